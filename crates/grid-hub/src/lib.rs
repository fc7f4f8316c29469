pub mod config;
pub mod driver;
pub mod matcher;
pub mod slot;
pub mod node;
pub mod health_checker;
pub mod session;
pub mod node_set;
pub mod session_set;
pub mod session_queue;
pub mod registry;
pub mod http_router;
pub mod http_server;

#[cfg(test)]
mod test_support;

pub use config::{HubConfig, NodeConfig};
pub use driver::{Protocol, ProtocolDriver, RequestType, SeleniumProtocol, WebDriverProtocol};
pub use health_checker::HealthMonitor;
pub use http_router::GridRouter;
pub use http_server::HttpServer;
pub use node::{HealthCheckStatus, HealthEvent, Node, NodeId};
pub use registry::{Registry, RegistryEvent};
pub use session::{Session, TimeoutReason};
pub use slot::NodeSlot;
