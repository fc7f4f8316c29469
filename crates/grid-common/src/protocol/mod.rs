pub mod capabilities;
pub mod error;
pub mod requests;
pub mod responses;


pub use capabilities::{
    is_wildcard, match_string, normalize_capabilities, Capabilities, BASIC_CAPABILITIES,
};
pub use error::{GridError, Result};
pub use requests::GridRequest;
pub use responses::GridResponse;
