//! Capability matching.
//!
//! Only the basic keys (`browserName`, `version`, `platform`, `platformName`,
//! `platformVersion`) take part in matching. Custom keys in a request are
//! carried to the node but never block scheduling.

use grid_common::{is_wildcard, match_string, Capabilities, BASIC_CAPABILITIES};
use std::sync::Arc;

use crate::driver::Protocol;
use crate::node::Node;
use crate::slot::NodeSlot;

/// Returns true when `candidate` satisfies every basic, non-wildcard key of `desired`.
pub fn matches(desired: &Capabilities, candidate: &Capabilities) -> bool {
    BASIC_CAPABILITIES.iter().all(|key| {
        let Some(wanted) = desired.get(*key) else {
            return true;
        };
        if is_wildcard(wanted) {
            return true;
        }
        let Some(wanted) = match_string(wanted) else {
            return true;
        };

        candidate
            .get(*key)
            .and_then(match_string)
            .map(|offered| offered.eq_ignore_ascii_case(wanted.trim()))
            .unwrap_or(false)
    })
}

/// First node/slot, in registration order, whose profile serves the request.
///
/// Lock state is ignored; this answers "could anything ever serve this",
/// not "what is free right now".
pub fn find_first_match(
    desired: &Capabilities,
    protocol: Protocol,
    nodes: &[Arc<Node>],
) -> Option<(Arc<Node>, Arc<NodeSlot>)> {
    nodes.iter().find_map(|node| {
        node.slots()
            .iter()
            .find(|slot| slot.protocol() == protocol && matches(desired, slot.capabilities()))
            .map(|slot| (node.clone(), slot.clone()))
    })
}
