//! Capability Maps
//!
//! A capability set is a flat JSON object describing a browser/platform
//! combination, either offered by a node slot or desired by a client.
//! Key casing of the well-known keys is normalized on ingestion so that
//! `BrowserName`, `browsername` and `browserName` all address the same
//! entry.

use serde_json::{Map, Value};

/// Capability set keyed by capability name.
pub type Capabilities = Map<String, Value>;

pub const BROWSER_NAME: &str = "browserName";
pub const VERSION: &str = "version";
pub const PLATFORM: &str = "platform";
pub const PLATFORM_NAME: &str = "platformName";
pub const PLATFORM_VERSION: &str = "platformVersion";
pub const MAX_INSTANCES: &str = "maxInstances";
pub const SELENIUM_PROTOCOL: &str = "seleniumProtocol";

/// Keys the matcher enforces. Everything else is informational.
pub const BASIC_CAPABILITIES: [&str; 5] = [
    BROWSER_NAME,
    VERSION,
    PLATFORM,
    PLATFORM_NAME,
    PLATFORM_VERSION,
];

/// Keys recognized case-insensitively and rewritten to their canonical casing.
const CANONICAL_KEYS: [&str; 7] = [
    BROWSER_NAME,
    VERSION,
    PLATFORM,
    PLATFORM_NAME,
    PLATFORM_VERSION,
    MAX_INSTANCES,
    SELENIUM_PROTOCOL,
];

/// Keys whose values are always carried as strings.
const STRING_COERCED: [&str; 2] = [VERSION, PLATFORM_VERSION];

/// Normalizes a raw capability object.
///
/// Known keys are matched case-insensitively and rewritten to canonical
/// casing, `version` and `platformVersion` are coerced to strings, and
/// unknown keys are copied verbatim. Anything that is not a JSON object
/// yields an empty map. The function is idempotent.
pub fn normalize_capabilities(raw: &Value) -> Capabilities {
    let mut normalized = Capabilities::new();

    let Some(object) = raw.as_object() else {
        return normalized;
    };

    for (key, value) in object {
        let lowered = key.to_ascii_lowercase();
        let canonical = CANONICAL_KEYS
            .iter()
            .find(|known| known.to_ascii_lowercase() == lowered);

        match canonical {
            Some(&canonical) if STRING_COERCED.contains(&canonical) => {
                normalized.insert(canonical.to_string(), coerce_to_string(value));
            }
            Some(&canonical) => {
                normalized.insert(canonical.to_string(), value.clone());
            }
            None => {
                normalized.insert(key.clone(), value.clone());
            }
        }
    }

    normalized
}

fn coerce_to_string(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        other => other.clone(),
    }
}

/// Returns the comparable string form of a scalar capability value.
pub fn match_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `"any"`, `"*"`, the empty string and `null` match anything.
pub fn is_wildcard(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s == "*" || s.eq_ignore_ascii_case("any")
        }
        _ => false,
    }
}
