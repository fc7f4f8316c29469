//! # Grid CLI
//!
//! Command-line interface for the grid hub.
//!
//! - `grid hub`: run a hub, configured from an optional JSON file and flags
//! - `grid status`: print a running hub's status JSON
//!
//! The CLI uses `argh` for argument parsing and dispatches to `grid-hub`.
//! Helpers shared by the binary and its tests live here.

pub mod status;

pub use status::fetch_hub_status;

/// Validates that a URL string starts with http:// or https://
///
/// # Arguments
///
/// * `url` - The URL string to validate
/// * `description` - What the URL is for, used in the error message
pub fn validate_http_url(url: &str, description: &str) -> anyhow::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("http://127.0.0.1:4444", "hub address").is_ok());
        assert!(validate_http_url("https://grid.example.com", "hub address").is_ok());

        let err = validate_http_url("127.0.0.1:4444", "hub address").unwrap_err();
        assert!(err.to_string().contains("must start with http://"));
    }
}
