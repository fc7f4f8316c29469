use anyhow::{Context, Result};
use grid_common::{GridRequest, HttpNodeProxy, NodeProxy};
use hyper::Method;
use serde_json::Value;
use std::time::Duration;
use url::Url;

const STATUS_PATH: &str = "/grid/api/hub";
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches `/grid/api/hub` from a running hub.
///
/// # Arguments
/// * `hub_url` - Hub base URL, e.g. `http://127.0.0.1:4444`
///
/// # Returns
/// The status document, or an error when the hub is unreachable or answers
/// with anything but a JSON 2xx reply
pub async fn fetch_hub_status(hub_url: &str) -> Result<Value> {
    let url = Url::parse(hub_url).with_context(|| format!("Invalid hub address {}", hub_url))?;
    let request = GridRequest::new(Method::GET, STATUS_PATH);

    let response = HttpNodeProxy::new()
        .proxy(&request, &url, Some(STATUS_TIMEOUT))
        .await
        .with_context(|| format!("Failed to reach hub at {}", hub_url))?;

    if !response.is_success() {
        anyhow::bail!(
            "Hub at {} answered {}: {}",
            hub_url,
            response.status,
            response.text_body()
        );
    }

    Ok(response.json_body()?)
}
