use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;

const ATTEMPTS: usize = 5;
const RETRY_SPACING: Duration = Duration::from_secs(1);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// GET with bounded retries: five attempts at one second spacing, fifteen
/// seconds per attempt, cancellable between and during attempts.
pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let mut final_err = anyhow!("fetch never attempted");
    for attempt in 0..ATTEMPTS {
        if attempt > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(anyhow!("fetch canceled")),
                _ = tokio::time::sleep(RETRY_SPACING) => {}
            }
        }
        let request = async {
            let resp = client.get(url).timeout(FETCH_TIMEOUT).send().await?;
            let status = resp.status();
            let body = resp.bytes().await?;
            if !status.is_success() {
                let peek = String::from_utf8_lossy(&body[..body.len().min(200)]).into_owned();
                return Err(anyhow!("response status not OK code:{status}, payload:{peek}"));
            }
            Ok(body.to_vec())
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(anyhow!("fetch canceled")),
            res = request => match res {
                Ok(body) => return Ok(body),
                Err(err) => final_err = err,
            }
        }
    }
    Err(final_err)
}
