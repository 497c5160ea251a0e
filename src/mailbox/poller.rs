use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use super::{ListQuery, MailClient};
use crate::errors::{AppError, AppResult};
use crate::types::MessageRef;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Re-runs `query` once a second until it matches something or
/// `timeout_secs` have passed.
pub async fn wait_for<C>(client: &C, query: &ListQuery, timeout_secs: u64) -> AppResult<Vec<MessageRef>>
where
    C: MailClient + ?Sized,
{
    let mut elapsed = 0u64;
    let mut found = client.list(query).await?;
    while found.is_empty() && elapsed < timeout_secs {
        sleep(POLL_INTERVAL).await;
        elapsed += 1;
        found = client.list(query).await?;
        debug!(elapsed, timeout_secs, matches = found.len(), "Polled mailbox");
    }
    if found.is_empty() {
        return Err(AppError::NotFound(format!(
            "no message matched {} after {elapsed}/{timeout_secs}s",
            query.q.as_deref().unwrap_or("<any>")
        )));
    }
    Ok(found)
}
