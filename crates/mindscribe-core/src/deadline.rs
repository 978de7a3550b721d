use std::future::Future;
use std::time::Duration;

/// Uniform first-settled-wins race between an operation and a wall-clock
/// limit. A timed-out operation is dropped and reported as failed; the remote
/// side is not chased for an outcome.
pub async fn with_deadline<T>(
    operation: impl Future<Output = anyhow::Result<T>>,
    limit: Duration,
    what: &str,
) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("{what} timed out after {}s", limit.as_secs()),
    }
}
