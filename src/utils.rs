use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Upper bound, in characters, for any upstream text echoed back to callers.
pub const ECHO_LIMIT: usize = 500;

pub fn spawn_async<F>(fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(fut)
}

/// Runs `fut` after `delay` on the current runtime.
pub fn spawn_after<F>(delay: Duration, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    spawn_async(async move {
        tokio::time::sleep(delay).await;
        fut.await;
    })
}

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Keeps at most `limit` characters, never splitting a UTF-8 sequence.
pub fn truncate_chars(input: &str, limit: usize) -> String {
    match input.char_indices().nth(limit) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}
