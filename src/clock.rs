//! Millisecond wall clock that follows tokio's clock.
//!
//! Timestamps are anchored to the real wall clock once per process and then
//! advanced with `tokio::time::Instant`, so a paused test runtime sees time move
//! exactly as far as it auto-advances.

use std::sync::OnceLock;
use tokio::time::Instant;

/// Process-wide so every client in one process stamps against the same epoch;
/// holds only the anchor, no session state.
static ANCHOR: OnceLock<(i64, Instant)> = OnceLock::new();

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    let (epoch_ms, start) = ANCHOR.get_or_init(|| (chrono::Utc::now().timestamp_millis(), Instant::now()));
    let elapsed = Instant::now().saturating_duration_since(*start);
    epoch_ms + i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX - epoch_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_now_follows_paused_clock() {
        let before = now_ms();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let after = now_ms();
        assert!(after - before >= 5_000);
    }
}
