//! Time utility functions

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Get current timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Age of a timestamp relative to `now`, zero when it lies in the future
pub fn age(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - timestamp).to_std().unwrap_or(Duration::ZERO)
}

/// Milliseconds elapsed since `start`
pub fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_never_negative() {
        let t = now();
        assert_eq!(age(t + chrono::Duration::seconds(5), t), Duration::ZERO);
        assert_eq!(age(t - chrono::Duration::seconds(5), t), Duration::from_secs(5));
    }
}
