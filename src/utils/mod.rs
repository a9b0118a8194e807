pub mod error;

use rand::prelude::*;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

pub fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_secs()
}

pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Milliseconds until `deadline_ms`, rounded up to whole seconds and
/// clamped to at least one second. Used for retry-after hints.
pub fn secs_until(deadline_ms: u64, now_ms: u64) -> u64 {
    let remaining = deadline_ms.saturating_sub(now_ms);
    std::cmp::max(1, remaining.div_ceil(1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_strings_are_unique_enough() {
        let a = random_string(16);
        let b = random_string(16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn secs_until_rounds_up_and_clamps() {
        assert_eq!(secs_until(10_500, 10_000), 1);
        assert_eq!(secs_until(12_001, 10_000), 3);
        // Deadline in the past still yields a usable hint
        assert_eq!(secs_until(9_000, 10_000), 1);
    }
}
