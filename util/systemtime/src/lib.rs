//! Wall clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the duration since the unix epoch.
pub fn system_time_as_duration() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before the unix epoch")
}

/// Returns the current unix time in milliseconds.
pub fn unix_time_as_millis() -> u64 {
    system_time_as_duration().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::unix_time_as_millis;

    #[test]
    fn millis_is_monotonic_enough() {
        let a = unix_time_as_millis();
        let b = unix_time_as_millis();
        assert!(b >= a);
    }
}
