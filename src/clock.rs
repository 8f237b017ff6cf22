use std::time::{SystemTime, UNIX_EPOCH};

/// Time source for footer close timestamps and replicate timestamps.
pub trait Clock: Send + Sync {
    /// Wall-clock microseconds since the Unix epoch.
    fn now_micros(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now_micros();
        let b = clock.now_micros();
        assert!(b >= a);
        assert!(a > 0);
    }
}
