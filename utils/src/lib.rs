use std::time::SystemTime;

pub mod backoff;

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_millis() as u64
}

/// Seconds elapsed since an epoch-millisecond timestamp, saturating at zero
/// if the clock moved backwards.
pub fn elapsed_secs_since_ms(at_ms: u64) -> f64 {
    let now_ms = get_epoch_time_in_ms();
    if now_ms < at_ms {
        return 0.0;
    }
    (now_ms - at_ms) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_secs_since_ms() {
        let now = get_epoch_time_in_ms();
        assert_eq!(elapsed_secs_since_ms(now + 10_000), 0.0);
        let elapsed = elapsed_secs_since_ms(now.saturating_sub(2_000));
        assert!(elapsed >= 2.0);
        assert!(elapsed < 3.0);
    }
}
