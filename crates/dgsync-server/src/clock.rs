use std::time::{
    SystemTime,
    UNIX_EPOCH,
};

/// Current wall-clock time in milliseconds since the epoch. A thin seam so
/// the maintenance coordinator's age-based cutoffs have one place to swap in
/// a fake clock for tests, rather than each caller reaching for
/// `SystemTime::now()` directly.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as i64
}
