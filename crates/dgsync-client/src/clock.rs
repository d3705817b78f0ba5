use std::time::{
    SystemTime,
    UNIX_EPOCH,
};

/// Current wall-clock time in milliseconds since the epoch, mirroring
/// `dgsync_server::clock`.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as i64
}
