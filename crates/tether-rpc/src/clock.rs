//! Coarse time snapshots.
//!
//! Dispatch stamps every call with a start and end time; doing a clock
//! syscall per call is measurable at high rates.  A background task
//! refreshes a shared `(nanos, ISO string)` snapshot every 2 ms, and the
//! readers fall back to direct clock reads while no refresher is running.

use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static COARSE_NS: AtomicI64 = AtomicI64::new(0);
static COARSE_ISO: RwLock<Option<String>> = RwLock::new(None);

/// Nanoseconds since the Unix epoch, from the snapshot when available.
pub fn now_ns() -> i64 {
    let cached = COARSE_NS.load(Ordering::Relaxed);
    if cached != 0 { cached } else { direct_ns() }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    now_ns() / 1_000_000
}

/// The current time as `2019-09-09T09:47:16.180+08:00`.
pub fn now_iso() -> String {
    if let Ok(guard) = COARSE_ISO.read() {
        if let Some(s) = guard.as_ref() {
            return s.clone();
        }
    }
    format_iso(chrono::Local::now())
}

fn direct_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}

fn format_iso(t: chrono::DateTime<chrono::Local>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
}

/// Start the 2 ms refresher.  The caller owns the handle; aborting it
/// leaves the readers on the direct-clock fallback.
pub fn spawn_refresher() -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {
        let mut tick = tokio::time::interval(Duration::from_millis(2));
        loop {
            tick.tick().await;
            COARSE_NS.store(direct_ns(), Ordering::Relaxed);
            if let Ok(mut guard) = COARSE_ISO.write() {
                *guard = Some(format_iso(chrono::Local::now()));
            }
        }
    })
}
