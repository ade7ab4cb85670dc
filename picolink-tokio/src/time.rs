use std::sync::OnceLock;

use tokio::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds of steady time since a fixed process-wide epoch.
///
/// Immune to wall-clock adjustments (the client may itself set the system
/// clock after a time sync). The epoch is arbitrary: timestamps derived
/// from this are only ever combined with the gateway time difference
/// obtained at probe time, so the origin cancels out.
///
/// Built on [`tokio::time::Instant`], so the paused test clock applies.
pub fn steady_now_ms() -> i64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().saturating_duration_since(epoch).as_millis() as i64
}
