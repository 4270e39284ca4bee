//! Background clock driving registry ticks.

use std::sync::Weak;
use std::thread;
use std::time::Duration;

/// Something advanced one step per clock period.
pub(super) trait Tick: Send + Sync + 'static {
    fn tick(&self);
}

/// Spawn the clock thread. It holds only a weak reference and stops once the
/// target has been dropped.
pub(super) fn spawn<T: Tick>(target: Weak<T>, resolution: Duration) -> std::io::Result<()> {
    thread::Builder::new()
        .name("pulse-clock".into())
        .spawn(move || run(target, resolution))?;
    Ok(())
}

fn run<T: Tick>(target: Weak<T>, resolution: Duration) {
    tracing::debug!(resolution_ms = resolution.as_millis() as u64, "registry clock started");
    loop {
        // std::thread::sleep resumes after EINTR, so signals never cut a
        // period short.
        thread::sleep(resolution);
        match target.upgrade() {
            Some(target) => target.tick(),
            None => {
                tracing::debug!("registry dropped, clock stopping");
                return;
            }
        }
    }
}
