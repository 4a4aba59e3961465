use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Process-wide "is triggering" flag shared by every trigger path.
///
/// Only one [`TriggerSession`] exists at a time. Finishing a session keeps
/// the gate closed for `cooldown` so a gesture that bounces (or the UI and a
/// key gesture racing) does not fire twice.
#[derive(Clone)]
pub struct TriggerGate {
    busy: Arc<AtomicBool>,
    cooldown: Duration,
}

impl TriggerGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            cooldown,
        }
    }

    /// Returns a session if no trigger is in progress or cooling down.
    pub fn try_begin(&self) -> Option<TriggerSession> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TriggerSession {
                busy: Arc::clone(&self.busy),
                cooldown: self.cooldown,
            })
    }

    pub fn is_triggering(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }
}

/// Holds the gate closed. Dropping it reopens the gate immediately.
pub struct TriggerSession {
    busy: Arc<AtomicBool>,
    cooldown: Duration,
}

impl TriggerSession {
    /// Waits out the cooldown, then reopens the gate.
    pub async fn finish(self) {
        tokio::time::sleep(self.cooldown).await;
    }
}

impl Drop for TriggerSession {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
