use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Whether the upstream currently looks down (a 504-class response was the
/// last thing the consumer decoded).
///
/// Written only by the consumer, read by every worker. The flag is a hint
/// that makes workers back off, not a correctness lock, hence the relaxed
/// ordering.
#[derive(Clone, Debug, Default)]
pub struct UpstreamStatus {
    down: Arc<AtomicBool>,
}

impl UpstreamStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Relaxed)
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Relaxed);
    }
}
