use std::time;

/// Millisecond clock relative to the moment a client or server was created. Every timestamp
/// handed to a session comes from here.
pub struct Epoch {
    time_base: time::Instant,
}

impl Epoch {
    pub fn new() -> Self {
        Self {
            time_base: time::Instant::now(),
        }
    }

    pub fn time_now_ms(&self) -> u64 {
        self.time_base.elapsed().as_millis() as u64
    }
}
