use std::time::Instant;

use neocortex::Neocortex;

/// Shared by every handler and by the mutation layers.
#[derive(Clone)]
pub struct AppState {
    pub neocortex: Neocortex,
    started_at: Instant,
}

impl AppState {
    pub fn new(neocortex: Neocortex) -> Self {
        Self {
            neocortex,
            started_at: Instant::now(),
        }
    }

    /// Seconds since the state was built.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
