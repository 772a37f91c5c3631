use chrono::Duration;

/// Ages and run times for display: whole seconds, never negative.
pub trait WholeSeconds {
    fn whole_seconds(&self) -> std::time::Duration;
}

impl WholeSeconds for Duration {
    fn whole_seconds(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.num_seconds().max(0).unsigned_abs())
    }
}
