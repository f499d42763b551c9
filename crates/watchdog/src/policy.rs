use std::time::Duration;

/// When and how often a supervised process may be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub restart_delay: Duration,
    /// Total starts allowed; `None` is unbounded. The first start is always allowed.
    pub max_restarts: Option<u32>,
}

impl RestartPolicy {
    pub fn new(restart_delay: Duration, max_restarts: Option<u32>) -> Self {
        Self {
            restart_delay,
            max_restarts,
        }
    }

    /// Whether another start is permitted after `restart_count` starts.
    pub fn allows_start(&self, restart_count: u32) -> bool {
        if restart_count == 0 {
            return true;
        }
        match self.max_restarts {
            Some(max) => restart_count < max,
            None => true,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), None)
    }
}
