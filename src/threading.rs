//! Process-wide threading mode.
//!
//! The server runs its packet handlers either on a single thread or on a
//! pool of workers. Components that guard state with a mutex only on the
//! multi-threaded path take this mode at construction instead of consulting
//! a global.

use serde::{Deserialize, Serialize};

/// Whether the embedding server runs multi-threaded packet handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiThreading {
    enabled: bool,
}

impl MultiThreading {
    pub const fn single() -> Self {
        MultiThreading { enabled: false }
    }

    pub const fn multi() -> Self {
        MultiThreading { enabled: true }
    }

    /// True when concurrent mutators exist and critical sections must
    /// actually lock.
    pub const fn enabled(self) -> bool {
        self.enabled
    }
}
