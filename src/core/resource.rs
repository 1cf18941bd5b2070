//! Execution capacity.
//!
//! Commands declare how many cores they need; executors own a fixed
//! budget of cores that admission claims from and completion releases to.

use serde::{Deserialize, Serialize};
use std::fmt;

fn default_cores() -> u32 {
    1
}

/// Capacity a command needs while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Number of cores held for the duration of the command.
    #[serde(default = "default_cores")]
    pub cores: u32,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cores: default_cores(),
        }
    }
}

impl ResourceRequirements {
    /// Requirements with an explicit core count.
    pub fn cores(cores: u32) -> Self {
        Self { cores }
    }

    /// The larger of two requirements, field by field.
    pub fn max(self, other: Self) -> Self {
        Self {
            cores: self.cores.max(other.cores),
        }
    }
}

/// A pool of cores with a hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreBudget {
    total: u32,
    in_use: u32,
}

impl CoreBudget {
    /// Create a budget with nothing claimed.
    pub fn new(total: u32) -> Self {
        Self { total, in_use: 0 }
    }

    /// Total cores in the pool.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Cores currently claimed.
    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    /// Cores still free.
    pub fn available(&self) -> u32 {
        self.total.saturating_sub(self.in_use)
    }

    /// True if `req` fits in what is free.
    pub fn can_fit(&self, req: &ResourceRequirements) -> bool {
        req.cores <= self.available()
    }

    /// Claim capacity for `req`. Returns false and claims nothing if it does not fit.
    pub fn claim(&mut self, req: &ResourceRequirements) -> bool {
        if !self.can_fit(req) {
            return false;
        }
        self.in_use += req.cores;
        true
    }

    /// Return capacity claimed for `req`.
    pub fn release(&mut self, req: &ResourceRequirements) {
        self.in_use = self.in_use.saturating_sub(req.cores);
    }
}

impl fmt::Display for CoreBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} cores", self.in_use, self.total)
    }
}
