use std::fmt;
use std::str::FromStr;

use cmsgc_arena::ArenaConfig;
use serde::{Deserialize, Serialize};

use crate::GcError;

pub const DEFAULT_INITIAL_THRESHOLD: usize = 1024 * 1024;
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.5;

/// How much a heap reports about its collections through the `log` facade.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Off,
    /// One line when a cycle starts, one when it ends, and threshold changes.
    Summary,
    /// Every scanned range and every newly marked object as well.
    Trace,
}

impl FromStr for Verbosity {
    type Err = GcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "0" => Ok(Self::Off),
            "summary" | "1" => Ok(Self::Summary),
            "trace" | "2" => Ok(Self::Trace),
            _ => Err(GcError::InvalidConfig(format!("unknown verbosity `{s}`"))),
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Summary => write!(f, "summary"),
            Self::Trace => write!(f, "trace"),
        }
    }
}

/// Whether the machine stack and the callee-saved registers are roots.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackScan {
    #[default]
    Enabled,
    /// Only registered ranges and explicitly traced roots keep objects alive.
    Disabled,
}

/// Settings for a [`crate::Heap`].
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Live bytes above which the next allocation collects first.
    pub initial_threshold: usize,
    /// After a cycle that ends above the threshold, the threshold becomes the
    /// live size multiplied by this. Must be at least 1.
    pub growth_factor: f64,
    pub verbosity: Verbosity,
    pub stack_scan: StackScan,
    pub arena: ArenaConfig,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_threshold: DEFAULT_INITIAL_THRESHOLD,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            verbosity: Verbosity::Off,
            stack_scan: StackScan::Enabled,
            arena: ArenaConfig::default(),
        }
    }
}

impl HeapConfig {
    pub fn validate(&self) -> Result<(), GcError> {
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(GcError::InvalidConfig(format!(
                "growth factor must be a finite number >= 1, got {}",
                self.growth_factor
            )));
        }

        Ok(())
    }
}
