use crate::driver::GranularityKind;
use crate::vmm::memory::split::{CapacityWeighted, SplitPolicy, Striped};
use log::warn;
use std::env;
use std::sync::Arc;

pub const ENV_GRANULARITY: &str = "VMM_GRANULARITY";
pub const ENV_SPLIT: &str = "VMM_SPLIT";
pub const ENV_STRICT_FREE: &str = "VMM_STRICT_FREE";

/// Built-in split policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitStrategy {
    #[default]
    Striped,
    CapacityWeighted,
}

/// Allocator tuning.
#[derive(Debug, Clone, Default)]
pub struct AllocatorConfig {
    /// Granularity used to round chunks and align ranges.
    pub granularity: GranularityKind,
    pub split: SplitStrategy,
    /// Reject `free` calls whose size matches neither the requested nor the actual size.
    pub strict_free_size: bool,
    custom_policy: Option<Arc<dyn SplitPolicy>>,
}

impl AllocatorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn granularity(mut self, kind: GranularityKind) -> Self {
        self.granularity = kind;
        self
    }

    #[must_use]
    pub const fn split(mut self, strategy: SplitStrategy) -> Self {
        self.split = strategy;
        self
    }

    #[must_use]
    pub const fn strict_free_size(mut self, strict: bool) -> Self {
        self.strict_free_size = strict;
        self
    }

    /// Uses `policy` instead of the built-in strategy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn SplitPolicy>) -> Self {
        self.custom_policy = Some(policy);
        self
    }

    /// The policy the allocator will split requests with.
    #[must_use]
    pub fn policy(&self) -> Arc<dyn SplitPolicy> {
        match (&self.custom_policy, self.split) {
            (Some(p), _) => Arc::clone(p),
            (None, SplitStrategy::Striped) => Arc::new(Striped),
            (None, SplitStrategy::CapacityWeighted) => Arc::new(CapacityWeighted),
        }
    }

    /// Defaults overridden by `VMM_GRANULARITY`, `VMM_SPLIT` and `VMM_STRICT_FREE`.
    ///
    /// Unrecognised values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_GRANULARITY) {
            match v.trim().to_ascii_lowercase().as_str() {
                "minimum" | "min" => config.granularity = GranularityKind::Minimum,
                "recommended" | "rec" => config.granularity = GranularityKind::Recommended,
                other => warn!("ignoring {ENV_GRANULARITY}={other}"),
            }
        }
        if let Some(v) = lookup(ENV_SPLIT) {
            match v.trim().to_ascii_lowercase().as_str() {
                "striped" | "even" => config.split = SplitStrategy::Striped,
                "weighted" | "capacity" => config.split = SplitStrategy::CapacityWeighted,
                other => warn!("ignoring {ENV_SPLIT}={other}"),
            }
        }
        if let Some(v) = lookup(ENV_STRICT_FREE) {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.strict_free_size = true,
                "0" | "false" | "no" => config.strict_free_size = false,
                other => warn!("ignoring {ENV_STRICT_FREE}={other}"),
            }
        }

        config
    }
}
