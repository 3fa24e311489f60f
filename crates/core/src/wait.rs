//! Requeue delays selected by reconcile outcome.

use std::time::Duration;

use crate::error::ConfigError;

/// Three named requeue delays, owned per reconciler instance.
///
/// - `tiny`: fast poll for transient "not ready yet" states
/// - `short`: backoff after a failure
/// - `long`: steady-state interval after a fully successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTiers {
    pub tiny: Duration,
    pub short: Duration,
    pub long: Duration,
}

impl Default for WaitTiers {
    fn default() -> Self {
        Self {
            tiny: Duration::from_secs(3),
            short: Duration::from_secs(30),
            long: Duration::from_secs(60),
        }
    }
}

impl WaitTiers {
    /// Build tiers, requiring `tiny < short < long`.
    pub fn new(tiny: Duration, short: Duration, long: Duration) -> Result<Self, ConfigError> {
        if tiny.is_zero() {
            return Err(ConfigError::WaitTiers("tiny wait must be non-zero".into()));
        }
        if !(tiny < short && short < long) {
            return Err(ConfigError::WaitTiers(format!(
                "expected tiny < short < long, got {:?} / {:?} / {:?}",
                tiny, short, long
            )));
        }
        Ok(Self { tiny, short, long })
    }

    pub fn from_secs(tiny: u64, short: u64, long: u64) -> Result<Self, ConfigError> {
        Self::new(Duration::from_secs(tiny), Duration::from_secs(short), Duration::from_secs(long))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_ordered() {
        let w = WaitTiers::default();
        assert!(w.tiny < w.short && w.short < w.long);
        assert_eq!(WaitTiers::from_secs(3, 30, 60).unwrap(), w);
    }

    #[test]
    fn rejects_unordered_tiers() {
        assert!(WaitTiers::from_secs(30, 3, 60).is_err());
        assert!(WaitTiers::from_secs(3, 30, 30).is_err());
        assert!(WaitTiers::from_secs(0, 30, 60).is_err());
        let e = WaitTiers::from_secs(5, 5, 60).unwrap_err().to_string();
        assert!(e.contains("tiny < short < long"), "e={}", e);
    }
}
