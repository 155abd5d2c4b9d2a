//! The host runtime surface: the slice of the invocation context the
//! orchestrator needs that has nothing to do with stream records — how
//! much wall-clock time is left, and who this function is.

/// Implemented by the binary embedding this engine (a Lambda runtime
/// shim, a local harness, ...). Kept deliberately tiny: everything else
/// the orchestrator needs is either a record already handed to it or one
/// of the other collaborator traits.
pub trait HostRuntime: Send + Sync {
    /// Milliseconds remaining before the host forcibly terminates this
    /// invocation. Used to derive each phase's deadline.
    fn remaining_time_millis(&self) -> i64;
    fn function_name(&self) -> &str;
    fn function_alias(&self) -> &str;
}

/// A fixed-budget [`HostRuntime`] for tests: reports a constant remaining
/// time regardless of how long the test has been running.
#[derive(Debug, Clone)]
pub struct FixedHostRuntime {
    pub remaining_millis: i64,
    pub function_name: String,
    pub function_alias: String,
}

impl FixedHostRuntime {
    pub fn new(remaining_millis: i64) -> Self {
        FixedHostRuntime {
            remaining_millis,
            function_name: "test-function".to_string(),
            function_alias: "test".to_string(),
        }
    }
}

impl HostRuntime for FixedHostRuntime {
    fn remaining_time_millis(&self) -> i64 {
        self.remaining_millis
    }

    fn function_name(&self) -> &str {
        &self.function_name
    }

    fn function_alias(&self) -> &str {
        &self.function_alias
    }
}

/// The wall-clock budget derived from a [`HostRuntime`] and the configured
/// percentage of remaining time — the deadline every phase races its work
/// against.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    instant: tokio::time::Instant,
}

impl Deadline {
    pub fn from_host(host: &dyn HostRuntime, fraction: f64) -> Self {
        let remaining_ms = host.remaining_time_millis().max(0) as u64;
        let budget_ms = ((remaining_ms as f64) * fraction.clamp(0.0, 1.0)) as u64;
        Deadline {
            instant: tokio::time::Instant::now() + std::time::Duration::from_millis(budget_ms),
        }
    }

    /// The finalise phase's deadline: reserves at least one second for the
    /// checkpoint write that must follow it, so it never simply reuses the
    /// configured fraction the way the initiate/process phases do. Takes
    /// the larger of "all but the last second" and "the configured
    /// fraction, floored at 0.8" — whichever leaves more time for the
    /// finalising tasks themselves.
    pub fn for_finalise(host: &dyn HostRuntime, configured_fraction: f64) -> Self {
        let remaining_ms = host.remaining_time_millis().max(0) as u64;
        let remaining = std::time::Duration::from_millis(remaining_ms);
        let reserved = remaining.saturating_sub(std::time::Duration::from_secs(1));
        let fraction = configured_fraction.max(0.8).clamp(0.0, 1.0);
        let fractional =
            std::time::Duration::from_millis(((remaining_ms as f64) * fraction) as u64);
        let budget = reserved.max(fractional);
        Deadline {
            instant: tokio::time::Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> std::time::Duration {
        self.instant
            .saturating_duration_since(tokio::time::Instant::now())
    }

    pub fn has_passed(&self) -> bool {
        tokio::time::Instant::now() >= self.instant
    }

    pub fn as_tokio_instant(&self) -> tokio::time::Instant {
        self.instant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_applies_configured_fraction() {
        let host = FixedHostRuntime::new(1000);
        let deadline = Deadline::from_host(&host, 0.5);
        assert!(deadline.remaining() <= std::time::Duration::from_millis(500));
    }

    #[test]
    fn negative_remaining_time_clamps_to_zero_budget() {
        let host = FixedHostRuntime::new(-50);
        let deadline = Deadline::from_host(&host, 0.9);
        assert!(deadline.has_passed());
    }

    #[test]
    fn finalise_deadline_reserves_the_last_second() {
        let host = FixedHostRuntime::new(5_000);
        let deadline = Deadline::for_finalise(&host, 0.5);
        // remaining - 1s = 4s, remaining * max(0.5, 0.8) = 4s: both agree here.
        assert!(deadline.remaining() <= std::time::Duration::from_millis(4_000));
        assert!(deadline.remaining() > std::time::Duration::from_millis(3_900));
    }

    #[test]
    fn finalise_deadline_floors_the_configured_fraction_at_eighty_percent() {
        let host = FixedHostRuntime::new(10_000);
        let deadline = Deadline::for_finalise(&host, 0.1);
        // remaining - 1s = 9s, remaining * 0.8 = 8s: the larger, 9s, wins.
        assert!(deadline.remaining() > std::time::Duration::from_millis(8_900));
    }
}
