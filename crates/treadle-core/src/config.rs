//! Store configuration.

use std::time::Duration;

use crate::domain::PersistenceError;

/// What to do with a lease whose owner has no liveness row at all.
///
/// The owner may be a node that has not checked in yet, or one whose row was
/// already deleted. Neither case can be told apart from the row alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingLivenessPolicy {
    /// The owner might be starting up; only the lease timeout reclaims it.
    #[default]
    TreatAsLive,
    /// A lease without a known owner is reclaimable immediately.
    TreatAsDefunct,
}

/// Configuration for one scheduler node's job store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Logical scheduler name shared by all nodes of a cluster.
    pub scheduler_name: String,
    /// Unique id of this node; written as the owner of its leases.
    pub instance_id: String,
    /// Enables check-in, startup recovery and periodic recovery.
    pub clustered: bool,
    /// How often the node writes its liveness row.
    pub checkin_interval: Duration,
    /// A peer is defunct after `defunct_multiplier × its interval` of silence.
    pub defunct_multiplier: u32,
    /// Age after which a job lease is reclaimable.
    pub job_timeout: Duration,
    /// Age after which a trigger lease is reclaimable.
    pub trigger_timeout: Duration,
    /// How late a fire time may be before it counts as misfired.
    pub misfire_threshold: Duration,
    pub missing_liveness: MissingLivenessPolicy,
    /// Period of the recovery sweep; defaults to four check-in intervals.
    pub recovery_interval: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            scheduler_name: "treadle".to_string(),
            instance_id: String::new(),
            clustered: false,
            checkin_interval: Duration::from_millis(7_500),
            defunct_multiplier: 2,
            job_timeout: Duration::from_secs(10 * 60),
            trigger_timeout: Duration::from_secs(10 * 60),
            misfire_threshold: Duration::from_millis(5_000),
            missing_liveness: MissingLivenessPolicy::default(),
            recovery_interval: None,
        }
    }
}

impl StoreConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    pub fn with_scheduler_name(mut self, scheduler_name: impl Into<String>) -> Self {
        self.scheduler_name = scheduler_name.into();
        self
    }

    pub fn with_clustered(mut self, clustered: bool) -> Self {
        self.clustered = clustered;
        self
    }

    pub fn with_checkin_interval(mut self, interval: Duration) -> Self {
        self.checkin_interval = interval;
        self
    }

    pub fn with_defunct_multiplier(mut self, multiplier: u32) -> Self {
        self.defunct_multiplier = multiplier;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_trigger_timeout(mut self, timeout: Duration) -> Self {
        self.trigger_timeout = timeout;
        self
    }

    pub fn with_misfire_threshold(mut self, threshold: Duration) -> Self {
        self.misfire_threshold = threshold;
        self
    }

    pub fn with_missing_liveness(mut self, policy: MissingLivenessPolicy) -> Self {
        self.missing_liveness = policy;
        self
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = Some(interval);
        self
    }

    pub fn effective_recovery_interval(&self) -> Duration {
        self.recovery_interval
            .unwrap_or_else(|| self.checkin_interval.saturating_mul(4))
    }

    pub fn validate(&self) -> Result<(), PersistenceError> {
        if self.instance_id.trim().is_empty() {
            return Err(PersistenceError::Configuration("instance_id must not be empty".into()));
        }
        if self.scheduler_name.trim().is_empty() {
            return Err(PersistenceError::Configuration("scheduler_name must not be empty".into()));
        }
        let durations = [
            ("checkin_interval", self.checkin_interval),
            ("job_timeout", self.job_timeout),
            ("trigger_timeout", self.trigger_timeout),
            ("recovery_interval", self.effective_recovery_interval()),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(PersistenceError::Configuration(format!("{name} must be positive")));
            }
        }
        if self.defunct_multiplier == 0 {
            return Err(PersistenceError::Configuration("defunct_multiplier must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.scheduler_name, "treadle");
        assert!(!config.clustered);
        assert_eq!(config.checkin_interval, Duration::from_millis(7_500));
        assert_eq!(config.job_timeout, Duration::from_secs(600));
        assert_eq!(config.trigger_timeout, Duration::from_secs(600));
        assert_eq!(config.misfire_threshold, Duration::from_millis(5_000));
        assert_eq!(config.missing_liveness, MissingLivenessPolicy::TreatAsLive);
        assert_eq!(config.effective_recovery_interval(), Duration::from_secs(30));
    }

    #[test]
    fn store_config_builders() {
        let config = StoreConfig::new("node-a")
            .with_clustered(true)
            .with_checkin_interval(Duration::from_secs(1))
            .with_missing_liveness(MissingLivenessPolicy::TreatAsDefunct);
        assert_eq!(config.instance_id, "node-a");
        assert!(config.clustered);
        assert_eq!(config.effective_recovery_interval(), Duration::from_secs(4));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_instance_id_is_rejected() {
        let err = StoreConfig::default().validate().unwrap_err();
        assert!(matches!(err, PersistenceError::Configuration(_)));
    }

    #[test]
    fn zero_durations_are_rejected() {
        let err = StoreConfig::new("node-a")
            .with_trigger_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("trigger_timeout"));
    }
}
