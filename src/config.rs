//! Runtime configuration surface: [`RuntimeConfig`] and [`Profile`].

use crate::error::{ConfigError, Error, Result};
use crate::group::MAX_GROUP_SIZE;

/// A workload-shape preset. Chooses a preferred group size (within
/// `[8, 32]`) and whether NUMA placement is worth the bother; `Customized`
/// defers both to `workers_per_group`/`scheduling_groups`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    ComputeHeavy,
    Compute,
    Neutral,
    Io,
    IoHeavy,
    Customized,
}

impl Profile {
    pub fn preferred_group_size(self) -> usize {
        match self {
            Profile::ComputeHeavy => 8,
            Profile::Compute => 12,
            Profile::Neutral => 16,
            Profile::Io => 24,
            Profile::IoHeavy => 32,
            Profile::Customized => 16,
        }
    }

    pub fn numa_aware(self) -> bool {
        !matches!(self, Profile::Io | Profile::IoHeavy | Profile::Customized)
    }
}

impl Default for Profile {
    fn default() -> Self {
        Profile::Neutral
    }
}

/// An explicit CPU list or exclusion list, as accepted by
/// `fiber_worker_accessible_cpus`/`fiber_worker_inaccessible_cpus`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSet(pub Vec<usize>);

impl CpuSet {
    /// Parses a comma-separated list of indices and inclusive ranges, e.g.
    /// `"0,2,4-7"`.
    pub fn parse(s: &str) -> std::result::Result<Self, ConfigError> {
        let mut cpus = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: usize = lo.trim().parse().map_err(|_| ConfigError(format!("invalid CPU range: {part}")))?;
                let hi: usize = hi.trim().parse().map_err(|_| ConfigError(format!("invalid CPU range: {part}")))?;
                if lo > hi {
                    return Err(ConfigError(format!("invalid CPU range: {part}")));
                }
                cpus.extend(lo..=hi);
            } else {
                cpus.push(part.parse().map_err(|_| ConfigError(format!("invalid CPU index: {part}")))?);
            }
        }
        Ok(Self(cpus))
    }
}

/// Builder-style runtime configuration, covering every option in the
/// external interface's configuration table. Construct with
/// [`RuntimeConfig::new`], chain `with_*` setters, then pass to
/// `start_runtime` (which calls [`Self::validate`] before acting on it).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub(crate) concurrency_hint: usize,
    pub(crate) scheduling_group_size: usize,
    pub(crate) workers_per_group: Option<usize>,
    pub(crate) scheduling_groups: Option<usize>,
    pub(crate) numa_aware: bool,
    pub(crate) work_stealing_ratio: u64,
    pub(crate) cross_numa_work_stealing_ratio: u64,
    pub(crate) fiber_worker_accessible_cpus: Option<CpuSet>,
    pub(crate) fiber_worker_inaccessible_cpus: Option<CpuSet>,
    pub(crate) fiber_worker_disallow_cpu_migration: bool,
    pub(crate) fiber_stack_size: usize,
    pub(crate) fiber_stack_enable_guard_page: bool,
    pub(crate) fiber_run_queue_size: usize,
    pub(crate) profile: Profile,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        let profile = Profile::default();
        Self {
            concurrency_hint: 0,
            scheduling_group_size: profile.preferred_group_size(),
            workers_per_group: None,
            scheduling_groups: None,
            numa_aware: profile.numa_aware(),
            work_stealing_ratio: 8,
            cross_numa_work_stealing_ratio: 0,
            fiber_worker_accessible_cpus: None,
            fiber_worker_inaccessible_cpus: None,
            fiber_worker_disallow_cpu_migration: false,
            fiber_stack_size: crate::stack::DEFAULT_USER_STACK_SIZE,
            fiber_stack_enable_guard_page: true,
            fiber_run_queue_size: crate::run_queue::RunQueue::DEFAULT_CAPACITY,
            profile,
        }
    }

    /// Sets the profile and resets `scheduling_group_size`/`numa_aware` to
    /// its preferred values; call any `with_*` override after this one.
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self.scheduling_group_size = profile.preferred_group_size();
        self.numa_aware = profile.numa_aware();
        self
    }

    pub fn with_concurrency_hint(mut self, n: usize) -> Self {
        self.concurrency_hint = n;
        self
    }

    pub fn with_scheduling_group_size(mut self, n: usize) -> Self {
        self.scheduling_group_size = n;
        self
    }

    pub fn with_workers_per_group(mut self, n: usize) -> Self {
        self.workers_per_group = Some(n);
        self
    }

    pub fn with_scheduling_groups(mut self, n: usize) -> Self {
        self.scheduling_groups = Some(n);
        self
    }

    pub fn with_numa_aware(mut self, enabled: bool) -> Self {
        self.numa_aware = enabled;
        self
    }

    pub fn with_work_stealing_ratio(mut self, n: u64) -> Self {
        self.work_stealing_ratio = n;
        self
    }

    pub fn with_cross_numa_work_stealing_ratio(mut self, n: u64) -> Self {
        self.cross_numa_work_stealing_ratio = n;
        self
    }

    pub fn with_fiber_worker_accessible_cpus(mut self, cpus: CpuSet) -> Self {
        self.fiber_worker_accessible_cpus = Some(cpus);
        self
    }

    pub fn with_fiber_worker_inaccessible_cpus(mut self, cpus: CpuSet) -> Self {
        self.fiber_worker_inaccessible_cpus = Some(cpus);
        self
    }

    pub fn with_fiber_worker_disallow_cpu_migration(mut self, disallow: bool) -> Self {
        self.fiber_worker_disallow_cpu_migration = disallow;
        self
    }

    pub fn with_fiber_stack_size(mut self, bytes: usize) -> Self {
        self.fiber_stack_size = bytes;
        self
    }

    pub fn with_fiber_stack_enable_guard_page(mut self, enabled: bool) -> Self {
        self.fiber_stack_enable_guard_page = enabled;
        self
    }

    pub fn with_fiber_run_queue_size(mut self, capacity: usize) -> Self {
        self.fiber_run_queue_size = capacity;
        self
    }

    /// Checks the joint-consistency rules §10.1 calls out: group size
    /// within bounds, run queue capacity a power of two, and both CPU lists
    /// not given at once. Called once by `start_runtime`.
    pub fn validate(&self) -> Result<()> {
        if self.scheduling_group_size == 0 || self.scheduling_group_size > MAX_GROUP_SIZE {
            return Err(Error::InvalidConfig(ConfigError(format!(
                "scheduling_group_size must be in 1..={MAX_GROUP_SIZE}, got {}",
                self.scheduling_group_size
            ))));
        }
        if let Some(n) = self.workers_per_group {
            if n == 0 || n > MAX_GROUP_SIZE {
                return Err(Error::InvalidConfig(ConfigError(format!(
                    "workers_per_group must be in 1..={MAX_GROUP_SIZE}, got {n}"
                ))));
            }
        }
        if let Some(n) = self.scheduling_groups {
            if n == 0 {
                return Err(Error::InvalidConfig(ConfigError("scheduling_groups must be at least 1".into())));
            }
        }
        if !self.fiber_run_queue_size.is_power_of_two() {
            return Err(Error::InvalidConfig(ConfigError(format!(
                "fiber_run_queue_size must be a power of two, got {}",
                self.fiber_run_queue_size
            ))));
        }
        if self.fiber_worker_accessible_cpus.is_some() && self.fiber_worker_inaccessible_cpus.is_some() {
            return Err(Error::InvalidConfig(ConfigError(
                "fiber_worker_accessible_cpus and fiber_worker_inaccessible_cpus are mutually exclusive".into(),
            )));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_set_parses_ranges_and_singletons() {
        let set = CpuSet::parse("0,2,4-6").unwrap();
        assert_eq!(set.0, vec![0, 2, 4, 5, 6]);
    }

    #[test]
    fn cpu_set_rejects_inverted_range() {
        assert!(CpuSet::parse("5-3").is_err());
    }

    #[test]
    fn validate_rejects_oversized_group() {
        let cfg = RuntimeConfig::new().with_scheduling_group_size(100);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_power_of_two_queue() {
        let cfg = RuntimeConfig::new().with_fiber_run_queue_size(100);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_both_cpu_lists() {
        let cfg = RuntimeConfig::new()
            .with_fiber_worker_accessible_cpus(CpuSet(vec![0]))
            .with_fiber_worker_inaccessible_cpus(CpuSet(vec![1]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_profile_is_neutral() {
        let cfg = RuntimeConfig::new();
        assert_eq!(cfg.scheduling_group_size, Profile::Neutral.preferred_group_size());
    }
}
