//! Resource quotas, samples, and shared pools.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of samples a rolling window retains.
pub const ROLLING_WINDOW_CAPACITY: usize = 1000;

/// The axes a quota constrains and a sample reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAxis {
    Cpu,
    Memory,
    Disk,
    Threads,
    FileHandles,
    Connections,
}

impl ResourceAxis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Threads => "threads",
            Self::FileHandles => "file_handles",
            Self::Connections => "connections",
        }
    }

    pub fn all() -> &'static [ResourceAxis] {
        &[
            Self::Cpu,
            Self::Memory,
            Self::Disk,
            Self::Threads,
            Self::FileHandles,
            Self::Connections,
        ]
    }
}

impl std::fmt::Display for ResourceAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-owner numeric limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuota {
    /// Maximum CPU usage percentage (0.0-100.0)
    pub cpu_percent: f64,
    /// Maximum resident memory in MB
    pub memory_mb: u64,
    /// Maximum scratch disk in MB
    pub disk_mb: u64,
    /// Maximum thread count
    pub max_threads: u32,
    /// Maximum open file handles
    pub max_file_handles: u32,
    /// Maximum open connections
    pub max_connections: u32,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            cpu_percent: 50.0,
            memory_mb: 512,
            disk_mb: 1024,
            max_threads: 5,
            max_file_handles: 100,
            max_connections: 10,
        }
    }
}

impl ResourceQuota {
    /// Limit for one axis, in that axis's native unit.
    pub fn limit(&self, axis: ResourceAxis) -> f64 {
        match axis {
            ResourceAxis::Cpu => self.cpu_percent,
            ResourceAxis::Memory => self.memory_mb as f64,
            ResourceAxis::Disk => self.disk_mb as f64,
            ResourceAxis::Threads => f64::from(self.max_threads),
            ResourceAxis::FileHandles => f64::from(self.max_file_handles),
            ResourceAxis::Connections => f64::from(self.max_connections),
        }
    }
}

/// One measurement for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub threads: u32,
    pub open_files: u32,
    pub connections: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ResourceSample {
    pub fn zero() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_mb: 0.0,
            disk_mb: 0.0,
            threads: 0,
            open_files: 0,
            connections: 0,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Value along one axis.
    pub fn value(&self, axis: ResourceAxis) -> f64 {
        match axis {
            ResourceAxis::Cpu => self.cpu_percent,
            ResourceAxis::Memory => self.memory_mb,
            ResourceAxis::Disk => self.disk_mb,
            ResourceAxis::Threads => f64::from(self.threads),
            ResourceAxis::FileHandles => f64::from(self.open_files),
            ResourceAxis::Connections => f64::from(self.connections),
        }
    }

    /// Axes where this sample exceeds the quota.
    pub fn violations(&self, quota: &ResourceQuota) -> Vec<ResourceAxis> {
        ResourceAxis::all()
            .iter()
            .copied()
            .filter(|axis| self.value(*axis) > quota.limit(*axis))
            .collect()
    }
}

/// Fixed-capacity window of samples with lazily derived peak and average.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollingWindow {
    samples: VecDeque<ResourceSample>,
}

impl RollingWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(64),
        }
    }

    /// Push a sample, evicting the oldest past capacity.
    pub fn push(&mut self, sample: ResourceSample) {
        if self.samples.len() == ROLLING_WINDOW_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&ResourceSample> {
        self.samples.back()
    }

    /// Last `n` samples, oldest first.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &ResourceSample> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip)
    }

    /// Peak along an axis over the whole window.
    pub fn peak(&self, axis: ResourceAxis) -> f64 {
        self.samples
            .iter()
            .map(|s| s.value(axis))
            .fold(0.0, f64::max)
    }

    /// Average along an axis over the whole window.
    pub fn average(&self, axis: ResourceAxis) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|s| s.value(axis)).sum();
        sum / self.samples.len() as f64
    }
}

/// A named shared capacity: `available = capacity - used - reserved`.
///
/// Pool arithmetic is the one piece of globally shared mutable state in
/// the runtime; the resource monitor guards mutation behind its lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub name: String,
    pub capacity: f64,
    pub used: f64,
    pub reserved: f64,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, capacity: f64) -> Self {
        Self {
            name: name.into(),
            capacity,
            used: 0.0,
            reserved: 0.0,
        }
    }

    pub fn available(&self) -> f64 {
        self.capacity - self.used - self.reserved
    }

    /// Take `amount` from the pool. Fails without mutating when the pool
    /// cannot cover it, so `used + reserved <= capacity` always holds.
    pub fn allocate(&mut self, amount: f64) -> Result<(), String> {
        if amount < 0.0 {
            return Err(format!("Negative allocation on pool {}", self.name));
        }
        if amount > self.available() {
            return Err(format!(
                "Pool {} exhausted: requested {:.1}, available {:.1}",
                self.name,
                amount,
                self.available()
            ));
        }
        self.used += amount;
        Ok(())
    }

    /// Return `amount` to the pool, clamped so `used` never goes negative.
    pub fn release(&mut self, amount: f64) {
        self.used = (self.used - amount).max(0.0);
    }

    /// Set aside `amount` without using it yet.
    pub fn reserve(&mut self, amount: f64) -> Result<(), String> {
        if amount > self.available() {
            return Err(format!(
                "Pool {} cannot reserve {:.1}, available {:.1}",
                self.name,
                amount,
                self.available()
            ));
        }
        self.reserved += amount;
        Ok(())
    }

    pub fn unreserve(&mut self, amount: f64) {
        self.reserved = (self.reserved - amount).max(0.0);
    }

    /// Invariant check used by snapshot restore: a negative pool is fatal.
    pub fn is_consistent(&self) -> bool {
        self.used >= 0.0 && self.reserved >= 0.0 && self.used + self.reserved <= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_axis_lookup() {
        let quota = ResourceQuota::default();
        assert!((quota.limit(ResourceAxis::Cpu) - 50.0).abs() < f64::EPSILON);
        assert!((quota.limit(ResourceAxis::Memory) - 512.0).abs() < f64::EPSILON);
        assert!((quota.limit(ResourceAxis::Threads) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sample_violations() {
        let quota = ResourceQuota {
            memory_mb: 64,
            ..ResourceQuota::default()
        };
        let mut sample = ResourceSample::zero();
        sample.memory_mb = 80.0;
        sample.cpu_percent = 10.0;

        let violations = sample.violations(&quota);
        assert_eq!(violations, vec![ResourceAxis::Memory]);
    }

    #[test]
    fn test_rolling_window_eviction() {
        let mut window = RollingWindow::new();
        for i in 0..(ROLLING_WINDOW_CAPACITY + 10) {
            let mut s = ResourceSample::zero();
            s.memory_mb = i as f64;
            window.push(s);
        }
        assert_eq!(window.len(), ROLLING_WINDOW_CAPACITY);
        // Oldest entries were evicted from the front.
        assert!((window.peak(ResourceAxis::Memory) - (ROLLING_WINDOW_CAPACITY + 9) as f64).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_peak_and_average() {
        let mut window = RollingWindow::new();
        for v in [10.0, 20.0, 60.0] {
            let mut s = ResourceSample::zero();
            s.cpu_percent = v;
            window.push(s);
        }
        assert!((window.peak(ResourceAxis::Cpu) - 60.0).abs() < f64::EPSILON);
        assert!((window.average(ResourceAxis::Cpu) - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_allocate_release() {
        let mut pool = ResourcePool::new("memory_mb", 100.0);
        pool.allocate(60.0).unwrap();
        assert!((pool.available() - 40.0).abs() < f64::EPSILON);

        // Over-allocation fails without mutating.
        assert!(pool.allocate(50.0).is_err());
        assert!((pool.used - 60.0).abs() < f64::EPSILON);

        pool.release(60.0);
        assert!((pool.used - 0.0).abs() < f64::EPSILON);

        // Release past zero clamps.
        pool.release(10.0);
        assert!(pool.is_consistent());
    }

    #[test]
    fn test_pool_reserve() {
        let mut pool = ResourcePool::new("cpu", 100.0);
        pool.reserve(30.0).unwrap();
        assert!((pool.available() - 70.0).abs() < f64::EPSILON);
        assert!(pool.allocate(80.0).is_err());
        pool.unreserve(30.0);
        assert!(pool.allocate(80.0).is_ok());
        assert!(pool.is_consistent());
    }
}
