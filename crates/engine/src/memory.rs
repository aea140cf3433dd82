//! Memory pressure governor
//!
//! The governor samples host and device memory, decides when transient
//! allocations should be reclaimed, and owns the per-device locks that keep a
//! reclaim pass from running while a batch is generating on the same device.
//!
//! Reclaiming never unloads registered models; that stays an explicit
//! registry operation.

use crate::model::Device;
use modelserve_common::config::MemoryConfig;
use modelserve_common::METRICS;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Point-in-time memory snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    /// Host memory in use, percent
    pub host_percent_used: f64,

    /// Device bytes in use
    pub device_bytes_used: u64,

    /// Device capacity in bytes
    pub device_bytes_max: u64,
}

impl MemorySample {
    /// Fraction of device capacity in use
    pub fn device_fraction(&self) -> f64 {
        if self.device_bytes_max == 0 {
            return 0.0;
        }
        self.device_bytes_used as f64 / self.device_bytes_max as f64
    }

    /// Device headroom in bytes
    pub fn free_device_bytes(&self) -> u64 {
        self.device_bytes_max.saturating_sub(self.device_bytes_used)
    }
}

/// Source of memory measurements
pub trait MemorySource: Send + Sync {
    /// Take a snapshot
    fn sample(&self) -> MemorySample;

    /// Free transient allocations, returning the bytes released
    fn release_transient(&self) -> u64 {
        0
    }
}

/// Ledger of bytes held on a device
///
/// Resident bytes belong to loaded models; transient bytes are batch scratch
/// space that stays cached until the next reclaim.
#[derive(Debug)]
pub struct DeviceAccounting {
    capacity: u64,
    resident: AtomicU64,
    transient: AtomicU64,
}

impl DeviceAccounting {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            resident: AtomicU64::new(0),
            transient: AtomicU64::new(0),
        }
    }

    pub fn allocate_resident(&self, bytes: u64) {
        self.resident.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn release_resident(&self, bytes: u64) {
        let _ = self
            .resident
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn reserve_transient(&self, bytes: u64) {
        self.transient.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Drop all transient bytes, returning how many were held
    pub fn clear_transient(&self) -> u64 {
        self.transient.swap(0, Ordering::Relaxed)
    }

    pub fn used(&self) -> u64 {
        self.resident.load(Ordering::Relaxed) + self.transient.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Host memory from `/proc/meminfo` plus the device ledger
pub struct SystemMemorySource {
    device: Arc<DeviceAccounting>,
}

impl SystemMemorySource {
    pub fn new(device: Arc<DeviceAccounting>) -> Self {
        Self { device }
    }
}

impl MemorySource for SystemMemorySource {
    fn sample(&self) -> MemorySample {
        MemorySample {
            host_percent_used: host_percent_used().unwrap_or(0.0),
            device_bytes_used: self.device.used(),
            device_bytes_max: self.device.capacity(),
        }
    }

    fn release_transient(&self) -> u64 {
        self.device.clear_transient()
    }
}

fn host_percent_used() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let percent = parse_meminfo(&meminfo);
    if percent.is_none() {
        trace!("Host memory accounting unavailable");
    }
    percent
}

/// Percent of host memory in use from a `/proc/meminfo` body
fn parse_meminfo(content: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse().ok())
    };

    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((1.0 - available as f64 / total as f64) * 100.0)
}

/// Manually driven source for tests and simulations
#[derive(Debug, Default)]
pub struct FixedMemorySource {
    host_percent_bits: AtomicU64,
    device_used: AtomicU64,
    device_max: AtomicU64,
    transient: AtomicU64,
}

impl FixedMemorySource {
    pub fn new(host_percent_used: f64, device_bytes_used: u64, device_bytes_max: u64) -> Self {
        Self {
            host_percent_bits: AtomicU64::new(host_percent_used.to_bits()),
            device_used: AtomicU64::new(device_bytes_used),
            device_max: AtomicU64::new(device_bytes_max),
            transient: AtomicU64::new(0),
        }
    }

    pub fn set_host_percent(&self, percent: f64) {
        self.host_percent_bits.store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn set_device_used(&self, bytes: u64) {
        self.device_used.store(bytes, Ordering::Relaxed);
    }

    /// Bytes the next reclaim will report as released
    pub fn set_transient(&self, bytes: u64) {
        self.transient.store(bytes, Ordering::Relaxed);
    }
}

impl MemorySource for FixedMemorySource {
    fn sample(&self) -> MemorySample {
        MemorySample {
            host_percent_used: f64::from_bits(self.host_percent_bits.load(Ordering::Relaxed)),
            device_bytes_used: self.device_used.load(Ordering::Relaxed),
            device_bytes_max: self.device_max.load(Ordering::Relaxed),
        }
    }

    fn release_transient(&self) -> u64 {
        let released = self.transient.swap(0, Ordering::Relaxed);
        let _ = self
            .device_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(released))
            });
        released
    }
}

/// One lock per device, shared by reclaim and generation
#[derive(Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<Device, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn get(&self, device: Device) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(device)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Memory pressure governor
pub struct MemoryGovernor {
    source: Arc<dyn MemorySource>,
    accounting: Arc<DeviceAccounting>,
    threshold: f64,
    locks: DeviceLocks,
}

impl MemoryGovernor {
    /// Create a governor over an explicit source
    pub fn new(
        source: Arc<dyn MemorySource>,
        accounting: Arc<DeviceAccounting>,
        threshold: f64,
    ) -> Self {
        Self {
            source,
            accounting,
            threshold,
            locks: DeviceLocks::default(),
        }
    }

    /// Governor over host memory and a device ledger sized from config
    pub fn from_config(config: &MemoryConfig) -> Self {
        let accounting = Arc::new(DeviceAccounting::new(config.device_capacity_bytes));
        let source = Arc::new(SystemMemorySource::new(accounting.clone()));
        Self::new(source, accounting, config.threshold)
    }

    /// Take a snapshot and publish it
    pub fn sample(&self) -> MemorySample {
        let sample = self.source.sample();
        METRICS
            .engine
            .host_memory_percent
            .set(sample.host_percent_used.round() as i64);
        METRICS
            .engine
            .device_memory_used
            .set(sample.device_bytes_used.min(i64::MAX as u64) as i64);
        sample
    }

    /// Whether `sample` crosses the pressure threshold
    pub fn is_under_pressure(&self, sample: &MemorySample) -> bool {
        sample.device_fraction() > self.threshold
            || sample.host_percent_used > self.threshold * 100.0
    }

    /// Sample now and report whether transient state should be evicted
    pub fn should_evict(&self) -> bool {
        let sample = self.sample();
        self.is_under_pressure(&sample)
    }

    /// Release transient allocations on `device`
    ///
    /// Blocks until no batch is generating on the same device.
    pub fn reclaim(&self, device: Device) -> u64 {
        let lock = self.locks.get(device);
        let _guard = lock.lock();

        let released = self.source.release_transient();
        METRICS.engine.reclaims_total.inc();
        warn!(
            "Memory pressure on {}: reclaimed {} transient bytes",
            device, released
        );
        released
    }

    /// Reclaim if the threshold is crossed; returns whether a reclaim ran
    pub fn relieve_pressure(&self, device: Device) -> bool {
        if self.should_evict() {
            self.reclaim(device);
            true
        } else {
            debug!("No memory pressure on {}", device);
            false
        }
    }

    /// Lock serializing reclaim and generation on `device`
    pub fn device_lock(&self, device: Device) -> Arc<Mutex<()>> {
        self.locks.get(device)
    }

    pub fn accounting(&self) -> &Arc<DeviceAccounting> {
        &self.accounting
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn governor(source: Arc<FixedMemorySource>) -> MemoryGovernor {
        MemoryGovernor::new(source, Arc::new(DeviceAccounting::new(16 * GIB)), 0.9)
    }

    #[test]
    fn test_should_evict_on_device_pressure() {
        let source = Arc::new(FixedMemorySource::new(10.0, 95, 100));
        let governor = governor(source.clone());
        assert!(governor.should_evict());

        source.set_device_used(50);
        assert!(!governor.should_evict());
    }

    #[test]
    fn test_should_evict_on_host_pressure() {
        let source = Arc::new(FixedMemorySource::new(91.0, 0, 100));
        let governor = governor(source.clone());
        assert!(governor.should_evict());

        source.set_host_percent(89.0);
        assert!(!governor.should_evict());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let source = Arc::new(FixedMemorySource::new(90.0, 90, 100));
        assert!(!governor(source).should_evict());
    }

    #[test]
    fn test_reclaim_releases_transient() {
        let source = Arc::new(FixedMemorySource::new(10.0, 95, 100));
        source.set_transient(20);
        let governor = governor(source.clone());

        assert!(governor.relieve_pressure(Device::Cpu));
        assert_eq!(source.sample().device_bytes_used, 75);
        assert!(!governor.relieve_pressure(Device::Cpu));
    }

    #[test]
    fn test_device_accounting() {
        let accounting = Arc::new(DeviceAccounting::new(10 * GIB));
        accounting.allocate_resident(2 * GIB);
        accounting.reserve_transient(GIB);
        assert_eq!(accounting.used(), 3 * GIB);

        let source = SystemMemorySource::new(accounting.clone());
        assert_eq!(source.sample().device_bytes_used, 3 * GIB);
        assert_eq!(source.release_transient(), GIB);
        assert_eq!(accounting.used(), 2 * GIB);

        accounting.release_resident(5 * GIB);
        assert_eq!(accounting.used(), 0);
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        let percent = parse_meminfo(content).unwrap();
        assert!((percent - 75.0).abs() < 1e-9);
        assert!(parse_meminfo("MemTotal: 10 kB\n").is_none());
    }

    #[test]
    fn test_device_locks_are_shared() {
        let locks = DeviceLocks::default();
        let a = locks.get(Device::Cpu);
        let b = locks.get(Device::Cpu);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &locks.get(Device::Cuda(0))));
    }
}
