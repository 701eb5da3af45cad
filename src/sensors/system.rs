//! Host sensors backed by the `sysinfo` crate.
//!
//! Exposes CPU load, memory, network and disk throughput, and every
//! temperature component the OS reports. On Linux, GPU load, fans and
//! voltages come from sysfs. Rates are computed from cumulative counters, so
//! the first read of a rate sensor has no baseline and fails.

use crate::sensors::sysfs::{slug, HwmonInput, HwmonKind, Sysfs};
use crate::sensors::types::{Reading, SensorError, SensorId, SensorInfo};
use crate::sensors::SensorSource;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Components, Disks, Networks, System};

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Shortest span a rate is measured over. Reads closer together than this
/// share the last measurement, so keys bound to the same counter do not
/// shorten each other's span.
pub const MIN_RATE_PERIOD: Duration = Duration::from_millis(500);

/// Percentages slightly above 100 show up from rounding in some kernels.
const PERCENT_CEILING: f64 = 100.5;

const CPU_LABEL_HINTS: &[&str] = &["package", "tdie", "tctl", "coretemp", "k10temp", "cpu"];
const GPU_LABEL_HINTS: &[&str] = &["amdgpu", "nvidia", "gpu", "edge", "radeon", "nouveau"];
const BOARD_LABEL_HINTS: &[&str] = &["systin", "motherboard", "nct", "it87", "acpitz"];
const NVME_LABEL_HINTS: &[&str] = &["nvme", "composite"];
const VCORE_LABEL_HINTS: &[&str] = &["vcore", "cpu"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Counter {
    NetRx,
    NetTx,
    DiskRead,
    DiskWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Metric {
    CpuLoad,
    MemoryUsage,
    MemoryUsed,
    Rate(Counter),
    CpuTemperature,
    GpuTemperature,
    BoardTemperature,
    NvmeTemperature,
    Component(String),
    GpuLoad,
    CpuVoltage,
    Hwmon(HwmonKind, String),
}

impl Metric {
    fn parse(id: &SensorId) -> Option<Self> {
        let metric = match id.as_str() {
            "cpu.load" => Metric::CpuLoad,
            "memory.usage" => Metric::MemoryUsage,
            "memory.used" => Metric::MemoryUsed,
            "net.download" => Metric::Rate(Counter::NetRx),
            "net.upload" => Metric::Rate(Counter::NetTx),
            "disk.read" => Metric::Rate(Counter::DiskRead),
            "disk.write" => Metric::Rate(Counter::DiskWrite),
            "cpu.temperature" => Metric::CpuTemperature,
            "gpu.temperature" => Metric::GpuTemperature,
            "board.temperature" => Metric::BoardTemperature,
            "nvme.temperature" => Metric::NvmeTemperature,
            "gpu.load" => Metric::GpuLoad,
            "cpu.voltage" => Metric::CpuVoltage,
            other => {
                if let Some(rest) = other.strip_prefix("temp.") {
                    Metric::Component(rest.to_string())
                } else if let Some(rest) = other.strip_prefix("fan.") {
                    Metric::Hwmon(HwmonKind::Fan, rest.to_string())
                } else {
                    Metric::Hwmon(HwmonKind::Voltage, other.strip_prefix("volt.")?.to_string())
                }
            }
        };
        Some(metric)
    }

    fn unit(&self) -> &'static str {
        match self {
            Metric::CpuLoad | Metric::MemoryUsage | Metric::GpuLoad => "%",
            Metric::MemoryUsed => "GB",
            Metric::Rate(_) => "MB/s",
            Metric::CpuTemperature
            | Metric::GpuTemperature
            | Metric::BoardTemperature
            | Metric::NvmeTemperature
            | Metric::Component(_) => "°C",
            Metric::CpuVoltage => HwmonKind::Voltage.unit(),
            Metric::Hwmon(kind, _) => kind.unit(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    total: u64,
    at: Instant,
    rate: Option<f64>,
}

/// Per-counter baselines for MB/s rates.
#[derive(Debug, Default)]
struct RateTracker {
    windows: HashMap<Counter, RateWindow>,
}

impl RateTracker {
    /// Rate of `counter` at `now`. Within [`MIN_RATE_PERIOD`] of the last
    /// measurement the previous rate is returned and `total` is not called.
    /// `None` until two measurements far enough apart exist.
    fn rate(&mut self, counter: Counter, now: Instant, total: impl FnOnce() -> u64) -> Option<f64> {
        if let Some(window) = self.windows.get(&counter) {
            if now.saturating_duration_since(window.at) < MIN_RATE_PERIOD {
                return window.rate;
            }
        }
        let total = total();
        let rate = self.windows.get(&counter).map(|prev| {
            let elapsed = now.duration_since(prev.at).as_secs_f64();
            total.saturating_sub(prev.total) as f64 / BYTES_PER_MB / elapsed
        });
        self.windows.insert(counter, RateWindow { total, at: now, rate });
        rate
    }
}

struct SystemState {
    system: System,
    components: Components,
    networks: Networks,
    disks: Disks,
    sysfs: Sysfs,
    last_cpu_refresh: Option<Instant>,
    rates: RateTracker,
}

impl SystemState {
    fn new(sysfs: Sysfs) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system,
            components: Components::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            disks: Disks::new_with_refreshed_list(),
            sysfs,
            last_cpu_refresh: Some(Instant::now()),
            rates: RateTracker::default(),
        }
    }

    fn read(&mut self, id: &SensorId, metric: &Metric) -> Result<Reading, SensorError> {
        let unit = metric.unit();
        match metric {
            Metric::CpuLoad => {
                // Refreshing faster than sysinfo's minimum interval yields noise,
                // so keys polling the CPU back to back share one measurement.
                let stale = self
                    .last_cpu_refresh
                    .map(|t| t.elapsed() >= sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)
                    .unwrap_or(true);
                if stale {
                    self.system.refresh_cpu_usage();
                    self.last_cpu_refresh = Some(Instant::now());
                }
                Ok(percentage(f64::from(self.system.global_cpu_usage()), unit))
            }
            Metric::MemoryUsage => {
                self.system.refresh_memory();
                let total = self.system.total_memory();
                if total == 0 {
                    return Err(SensorError::Provider("total memory reported as zero".into()));
                }
                let used = self.system.used_memory() as f64 / total as f64 * 100.0;
                Ok(percentage(used, unit))
            }
            Metric::MemoryUsed => {
                self.system.refresh_memory();
                let gb = self.system.used_memory() as f64 / (BYTES_PER_MB * 1024.0);
                Ok(Reading::new(gb, unit))
            }
            Metric::Rate(counter) => self.rate(*counter, unit),
            Metric::CpuTemperature => self.temperature_matching(id, CPU_LABEL_HINTS, unit),
            Metric::GpuTemperature => self.temperature_matching(id, GPU_LABEL_HINTS, unit),
            Metric::BoardTemperature => self.temperature_matching(id, BOARD_LABEL_HINTS, unit),
            Metric::NvmeTemperature => self.temperature_matching(id, NVME_LABEL_HINTS, unit),
            Metric::GpuLoad => self
                .sysfs
                .gpu_busy_percent()
                .map(|busy| percentage(busy, unit))
                .ok_or_else(|| SensorError::NotFound(id.clone())),
            Metric::CpuVoltage => {
                let input = self.sysfs.find_hinted(HwmonKind::Voltage, VCORE_LABEL_HINTS);
                hwmon_reading(id, input, unit)
            }
            Metric::Hwmon(kind, wanted) => hwmon_reading(id, self.sysfs.find(*kind, wanted), unit),
            Metric::Component(wanted) => {
                self.components.refresh(true);
                let component = self
                    .components
                    .list()
                    .iter()
                    .find(|c| slug(c.label()) == *wanted)
                    .ok_or_else(|| SensorError::NotFound(id.clone()))?;
                temperature_reading(component.temperature(), unit)
            }
        }
    }

    fn rate(&mut self, counter: Counter, unit: &str) -> Result<Reading, SensorError> {
        let Self {
            networks,
            disks,
            rates,
            ..
        } = self;
        let total = || match counter {
            Counter::NetRx | Counter::NetTx => {
                networks.refresh(true);
                networks
                    .list()
                    .values()
                    .map(|n| match counter {
                        Counter::NetRx => n.total_received(),
                        _ => n.total_transmitted(),
                    })
                    .sum::<u64>()
            }
            Counter::DiskRead | Counter::DiskWrite => {
                disks.refresh(true);
                disks
                    .list()
                    .iter()
                    .map(|d| {
                        let usage = d.usage();
                        match counter {
                            Counter::DiskRead => usage.total_read_bytes,
                            _ => usage.total_written_bytes,
                        }
                    })
                    .sum::<u64>()
            }
        };
        rates
            .rate(counter, Instant::now(), total)
            .map(|mb_per_sec| Reading::new(mb_per_sec, unit))
            .ok_or_else(|| SensorError::Provider("rate has no baseline yet".into()))
    }

    fn temperature_matching(
        &mut self,
        id: &SensorId,
        hints: &[&str],
        unit: &str,
    ) -> Result<Reading, SensorError> {
        self.components.refresh(true);
        for hint in hints {
            let found = self
                .components
                .list()
                .iter()
                .find(|c| c.label().to_ascii_lowercase().contains(hint));
            if let Some(component) = found {
                return temperature_reading(component.temperature(), unit);
            }
        }
        Err(SensorError::NotFound(id.clone()))
    }

    fn list(&mut self) -> Vec<SensorInfo> {
        let mut sensors = vec![
            SensorInfo::new("cpu.load", "CPU Load", "%"),
            SensorInfo::new("memory.usage", "RAM Usage", "%"),
            SensorInfo::new("memory.used", "RAM Used", "GB"),
            SensorInfo::new("net.download", "Net Down", "MB/s"),
            SensorInfo::new("net.upload", "Net Up", "MB/s"),
            SensorInfo::new("disk.read", "Disk Read", "MB/s"),
            SensorInfo::new("disk.write", "Disk Write", "MB/s"),
        ];

        self.components.refresh(true);
        let labels: Vec<String> = self
            .components
            .list()
            .iter()
            .map(|c| c.label().to_ascii_lowercase())
            .collect();
        let has = |hints: &[&str]| labels.iter().any(|l| hints.iter().any(|h| l.contains(h)));
        if has(CPU_LABEL_HINTS) {
            sensors.push(SensorInfo::new("cpu.temperature", "CPU Temp", "°C"));
        }
        if has(GPU_LABEL_HINTS) {
            sensors.push(SensorInfo::new("gpu.temperature", "GPU Temp", "°C"));
        }
        if has(BOARD_LABEL_HINTS) {
            sensors.push(SensorInfo::new("board.temperature", "Motherboard", "°C"));
        }
        if has(NVME_LABEL_HINTS) {
            sensors.push(SensorInfo::new("nvme.temperature", "NVMe Temp", "°C"));
        }
        if self.sysfs.gpu_busy_percent().is_some() {
            sensors.push(SensorInfo::new("gpu.load", "GPU Load", "%"));
        }

        for component in self.components.list() {
            let id = slug(component.label());
            if !id.is_empty() {
                sensors.push(SensorInfo::new(format!("temp.{id}"), component.label(), "°C"));
            }
        }

        let inputs = self.sysfs.hwmon_inputs();
        let has_vcore = inputs.iter().any(|i| {
            i.kind == HwmonKind::Voltage
                && VCORE_LABEL_HINTS
                    .iter()
                    .any(|h| i.label.to_ascii_lowercase().contains(h))
        });
        if has_vcore {
            sensors.push(SensorInfo::new("cpu.voltage", "CPU Voltage", "V"));
        }
        for input in inputs {
            let prefix = match input.kind {
                HwmonKind::Fan => "fan",
                HwmonKind::Voltage => "volt",
            };
            sensors.push(SensorInfo::new(
                format!("{prefix}.{}", input.slug),
                input.label.clone(),
                input.kind.unit(),
            ));
        }
        sensors
    }
}

fn hwmon_reading(id: &SensorId, input: Option<HwmonInput>, unit: &str) -> Result<Reading, SensorError> {
    let input = input.ok_or_else(|| SensorError::NotFound(id.clone()))?;
    input
        .read()
        .map(|value| Reading::new(value, unit))
        .ok_or_else(|| SensorError::Provider(format!("{} is unreadable", input.label)))
}

fn percentage(value: f64, unit: &str) -> Reading {
    let mut reading = Reading::new(value, unit);
    if !(0.0..=PERCENT_CEILING).contains(&value) {
        reading.ok = false;
    }
    reading
}

fn temperature_reading(celsius: Option<f32>, unit: &str) -> Result<Reading, SensorError> {
    celsius
        .map(|t| Reading::new(f64::from(t), unit))
        .ok_or_else(|| SensorError::Provider("component has no temperature".into()))
}

/// Sensor provider for the local machine.
#[derive(Clone)]
pub struct SystemSensors {
    state: Arc<Mutex<SystemState>>,
}

impl SystemSensors {
    /// Create the provider and take the initial counter snapshot.
    pub fn new() -> Self {
        Self::with_sysfs(Sysfs::default())
    }

    pub(crate) fn with_sysfs(sysfs: Sysfs) -> Self {
        Self {
            state: Arc::new(Mutex::new(SystemState::new(sysfs))),
        }
    }
}

impl Default for SystemSensors {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorSource for SystemSensors {
    async fn read(&self, id: &SensorId) -> Result<Reading, SensorError> {
        let metric = Metric::parse(id).ok_or_else(|| SensorError::NotFound(id.clone()))?;
        let state = Arc::clone(&self.state);
        let id = id.clone();

        // sysinfo refreshes are blocking syscalls
        tokio::task::spawn_blocking(move || state.lock().read(&id, &metric))
            .await
            .map_err(|e| SensorError::Provider(format!("sensor worker failed: {e}")))?
    }

    async fn list(&self) -> Vec<SensorInfo> {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || state.lock().list())
            .await
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_to_back_rate_reads_share_one_measurement() {
        let mut rates = RateTracker::default();
        let start = Instant::now();
        let mb = 1_048_576;

        assert_eq!(rates.rate(Counter::NetRx, start, || 0), None);
        // Too soon for a first measurement; the counter is not even read.
        let early = start + Duration::from_millis(100);
        assert_eq!(rates.rate(Counter::NetRx, early, || panic!("read too early")), None);

        let first = start + Duration::from_secs(1);
        assert_eq!(rates.rate(Counter::NetRx, first, || 2 * mb), Some(2.0));
        // A second key reading right after gets the same value instead of a
        // rate over a few microseconds.
        let second = first + Duration::from_micros(400);
        assert_eq!(rates.rate(Counter::NetRx, second, || 3 * mb), Some(2.0));

        let later = first + Duration::from_secs(2);
        assert_eq!(rates.rate(Counter::NetRx, later, || 6 * mb), Some(2.0));
        assert_eq!(rates.rate(Counter::NetTx, later, || 6 * mb), None);
    }

    #[tokio::test]
    async fn test_sysfs_sensors_are_listed_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let busy = dir.path().join("drm/card0/device/gpu_busy_percent");
        std::fs::create_dir_all(busy.parent().unwrap()).unwrap();
        std::fs::write(&busy, "64\n").unwrap();
        let chip = dir.path().join("hwmon/hwmon0");
        std::fs::create_dir_all(&chip).unwrap();
        std::fs::write(chip.join("name"), "it8689\n").unwrap();
        std::fs::write(chip.join("fan2_input"), "950\n").unwrap();
        std::fs::write(chip.join("in0_input"), "1200\n").unwrap();
        std::fs::write(chip.join("in0_label"), "CPU Vcore\n").unwrap();

        let sensors = SystemSensors::with_sysfs(Sysfs::new(dir.path().join("drm"), dir.path().join("hwmon")));
        let ids: Vec<String> = sensors.list().await.into_iter().map(|s| s.id.to_string()).collect();
        for id in ["gpu.load", "cpu.voltage", "fan.it8689_fan2", "volt.it8689_cpu_vcore"] {
            assert!(ids.iter().any(|i| i == id), "{id} missing from {ids:?}");
        }

        let gpu = sensors.read(&SensorId::new("gpu.load")).await.unwrap();
        assert_eq!((gpu.value, gpu.unit.as_str(), gpu.ok), (64.0, "%", true));
        let fan = sensors.read(&SensorId::new("fan.it8689_fan2")).await.unwrap();
        assert_eq!((fan.value, fan.unit.as_str()), (950.0, "RPM"));
        let volts = sensors.read(&SensorId::new("cpu.voltage")).await.unwrap();
        assert!((volts.value - 1.2).abs() < 1e-9);
        assert!(matches!(
            sensors.read(&SensorId::new("fan.nope")).await,
            Err(SensorError::NotFound(_))
        ));
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!(Metric::parse(&"cpu.load".into()), Some(Metric::CpuLoad));
        assert_eq!(
            Metric::parse(&"net.upload".into()),
            Some(Metric::Rate(Counter::NetTx))
        );
        assert_eq!(
            Metric::parse(&"temp.nvme_composite".into()),
            Some(Metric::Component("nvme_composite".into()))
        );
        assert_eq!(
            Metric::parse(&"fan.nct6798_cpu_fan".into()),
            Some(Metric::Hwmon(HwmonKind::Fan, "nct6798_cpu_fan".into()))
        );
        assert_eq!(Metric::parse(&"gpu.load".into()), Some(Metric::GpuLoad));
        assert_eq!(Metric::parse(&"bogus".into()), None);
    }

    #[test]
    fn test_out_of_range_percentage_is_not_ok() {
        assert!(!percentage(250.0, "%").ok);
        assert!(!percentage(-1.0, "%").ok);
        assert!(percentage(100.2, "%").ok);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let sensors = SystemSensors::new();
        let result = sensors.read(&SensorId::new("bogus")).await;
        assert!(matches!(result, Err(SensorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_contains_core_metrics() {
        let sensors = SystemSensors::new();
        let list = sensors.list().await;
        assert!(list.iter().any(|s| s.id.as_str() == "cpu.load"));
        assert!(list.iter().any(|s| s.id.as_str() == "memory.usage"));
    }
}
