//! Deterministic in-memory sensor provider.
//!
//! Used by demo mode, where no real hardware counters are wanted, and by the
//! test suite. Each sensor plays back a queue of scripted steps and falls
//! back to a synthetic waveform once the queue is empty.

use crate::sensors::types::{Reading, SensorError, SensorId, SensorInfo};
use crate::sensors::SensorSource;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One scripted outcome for a read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptStep {
    /// Return this value
    Value(f64),
    /// Fail with a provider error
    Fail,
    /// Stall for the given duration, then fail
    Hang(Duration),
}

/// Synthetic signal used after the scripted steps run out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    Constant(f64),
    /// Linear ramp up and down between `min` and `max` over `period` reads
    Triangle { min: f64, max: f64, period: u32 },
    Sine { min: f64, max: f64, period: u32 },
}

impl Waveform {
    /// Value of the waveform at read number `n`.
    pub fn at(&self, n: u64) -> f64 {
        match *self {
            Waveform::Constant(v) => v,
            Waveform::Triangle { min, max, period } => {
                let period = u64::from(period.max(2));
                let half = period as f64 / 2.0;
                let phase = (n % period) as f64;
                let t = if phase <= half {
                    phase / half
                } else {
                    (period as f64 - phase) / half
                };
                min + (max - min) * t
            }
            Waveform::Sine { min, max, period } => {
                let period = f64::from(period.max(2));
                let angle = 2.0 * PI * (n as f64) / period;
                min + (max - min) * (0.5 + 0.5 * angle.sin())
            }
        }
    }
}

struct ScriptedSensor {
    info: SensorInfo,
    steps: VecDeque<ScriptStep>,
    waveform: Waveform,
    reads: u64,
}

/// Sensor provider backed by scripts and waveforms.
pub struct ScriptedSource {
    sensors: Mutex<BTreeMap<SensorId, ScriptedSensor>>,
    calls: AtomicU64,
}

impl ScriptedSource {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self {
            sensors: Mutex::new(BTreeMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Provider with a handful of plausible sensors for demo mode.
    pub fn demo() -> Self {
        let source = Self::new();
        source.add_waveform_sensor(
            "cpu.load",
            "CPU Load",
            "%",
            Waveform::Triangle { min: 10.0, max: 90.0, period: 40 },
        );
        source.add_waveform_sensor(
            "cpu.temperature",
            "CPU Temp",
            "°C",
            Waveform::Sine { min: 45.0, max: 78.0, period: 90 },
        );
        source.add_waveform_sensor(
            "memory.usage",
            "RAM Usage",
            "%",
            Waveform::Sine { min: 38.0, max: 44.0, period: 300 },
        );
        source.add_waveform_sensor(
            "net.download",
            "Net Down",
            "MB/s",
            Waveform::Triangle { min: 0.0, max: 12.5, period: 16 },
        );
        source
    }

    /// Register a sensor that reads a constant zero until scripted.
    pub fn add_sensor(&self, id: &str, display_name: &str, unit: &str) {
        self.add_waveform_sensor(id, display_name, unit, Waveform::Constant(0.0));
    }

    /// Register a sensor that follows `waveform` once its script is empty.
    pub fn add_waveform_sensor(&self, id: &str, display_name: &str, unit: &str, waveform: Waveform) {
        self.sensors.lock().insert(
            SensorId::new(id),
            ScriptedSensor {
                info: SensorInfo::new(id, display_name, unit),
                steps: VecDeque::new(),
                waveform,
                reads: 0,
            },
        );
    }

    /// Remove a sensor; later reads report it as not found.
    pub fn remove_sensor(&self, id: &str) {
        self.sensors.lock().remove(&SensorId::new(id));
    }

    /// Queue scripted steps for `id`. Unknown ids are ignored.
    pub fn push_steps(&self, id: &str, steps: impl IntoIterator<Item = ScriptStep>) {
        if let Some(sensor) = self.sensors.lock().get_mut(&SensorId::new(id)) {
            sensor.steps.extend(steps);
        }
    }

    /// Total number of reads across all sensors, including unknown ids.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of reads served for one sensor.
    pub fn reads_for(&self, id: &str) -> u64 {
        self.sensors
            .lock()
            .get(&SensorId::new(id))
            .map(|s| s.reads)
            .unwrap_or(0)
    }

    fn next_step(&self, id: &SensorId) -> Result<(ScriptStep, String), SensorError> {
        let mut sensors = self.sensors.lock();
        let sensor = sensors
            .get_mut(id)
            .ok_or_else(|| SensorError::NotFound(id.clone()))?;

        let step = match sensor.steps.pop_front() {
            Some(step) => step,
            None => ScriptStep::Value(sensor.waveform.at(sensor.reads)),
        };
        sensor.reads += 1;
        Ok((step, sensor.info.unit.clone()))
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorSource for ScriptedSource {
    async fn read(&self, id: &SensorId) -> Result<Reading, SensorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (step, unit) = self.next_step(id)?;
        match step {
            ScriptStep::Value(value) => Ok(Reading::new(value, unit)),
            ScriptStep::Fail => Err(SensorError::Provider(format!("scripted failure for {id}"))),
            ScriptStep::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Err(SensorError::Provider(format!("scripted stall for {id}")))
            }
        }
    }

    async fn list(&self) -> Vec<SensorInfo> {
        self.sensors.lock().values().map(|s| s.info.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_waveform_hits_extremes() {
        let wave = Waveform::Triangle { min: 10.0, max: 90.0, period: 8 };
        assert_eq!(wave.at(0), 10.0);
        assert_eq!(wave.at(4), 90.0);
        assert_eq!(wave.at(8), 10.0);
        assert_eq!(wave.at(2), 50.0);
    }

    #[tokio::test]
    async fn test_steps_play_before_waveform() {
        let source = ScriptedSource::new();
        source.add_waveform_sensor("x", "X", "u", Waveform::Constant(7.0));
        source.push_steps("x", [ScriptStep::Value(1.0), ScriptStep::Fail]);

        let id = SensorId::new("x");
        assert_eq!(source.read(&id).await.unwrap().value, 1.0);
        assert!(source.read(&id).await.is_err());
        assert_eq!(source.read(&id).await.unwrap().value, 7.0);
        assert_eq!(source.reads_for("x"), 3);
        assert_eq!(source.call_count(), 3);
    }

    #[tokio::test]
    async fn test_removed_sensor_is_not_found() {
        let source = ScriptedSource::demo();
        source.remove_sensor("cpu.load");
        let result = source.read(&SensorId::new("cpu.load")).await;
        assert!(matches!(result, Err(SensorError::NotFound(_))));
    }
}
