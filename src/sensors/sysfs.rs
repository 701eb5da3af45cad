//! Linux sysfs counters that `sysinfo` does not cover: GPU busy percentage
//! from DRM devices, and fan speeds and voltages from hwmon chips.
//!
//! Every lookup rescans the tree, so hot-plugged devices show up and
//! vanished ones turn into `NotFound` on the next read.

use std::fs;
use std::path::{Path, PathBuf};

/// hwmon input kinds exposed as sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HwmonKind {
    Fan,
    Voltage,
}

impl HwmonKind {
    fn prefix(self) -> &'static str {
        match self {
            HwmonKind::Fan => "fan",
            HwmonKind::Voltage => "in",
        }
    }

    pub(crate) fn unit(self) -> &'static str {
        match self {
            HwmonKind::Fan => "RPM",
            HwmonKind::Voltage => "V",
        }
    }

    /// Raw sysfs value to display units (fans in RPM, voltages in mV).
    fn scale(self, raw: f64) -> f64 {
        match self {
            HwmonKind::Fan => raw,
            HwmonKind::Voltage => raw / 1000.0,
        }
    }
}

/// One readable hwmon input.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HwmonInput {
    pub kind: HwmonKind,
    /// Human label (`CPU Fan`, `nct6798 in0`)
    pub label: String,
    /// Identifier suffix derived from the label
    pub slug: String,
    path: PathBuf,
}

impl HwmonInput {
    pub(crate) fn read(&self) -> Option<f64> {
        read_number(&self.path).map(|raw| self.kind.scale(raw))
    }
}

/// Roots of the sysfs trees, swappable for tests.
#[derive(Debug, Clone)]
pub(crate) struct Sysfs {
    drm: PathBuf,
    hwmon: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/sys/class/drm", "/sys/class/hwmon")
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_number(path: &Path) -> Option<f64> {
    read_trimmed(path)?.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Sorted entries of `dir`, empty if it cannot be read.
fn entries(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map(|rd| rd.flatten().map(|e| e.path()).collect())
        .unwrap_or_default();
    paths.sort();
    paths
}

/// Lower-case label with every run of non-alphanumerics folded to `_`.
pub(crate) fn slug(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

impl Sysfs {
    pub(crate) fn new(drm: impl Into<PathBuf>, hwmon: impl Into<PathBuf>) -> Self {
        Self {
            drm: drm.into(),
            hwmon: hwmon.into(),
        }
    }

    /// Busy percentage of the first GPU that reports one (amdgpu).
    pub(crate) fn gpu_busy_percent(&self) -> Option<f64> {
        entries(&self.drm)
            .into_iter()
            .filter(|card| {
                card.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("card") && !n.contains('-'))
            })
            .find_map(|card| read_number(&card.join("device").join("gpu_busy_percent")))
    }

    /// Every fan and voltage input of every hwmon chip.
    pub(crate) fn hwmon_inputs(&self) -> Vec<HwmonInput> {
        let mut inputs = Vec::new();
        for chip in entries(&self.hwmon) {
            let chip_name = read_trimmed(&chip.join("name")).unwrap_or_else(|| "hwmon".into());
            for file in entries(&chip) {
                let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(channel) = name.strip_suffix("_input") else {
                    continue;
                };
                let kind = [HwmonKind::Fan, HwmonKind::Voltage].into_iter().find(|k| {
                    channel
                        .strip_prefix(k.prefix())
                        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                });
                let Some(kind) = kind else {
                    continue;
                };
                let label = read_trimmed(&chip.join(format!("{channel}_label")))
                    .filter(|l| !l.is_empty())
                    .map(|l| format!("{chip_name} {l}"))
                    .unwrap_or_else(|| format!("{chip_name} {channel}"));
                inputs.push(HwmonInput {
                    kind,
                    slug: slug(&label),
                    label,
                    path: file,
                });
            }
        }
        inputs
    }

    /// Input of `kind` whose slug is `wanted`.
    pub(crate) fn find(&self, kind: HwmonKind, wanted: &str) -> Option<HwmonInput> {
        self.hwmon_inputs()
            .into_iter()
            .find(|i| i.kind == kind && i.slug == wanted)
    }

    /// First input of `kind` whose label contains one of `hints`, tried in
    /// hint order.
    pub(crate) fn find_hinted(&self, kind: HwmonKind, hints: &[&str]) -> Option<HwmonInput> {
        let inputs: Vec<HwmonInput> = self
            .hwmon_inputs()
            .into_iter()
            .filter(|i| i.kind == kind)
            .collect();
        hints.iter().find_map(|hint| {
            inputs
                .iter()
                .find(|i| i.label.to_ascii_lowercase().contains(hint))
                .cloned()
        })
    }
}
