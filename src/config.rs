use confique::Config;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::Path, time::Duration};

use crate::{SweepError, SweepResult};

#[derive(Config, Serialize, Debug, Clone)]
pub struct ExperimentConfig {
    pub name: String,
    #[config(default = "")]
    pub description: String,
    pub min_value: f64,
    pub max_value: f64,
    /// Points per unit of sweep range, kept with the run snapshot.
    pub data_density: f64,
    pub voltage_range: [f64; 2],
    pub current_range: [f64; 2],
    pub amplification: f64,
    pub ramp_points: usize,
    #[config(default = "one_way")]
    pub sweep_shape: SweepShape,
    #[config(nested)]
    pub nidaq: NidaqConfig,
    #[config(nested)]
    pub smu: SmuConfig,
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct NidaqConfig {
    pub activation_module_id: String,
    pub readout_module_id: String,
    pub sample_frequency: f64,
    pub update_frequency: f64,
    pub samples_per_measurement: usize,
    pub readout_channels: Vec<u32>,
    pub control_voltages: BTreeMap<u32, f64>,
    /// Upper bound for one acquisition window, in ms.
    #[config(default = 10000)]
    pub read_timeout: u64,
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct SmuConfig {
    pub device_id: String,
    /// Command timeout in ms.
    pub timeout: u64,
    pub drive_mode: DriveMode,
    pub tolerance_voltage: f64,
    pub tolerance_current: f64,
    /// Settling delay after each set-point, in seconds.
    pub pause_between_set: f64,
    #[config(default = 1.0)]
    pub nplc: f64,
    /// Source delay programmed into the instrument, in seconds.
    #[config(default = 0.05)]
    pub source_delay: f64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriveMode {
    CurrentDriven,
    VoltageDriven,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SweepShape {
    #[default]
    OneWay,
    RoundTrip,
}

/// Electrical quantity sourced or measured by the SMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quantity {
    Current,
    Voltage,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Current => write!(f, "current"),
            Quantity::Voltage => write!(f, "voltage"),
        }
    }
}

impl DriveMode {
    pub fn sourced(&self) -> Quantity {
        match self {
            DriveMode::CurrentDriven => Quantity::Current,
            DriveMode::VoltageDriven => Quantity::Voltage,
        }
    }

    /// Settle tolerance matching the sourced quantity.
    pub fn tolerance(&self, smu: &SmuConfig) -> f64 {
        match self {
            DriveMode::CurrentDriven => smu.tolerance_current,
            DriveMode::VoltageDriven => smu.tolerance_voltage,
        }
    }

    /// Hard clamp for commanded set-points.
    pub fn range(&self, config: &ExperimentConfig) -> [f64; 2] {
        match self {
            DriveMode::CurrentDriven => config.current_range,
            DriveMode::VoltageDriven => config.voltage_range,
        }
    }
}

impl ExperimentConfig {
    /// Load a YAML configuration and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> SweepResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SweepError::config(format!(
                "file not found: {}",
                path.display()
            )));
        }
        let config = Self::builder()
            .file(path)
            .load()
            .map_err(|e| SweepError::config(format!("{}: {e:#}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SweepResult<()> {
        if self.name.trim().is_empty() {
            return Err(SweepError::config("name must not be empty"));
        }
        if !(self.min_value < self.max_value) {
            return Err(SweepError::config(format!(
                "min_value ({}) must be below max_value ({})",
                self.min_value, self.max_value
            )));
        }
        if self.ramp_points < 2 {
            return Err(SweepError::config(format!(
                "ramp_points must be at least 2, got {}",
                self.ramp_points
            )));
        }
        if !(self.amplification > 0.0) {
            return Err(SweepError::config("amplification must be positive"));
        }
        if !(self.data_density > 0.0) {
            return Err(SweepError::config("data_density must be positive"));
        }
        check_range("voltage_range", self.voltage_range)?;
        check_range("current_range", self.current_range)?;
        self.nidaq.validate(self.voltage_range)?;
        self.smu.validate()
    }

    pub fn tolerance(&self) -> f64 {
        self.smu.drive_mode.tolerance(&self.smu)
    }

    pub fn source_range(&self) -> [f64; 2] {
        self.smu.drive_mode.range(self)
    }

    /// Compliance limits programmed into the SMU, as in the bench setup:
    /// the smaller magnitude of each configured range.
    pub fn compliance(&self) -> (f64, f64) {
        let min_abs = |r: [f64; 2]| r[0].abs().min(r[1].abs());
        (min_abs(self.voltage_range), min_abs(self.current_range))
    }
}

impl NidaqConfig {
    fn validate(&self, voltage_range: [f64; 2]) -> SweepResult<()> {
        if !(self.update_frequency > 0.0) {
            return Err(SweepError::config("update_frequency must be positive"));
        }
        if self.sample_frequency < self.update_frequency {
            return Err(SweepError::config(format!(
                "sample_frequency ({}) must not be below update_frequency ({})",
                self.sample_frequency, self.update_frequency
            )));
        }
        if self.samples_per_measurement == 0 {
            return Err(SweepError::config("samples_per_measurement must be at least 1"));
        }
        if self.readout_channels.is_empty() {
            return Err(SweepError::config("readout_channels must not be empty"));
        }
        check_unique_channels(&self.readout_channels)?;
        for (channel, volts) in &self.control_voltages {
            if !volts.is_finite() || *volts < voltage_range[0] || *volts > voltage_range[1] {
                return Err(SweepError::config(format!(
                    "control voltage {volts} V on channel {channel} outside voltage_range [{}, {}]",
                    voltage_range[0], voltage_range[1]
                )));
            }
        }
        if self.read_timeout == 0 {
            return Err(SweepError::config("nidaq.read_timeout must be positive"));
        }
        Ok(())
    }

    /// Minimum spacing between two acquisition windows.
    pub fn update_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.update_frequency)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }
}

impl SmuConfig {
    fn validate(&self) -> SweepResult<()> {
        if self.device_id.trim().is_empty() {
            return Err(SweepError::config("smu.device_id must not be empty"));
        }
        if self.timeout == 0 {
            return Err(SweepError::config("smu.timeout must be positive"));
        }
        let tolerance = match self.drive_mode {
            DriveMode::CurrentDriven => ("tolerance_current", self.tolerance_current),
            DriveMode::VoltageDriven => ("tolerance_voltage", self.tolerance_voltage),
        };
        if !(tolerance.1 >= 0.0) || !tolerance.1.is_finite() {
            return Err(SweepError::config(format!(
                "smu.{} must be a non-negative number",
                tolerance.0
            )));
        }
        if self.tolerance_voltage < 0.0 || self.tolerance_current < 0.0 {
            return Err(SweepError::config("smu tolerances must not be negative"));
        }
        if !(self.pause_between_set >= 0.0) || !self.pause_between_set.is_finite() {
            return Err(SweepError::config("smu.pause_between_set must be >= 0"));
        }
        if !(self.nplc > 0.0) {
            return Err(SweepError::config("smu.nplc must be positive"));
        }
        if !(self.source_delay >= 0.0) {
            return Err(SweepError::config("smu.source_delay must be >= 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs_f64(self.pause_between_set)
    }
}

fn check_range(name: &str, range: [f64; 2]) -> SweepResult<()> {
    if !(range[0] < range[1]) {
        return Err(SweepError::config(format!(
            "{name} must be [lo, hi] with lo < hi, got [{}, {}]",
            range[0], range[1]
        )));
    }
    Ok(())
}

pub(crate) fn check_unique_channels(channels: &[u32]) -> SweepResult<()> {
    let mut seen = std::collections::BTreeSet::new();
    for channel in channels {
        if !seen.insert(*channel) {
            return Err(SweepError::config(format!(
                "readout channel {channel} listed more than once"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Bench configuration used across the crate's tests.
    pub(crate) fn bench_config() -> ExperimentConfig {
        ExperimentConfig {
            name: "hysteron".into(),
            description: "current sweep".into(),
            min_value: -150e-9,
            max_value: 150e-9,
            data_density: 100.0,
            voltage_range: [-2.0, 2.0],
            current_range: [-200e-9, 200e-9],
            amplification: 100.0,
            ramp_points: 30,
            sweep_shape: SweepShape::OneWay,
            nidaq: NidaqConfig {
                activation_module_id: "cDAQ1Mod1".into(),
                readout_module_id: "cDAQ1Mod2".into(),
                sample_frequency: 10_000.0,
                update_frequency: 5_000.0,
                samples_per_measurement: 8,
                readout_channels: vec![0, 3, 4],
                control_voltages: BTreeMap::from([(1, 0.5), (2, -0.25)]),
                read_timeout: 1000,
            },
            smu: SmuConfig {
                device_id: "sim".into(),
                timeout: 500,
                drive_mode: DriveMode::CurrentDriven,
                tolerance_voltage: 0.01,
                tolerance_current: 10e-9,
                pause_between_set: 0.0,
                nplc: 1.0,
                source_delay: 0.05,
            },
        }
    }

    const SETUP_YAML: &str = r#"
name: hysteron
description: Hysteron switching sweep
min_value: -150.0e-9
max_value: 150.0e-9
data_density: 100
voltage_range: [-2.0, 2.0]
current_range: [-200.0e-9, 200.0e-9]
amplification: 100
ramp_points: 30
nidaq:
  activation_module_id: cDAQ1Mod1
  readout_module_id: cDAQ1Mod2
  sample_frequency: 1000
  update_frequency: 100
  samples_per_measurement: 10
  readout_channels: [0, 1, 4]
  control_voltages:
    2: 0.3
    5: -0.1
smu:
  device_id: "GPIB0::15::INSTR"
  timeout: 25000
  drive_mode: CURRENT_DRIVEN
  tolerance_voltage: 0.01
  tolerance_current: 10.0e-9
  pause_between_set: 0.1
"#;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_setup_yaml() {
        let file = write_yaml(SETUP_YAML);
        let config = ExperimentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "hysteron");
        assert_eq!(config.ramp_points, 30);
        assert_eq!(config.sweep_shape, SweepShape::OneWay);
        assert_eq!(config.smu.drive_mode, DriveMode::CurrentDriven);
        assert_eq!(config.nidaq.readout_channels, vec![0, 1, 4]);
        assert_eq!(config.nidaq.control_voltages.get(&2), Some(&0.3));
        assert_eq!(config.nidaq.read_timeout, 10000);
        assert_eq!(config.smu.nplc, 1.0);
        assert_eq!(config.tolerance(), 10e-9);
        assert_eq!(config.source_range(), [-200e-9, 200e-9]);
    }

    #[test]
    fn round_trip_is_explicit_opt_in() {
        let yaml = SETUP_YAML.replace("ramp_points: 30", "ramp_points: 30\nsweep_shape: round_trip");
        let file = write_yaml(&yaml);
        let config = ExperimentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.sweep_shape, SweepShape::RoundTrip);
    }

    #[test]
    fn missing_field_fails() {
        let yaml = SETUP_YAML.replace("ramp_points: 30\n", "");
        let file = write_yaml(&yaml);
        let err = ExperimentConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, SweepError::Config(_)), "{err}");
        assert!(err.to_string().contains("ramp_points"), "{err}");
    }

    #[test]
    fn unknown_drive_mode_fails() {
        let yaml = SETUP_YAML.replace("CURRENT_DRIVEN", "POWER_DRIVEN");
        let file = write_yaml(&yaml);
        assert!(ExperimentConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = ExperimentConfig::from_file("/nonexistent/setup.yaml").unwrap_err();
        assert!(matches!(err, SweepError::Config(_)));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = bench_config();
        config.max_value = config.min_value;
        assert!(matches!(config.validate(), Err(SweepError::Config(_))));

        let mut config = bench_config();
        config.ramp_points = 1;
        assert!(config.validate().is_err());

        let mut config = bench_config();
        config.amplification = 0.0;
        assert!(config.validate().is_err());

        let mut config = bench_config();
        config.nidaq.update_frequency = 20_000.0;
        assert!(config.validate().is_err());

        let mut config = bench_config();
        config.nidaq.samples_per_measurement = 0;
        assert!(config.validate().is_err());

        let mut config = bench_config();
        config.nidaq.readout_channels = vec![0, 3, 0];
        assert!(config.validate().is_err());

        let mut config = bench_config();
        config.nidaq.control_voltages.insert(7, 5.0);
        assert!(config.validate().is_err());

        let mut config = bench_config();
        config.smu.tolerance_current = -1e-9;
        assert!(config.validate().is_err());

        let mut config = bench_config();
        config.smu.timeout = 0;
        assert!(config.validate().is_err());

        assert!(bench_config().validate().is_ok());
    }

    #[test]
    fn drive_mode_selects_matching_fields() {
        let mut config = bench_config();
        assert_eq!(config.tolerance(), config.smu.tolerance_current);
        config.smu.drive_mode = DriveMode::VoltageDriven;
        assert_eq!(config.tolerance(), config.smu.tolerance_voltage);
        assert_eq!(config.source_range(), config.voltage_range);
        assert_eq!(config.smu.drive_mode.sourced(), Quantity::Voltage);
    }

    #[test]
    fn compliance_uses_smaller_magnitude() {
        let mut config = bench_config();
        config.voltage_range = [-1.5, 3.0];
        assert_eq!(config.compliance(), (1.5, 200e-9));
    }
}
