//! NI-DAQ chassis boundary and the per-run acquisition session.
//!
//! The chassis has two modules: an activation module whose analog outputs
//! hold the static control voltages, and a readout module whose analog inputs
//! are sampled once per sweep step.

use log::{error, info};
use ndarray::Array2;
use std::{
    collections::BTreeMap,
    thread,
    time::{Duration, Instant},
};
use time::OffsetDateTime;

use crate::{config::check_unique_channels, ExperimentConfig, SweepError, SweepResult};

/// Steps used to bring a held control voltage back to 0 V on release.
pub const OUTPUT_RAMP_STEPS: usize = 10;

pub trait DaqChassis {
    fn name(&self) -> &str;

    fn reset_module(&mut self, module: &str) -> SweepResult<()>;

    /// Number of analog input channels on `module`.
    fn ai_channel_count(&self, module: &str) -> SweepResult<u32>;

    /// Number of analog output channels on `module`.
    fn ao_channel_count(&self, module: &str) -> SweepResult<u32>;

    /// Drive a static voltage on one analog output.
    fn write_voltage(
        &mut self,
        module: &str,
        channel: u32,
        volts: f64,
        limits: [f64; 2],
    ) -> SweepResult<()>;

    /// Finite acquisition of `samples` points per channel at `sample_rate`.
    /// Rows follow the order of `channels`.
    fn read_voltages(
        &mut self,
        module: &str,
        channels: &[u32],
        sample_rate: f64,
        samples: usize,
        timeout: Duration,
    ) -> SweepResult<Array2<f64>>;
}

impl<T: DaqChassis + ?Sized> DaqChassis for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn reset_module(&mut self, module: &str) -> SweepResult<()> {
        (**self).reset_module(module)
    }

    fn ai_channel_count(&self, module: &str) -> SweepResult<u32> {
        (**self).ai_channel_count(module)
    }

    fn ao_channel_count(&self, module: &str) -> SweepResult<u32> {
        (**self).ao_channel_count(module)
    }

    fn write_voltage(
        &mut self,
        module: &str,
        channel: u32,
        volts: f64,
        limits: [f64; 2],
    ) -> SweepResult<()> {
        (**self).write_voltage(module, channel, volts, limits)
    }

    fn read_voltages(
        &mut self,
        module: &str,
        channels: &[u32],
        sample_rate: f64,
        samples: usize,
        timeout: Duration,
    ) -> SweepResult<Array2<f64>> {
        (**self).read_voltages(module, channels, sample_rate, samples, timeout)
    }
}

/// One acquisition window: raw samples per readout channel.
#[derive(Debug, Clone)]
pub struct AcquisitionWindow {
    pub started_at: OffsetDateTime,
    pub started: Instant,
    pub buffers: BTreeMap<u32, Vec<f64>>,
}

pub struct AcquisitionController<'a, D: DaqChassis + ?Sized> {
    daq: &'a mut D,
    activation_module: String,
    readout_module: String,
    channels: Vec<u32>,
    ao_channels: u32,
    sample_rate: f64,
    update_period: Duration,
    read_timeout: Duration,
    voltage_limits: [f64; 2],
    active_outputs: BTreeMap<u32, f64>,
    static_applied: bool,
    last_window: Option<Instant>,
    released: bool,
}

impl<'a, D: DaqChassis + ?Sized> AcquisitionController<'a, D> {
    /// Check the channel set against the chassis, reset both modules and
    /// bring every activation channel to 0 V.
    pub fn configure(daq: &'a mut D, config: &ExperimentConfig) -> SweepResult<Self> {
        let nidaq = &config.nidaq;
        check_unique_channels(&nidaq.readout_channels)?;

        let ai_channels = daq.ai_channel_count(&nidaq.readout_module_id)?;
        if let Some(channel) = nidaq
            .readout_channels
            .iter()
            .find(|&&ch| ch >= ai_channels)
        {
            return Err(SweepError::config(format!(
                "readout channel {channel} does not exist on {} ({ai_channels} inputs)",
                nidaq.readout_module_id
            )));
        }
        let ao_channels = daq.ao_channel_count(&nidaq.activation_module_id)?;
        check_outputs(&nidaq.control_voltages, ao_channels, &nidaq.activation_module_id)?;

        let mut channels = nidaq.readout_channels.clone();
        channels.sort_unstable();

        let mut controller = Self {
            daq,
            activation_module: nidaq.activation_module_id.clone(),
            readout_module: nidaq.readout_module_id.clone(),
            channels,
            ao_channels,
            sample_rate: nidaq.sample_frequency,
            update_period: nidaq.update_period(),
            read_timeout: nidaq.read_timeout(),
            voltage_limits: config.voltage_range,
            active_outputs: BTreeMap::new(),
            static_applied: false,
            last_window: None,
            released: false,
        };

        controller.daq.reset_module(&controller.activation_module)?;
        controller.daq.reset_module(&controller.readout_module)?;

        info!(" --- INSTRUMENT: NIDAQ --- ");
        info!(
            "Following voltages will be applied: {} on channels {} respectively",
            join(nidaq.control_voltages.values()),
            join(nidaq.control_voltages.keys())
        );
        info!("Readout channels: {}", join(controller.channels.iter()));

        for &channel in nidaq.control_voltages.keys() {
            controller.write_output(channel, 0.0)?;
        }

        Ok(controller)
    }

    pub fn channels(&self) -> &[u32] {
        &self.channels
    }

    /// Apply the static control voltages. Allowed once per session.
    pub fn apply_static_voltages(&mut self, control_voltages: &BTreeMap<u32, f64>) -> SweepResult<()> {
        if self.static_applied {
            return Err(SweepError::config(
                "static control voltages are applied once per run",
            ));
        }
        check_outputs(control_voltages, self.ao_channels, &self.activation_module)?;
        self.static_applied = true;
        for (&channel, &volts) in control_voltages {
            self.write_output(channel, volts)?;
            info!("(NIDAQ Channel {channel}) Voltage {volts}V applied.");
        }
        Ok(())
    }

    /// Acquire `samples` points on every readout channel. Windows are spaced
    /// by at least one update period.
    pub fn acquire(&mut self, samples: usize) -> SweepResult<AcquisitionWindow> {
        if let Some(last) = self.last_window {
            let next = last + self.update_period;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
        }

        let started = Instant::now();
        let started_at = OffsetDateTime::now_utc();
        self.last_window = Some(started);

        let data = self.daq.read_voltages(
            &self.readout_module,
            &self.channels,
            self.sample_rate,
            samples,
            self.read_timeout,
        )?;
        if data.dim() != (self.channels.len(), samples) {
            return Err(SweepError::instrument(
                self.daq.name(),
                format!(
                    "read returned {:?} samples, expected ({}, {samples})",
                    data.dim(),
                    self.channels.len()
                ),
            ));
        }

        let buffers = self
            .channels
            .iter()
            .zip(data.rows())
            .map(|(&channel, row)| (channel, row.to_vec()))
            .collect();

        Ok(AcquisitionWindow {
            started_at,
            started,
            buffers,
        })
    }

    /// Return every activation channel touched in this session to 0 V.
    pub fn release(mut self) -> SweepResult<()> {
        self.released = true;
        self.zero_outputs()
    }

    fn write_output(&mut self, channel: u32, volts: f64) -> SweepResult<()> {
        self.daq.write_voltage(
            &self.activation_module,
            channel,
            volts,
            self.voltage_limits,
        )?;
        self.active_outputs.insert(channel, volts);
        Ok(())
    }

    /// Ramps one output from its held value to exactly 0 V.
    fn ramp_to_zero(&mut self, channel: u32, held: f64) -> SweepResult<()> {
        if held == 0.0 {
            return self.write_output(channel, 0.0);
        }
        for step in (0..OUTPUT_RAMP_STEPS).rev() {
            self.write_output(channel, held * step as f64 / OUTPUT_RAMP_STEPS as f64)?;
        }
        Ok(())
    }

    fn zero_outputs(&mut self) -> SweepResult<()> {
        let mut first_error = None;
        let held: Vec<(u32, f64)> = self
            .active_outputs
            .iter()
            .map(|(&channel, &volts)| (channel, volts))
            .collect();
        for (channel, volts) in held {
            match self.ramp_to_zero(channel, volts) {
                Ok(()) => info!("(NIDAQ Channel {channel}) shutdown."),
                Err(e) => {
                    error!("(NIDAQ Channel {channel}) failed to return to 0 V: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<D: DaqChassis + ?Sized> Drop for AcquisitionController<'_, D> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            // errors are already logged per channel
            let _ = self.zero_outputs();
        }
    }
}

fn check_outputs(voltages: &BTreeMap<u32, f64>, available: u32, module: &str) -> SweepResult<()> {
    match voltages.keys().find(|&&ch| ch >= available) {
        Some(channel) => Err(SweepError::config(format!(
            "activation channel {channel} does not exist on {module} ({available} outputs)"
        ))),
        None => Ok(()),
    }
}

fn join<T: ToString>(items: impl Iterator<Item = T>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::bench_config;
    use crate::simulated::{InstrumentEvent, Journal, SimulatedChassis};

    #[test]
    fn configure_resets_modules_and_zeroes_outputs() {
        let journal = Journal::default();
        let mut daq = SimulatedChassis::new(journal.clone());
        let config = bench_config();
        let controller = AcquisitionController::configure(&mut daq, &config).unwrap();
        assert_eq!(controller.channels(), &[0, 3, 4]);
        drop(controller);

        let events = journal.events();
        assert_eq!(events[0], InstrumentEvent::ModuleReset("cDAQ1Mod1".into()));
        assert_eq!(events[1], InstrumentEvent::ModuleReset("cDAQ1Mod2".into()));
        assert!(events.contains(&InstrumentEvent::OutputWritten { channel: 1, volts: 0.0 }));
        assert!(events.contains(&InstrumentEvent::OutputWritten { channel: 2, volts: 0.0 }));
    }

    #[test]
    fn unknown_readout_channel_is_config_error() {
        let journal = Journal::default();
        let mut daq = SimulatedChassis::new(journal.clone());
        let mut config = bench_config();
        config.nidaq.readout_channels = vec![0, 16];
        let err = AcquisitionController::configure(&mut daq, &config).err().unwrap();
        assert!(matches!(err, SweepError::Config(_)), "{err}");
        assert!(journal.events().is_empty());
    }

    #[test]
    fn duplicate_readout_channel_is_config_error() {
        let mut daq = SimulatedChassis::new(Journal::default());
        let mut config = bench_config();
        config.nidaq.readout_channels = vec![2, 2];
        let err = AcquisitionController::configure(&mut daq, &config).err().unwrap();
        assert!(matches!(err, SweepError::Config(_)));
    }

    #[test]
    fn unknown_activation_channel_is_config_error() {
        let mut daq = SimulatedChassis::new(Journal::default());
        let mut config = bench_config();
        config.nidaq.control_voltages.insert(20, 0.1);
        let err = AcquisitionController::configure(&mut daq, &config).err().unwrap();
        assert!(matches!(err, SweepError::Config(_)));
    }

    fn output_writes(journal: &Journal) -> Vec<(u32, f64)> {
        journal
            .events()
            .into_iter()
            .filter_map(|e| match e {
                InstrumentEvent::OutputWritten { channel, volts } => Some((channel, volts)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn static_voltages_apply_once() {
        let journal = Journal::default();
        let mut daq = SimulatedChassis::new(journal.clone());
        let config = bench_config();
        let mut controller = AcquisitionController::configure(&mut daq, &config).unwrap();
        controller
            .apply_static_voltages(&config.nidaq.control_voltages)
            .unwrap();
        assert!(controller
            .apply_static_voltages(&config.nidaq.control_voltages)
            .is_err());
        controller.release().unwrap();

        let writes = output_writes(&journal);
        assert_eq!(
            writes[..4],
            [(1, 0.0), (2, 0.0), (1, 0.5), (2, -0.25)]
        );
        assert_eq!(writes.len(), 4 + 2 * OUTPUT_RAMP_STEPS);
    }

    #[test]
    fn release_ramps_held_voltage_down_to_zero() {
        let journal = Journal::default();
        let mut daq = SimulatedChassis::new(journal.clone());
        let mut config = bench_config();
        config.nidaq.control_voltages = BTreeMap::from([(1, 1.5), (2, 0.0)]);
        let mut controller = AcquisitionController::configure(&mut daq, &config).unwrap();
        controller
            .apply_static_voltages(&config.nidaq.control_voltages)
            .unwrap();
        controller.release().unwrap();

        let writes = output_writes(&journal);
        let ramp: Vec<f64> = writes[4..]
            .iter()
            .filter(|(channel, _)| *channel == 1)
            .map(|&(_, volts)| volts)
            .collect();
        assert_eq!(
            ramp,
            vec![1.35, 1.2, 1.05, 0.9, 0.75, 0.6, 0.45, 0.3, 0.15, 0.0]
        );
        // an output already at 0 V gets a single write
        assert_eq!(writes[4..].iter().filter(|(channel, _)| *channel == 2).count(), 1);
        assert_eq!(writes.last(), Some(&(2, 0.0)));
    }

    #[test]
    fn dropped_session_ramps_outputs_down() {
        let journal = Journal::default();
        let mut daq = SimulatedChassis::new(journal.clone());
        let config = bench_config();
        let mut controller = AcquisitionController::configure(&mut daq, &config).unwrap();
        controller
            .apply_static_voltages(&config.nidaq.control_voltages)
            .unwrap();
        drop(controller);

        let channel_one: Vec<f64> = output_writes(&journal)
            .into_iter()
            .filter(|(channel, _)| *channel == 1)
            .map(|(_, volts)| volts)
            .collect();
        // zeroed at configure, held at 0.5 V, then ramped
        assert_eq!(channel_one.len(), 2 + OUTPUT_RAMP_STEPS);
        assert!(channel_one[2..].windows(2).all(|w| w[1] < w[0]));
        assert_eq!(channel_one.last(), Some(&0.0));
    }

    #[test]
    fn acquire_returns_full_buffers_per_channel() {
        let mut daq = SimulatedChassis::new(Journal::default());
        let config = bench_config();
        let mut controller = AcquisitionController::configure(&mut daq, &config).unwrap();
        let window = controller.acquire(8).unwrap();
        assert_eq!(window.buffers.keys().copied().collect::<Vec<_>>(), vec![0, 3, 4]);
        assert!(window.buffers.values().all(|b| b.len() == 8));
    }

    #[test]
    fn windows_are_paced_by_update_period() {
        let mut daq = SimulatedChassis::new(Journal::default());
        let mut config = bench_config();
        config.nidaq.update_frequency = 50.0;
        let mut controller = AcquisitionController::configure(&mut daq, &config).unwrap();
        let first = controller.acquire(4).unwrap();
        let second = controller.acquire(4).unwrap();
        assert!(second.started.duration_since(first.started) >= Duration::from_millis(20));
    }

    #[test]
    fn short_read_is_instrument_error() {
        let mut daq = SimulatedChassis::new(Journal::default()).with_short_reads();
        let config = bench_config();
        let mut controller = AcquisitionController::configure(&mut daq, &config).unwrap();
        let err = controller.acquire(8).unwrap_err();
        assert!(matches!(err, SweepError::Instrument { .. }));
    }
}
