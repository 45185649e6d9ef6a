//! Source-measurement unit boundary and the per-run source session.
//!
//! [`SourceMeter`] is what a driver has to provide; [`SourceController`]
//! owns a driver for the duration of one run, enforces the configured range
//! before anything reaches the instrument and switches the output off again
//! on every exit path.

use log::{error, info};
use std::{
    thread,
    time::{Duration, Instant},
};

use crate::{
    tolerance::within_tolerance, DriveMode, ExperimentConfig, Quantity, SweepError, SweepPoint,
    SweepResult,
};

/// Settings applied to the SMU when a run opens its session.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSetup {
    pub drive_mode: DriveMode,
    pub compliance_voltage: f64,
    pub compliance_current: f64,
    pub nplc: f64,
    pub source_delay: f64,
    pub timeout: Duration,
}

impl SourceSetup {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        let (compliance_voltage, compliance_current) = config.compliance();
        Self {
            drive_mode: config.smu.drive_mode,
            compliance_voltage,
            compliance_current,
            nplc: config.smu.nplc,
            source_delay: config.smu.source_delay,
            timeout: config.smu.timeout(),
        }
    }
}

pub trait SourceMeter {
    /// Address the driver was opened with, used in error reports.
    fn device(&self) -> &str;

    fn identify(&mut self) -> SweepResult<String>;

    /// Reset the instrument, select the source function and enable the output.
    fn configure(&mut self, setup: &SourceSetup) -> SweepResult<()>;

    fn set_level(&mut self, quantity: Quantity, value: f64) -> SweepResult<()>;

    fn read_back(&mut self, quantity: Quantity) -> SweepResult<f64>;

    /// Bring the source back to zero and disable the output.
    fn shutdown(&mut self) -> SweepResult<()>;
}

impl<T: SourceMeter + ?Sized> SourceMeter for Box<T> {
    fn device(&self) -> &str {
        (**self).device()
    }

    fn identify(&mut self) -> SweepResult<String> {
        (**self).identify()
    }

    fn configure(&mut self, setup: &SourceSetup) -> SweepResult<()> {
        (**self).configure(setup)
    }

    fn set_level(&mut self, quantity: Quantity, value: f64) -> SweepResult<()> {
        (**self).set_level(quantity, value)
    }

    fn read_back(&mut self, quantity: Quantity) -> SweepResult<f64> {
        (**self).read_back(quantity)
    }

    fn shutdown(&mut self) -> SweepResult<()> {
        (**self).shutdown()
    }
}

/// Result of commanding one set-point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedValue {
    pub commanded: f64,
    pub achieved: f64,
    pub settled_at: Instant,
}

pub struct SourceController<'a, S: SourceMeter + ?Sized> {
    smu: &'a mut S,
    mode: DriveMode,
    range: [f64; 2],
    pause: Duration,
    released: bool,
}

impl<'a, S: SourceMeter + ?Sized> SourceController<'a, S> {
    /// Take the SMU for one run and apply the bench setup.
    pub fn open(smu: &'a mut S, config: &ExperimentConfig) -> SweepResult<Self> {
        let setup = SourceSetup::from_config(config);
        let mut controller = Self {
            smu,
            mode: config.smu.drive_mode,
            range: config.source_range(),
            pause: config.smu.pause(),
            released: false,
        };

        let id = controller.smu.identify()?;
        info!(" --- INSTRUMENT: SMU --- ");
        info!("{}: {}", controller.smu.device(), id.trim());
        controller.smu.configure(&setup)?;
        info!("Drive mode: {:?}", setup.drive_mode);
        info!("Compliance voltage: {}", setup.compliance_voltage);
        info!("Compliance current: {}", setup.compliance_current);

        Ok(controller)
    }

    pub fn drive_mode(&self) -> DriveMode {
        self.mode
    }

    /// Command the point's value, wait for the settling pause and read back
    /// what the instrument actually sources.
    pub fn apply(&mut self, point: &SweepPoint) -> SweepResult<AppliedValue> {
        let quantity = self.mode.sourced();
        let [lo, hi] = self.range;
        if !(point.value >= lo && point.value <= hi) {
            return Err(SweepError::Range {
                ordinal: point.ordinal,
                quantity,
                value: point.value,
                lo,
                hi,
            });
        }

        self.smu.set_level(quantity, point.value)?;
        if !self.pause.is_zero() {
            thread::sleep(self.pause);
        }
        let achieved = self.smu.read_back(quantity)?;

        Ok(AppliedValue {
            commanded: point.value,
            achieved,
            settled_at: Instant::now(),
        })
    }

    pub fn verify(&self, point: &SweepPoint, applied: &AppliedValue) -> bool {
        within_tolerance(point.value, applied.achieved, point.settle_bound)
    }

    /// Give the instrument back: zero the source, output off.
    pub fn release(mut self) -> SweepResult<()> {
        self.released = true;
        let result = self.smu.shutdown();
        if result.is_ok() {
            info!("SMU shutdown.");
        }
        result
    }
}

impl<S: SourceMeter + ?Sized> Drop for SourceController<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.smu.shutdown() {
            Ok(()) => info!("SMU shutdown."),
            Err(e) => error!("SMU shutdown failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::bench_config;
    use crate::simulated::{InstrumentEvent, Journal, SimulatedSmu, SmuFault};

    fn point(ordinal: usize, value: f64) -> SweepPoint {
        SweepPoint {
            ordinal,
            value,
            settle_bound: 10e-9,
        }
    }

    #[test]
    fn open_configures_from_bench_setup() {
        let journal = Journal::default();
        let mut smu = SimulatedSmu::new(journal.clone());
        let config = bench_config();
        let controller = SourceController::open(&mut smu, &config).unwrap();
        assert_eq!(controller.drive_mode(), DriveMode::CurrentDriven);
        controller.release().unwrap();

        let events = journal.events();
        assert_eq!(
            events[0],
            InstrumentEvent::SmuConfigured(SourceSetup::from_config(&config))
        );
        assert_eq!(events.last(), Some(&InstrumentEvent::SmuShutdown));
    }

    #[test]
    fn apply_reads_back_achieved_value() {
        let mut smu = SimulatedSmu::new(Journal::default());
        let config = bench_config();
        let mut controller = SourceController::open(&mut smu, &config).unwrap();
        let p = point(0, -150e-9);
        let applied = controller.apply(&p).unwrap();
        assert_eq!(applied.commanded, -150e-9);
        assert_eq!(applied.achieved, -150e-9);
        assert!(controller.verify(&p, &applied));
    }

    #[test]
    fn verify_rejects_offset_beyond_tolerance() {
        let mut smu = SimulatedSmu::new(Journal::default()).with_fault(0, SmuFault::Offset(15e-9));
        let config = bench_config();
        let mut controller = SourceController::open(&mut smu, &config).unwrap();
        let p = point(0, 0.0);
        let applied = controller.apply(&p).unwrap();
        assert!(!controller.verify(&p, &applied));
        let applied = controller.apply(&p).unwrap();
        assert!(controller.verify(&p, &applied));
    }

    #[test]
    fn out_of_range_fails_before_hardware() {
        let journal = Journal::default();
        let mut smu = SimulatedSmu::new(journal.clone());
        let config = bench_config();
        let mut controller = SourceController::open(&mut smu, &config).unwrap();
        let before = journal.events().len();
        let err = controller.apply(&point(4, 250e-9)).unwrap_err();
        assert!(matches!(err, SweepError::Range { ordinal: 4, .. }), "{err}");
        assert_eq!(journal.events().len(), before);
    }

    #[test]
    fn timeout_surfaces_as_instrument_timeout() {
        let mut smu = SimulatedSmu::new(Journal::default()).with_fault(0, SmuFault::Timeout);
        let config = bench_config();
        let mut controller = SourceController::open(&mut smu, &config).unwrap();
        let err = controller.apply(&point(0, 0.0)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn dropping_the_session_shuts_the_source_down() {
        let journal = Journal::default();
        let mut smu = SimulatedSmu::new(journal.clone());
        {
            let _controller = SourceController::open(&mut smu, &bench_config()).unwrap();
        }
        let shutdowns = journal
            .events()
            .iter()
            .filter(|e| **e == InstrumentEvent::SmuShutdown)
            .count();
        assert_eq!(shutdowns, 1);
    }
}
