//! In-process stand-ins for the SMU and the NI chassis.
//!
//! Both record what they were asked to do in a shared [`Journal`], which lets
//! tests check command ordering across the two instruments. Faults can be
//! injected per SMU set call.

use ndarray::Array2;
use rand::Rng;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crate::{
    smu::{SourceMeter, SourceSetup},
    DaqChassis, Quantity, SweepError, SweepResult,
};

const CHANNELS_PER_MODULE: u32 = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentEvent {
    SmuConfigured(SourceSetup),
    SmuLevel { quantity: Quantity, value: f64 },
    SmuReadBack(f64),
    SmuShutdown,
    ModuleReset(String),
    OutputWritten { channel: u32, volts: f64 },
    Acquired { channels: usize, samples: usize },
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<InstrumentEvent>>>);

impl Journal {
    pub fn push(&self, event: InstrumentEvent) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<InstrumentEvent> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmuFault {
    /// The read-back after this set call is off by the given amount.
    Offset(f64),
    /// The set call never completes.
    Timeout,
}

pub struct SimulatedSmu {
    device: String,
    journal: Journal,
    setup: Option<SourceSetup>,
    level: f64,
    offset: f64,
    noise: f64,
    set_calls: usize,
    faults: BTreeMap<usize, SmuFault>,
}

impl SimulatedSmu {
    pub fn new(journal: Journal) -> Self {
        Self {
            device: "SIM::SMU".into(),
            journal,
            setup: None,
            level: 0.0,
            offset: 0.0,
            noise: 0.0,
            set_calls: 0,
            faults: BTreeMap::new(),
        }
    }

    /// Uniform read-back noise of +/- `amplitude`.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude.abs();
        self
    }

    /// Inject a fault on the `call`-th set command (0-based).
    pub fn with_fault(mut self, call: usize, fault: SmuFault) -> Self {
        self.faults.insert(call, fault);
        self
    }

    fn timeout(&self) -> Duration {
        self.setup
            .as_ref()
            .map(|s| s.timeout)
            .unwrap_or(Duration::from_millis(1))
    }
}

impl SourceMeter for SimulatedSmu {
    fn device(&self) -> &str {
        &self.device
    }

    fn identify(&mut self) -> SweepResult<String> {
        Ok("SIMULATED,Model 2401,0,0.0".into())
    }

    fn configure(&mut self, setup: &SourceSetup) -> SweepResult<()> {
        self.journal
            .push(InstrumentEvent::SmuConfigured(setup.clone()));
        self.setup = Some(setup.clone());
        self.level = 0.0;
        Ok(())
    }

    fn set_level(&mut self, quantity: Quantity, value: f64) -> SweepResult<()> {
        let Some(setup) = &self.setup else {
            return Err(SweepError::instrument(&self.device, "output not enabled"));
        };
        if setup.drive_mode.sourced() != quantity {
            return Err(SweepError::instrument(
                &self.device,
                format!("cannot source {quantity} in {:?} mode", setup.drive_mode),
            ));
        }

        let call = self.set_calls;
        self.set_calls += 1;
        self.offset = 0.0;
        match self.faults.get(&call) {
            Some(SmuFault::Timeout) => {
                return Err(SweepError::InstrumentTimeout {
                    device: self.device.clone(),
                    operation: format!("set {quantity}"),
                    timeout: self.timeout(),
                })
            }
            Some(SmuFault::Offset(offset)) => self.offset = *offset,
            None => {}
        }

        self.level = value;
        self.journal
            .push(InstrumentEvent::SmuLevel { quantity, value });
        Ok(())
    }

    fn read_back(&mut self, _quantity: Quantity) -> SweepResult<f64> {
        let noise = if self.noise > 0.0 {
            rand::rng().random_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        let value = self.level + self.offset + noise;
        self.journal.push(InstrumentEvent::SmuReadBack(value));
        Ok(value)
    }

    fn shutdown(&mut self) -> SweepResult<()> {
        self.level = 0.0;
        self.setup = None;
        self.journal.push(InstrumentEvent::SmuShutdown);
        Ok(())
    }
}

type ReadHook = Box<dyn FnMut(usize) + Send>;

pub struct SimulatedChassis {
    journal: Journal,
    reads: usize,
    short_reads: bool,
    stalled_read: Option<usize>,
    noise: f64,
    read_hook: Option<ReadHook>,
}

impl SimulatedChassis {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            reads: 0,
            short_reads: false,
            stalled_read: None,
            noise: 0.0,
            read_hook: None,
        }
    }

    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude.abs();
        self
    }

    /// Every read returns one sample less than requested.
    pub fn with_short_reads(mut self) -> Self {
        self.short_reads = true;
        self
    }

    /// The `read`-th read (0-based) times out instead of returning samples.
    pub fn with_read_timeout(mut self, read: usize) -> Self {
        self.stalled_read = Some(read);
        self
    }

    /// Called after each completed read with the number of reads so far.
    pub fn with_read_hook(mut self, hook: impl FnMut(usize) + Send + 'static) -> Self {
        self.read_hook = Some(Box::new(hook));
        self
    }
}

impl DaqChassis for SimulatedChassis {
    fn name(&self) -> &str {
        "SIM::NIDAQ"
    }

    fn reset_module(&mut self, module: &str) -> SweepResult<()> {
        self.journal
            .push(InstrumentEvent::ModuleReset(module.to_string()));
        Ok(())
    }

    fn ai_channel_count(&self, _module: &str) -> SweepResult<u32> {
        Ok(CHANNELS_PER_MODULE)
    }

    fn ao_channel_count(&self, _module: &str) -> SweepResult<u32> {
        Ok(CHANNELS_PER_MODULE)
    }

    fn write_voltage(
        &mut self,
        module: &str,
        channel: u32,
        volts: f64,
        limits: [f64; 2],
    ) -> SweepResult<()> {
        if volts < limits[0] || volts > limits[1] {
            return Err(SweepError::instrument(
                format!("{module}/ao{channel}"),
                format!("{volts} V outside [{}, {}]", limits[0], limits[1]),
            ));
        }
        self.journal
            .push(InstrumentEvent::OutputWritten { channel, volts });
        Ok(())
    }

    fn read_voltages(
        &mut self,
        _module: &str,
        channels: &[u32],
        sample_rate: f64,
        samples: usize,
        timeout: Duration,
    ) -> SweepResult<Array2<f64>> {
        let window = Duration::from_secs_f64(samples as f64 / sample_rate);
        if window > timeout || self.stalled_read == Some(self.reads) {
            return Err(SweepError::InstrumentTimeout {
                device: self.name().to_string(),
                operation: "read analog inputs".into(),
                timeout,
            });
        }
        thread::sleep(window);

        let samples = if self.short_reads {
            samples.saturating_sub(1)
        } else {
            samples
        };
        let mut rng = rand::rng();
        let noise = self.noise;
        let data = Array2::from_shape_fn((channels.len(), samples), |(row, _)| {
            let baseline = 0.1 * channels[row] as f64;
            if noise > 0.0 {
                baseline + rng.random_range(-noise..=noise)
            } else {
                baseline
            }
        });

        self.reads += 1;
        self.journal.push(InstrumentEvent::Acquired {
            channels: channels.len(),
            samples,
        });
        if let Some(hook) = self.read_hook.as_mut() {
            hook(self.reads);
        }
        Ok(data)
    }
}
