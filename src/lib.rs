//! Synchronized SMU sweep and NI-DAQ readout for hysteron characterization
//! of reconfigurable nonlinear processing units.
//!
//! A run steps the source-measurement unit through a planned set of points
//! and, for each point that settled, acquires one window of readout samples
//! before the next point is commanded. See [`SyncOrchestrator`].

pub mod acquisition;
pub mod config;
pub mod error;
pub mod keithley;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
pub mod orchestrator;
pub mod record;
pub mod simulated;
pub mod smu;
pub mod sweep;
pub mod tolerance;
pub mod tui;
pub mod writer;

pub use acquisition::{AcquisitionController, AcquisitionWindow, DaqChassis};
pub use config::{DriveMode, ExperimentConfig, NidaqConfig, Quantity, SmuConfig, SweepShape};
pub use error::{SweepError, SweepResult};
pub use keithley::Keithley2400;
#[cfg(feature = "nidaqmx")]
pub use nidaqmx::NiChassis;
pub use orchestrator::{AbortedRun, CancelToken, Progress, SyncOrchestrator, SyncState};
pub use record::{MergedRun, RunStatus, SampleRecord};
pub use smu::{AppliedValue, SourceController, SourceMeter, SourceSetup};
pub use sweep::{SweepPlanner, SweepPoint};
pub use tolerance::within_tolerance;
pub use writer::{CsvRecorder, RunDirectory, RunRecorder};
#[cfg(feature = "storage_hdf5")]
pub use writer::Hdf5Recorder;
