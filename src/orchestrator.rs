//! The sweep state machine.
//!
//! ```text
//! Idle -> Initializing -> Stepping -> Settling -> Acquiring -> Stepping ... -> Finalizing -> Done
//!                  \            \          \            \                         \
//!                   +------------+----------+------------+-------------------------+--> Failed
//! ```
//!
//! A step is strictly apply, verify (one retry), acquire. The next apply is
//! only issued once the previous acquisition window has been read, so every
//! sample set belongs to exactly one set-point. Both instrument sessions are
//! scoped to [`SyncOrchestrator::run`] and released on every exit path.

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    smu::{AppliedValue, SourceController, SourceMeter},
    AcquisitionController, DaqChassis, ExperimentConfig, MergedRun, RunRecorder, RunStatus,
    SampleRecord, SweepError, SweepPlanner, SweepPoint, SweepResult,
};

/// Apply attempts per point before the run is aborted.
const MAX_APPLY_ATTEMPTS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Initializing,
    Stepping,
    Settling,
    Acquiring,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "IDLE",
            SyncState::Initializing => "INITIALIZING",
            SyncState::Stepping => "STEPPING",
            SyncState::Settling => "SETTLING",
            SyncState::Acquiring => "ACQUIRING",
            SyncState::Finalizing => "FINALIZING",
            SyncState::Done => "DONE",
            SyncState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

impl SyncState {
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Idle | SyncState::Done | SyncState::Failed)
    }
}

/// Cancels a run between two steps. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Published while a run executes.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    State(SyncState),
    Planned {
        points: usize,
    },
    Retry {
        ordinal: usize,
        commanded: f64,
        achieved: f64,
    },
    Point {
        ordinal: usize,
        commanded: f64,
        measured: f64,
        attempts: u8,
    },
    Finished {
        records: usize,
        error: Option<String>,
    },
}

/// A run that ended in `Failed`, with everything collected before the failure.
#[derive(Debug, Error)]
#[error("run aborted after {} of {} points: {error}", .partial.len(), .partial.planned_points)]
pub struct AbortedRun {
    #[source]
    pub error: SweepError,
    pub partial: MergedRun,
}

pub struct SyncOrchestrator<S: SourceMeter, D: DaqChassis> {
    config: ExperimentConfig,
    smu: S,
    daq: D,
    state: SyncState,
    cancel: CancelToken,
    progress: Option<Sender<Progress>>,
}

impl<S: SourceMeter, D: DaqChassis> SyncOrchestrator<S, D> {
    /// Rejects an invalid config before any instrument is touched.
    pub fn new(config: ExperimentConfig, smu: S, daq: D) -> SweepResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            smu,
            daq,
            state: SyncState::Idle,
            cancel: CancelToken::default(),
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: Sender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Execute one complete sweep and hand the merged record to `recorder`.
    ///
    /// On failure the partial record is still handed to the recorder and
    /// returned inside [`AbortedRun`]. A cancel issued before the call makes
    /// the run fail before any instrument is opened. The token is cleared once
    /// the run has ended, so the next run starts uncancelled.
    pub fn run(&mut self, recorder: &mut dyn RunRecorder) -> Result<MergedRun, AbortedRun> {
        let mut run = MergedRun::new(self.config.clone(), OffsetDateTime::now_utc());
        let mut machine = Machine {
            state: &mut self.state,
            progress: self.progress.as_ref(),
        };
        machine.enter(SyncState::Idle);
        info!("Starting experiment: {} - {}", self.config.name, self.config.description);

        let outcome = execute(
            &self.config,
            &mut self.smu,
            &mut self.daq,
            &self.cancel,
            &mut machine,
            &mut run,
        )
        .and_then(|()| {
            run.status = RunStatus::Complete;
            recorder.record(&run)
        });

        let result = match outcome {
            Ok(()) => {
                machine.enter(SyncState::Done);
                machine.publish(Progress::Finished {
                    records: run.len(),
                    error: None,
                });
                info!("Experiment completed: {} points recorded", run.len());
                Ok(run)
            }
            Err(error) => {
                machine.enter(SyncState::Failed);
                error!("Experiment aborted after {} points: {error}", run.len());
                let recorded = run.status == RunStatus::Complete;
                run.status = RunStatus::Aborted {
                    reason: error.to_string(),
                };
                if !recorded {
                    if let Err(e) = recorder.record(&run) {
                        error!("Could not record partial run: {e}");
                    }
                }
                machine.publish(Progress::Finished {
                    records: run.len(),
                    error: Some(error.to_string()),
                });
                Err(AbortedRun {
                    error,
                    partial: run,
                })
            }
        };
        self.cancel.reset();
        result
    }
}

struct Machine<'a> {
    state: &'a mut SyncState,
    progress: Option<&'a Sender<Progress>>,
}

impl Machine<'_> {
    fn enter(&mut self, next: SyncState) {
        debug!("{} -> {}", self.state, next);
        *self.state = next;
        self.publish(Progress::State(next));
    }

    fn publish(&self, event: Progress) {
        if let Some(tx) = self.progress {
            // the receiving side may already be gone; the run does not depend on it
            let _ = tx.send(event);
        }
    }
}

fn execute<S: SourceMeter, D: DaqChassis>(
    config: &ExperimentConfig,
    smu: &mut S,
    daq: &mut D,
    cancel: &CancelToken,
    machine: &mut Machine<'_>,
    run: &mut MergedRun,
) -> SweepResult<()> {
    machine.enter(SyncState::Initializing);
    if cancel.is_cancelled() {
        warn!("Run cancelled before any instrument was opened");
        return Err(SweepError::Cancelled { completed: 0 });
    }
    let mut source = SourceController::open(smu, config)?;
    let mut acquisition = AcquisitionController::configure(daq, config)?;
    acquisition.apply_static_voltages(&config.nidaq.control_voltages)?;

    let plan = SweepPlanner::plan(config)?;
    run.planned_points = plan.len();
    machine.publish(Progress::Planned { points: plan.len() });
    info!(
        "Sweep planned: {} points from {:e} to {:e} ({:?})",
        plan.len(),
        config.min_value,
        config.max_value,
        config.sweep_shape
    );

    let run_start = Instant::now();
    for point in &plan {
        if cancel.is_cancelled() {
            warn!("Run cancelled before point {}", point.ordinal);
            return Err(SweepError::Cancelled {
                completed: run.len(),
            });
        }

        let (applied, attempts) = settle(&mut source, point, machine)?;

        machine.enter(SyncState::Acquiring);
        let window = acquisition.acquire(config.nidaq.samples_per_measurement)?;

        let record = SampleRecord {
            ordinal: point.ordinal,
            commanded: applied.commanded,
            measured: applied.achieved,
            buffers: window.buffers,
            timestamp: window.started_at,
            elapsed: window.started.duration_since(run_start),
            attempts,
        };
        run.push(record).map_err(|r| {
            SweepError::Record(format!(
                "record {} out of order, expected {}",
                r.ordinal,
                run.len()
            ))
        })?;

        info!(
            "Point {}/{} @ {:e}, measured {:e}",
            point.ordinal + 1,
            plan.len(),
            applied.commanded,
            applied.achieved
        );
        machine.publish(Progress::Point {
            ordinal: point.ordinal,
            commanded: applied.commanded,
            measured: applied.achieved,
            attempts,
        });
    }

    machine.enter(SyncState::Finalizing);
    let source_released = source.release();
    let acquisition_released = acquisition.release();
    source_released.and(acquisition_released)
}

/// Apply a point and verify it, retrying the apply once.
fn settle<S: SourceMeter + ?Sized>(
    source: &mut SourceController<'_, S>,
    point: &SweepPoint,
    machine: &mut Machine<'_>,
) -> SweepResult<(AppliedValue, u8)> {
    let mut achieved = f64::NAN;
    for attempt in 1..=MAX_APPLY_ATTEMPTS {
        machine.enter(SyncState::Stepping);
        let applied = source.apply(point)?;

        machine.enter(SyncState::Settling);
        if source.verify(point, &applied) {
            return Ok((applied, attempt));
        }

        achieved = applied.achieved;
        warn!(
            "Point {}: commanded {:e}, achieved {:e} outside tolerance {:e} (attempt {attempt})",
            point.ordinal, point.value, achieved, point.settle_bound
        );
        machine.publish(Progress::Retry {
            ordinal: point.ordinal,
            commanded: point.value,
            achieved,
        });
    }

    Err(SweepError::Settling {
        ordinal: point.ordinal,
        quantity: source.drive_mode().sourced(),
        commanded: point.value,
        achieved,
        tolerance: point.settle_bound,
    })
}
