use anyhow::{anyhow, Context, Result};
use log::{error, info};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime};

use crate::{ExperimentConfig, MergedRun, RunStatus, SweepError, SweepPlanner, SweepResult};

/// Persists a finished (or aborted) run.
pub trait RunRecorder {
    fn record(&mut self, run: &MergedRun) -> SweepResult<()>;
}

/// Every recorder sees the run, the first failure is reported.
impl RunRecorder for Vec<Box<dyn RunRecorder + Send>> {
    fn record(&mut self, run: &MergedRun) -> SweepResult<()> {
        let mut first = None;
        for recorder in self.iter_mut() {
            if let Err(e) = recorder.record(run) {
                error!("Recorder failed: {e}");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// One directory per run: `{name}-{YYYY-MM-DD_HH-MM-SS}`.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    path: PathBuf,
}

impl RunDirectory {
    pub fn create(output_dir: &Path, name: &str, started: OffsetDateTime) -> SweepResult<Self> {
        let stamp = started
            .format(format_description!(
                "[year]-[month]-[day]_[hour]-[minute]-[second]"
            ))
            .map_err(|e| SweepError::Record(e.to_string()))?;
        let base: String = name
            .trim()
            .chars()
            .map(|c| if c.is_whitespace() || c == '/' || c == '\\' { '_' } else { c })
            .collect();

        let mut path = output_dir.join(format!("{base}-{stamp}"));
        let mut suffix = 1;
        while path.exists() {
            path = output_dir.join(format!("{base}-{stamp}_{suffix}"));
            suffix += 1;
        }
        fs::create_dir_all(&path)?;
        info!("Run directory: {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join("setup.log")
    }

    /// Recorders writing into this directory.
    pub fn recorders(&self) -> Vec<Box<dyn RunRecorder + Send>> {
        let mut recorders: Vec<Box<dyn RunRecorder + Send>> = Vec::new();
        recorders.push(Box::new(CsvRecorder::new(&self.path)));
        #[cfg(feature = "storage_hdf5")]
        recorders.push(Box::new(Hdf5Recorder::new(&self.path)));
        recorders
    }
}

#[derive(Serialize)]
struct SetupSnapshot<'a> {
    #[serde(flatten)]
    status: &'a RunStatus,
    started_at: String,
    planned_points: usize,
    recorded_points: usize,
    experiment: &'a ExperimentConfig,
}

/// Writes `setup.yaml`, `sweep.csv` and `samples.csv`.
pub struct CsvRecorder {
    dir: PathBuf,
}

impl CsvRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write_setup(&self, run: &MergedRun) -> Result<()> {
        let snapshot = SetupSnapshot {
            status: &run.status,
            started_at: run.started_at.format(&Rfc3339)?,
            planned_points: run.planned_points,
            recorded_points: run.len(),
            experiment: &run.config,
        };
        let file = fs::File::create(self.dir.join("setup.yaml"))?;
        serde_yaml::to_writer(file, &snapshot).context("writing setup.yaml")?;
        Ok(())
    }

    fn write_sweep(&self, run: &MergedRun) -> Result<()> {
        let plan = SweepPlanner::plan(&run.config)?;
        let mut wtr = csv::Writer::from_path(self.dir.join("sweep.csv"))?;
        wtr.write_record(["ordinal", "value", "settle_bound"])?;
        for point in &plan {
            wtr.write_record([
                point.ordinal.to_string(),
                point.value.to_string(),
                point.settle_bound.to_string(),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }

    fn write_samples(&self, run: &MergedRun) -> Result<()> {
        let amplification = run.config.amplification;
        let mut channels = run.config.nidaq.readout_channels.clone();
        channels.sort_unstable();

        let mut wtr = csv::Writer::from_path(self.dir.join("samples.csv"))?;
        let mut header: Vec<String> = [
            "ordinal",
            "commanded",
            "measured",
            "attempts",
            "timestamp",
            "elapsed_s",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for ch in &channels {
            header.push(format!("ai{ch}_mean"));
            header.push(format!("ai{ch}_scaled"));
        }
        wtr.write_record(&header)?;

        for record in run.records() {
            let mut row = vec![
                record.ordinal.to_string(),
                record.commanded.to_string(),
                record.measured.to_string(),
                record.attempts.to_string(),
                record.timestamp.format(&Rfc3339)?,
                record.elapsed.as_secs_f64().to_string(),
            ];
            for &ch in &channels {
                let mean = record
                    .channel_mean(ch)
                    .ok_or_else(|| anyhow!("point {} has no samples for ai{ch}", record.ordinal))?;
                row.push(mean.to_string());
                row.push((mean / amplification).to_string());
            }
            wtr.write_record(&row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

impl RunRecorder for CsvRecorder {
    fn record(&mut self, run: &MergedRun) -> SweepResult<()> {
        self.write_setup(run)?;
        self.write_sweep(run)?;
        self.write_samples(run)?;
        info!(
            "Saved {} of {} points to {}",
            run.len(),
            run.planned_points,
            self.dir.display()
        );
        Ok(())
    }
}

#[cfg(feature = "storage_hdf5")]
pub use hdf5_store::Hdf5Recorder;

#[cfg(feature = "storage_hdf5")]
mod hdf5_store {
    use anyhow::{anyhow, Result};
    use hdf5::File;
    use ndarray::{s, Array1, Array3, ArrayView1};
    use std::path::PathBuf;

    use crate::{MergedRun, RunRecorder, SweepResult};

    /// Full raw buffers in `samples.h5`, one (points, channels, samples) dataset.
    pub struct Hdf5Recorder {
        dir: PathBuf,
    }

    impl Hdf5Recorder {
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self { dir: dir.into() }
        }

        fn write(&self, run: &MergedRun) -> Result<()> {
            let file = File::create(self.dir.join("samples.h5"))?;
            let records = run.records();
            let n_points = records.len();
            let mut channels = run.config.nidaq.readout_channels.clone();
            channels.sort_unstable();
            let n_channels = channels.len();
            let n_samples = run.config.nidaq.samples_per_measurement;

            let ordinal: Array1<u64> = records.iter().map(|r| r.ordinal as u64).collect();
            let commanded: Array1<f64> = records.iter().map(|r| r.commanded).collect();
            let measured: Array1<f64> = records.iter().map(|r| r.measured).collect();
            let elapsed: Array1<f64> = records.iter().map(|r| r.elapsed.as_secs_f64()).collect();
            let timestamps: Array1<i64> = records
                .iter()
                .map(|r| r.timestamp.unix_timestamp_nanos() as i64)
                .collect();
            let channel_ids: Array1<u32> = channels.iter().copied().collect();

            file.new_dataset_builder().with_data(&ordinal).create("ordinal")?;
            file.new_dataset_builder().with_data(&commanded).create("commanded")?;
            file.new_dataset_builder().with_data(&measured).create("measured")?;
            file.new_dataset_builder().with_data(&elapsed).create("elapsed_s")?;
            file.new_dataset_builder().with_data(&timestamps).create("timestamps_ns")?;
            file.new_dataset_builder().with_data(&channel_ids).create("channels")?;

            if n_points == 0 {
                return Ok(());
            }

            let mut samples = Array3::<f64>::zeros((n_points, n_channels, n_samples));
            for (i, record) in records.iter().enumerate() {
                for (j, ch) in channels.iter().enumerate() {
                    let buffer = record
                        .buffers
                        .get(ch)
                        .ok_or_else(|| anyhow!("point {} has no buffer for ai{ch}", record.ordinal))?;
                    if buffer.len() != n_samples {
                        return Err(anyhow!(
                            "point {} ai{ch}: {} samples, expected {n_samples}",
                            record.ordinal,
                            buffer.len()
                        ));
                    }
                    samples
                        .slice_mut(s![i, j, ..])
                        .assign(&ArrayView1::from(buffer.as_slice()));
                }
            }

            file.new_dataset::<f64>()
                .shape((n_points, n_channels, n_samples))
                .chunk((1, n_channels, n_samples))
                .blosc_lz4(5, true)
                .create("samples")?
                .write(&samples)?;
            Ok(())
        }
    }

    impl RunRecorder for Hdf5Recorder {
        fn record(&mut self, run: &MergedRun) -> SweepResult<()> {
            self.write(run)?;
            Ok(())
        }
    }
}
