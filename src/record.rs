use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use time::OffsetDateTime;

use crate::ExperimentConfig;

/// Everything captured for one sweep point.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub ordinal: usize,
    pub commanded: f64,
    /// SMU read-back that passed verification.
    pub measured: f64,
    /// Raw readout samples, keyed and ordered by channel index.
    pub buffers: BTreeMap<u32, Vec<f64>>,
    /// Wall-clock start of the acquisition window.
    pub timestamp: OffsetDateTime,
    /// Start of the acquisition window relative to the run start.
    pub elapsed: Duration,
    /// Apply attempts needed to settle (1 or 2).
    pub attempts: u8,
}

impl SampleRecord {
    pub fn channel_mean(&self, channel: u32) -> Option<f64> {
        let samples = self.buffers.get(&channel)?;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Per-channel means divided by the current amplification factor.
    pub fn amplified_means(&self, amplification: f64) -> BTreeMap<u32, f64> {
        self.buffers
            .keys()
            .filter_map(|&ch| Some((ch, self.channel_mean(ch)? / amplification)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Complete,
    Aborted { reason: String },
}

/// Config snapshot plus one record per completed sweep point.
#[derive(Debug, Clone)]
pub struct MergedRun {
    pub config: ExperimentConfig,
    pub started_at: OffsetDateTime,
    pub planned_points: usize,
    pub status: RunStatus,
    records: Vec<SampleRecord>,
}

impl MergedRun {
    pub fn new(config: ExperimentConfig, started_at: OffsetDateTime) -> Self {
        Self {
            config,
            started_at,
            planned_points: 0,
            status: RunStatus::InProgress,
            records: Vec::new(),
        }
    }

    /// Append the record for the next ordinal. Any other ordinal is refused,
    /// so the sequence stays ascending and gap-free.
    pub fn push(&mut self, record: SampleRecord) -> Result<(), SampleRecord> {
        if record.ordinal != self.records.len() {
            return Err(record);
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::bench_config;

    fn record(ordinal: usize) -> SampleRecord {
        SampleRecord {
            ordinal,
            commanded: 0.0,
            measured: 0.0,
            buffers: BTreeMap::from([(0, vec![1.0, 2.0, 3.0]), (3, vec![-4.0, 4.0])]),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            elapsed: Duration::ZERO,
            attempts: 1,
        }
    }

    #[test]
    fn push_keeps_ordinals_gap_free() {
        let mut run = MergedRun::new(bench_config(), OffsetDateTime::UNIX_EPOCH);
        run.push(record(0)).unwrap();
        assert!(run.push(record(2)).is_err());
        assert!(run.push(record(0)).is_err());
        run.push(record(1)).unwrap();
        assert_eq!(run.len(), 2);
        assert_eq!(run.records()[1].ordinal, 1);
    }

    #[test]
    fn means_per_channel() {
        let r = record(0);
        assert_eq!(r.channel_mean(0), Some(2.0));
        assert_eq!(r.channel_mean(3), Some(0.0));
        assert_eq!(r.channel_mean(7), None);
        let amplified = r.amplified_means(100.0);
        assert_eq!(amplified.get(&0), Some(&0.02));
    }
}
