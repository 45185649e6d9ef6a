use crate::{ExperimentConfig, SweepError, SweepResult, SweepShape};

/// One planned set-point of the sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    pub ordinal: usize,
    /// Current in A or voltage in V, depending on the drive mode.
    pub value: f64,
    /// Largest accepted deviation of the read-back value.
    pub settle_bound: f64,
}

pub struct SweepPlanner;

impl SweepPlanner {
    /// Linear ramp from `min_value` to `max_value` with `ramp_points` points,
    /// mirrored back down when the config asks for a round trip.
    pub fn plan(config: &ExperimentConfig) -> SweepResult<Vec<SweepPoint>> {
        let values = ramp(
            config.min_value,
            config.max_value,
            config.ramp_points,
            config.sweep_shape,
        )?;
        let settle_bound = config.tolerance();
        Ok(values
            .into_iter()
            .enumerate()
            .map(|(ordinal, value)| SweepPoint {
                ordinal,
                value,
                settle_bound,
            })
            .collect())
    }
}

/// Set-point values for a ramp; the endpoints are exact.
pub fn ramp(min: f64, max: f64, points: usize, shape: SweepShape) -> SweepResult<Vec<f64>> {
    if points < 2 {
        return Err(SweepError::config(format!(
            "ramp_points must be at least 2, got {points}"
        )));
    }
    if !(min < max) {
        return Err(SweepError::config(format!(
            "min_value ({min}) must be below max_value ({max})"
        )));
    }

    let last = points - 1;
    let step = (max - min) / last as f64;
    let mut values: Vec<f64> = (0..points)
        .map(|i| if i == last { max } else { min + step * i as f64 })
        .collect();

    if shape == SweepShape::RoundTrip {
        let down: Vec<f64> = values.iter().rev().skip(1).copied().collect();
        values.extend(down);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::bench_config;
    use crate::DriveMode;

    #[test]
    fn bench_ramp_has_thirty_even_points() {
        let config = bench_config();
        let points = SweepPlanner::plan(&config).unwrap();
        assert_eq!(points.len(), 30);
        assert_eq!(points[0].value, -150e-9);
        assert_eq!(points[29].value, 150e-9);

        let step = points[1].value - points[0].value;
        assert!((step - 10.3448e-9).abs() < 1e-12);
        for pair in points.windows(2) {
            assert!(pair[1].value > pair[0].value);
            assert!(((pair[1].value - pair[0].value) - step).abs() < 1e-15);
        }
        for (i, point) in points.iter().enumerate() {
            assert_eq!(point.ordinal, i);
            assert_eq!(point.settle_bound, config.smu.tolerance_current);
        }
    }

    #[test]
    fn round_trip_mirrors_without_duplicate_turning_point() {
        let mut config = bench_config();
        config.sweep_shape = SweepShape::RoundTrip;
        config.ramp_points = 5;
        let values: Vec<f64> = SweepPlanner::plan(&config)
            .unwrap()
            .iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values.len(), 9);
        assert_eq!(values[0], -150e-9);
        assert_eq!(values[4], 150e-9);
        assert_eq!(values[8], -150e-9);
        assert!(values[..5].windows(2).all(|w| w[1] > w[0]));
        assert!(values[4..].windows(2).all(|w| w[1] < w[0]));
        assert_eq!(values[3], values[5]);
    }

    #[test]
    fn two_points_are_the_endpoints() {
        let values = ramp(-1.0, 3.0, 2, SweepShape::OneWay).unwrap();
        assert_eq!(values, vec![-1.0, 3.0]);
    }

    #[test]
    fn plan_is_deterministic() {
        let config = bench_config();
        assert_eq!(
            SweepPlanner::plan(&config).unwrap(),
            SweepPlanner::plan(&config).unwrap()
        );
    }

    #[test]
    fn invalid_ramps_fail() {
        assert!(matches!(
            ramp(0.0, 1.0, 1, SweepShape::OneWay),
            Err(SweepError::Config(_))
        ));
        assert!(matches!(
            ramp(1.0, 1.0, 10, SweepShape::OneWay),
            Err(SweepError::Config(_))
        ));
        assert!(ramp(2.0, 1.0, 10, SweepShape::RoundTrip).is_err());
    }

    #[test]
    fn voltage_mode_uses_voltage_tolerance() {
        let mut config = bench_config();
        config.smu.drive_mode = DriveMode::VoltageDriven;
        config.min_value = -1.0;
        config.max_value = 1.0;
        let points = SweepPlanner::plan(&config).unwrap();
        assert!(points.iter().all(|p| p.settle_bound == 0.01));
    }
}
