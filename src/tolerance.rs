/// Whether an achieved source value is close enough to the commanded one.
///
/// Passes iff `|achieved - commanded| <= tolerance`. A NaN on either side
/// never passes.
pub fn within_tolerance(commanded: f64, achieved: f64, tolerance: f64) -> bool {
    (achieved - commanded).abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_passes_for_any_tolerance() {
        for x in [-150e-9, 0.0, 1.5, 42.0] {
            for t in [0.0, 1e-12, 10e-9, 1.0] {
                assert!(within_tolerance(x, x, t));
            }
        }
    }

    #[test]
    fn beyond_tolerance_fails() {
        for x in [-150e-9, 0.0, 2.0] {
            for t in [0.0, 10e-9, 0.5] {
                for eps in [1e-9, 1e-6, 0.1] {
                    assert!(!within_tolerance(x, x + t + eps, t));
                    assert!(!within_tolerance(x, x - t - eps, t));
                }
            }
        }
    }

    #[test]
    fn bench_example() {
        assert!(within_tolerance(-150e-9, -145e-9, 10e-9));
        assert!(!within_tolerance(-150e-9, -135e-9, 10e-9));
    }

    #[test]
    fn nan_never_passes() {
        assert!(!within_tolerance(1.0, f64::NAN, 1.0));
    }
}
