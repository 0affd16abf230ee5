//! Sub-metrics, weighted overall score and letter grade.

use wmsync_types::validation::Grade;

use crate::config::GradeThresholds;

const COMPLETENESS_WEIGHT: f64 = 0.30;
const ACCURACY_WEIGHT: f64 = 0.30;
const CONSISTENCY_WEIGHT: f64 = 0.25;
const UNIQUENESS_WEIGHT: f64 = 0.15;

/// `numerator / denominator`, or 1.0 when there is nothing to measure.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn rate(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        1.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Metrics {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub uniqueness: f64,
}

impl Metrics {
    pub(crate) fn overall(&self) -> f64 {
        let score = COMPLETENESS_WEIGHT * self.completeness
            + ACCURACY_WEIGHT * self.accuracy
            + CONSISTENCY_WEIGHT * self.consistency
            + UNIQUENESS_WEIGHT * self.uniqueness;
        score.clamp(0.0, 1.0)
    }
}

pub(crate) fn grade(score: f64, thresholds: &GradeThresholds) -> Grade {
    if score >= thresholds.a {
        Grade::A
    } else if score >= thresholds.b {
        Grade::B
    } else if score >= thresholds.c {
        Grade::C
    } else if score >= thresholds.d {
        Grade::D
    } else {
        Grade::F
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Metrics {
        fn perfect() -> Self {
            Self {
                completeness: 1.0,
                accuracy: 1.0,
                consistency: 1.0,
                uniqueness: 1.0,
            }
        }
    }

    #[test]
    fn empty_denominator_rates_perfect() {
        assert!((rate(0, 0) - 1.0).abs() < f64::EPSILON);
        assert!((rate(1, 4) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn weights_sum_to_one() {
        assert!((Metrics::perfect().overall() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn grade_boundaries_are_inclusive() {
        let t = GradeThresholds::default();
        assert_eq!(grade(0.95, &t), Grade::A);
        assert_eq!(grade(0.949, &t), Grade::B);
        assert_eq!(grade(0.90, &t), Grade::B);
        assert_eq!(grade(0.80, &t), Grade::C);
        assert_eq!(grade(0.70, &t), Grade::D);
        assert_eq!(grade(0.69, &t), Grade::F);
    }

    #[test]
    fn overall_weights_accuracy_and_completeness_equally() {
        let a = Metrics {
            accuracy: 0.5,
            ..Metrics::perfect()
        };
        let b = Metrics {
            completeness: 0.5,
            ..Metrics::perfect()
        };
        assert!((a.overall() - b.overall()).abs() < 1e-9);
        assert!((a.overall() - 0.85).abs() < 1e-9);
    }
}
