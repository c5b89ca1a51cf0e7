// src/analytics/features/scaling.rs
use serde::{Deserialize, Serialize};

use super::FeatureMatrix;
use crate::analytics::stats;

/// Variance of every column after min-max scaling to [0, 1].
/// Constant columns have variance 0.
pub fn minmax_variances(matrix: &FeatureMatrix) -> Vec<f64> {
    (0..matrix.n_cols())
        .map(|j| {
            let col = matrix.column(j);
            let min = col.iter().copied().fold(f64::INFINITY, f64::min);
            let max = col.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let span = max - min;
            if !span.is_finite() || span <= f64::EPSILON {
                return 0.0;
            }
            let scaled: Vec<f64> = col.iter().map(|v| (v - min) / span).collect();
            stats::variance(&scaled)
        })
        .collect()
}

/// Z-score standardization fitted on one matrix. Zero-spread columns map to 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(matrix: &FeatureMatrix) -> Self {
        let (means, stds): (Vec<f64>, Vec<f64>) = (0..matrix.n_cols())
            .map(|j| {
                let col = matrix.column(j);
                (stats::mean(&col), stats::std_dev(&col))
            })
            .unzip();
        Self { means, stds }
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(j, v)| {
                let std = self.stds[j];
                if std <= f64::EPSILON {
                    0.0
                } else {
                    (v - self.means[j]) / std
                }
            })
            .collect()
    }

    pub fn transform(&self, matrix: &FeatureMatrix) -> Vec<Vec<f64>> {
        matrix.rows.iter().map(|r| self.transform_row(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StudentId;

    fn matrix(rows: Vec<Vec<f64>>) -> FeatureMatrix {
        FeatureMatrix {
            student_ids: (0..rows.len()).map(|i| StudentId(i.to_string())).collect(),
            feature_names: (0..rows[0].len()).map(|j| format!("f{}", j)).collect(),
            rows,
        }
    }

    #[test]
    fn constant_column_has_zero_scaled_variance() {
        let m = matrix(vec![vec![1.0, 0.0], vec![1.0, 10.0], vec![1.0, 5.0]]);
        let v = minmax_variances(&m);
        assert_eq!(v[0], 0.0);
        assert!(v[1] > 0.1);
    }

    #[test]
    fn standardized_columns_have_zero_mean() {
        let m = matrix(vec![vec![1.0, 3.0], vec![2.0, 3.0], vec![3.0, 3.0]]);
        let scaler = StandardScaler::fit(&m);
        let z = scaler.transform(&m);
        let col0: f64 = z.iter().map(|r| r[0]).sum();
        assert!(col0.abs() < 1e-12);
        assert!(z.iter().all(|r| r[1] == 0.0));
    }
}
