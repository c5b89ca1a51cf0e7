// src/analytics/features/selector.rs
use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{FeatureMatrix, minmax_variances};
use crate::analytics::stats;
use crate::config;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Columns whose min-max scaled variance is below this are dropped
    pub variance_threshold: f64,
    /// Pairs whose |Pearson r| exceeds this lose their less important member
    pub correlation_threshold: f64,
    /// Upper bound on retained columns
    pub max_features: usize,
    /// How many columns the top-by-variance fallback keeps
    pub fallback_top_k: usize,
    /// Importance weight of the (normalized) scaled variance
    pub variance_weight: f64,
    /// Importance weight of |correlation with the label proxy|
    pub label_weight: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            variance_threshold: config::DEFAULT_VARIANCE_THRESHOLD,
            correlation_threshold: config::DEFAULT_CORRELATION_THRESHOLD,
            max_features: config::DEFAULT_MAX_FEATURES,
            fallback_top_k: config::DEFAULT_FALLBACK_TOP_K,
            variance_weight: config::IMPORTANCE_VARIANCE_WEIGHT,
            label_weight: config::IMPORTANCE_LABEL_WEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    LowVariance { scaled_variance: f64 },
    Correlated { kept: String, correlation: f64 },
    OverCap { rank: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedFeature {
    pub name: String,
    #[serde(flatten)]
    pub reason: DropReason,
}

/// Retained columns (in original column order) plus why everything else went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionReport {
    pub retained: Vec<String>,
    pub importances: BTreeMap<String, f64>,
    pub dropped: Vec<DroppedFeature>,
    /// Set when the thresholds removed every column and the top-by-variance
    /// fallback was used instead
    pub fallback_used: bool,
}

impl SelectionReport {
    pub fn retained_indices(&self, matrix: &FeatureMatrix) -> Vec<usize> {
        self.retained
            .iter()
            .filter_map(|n| matrix.column_index(n))
            .collect()
    }
}

pub struct FeatureSelector {
    config: SelectionConfig,
}

impl FeatureSelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    /// Prunes near-constant and redundant columns.
    ///
    /// Never returns an empty selection for a matrix with at least one column.
    pub fn select(&self, matrix: &FeatureMatrix, label_proxy: Option<&[f64]>) -> SelectionReport {
        let n_cols = matrix.n_cols();
        let scaled_variances = minmax_variances(matrix);
        let mut dropped = Vec::new();

        // Step 1: variance filter
        let mut survivors = Vec::new();
        for (j, &var) in scaled_variances.iter().enumerate() {
            if var >= self.config.variance_threshold {
                survivors.push(j);
            } else {
                dropped.push(DroppedFeature {
                    name: matrix.feature_names[j].clone(),
                    reason: DropReason::LowVariance { scaled_variance: var },
                });
            }
        }
        debug!(
            "Variance filter kept {}/{} columns (threshold {})",
            survivors.len(),
            n_cols,
            self.config.variance_threshold
        );

        if survivors.is_empty() {
            return self.fallback_by_raw_variance(matrix, dropped);
        }

        let importance = self.importance(matrix, &survivors, &scaled_variances, label_proxy);

        // Step 2: correlation pruning, strongest pairs first
        let mut removed = vec![false; n_cols];
        if survivors.len() > 1 {
            let columns: BTreeMap<usize, Vec<f64>> =
                survivors.iter().map(|&j| (j, matrix.column(j))).collect();
            let mut pairs = Vec::new();
            for (a, &i) in survivors.iter().enumerate() {
                for &j in &survivors[a + 1..] {
                    if let Some(r) = stats::pearson(&columns[&i], &columns[&j]) {
                        if r.abs() > self.config.correlation_threshold {
                            pairs.push((i, j, r));
                        }
                    }
                }
            }
            pairs.sort_by(|x, y| {
                y.2.abs()
                    .total_cmp(&x.2.abs())
                    .then(x.0.cmp(&y.0))
                    .then(x.1.cmp(&y.1))
            });

            for (i, j, r) in pairs {
                if removed[i] || removed[j] {
                    continue;
                }
                // Ties drop the later column
                let (keep, drop) = if importance[&j] > importance[&i] {
                    (j, i)
                } else {
                    (i, j)
                };
                removed[drop] = true;
                dropped.push(DroppedFeature {
                    name: matrix.feature_names[drop].clone(),
                    reason: DropReason::Correlated {
                        kept: matrix.feature_names[keep].clone(),
                        correlation: r,
                    },
                });
            }
        }

        // Step 3: cap by importance rank
        let mut ranked: Vec<usize> = survivors.into_iter().filter(|&j| !removed[j]).collect();
        ranked.sort_by(|&a, &b| importance[&b].total_cmp(&importance[&a]).then(a.cmp(&b)));
        let cap = self.config.max_features.max(1);
        if ranked.len() > cap {
            for (rank, &j) in ranked.iter().enumerate().skip(cap) {
                dropped.push(DroppedFeature {
                    name: matrix.feature_names[j].clone(),
                    reason: DropReason::OverCap { rank },
                });
            }
            ranked.truncate(cap);
        }

        let mut kept = ranked;
        kept.sort_unstable();
        info!(
            "Feature selection retained {}/{} columns ({} dropped)",
            kept.len(),
            n_cols,
            dropped.len()
        );

        SelectionReport {
            retained: kept.iter().map(|&j| matrix.feature_names[j].clone()).collect(),
            importances: kept
                .iter()
                .map(|&j| (matrix.feature_names[j].clone(), importance[&j]))
                .collect(),
            dropped,
            fallback_used: false,
        }
    }

    /// importance = w_var * (scaled variance / max scaled variance)
    ///            + w_label * |corr(column, label)|
    ///
    /// Without a usable label the variance term carries all the weight.
    fn importance(
        &self,
        matrix: &FeatureMatrix,
        survivors: &[usize],
        scaled_variances: &[f64],
        label_proxy: Option<&[f64]>,
    ) -> BTreeMap<usize, f64> {
        let max_var = survivors
            .iter()
            .map(|&j| scaled_variances[j])
            .fold(0.0_f64, f64::max);
        let label = label_proxy.filter(|l| l.len() == matrix.n_rows() && stats::variance(l) > 0.0);
        let (w_var, w_label) = match label {
            Some(_) => (self.config.variance_weight, self.config.label_weight),
            None => (1.0, 0.0),
        };

        survivors
            .iter()
            .map(|&j| {
                let var_term = if max_var > 0.0 {
                    scaled_variances[j] / max_var
                } else {
                    0.0
                };
                let label_term = label
                    .and_then(|l| stats::pearson(&matrix.column(j), l))
                    .map(f64::abs)
                    .unwrap_or(0.0);
                (j, w_var * var_term + w_label * label_term)
            })
            .collect()
    }

    fn fallback_by_raw_variance(
        &self,
        matrix: &FeatureMatrix,
        mut dropped: Vec<DroppedFeature>,
    ) -> SelectionReport {
        let n_cols = matrix.n_cols();
        if n_cols == 0 {
            return SelectionReport {
                retained: Vec::new(),
                importances: BTreeMap::new(),
                dropped,
                fallback_used: true,
            };
        }

        let raw: Vec<f64> = (0..n_cols)
            .map(|j| stats::variance(&matrix.column(j)))
            .collect();
        let mut order: Vec<usize> = (0..n_cols).collect();
        order.sort_by(|&a, &b| raw[b].total_cmp(&raw[a]).then(a.cmp(&b)));
        let k = self
            .config
            .fallback_top_k
            .min(self.config.max_features)
            .clamp(1, n_cols);
        let mut kept: Vec<usize> = order.into_iter().take(k).collect();
        kept.sort_unstable();

        let kept_names: Vec<String> = kept.iter().map(|&j| matrix.feature_names[j].clone()).collect();
        dropped.retain(|d| !kept_names.contains(&d.name));

        warn!(
            "Degenerate feature set: thresholds removed all {} columns, falling back to top {} by raw variance",
            n_cols, k
        );

        SelectionReport {
            importances: kept.iter().map(|&j| (matrix.feature_names[j].clone(), raw[j])).collect(),
            retained: kept_names,
            dropped,
            fallback_used: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StudentId;

    fn matrix(names: &[&str], rows: Vec<Vec<f64>>) -> FeatureMatrix {
        FeatureMatrix {
            student_ids: (0..rows.len()).map(|i| StudentId(format!("s{}", i))).collect(),
            feature_names: names.iter().map(|s| s.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn perfectly_correlated_pair_keeps_exactly_one() {
        let m = matrix(
            &["a", "b", "c"],
            vec![
                vec![1.0, 2.0, 5.0],
                vec![2.0, 4.0, 1.0],
                vec![3.0, 6.0, 4.0],
                vec![4.0, 8.0, 2.0],
            ],
        );
        let report = FeatureSelector::new(SelectionConfig::default()).select(&m, None);
        let ab: Vec<_> = report.retained.iter().filter(|n| *n == "a" || *n == "b").collect();
        assert_eq!(ab.len(), 1);
        assert!(report.retained.contains(&"c".to_string()));
        assert!(report
            .dropped
            .iter()
            .any(|d| matches!(d.reason, DropReason::Correlated { .. })));
    }

    #[test]
    fn all_constant_columns_fall_back_to_top_k() {
        let m = matrix(&["a", "b"], vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]]);
        let report = FeatureSelector::new(SelectionConfig::default()).select(&m, None);
        assert!(report.fallback_used);
        assert!(!report.retained.is_empty());
    }

    #[test]
    fn single_survivor_skips_correlation_step() {
        let m = matrix(&["a", "b"], vec![vec![1.0, 0.0], vec![2.0, 0.0], vec![3.0, 0.0]]);
        let report = FeatureSelector::new(SelectionConfig::default()).select(&m, None);
        assert_eq!(report.retained, vec!["a".to_string()]);
        assert!(!report.fallback_used);
    }

    #[test]
    fn cap_keeps_most_label_relevant_columns() {
        let label = [0.1, 0.2, 0.3, 0.4, 0.5];
        let m = matrix(
            &["noise", "signal"],
            vec![
                vec![3.0, 1.0],
                vec![1.0, 2.0],
                vec![4.0, 3.0],
                vec![1.0, 4.0],
                vec![5.0, 5.2],
            ],
        );
        let config = SelectionConfig {
            max_features: 1,
            ..SelectionConfig::default()
        };
        let report = FeatureSelector::new(config).select(&m, Some(&label));
        assert_eq!(report.retained, vec!["signal".to_string()]);
        assert!(report
            .dropped
            .iter()
            .any(|d| d.name == "noise" && matches!(d.reason, DropReason::OverCap { .. })));
    }
}
