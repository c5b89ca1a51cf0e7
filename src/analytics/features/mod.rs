// src/analytics/features/mod.rs
mod extractor;
mod scaling;
mod selector;

pub use extractor::{ExtractionOutput, FeatureConfig, FeatureExtractor, FeatureVector};
pub use scaling::{StandardScaler, minmax_variances};
pub use selector::{
    DropReason, DroppedFeature, FeatureSelector, SelectionConfig, SelectionReport,
};

use serde::{Deserialize, Serialize};

use crate::models::StudentId;

/// Dense students x features matrix with row and column labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub student_ids: Vec<StudentId>,
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.feature_names.len()
    }

    pub fn column(&self, j: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r[j]).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|n| n == name)
    }

    /// New matrix holding only the given columns, in the given order.
    pub fn select_columns(&self, indices: &[usize]) -> FeatureMatrix {
        FeatureMatrix {
            student_ids: self.student_ids.clone(),
            feature_names: indices.iter().map(|&j| self.feature_names[j].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| indices.iter().map(|&j| r[j]).collect())
                .collect(),
        }
    }

    /// Columns looked up by name; unknown names are ignored.
    pub fn select_named(&self, names: &[String]) -> FeatureMatrix {
        let indices: Vec<usize> = names.iter().filter_map(|n| self.column_index(n)).collect();
        self.select_columns(&indices)
    }
}
