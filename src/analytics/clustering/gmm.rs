// src/analytics/clustering/gmm.rs
use std::f64::consts::PI;

use log::debug;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::kmeans::kmeans;
use crate::analytics::stats;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GmmParams {
    pub n_init: usize,
    pub max_iter: usize,
    /// Stop when mean per-sample log-likelihood improves by less than this
    pub tolerance: f64,
    /// Added to every variance to keep components non-singular
    pub reg_covar: f64,
}

/// Diagonal-covariance Gaussian mixture fitted with EM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianMixture {
    pub weights: Vec<f64>,
    pub means: Vec<Vec<f64>>,
    pub variances: Vec<Vec<f64>>,
    /// Total log-likelihood of the training data
    pub log_likelihood: f64,
    pub converged: bool,
    pub iterations: usize,
}

impl GaussianMixture {
    /// Fits `k` components; each of the `n_init` restarts is initialized from
    /// a k-means solution on its own seed stream and the best likelihood wins.
    pub fn fit(data: &[Vec<f64>], k: usize, params: &GmmParams, seed: u64) -> GaussianMixture {
        let mut best: Option<GaussianMixture> = None;
        for restart in 0..params.n_init.max(1) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(restart as u64));
            let init = kmeans(data, k, &mut rng, params.max_iter, 1e-10);
            let model = Self::em(data, &init.centroids, &init.labels, params);
            debug!(
                "GMM k={} restart {}: log-likelihood {:.4} after {} iterations",
                k, restart, model.log_likelihood, model.iterations
            );
            let better = match &best {
                Some(b) => model.log_likelihood > b.log_likelihood,
                None => true,
            };
            if better {
                best = Some(model);
            }
        }
        best.unwrap_or_else(|| Self::em(data, &[], &[], params))
    }

    fn em(
        data: &[Vec<f64>],
        centroids: &[Vec<f64>],
        labels: &[usize],
        params: &GmmParams,
    ) -> GaussianMixture {
        let n = data.len();
        let k = centroids.len();
        let dims = data.first().map(|r| r.len()).unwrap_or(0);
        let global_var: Vec<f64> = (0..dims)
            .map(|j| {
                let col: Vec<f64> = data.iter().map(|r| r[j]).collect();
                stats::variance(&col) + params.reg_covar
            })
            .collect();

        // Start from the hard k-means partition
        let mut model = GaussianMixture {
            weights: vec![1.0 / k.max(1) as f64; k],
            means: centroids.to_vec(),
            variances: vec![global_var.clone(); k],
            log_likelihood: f64::NEG_INFINITY,
            converged: false,
            iterations: 0,
        };
        let mut resp = vec![vec![0.0; k]; n];
        for (i, &c) in labels.iter().enumerate() {
            if c < k {
                resp[i][c] = 1.0;
            }
        }
        model.m_step(data, &resp, &global_var, params.reg_covar);

        let mut previous = f64::NEG_INFINITY;
        for iter in 0..params.max_iter {
            model.iterations = iter + 1;
            let ll = model.e_step(data, &mut resp);
            model.log_likelihood = ll;
            if (ll - previous).abs() / n.max(1) as f64 <= params.tolerance {
                model.converged = true;
                break;
            }
            previous = ll;
            model.m_step(data, &resp, &global_var, params.reg_covar);
        }
        model
    }

    /// Fills responsibilities, returns the total log-likelihood.
    fn e_step(&self, data: &[Vec<f64>], resp: &mut [Vec<f64>]) -> f64 {
        let mut total = 0.0;
        for (row, r) in data.iter().zip(resp.iter_mut()) {
            let logs = self.weighted_log_densities(row);
            let lse = log_sum_exp(&logs);
            total += lse;
            for (slot, l) in r.iter_mut().zip(&logs) {
                *slot = (l - lse).exp();
            }
        }
        total
    }

    fn m_step(&mut self, data: &[Vec<f64>], resp: &[Vec<f64>], global_var: &[f64], reg: f64) {
        let n = data.len() as f64;
        let k = self.weights.len();
        let dims = global_var.len();
        for c in 0..k {
            let nk: f64 = resp.iter().map(|r| r[c]).sum();
            if nk < 1e-10 {
                // Starved component: tiny weight, keep its mean, broad variance
                self.weights[c] = 1e-10;
                self.variances[c] = global_var.to_vec();
                continue;
            }
            self.weights[c] = nk / n;
            let mut mean = vec![0.0; dims];
            for (row, r) in data.iter().zip(resp) {
                for j in 0..dims {
                    mean[j] += r[c] * row[j];
                }
            }
            mean.iter_mut().for_each(|m| *m /= nk);
            let mut var = vec![0.0; dims];
            for (row, r) in data.iter().zip(resp) {
                for j in 0..dims {
                    var[j] += r[c] * (row[j] - mean[j]).powi(2);
                }
            }
            var.iter_mut().for_each(|v| *v = *v / nk + reg);
            self.means[c] = mean;
            self.variances[c] = var;
        }
        let total: f64 = self.weights.iter().sum();
        if total > 0.0 {
            self.weights.iter_mut().for_each(|w| *w /= total);
        }
    }

    /// log(w_c) + log N(row | mu_c, diag(var_c)) for every component.
    fn weighted_log_densities(&self, row: &[f64]) -> Vec<f64> {
        self.means
            .iter()
            .zip(&self.variances)
            .zip(&self.weights)
            .map(|((mean, var), w)| {
                let mut log_pdf = 0.0;
                for ((x, m), v) in row.iter().zip(mean).zip(var) {
                    log_pdf -= 0.5 * ((2.0 * PI * v).ln() + (x - m).powi(2) / v);
                }
                w.max(1e-300).ln() + log_pdf
            })
            .collect()
    }

    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    /// Free parameters: k*d means + k*d variances + (k - 1) weights.
    pub fn n_parameters(&self) -> usize {
        let k = self.n_components();
        let d = self.means.first().map(|m| m.len()).unwrap_or(0);
        2 * k * d + k.saturating_sub(1)
    }

    pub fn bic(&self, n_samples: usize) -> f64 {
        -2.0 * self.log_likelihood + self.n_parameters() as f64 * (n_samples.max(1) as f64).ln()
    }

    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.n_parameters() as f64
    }

    pub fn responsibilities(&self, row: &[f64]) -> Vec<f64> {
        let logs = self.weighted_log_densities(row);
        let lse = log_sum_exp(&logs);
        logs.iter().map(|l| (l - lse).exp()).collect()
    }

    /// Hard assignment: component with the highest responsibility (lowest index on ties).
    pub fn predict(&self, row: &[f64]) -> usize {
        let logs = self.weighted_log_densities(row);
        let mut best = 0;
        for (c, l) in logs.iter().enumerate() {
            if *l > logs[best] {
                best = c;
            }
        }
        best
    }
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}
