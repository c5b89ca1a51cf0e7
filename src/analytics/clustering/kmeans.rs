// src/analytics/clustering/kmeans.rs
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::analytics::stats::squared_euclidean;

#[derive(Debug, Clone)]
pub struct KMeansResult {
    pub centroids: Vec<Vec<f64>>,
    pub labels: Vec<usize>,
    pub inertia: f64,
    pub iterations: usize,
}

/// Index of the nearest centroid; ties go to the lowest index.
pub fn nearest_centroid(row: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.iter().enumerate() {
        let d = squared_euclidean(row, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

/// k-means++ seeding: first centre uniform, the rest drawn proportional to
/// squared distance from the closest centre already chosen.
fn plus_plus_init(data: &[Vec<f64>], k: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f64>> {
    let n = data.len();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(data[rng.gen_range(0..n)].clone());

    let mut dist: Vec<f64> = data
        .iter()
        .map(|row| squared_euclidean(row, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = dist.iter().sum();
        let next = if total <= f64::EPSILON {
            rng.gen_range(0..n)
        } else {
            let mut target = rng.r#gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, d) in dist.iter().enumerate() {
                if target < *d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        };
        let centre = data[next].clone();
        for (i, row) in data.iter().enumerate() {
            dist[i] = dist[i].min(squared_euclidean(row, &centre));
        }
        centroids.push(centre);
    }
    centroids
}

/// Lloyd iterations from a k-means++ start.
///
/// An emptied cluster is re-seeded with the point currently farthest from its
/// own centroid, so the result always has `k` centroids.
pub fn kmeans(
    data: &[Vec<f64>],
    k: usize,
    rng: &mut ChaCha8Rng,
    max_iter: usize,
    tolerance: f64,
) -> KMeansResult {
    let dims = data.first().map(|r| r.len()).unwrap_or(0);
    let mut centroids = plus_plus_init(data, k, rng);
    let mut labels = vec![0usize; data.len()];
    let mut iterations = 0;

    for iter in 0..max_iter {
        iterations = iter + 1;
        let mut nearest = Vec::with_capacity(data.len());
        for (i, row) in data.iter().enumerate() {
            let (c, d) = nearest_centroid(row, &centroids);
            labels[i] = c;
            nearest.push(d);
        }

        let mut sums = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for (row, &c) in data.iter().zip(&labels) {
            counts[c] += 1;
            for (s, v) in sums[c].iter_mut().zip(row) {
                *s += v;
            }
        }

        let mut shift = 0.0;
        for c in 0..k {
            let updated = if counts[c] == 0 {
                let far = nearest
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                nearest[far] = 0.0;
                data[far].clone()
            } else {
                sums[c].iter().map(|s| s / counts[c] as f64).collect()
            };
            shift += squared_euclidean(&centroids[c], &updated);
            centroids[c] = updated;
        }

        if shift <= tolerance {
            break;
        }
    }

    let mut inertia = 0.0;
    for (i, row) in data.iter().enumerate() {
        let (c, d) = nearest_centroid(row, &centroids);
        labels[i] = c;
        inertia += d;
    }

    KMeansResult {
        centroids,
        labels,
        inertia,
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn separates_two_obvious_groups() {
        let data = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![10.0, 10.0],
            vec![10.1, 10.0],
            vec![10.0, 10.1],
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let result = kmeans(&data, 2, &mut rng, 100, 1e-9);
        assert_eq!(result.labels[0], result.labels[1]);
        assert_eq!(result.labels[0], result.labels[2]);
        assert_eq!(result.labels[3], result.labels[4]);
        assert_ne!(result.labels[0], result.labels[3]);
        assert!(result.inertia < 0.1);
    }

    #[test]
    fn identical_points_do_not_panic() {
        let data = vec![vec![1.0, 1.0]; 5];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = kmeans(&data, 3, &mut rng, 50, 1e-9);
        assert_eq!(result.centroids.len(), 3);
        assert_eq!(result.inertia, 0.0);
    }
}
