// src/analytics/clustering/metrics.rs
//
// Internal validity indices computed on a hard partition.

use std::collections::BTreeMap;

use crate::analytics::stats::euclidean;

/// Labels that actually own at least one row.
pub fn non_empty_clusters(labels: &[usize]) -> Vec<usize> {
    let mut seen: Vec<usize> = labels.to_vec();
    seen.sort_unstable();
    seen.dedup();
    seen
}

fn members(labels: &[usize]) -> BTreeMap<usize, Vec<usize>> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &c) in labels.iter().enumerate() {
        groups.entry(c).or_default().push(i);
    }
    groups
}

/// Mean silhouette coefficient in [-1, 1]; higher is better.
///
/// `None` unless there are at least two non-empty clusters and fewer
/// clusters than rows. Rows alone in their cluster score 0.
pub fn silhouette(data: &[Vec<f64>], labels: &[usize]) -> Option<f64> {
    let groups = members(labels);
    if groups.len() < 2 || groups.len() >= data.len() {
        return None;
    }

    let mut total = 0.0;
    for (i, row) in data.iter().enumerate() {
        let own = labels[i];
        let own_members = &groups[&own];
        if own_members.len() <= 1 {
            continue;
        }
        let a = own_members
            .iter()
            .filter(|&&j| j != i)
            .map(|&j| euclidean(row, &data[j]))
            .sum::<f64>()
            / (own_members.len() - 1) as f64;
        let b = groups
            .iter()
            .filter(|(c, _)| **c != own)
            .map(|(_, idx)| {
                idx.iter().map(|&j| euclidean(row, &data[j])).sum::<f64>() / idx.len() as f64
            })
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    Some(total / data.len() as f64)
}

/// Davies-Bouldin index; lower is better. `None` with fewer than two
/// non-empty clusters.
pub fn davies_bouldin(data: &[Vec<f64>], labels: &[usize]) -> Option<f64> {
    let groups = members(labels);
    if groups.len() < 2 {
        return None;
    }
    let dims = data.first().map(|r| r.len()).unwrap_or(0);

    let centroids: Vec<Vec<f64>> = groups
        .values()
        .map(|idx| {
            let mut c = vec![0.0; dims];
            for &i in idx {
                for (s, v) in c.iter_mut().zip(&data[i]) {
                    *s += v;
                }
            }
            c.iter_mut().for_each(|s| *s /= idx.len() as f64);
            c
        })
        .collect();
    let scatter: Vec<f64> = groups
        .values()
        .zip(&centroids)
        .map(|(idx, c)| idx.iter().map(|&i| euclidean(&data[i], c)).sum::<f64>() / idx.len() as f64)
        .collect();

    let m = centroids.len();
    let mut total = 0.0;
    for a in 0..m {
        let mut worst = 0.0_f64;
        for b in 0..m {
            if a == b {
                continue;
            }
            let separation = euclidean(&centroids[a], &centroids[b]).max(1e-12);
            worst = worst.max((scatter[a] + scatter[b]) / separation);
        }
        total += worst;
    }
    Some(total / m as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separated() -> (Vec<Vec<f64>>, Vec<usize>) {
        let data = vec![
            vec![0.0, 0.0],
            vec![0.0, 1.0],
            vec![20.0, 20.0],
            vec![20.0, 21.0],
        ];
        (data, vec![0, 0, 1, 1])
    }

    #[test]
    fn well_separated_partition_scores_well() {
        let (data, labels) = separated();
        let s = silhouette(&data, &labels).unwrap();
        assert!(s > 0.9);
        let db = davies_bouldin(&data, &labels).unwrap();
        assert!(db < 0.1);
    }

    #[test]
    fn mixed_partition_scores_worse() {
        let (data, _) = separated();
        let bad = vec![0, 1, 0, 1];
        assert!(silhouette(&data, &bad).unwrap() < 0.0);
        assert!(davies_bouldin(&data, &bad).unwrap() > 1.0);
    }

    #[test]
    fn single_cluster_is_undefined() {
        let (data, _) = separated();
        assert!(silhouette(&data, &[0, 0, 0, 0]).is_none());
        assert!(davies_bouldin(&data, &[0, 0, 0, 0]).is_none());
        assert_eq!(non_empty_clusters(&[2, 0, 2]), vec![0, 2]);
    }
}
