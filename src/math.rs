//! Robust statistics shared by the spike detector and the PID ranker.

/// Scale factor making the MAD a consistent estimator of the standard
/// deviation for normal data.
pub const MAD_SCALE: f64 = 0.6745;

/// Median of a sample. Returns 0.0 for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values compare"));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation around the sample median.
pub fn mad(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let med = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations)
}

/// Robust z-score: `0.6745 · (x − median) / max(MAD, eps)`.
///
/// The epsilon clamp keeps the score finite on quiet (near-constant)
/// series where the MAD collapses to zero.
pub fn robust_z(x: f64, med: f64, mad: f64, eps: f64) -> f64 {
    MAD_SCALE * (x - med) / mad.max(eps)
}

/// Arithmetic mean. Returns 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Cosine similarity of two mean-centered series.
///
/// Returns 0.0 when either centered series has zero norm or the lengths
/// differ (callers align the series first).
pub fn centered_cosine(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let ma = mean(a);
    let mb = mean(b);

    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let xc = x - ma;
        let yc = y - mb;
        dot += xc * yc;
        na += xc * xc;
        nb += yc * yc;
    }

    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }

    dot / (na.sqrt() * nb.sqrt())
}

/// 2×2 covariance matrix of a (cpu, ram) sample set, with its mean.
#[derive(Debug, Clone, Copy)]
pub struct Baseline2 {
    pub mean: [f64; 2],
    /// Row-major covariance: [[xx, xy], [xy, yy]].
    pub cov: [[f64; 2]; 2],
}

impl Baseline2 {
    /// Estimate mean and sample covariance from paired observations.
    /// Returns `None` with fewer than two samples.
    pub fn estimate(samples: &[[f64; 2]]) -> Option<Self> {
        if samples.len() < 2 {
            return None;
        }

        let n = samples.len() as f64;
        let mx = samples.iter().map(|s| s[0]).sum::<f64>() / n;
        let my = samples.iter().map(|s| s[1]).sum::<f64>() / n;

        let mut xx = 0.0;
        let mut xy = 0.0;
        let mut yy = 0.0;
        for s in samples {
            let dx = s[0] - mx;
            let dy = s[1] - my;
            xx += dx * dx;
            xy += dx * dy;
            yy += dy * dy;
        }
        let denom = n - 1.0;

        Some(Self {
            mean: [mx, my],
            cov: [[xx / denom, xy / denom], [xy / denom, yy / denom]],
        })
    }

    /// Squared Mahalanobis distance of a point from this distribution.
    /// Returns `None` when the covariance is singular (near-zero
    /// determinant), in which case callers fall back to the diagonal.
    pub fn mahalanobis_sq(&self, point: [f64; 2]) -> Option<f64> {
        let [[a, b], [_, d]] = self.cov;
        let det = a * d - b * b;
        if det.abs() < 1e-12 || !det.is_finite() {
            return None;
        }

        let dx = point[0] - self.mean[0];
        let dy = point[1] - self.mean[1];

        // Inverse of [[a, b], [b, d]] is [[d, -b], [-b, a]] / det.
        let dsq = (d * dx * dx - 2.0 * b * dx * dy + a * dy * dy) / det;
        if !dsq.is_finite() {
            return None;
        }
        Some(dsq.max(0.0))
    }
}
