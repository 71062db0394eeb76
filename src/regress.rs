//! Weighted linear regression for source sample histories.
//!
//! The regression y = b0 + b1*x is fitted with per-point weights that act
//! as relative variances (a point with weight 4 counts like one with a
//! doubled standard deviation). The residual-runs test decides whether
//! the fit describes the data: too few sign runs means the residuals are
//! not white noise, and the oldest half of the window is dropped until
//! they are.

/// Fewest points a regression can be run over.
pub const MIN_SAMPLES_FOR_REGRESS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct RegressionResult {
    /// Offset estimate at x = 0 (the newest sample's epoch).
    pub intercept: f64,
    /// Frequency estimate (d offset / d time).
    pub slope: f64,
    /// Weighted residual variance.
    pub s2: f64,
    pub intercept_sd: f64,
    pub slope_sd: f64,
    /// Number of oldest points to discard to make the residuals white.
    pub best_start: usize,
    /// Same-sign residual runs over the accepted fit.
    pub n_runs: usize,
    pub dof: usize,
}

/// Plain weighted least squares over one window.
/// Returns (b0, b1, s2, sb0, sb1), or None for a degenerate window.
fn wls(x: &[f64], y: &[f64], w: &[f64]) -> Option<(f64, f64, f64, f64, f64)> {
    let n = x.len();
    if n < MIN_SAMPLES_FOR_REGRESS {
        return None;
    }

    let mut p_total = 0.0;
    let mut x_mean = 0.0;
    let mut y_mean = 0.0;
    for i in 0..n {
        let p = 1.0 / w[i];
        p_total += p;
        x_mean += p * x[i];
        y_mean += p * y[i];
    }
    x_mean /= p_total;
    y_mean /= p_total;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for i in 0..n {
        let p = 1.0 / w[i];
        let dx = x[i] - x_mean;
        sxx += p * dx * dx;
        sxy += p * dx * (y[i] - y_mean);
    }
    if sxx <= 0.0 {
        return None;
    }

    let b1 = sxy / sxx;
    let b0 = y_mean - b1 * x_mean;

    let mut rss = 0.0;
    for i in 0..n {
        let r = y[i] - (b0 + b1 * x[i]);
        rss += r * r / w[i];
    }
    let dof = n - 2;
    let s2 = if dof > 0 { rss / dof as f64 } else { 0.0 };
    let sb1 = (s2 / sxx).sqrt();
    let sb0 = (s2 * (1.0 / p_total + x_mean * x_mean / sxx)).sqrt();
    Some((b0, b1, s2, sb0, sb1))
}

fn count_runs(resid: &[f64]) -> usize {
    let mut runs = 1;
    for pair in resid.windows(2) {
        if pair[0] * pair[1] <= 0.0 {
            runs += 1;
        }
    }
    runs
}

/// 5% lower critical value for the number of sign runs in `n` residuals,
/// normal approximation of the runs distribution with balanced signs.
fn critical_runs(n: usize) -> usize {
    if n < 8 {
        return 1;
    }
    let nf = n as f64;
    let mean = nf / 2.0 + 1.0;
    let var = nf * (nf - 2.0) / (4.0 * (nf - 1.0));
    (mean - 1.645 * var.sqrt()).floor() as usize
}

/// Two-sided 95% Student-t quantile for `dof` degrees of freedom.
pub fn t_quantile(dof: usize) -> f64 {
    const TABLE: [f64; 20] = [
        12.706, 4.303, 3.182, 2.776, 2.571, 2.447, 2.365, 2.306, 2.262, 2.228, 2.201, 2.179,
        2.160, 2.145, 2.131, 2.120, 2.110, 2.101, 2.093, 2.086,
    ];
    match dof {
        0 => TABLE[0],
        1..=20 => TABLE[dof - 1],
        21..=25 => 2.06,
        26..=30 => 2.04,
        _ => 2.0,
    }
}

/// Fit `y = b0 + b1*x` over the window, discarding oldest points until
/// the residuals pass the runs test. `ex`/`ey` are older samples used
/// only to extend the runs test; `min_samples` is the smallest window
/// the caller will accept.
pub fn find_best_regression(
    x: &[f64],
    y: &[f64],
    w: &[f64],
    ex: &[f64],
    ey: &[f64],
    min_samples: usize,
) -> Option<RegressionResult> {
    let n = x.len();
    let floor = min_samples.max(MIN_SAMPLES_FOR_REGRESS);
    if n < floor {
        return None;
    }

    let mut start = 0;
    loop {
        let npoints = n - start;
        let (b0, b1, s2, sb0, sb1) = wls(&x[start..], &y[start..], &w[start..])?;

        let mut resid = Vec::with_capacity(ex.len() + npoints);
        for i in 0..ex.len() {
            resid.push(ey[i] - (b0 + b1 * ex[i]));
        }
        for i in start..n {
            resid.push(y[i] - (b0 + b1 * x[i]));
        }
        let n_runs = count_runs(&resid);

        if n_runs > critical_runs(resid.len()) || npoints <= floor {
            return Some(RegressionResult {
                intercept: b0,
                slope: b1,
                s2,
                intercept_sd: sb0,
                slope_sd: sb1,
                best_start: start,
                n_runs,
                dof: npoints - 2,
            });
        }
        // Residuals are not white: drop the oldest half and retry.
        start += (npoints + 1) / 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn uniform_weights(n: usize) -> Vec<f64> {
        vec![1.0; n]
    }

    #[test]
    fn test_exact_line_is_recovered() {
        let x: Vec<f64> = (0..10).map(|i| -(i as f64)).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 0.5 + 2e-5 * xi).collect();
        let r = find_best_regression(&x, &y, &uniform_weights(10), &[], &[], 3).unwrap();
        assert!((r.slope - 2e-5).abs() < 1e-12);
        assert!((r.intercept - 0.5).abs() < 1e-12);
        assert!(r.s2 < 1e-20);
        assert_eq!(r.best_start, 0);
    }

    #[test]
    fn test_too_few_points_fails() {
        let x = [0.0, -1.0];
        let y = [0.0, 1.0];
        assert!(find_best_regression(&x, &y, &[1.0, 1.0], &[], &[], 3).is_none());
    }

    #[test]
    fn test_degenerate_x_fails() {
        let x = [1.0, 1.0, 1.0, 1.0];
        let y = [0.0, 1.0, 2.0, 3.0];
        assert!(find_best_regression(&x, &y, &uniform_weights(4), &[], &[], 3).is_none());
    }

    #[test]
    fn test_heavy_weight_points_count_less() {
        // A gross outlier with a large relative variance must barely
        // move the fit.
        let x: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let mut y: Vec<f64> = x.iter().map(|&xi| 1.0 + 0.1 * xi).collect();
        let mut w = uniform_weights(12);
        y[5] += 50.0;
        w[5] = 1e6;
        let (_, b1, _, _, _) = wls(&x, &y, &w).unwrap();
        assert!((b1 - 0.1).abs() < 0.01, "slope dragged to {}", b1);
    }

    #[test]
    fn test_count_runs() {
        assert_eq!(count_runs(&[1.0, 1.0, 1.0]), 1);
        assert_eq!(count_runs(&[1.0, -1.0, 1.0, -1.0]), 4);
        assert_eq!(count_runs(&[1.0, 1.0, -1.0, -1.0, 1.0]), 3);
    }

    #[test]
    fn test_critical_runs_sane() {
        // Around n/2 minus a couple of sigma.
        assert_eq!(critical_runs(4), 1);
        let c64 = critical_runs(64);
        assert!((26..=30).contains(&c64), "critical_runs(64) = {}", c64);
        assert!(critical_runs(128) > critical_runs(64));
    }

    #[test]
    fn test_curved_data_discards_oldest() {
        // Strong curvature: a line fits only the recent half.
        let n = 32;
        let x: Vec<f64> = (0..n).map(|i| (i as f64) - (n as f64 - 1.0)).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 1e-4 * xi * xi).collect();
        let r = find_best_regression(&x, &y, &uniform_weights(n), &[], &[], 3).unwrap();
        assert!(r.best_start > 0, "expected oldest samples to be dropped");
    }

    #[test]
    fn test_white_noise_keeps_whole_window() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 40;
        let x: Vec<f64> = (0..n).map(|i| -(i as f64)).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|&xi| 3e-6 * xi + 1e-6 * (rng.gen::<f64>() - 0.5))
            .collect();
        let r = find_best_regression(&x, &y, &uniform_weights(n), &[], &[], 3).unwrap();
        // White residuals must keep at least half the window and still
        // recover the slope.
        assert!(r.best_start <= n / 2, "best_start {}", r.best_start);
        assert!((r.slope - 3e-6).abs() < 1e-6);
    }

    #[test]
    fn test_frequency_step_convergence_property() {
        // offset = a + b*t + gaussian noise: after >= 8 samples the
        // estimated slope must lie within 3 * skew of b.
        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let a = 0.01;
            let b = 50e-6;
            let sigma = 2e-6;
            let n = 16;
            let x: Vec<f64> = (0..n).map(|i| -(i as f64) * 16.0).collect();
            let y: Vec<f64> = x
                .iter()
                .map(|&xi| {
                    // Box-Muller, as the simulation tests do elsewhere.
                    let u1: f64 = rng.gen::<f64>().max(1e-12);
                    let u2: f64 = rng.gen();
                    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                    a + b * xi + sigma * z
                })
                .collect();
            let r = find_best_regression(&x, &y, &uniform_weights(n), &[], &[], 3).unwrap();
            let kept = n - r.best_start;
            assert!(kept >= 8, "runs test kept only {} samples", kept);
            let skew = r.slope_sd * t_quantile(r.dof);
            assert!(
                (r.slope - b).abs() <= 3.0 * skew,
                "seed {}: slope {} not within 3*{} of {}",
                seed,
                r.slope,
                skew,
                b
            );
        }
    }

    #[test]
    fn test_extension_residuals_enter_runs_test() {
        // The fitted line misses the extension samples badly on one
        // side; their residuals are all the same sign and lower the
        // run count.
        let x: Vec<f64> = (0..16).map(|i| -(i as f64)).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 1e-6 * xi).collect();
        let ex: Vec<f64> = (16..32).map(|i| -(i as f64)).collect();
        let ey: Vec<f64> = ex.iter().map(|_| 1.0).collect();
        let with_ext = find_best_regression(&x, &y, &uniform_weights(16), &ex, &ey, 3).unwrap();
        let without = find_best_regression(&x, &y, &uniform_weights(16), &[], &[], 3).unwrap();
        assert!(with_ext.n_runs != without.n_runs);
    }

    #[test]
    fn test_t_quantile_shape() {
        assert!(t_quantile(1) > t_quantile(2));
        assert!(t_quantile(10) > t_quantile(30));
        assert_eq!(t_quantile(100), 2.0);
    }
}
