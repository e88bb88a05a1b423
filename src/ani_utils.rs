//! ANI estimation from containment and Jaccard under a Poisson mutation
//! model, with confidence intervals.
//!
//! Equations based off of: https://github.com/KoslickiLab/mutation-rate-ci-calculator
//! Reference: https://doi.org/10.1101/2022.01.11.475870

use roots::{find_root_brent, SimpleConvergency};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::Error;

pub const DEFAULT_CONFIDENCE: f64 = 0.95;
pub const DEFAULT_PROB_THRESHOLD: f64 = 1e-3;
pub const DEFAULT_JACCARD_ERR_THRESHOLD: f64 = 1e-4;

/// ANI estimate with optional confidence interval.
///
/// `dist` is the estimated mutation rate; `ani = 1 - dist`. Interval
/// fields are `None` when no CI was requested, when the variance model
/// broke down (too few hashes), or when `size_is_inaccurate` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct AniResult {
    pub dist: f64,
    pub p_nothing_in_common: f64,
    pub p_threshold: f64,
    pub dist_low: Option<f64>,
    pub dist_high: Option<f64>,
    pub size_is_inaccurate: bool,

    /// Only set for Jaccard-derived estimates.
    pub jaccard_error: Option<f64>,
    pub je_threshold: f64,
}

impl AniResult {
    fn new(dist: f64, p_nothing_in_common: f64) -> Result<Self, Error> {
        Ok(AniResult {
            dist: check_distance(dist)?,
            p_nothing_in_common,
            p_threshold: DEFAULT_PROB_THRESHOLD,
            dist_low: None,
            dist_high: None,
            size_is_inaccurate: false,
            jaccard_error: None,
            je_threshold: DEFAULT_JACCARD_ERR_THRESHOLD,
        })
    }

    /// Point estimate of identity. `None` when the Jaccard error bound
    /// exceeds its threshold, since the estimate is then unreliable.
    pub fn ani(&self) -> Option<f64> {
        if self.je_exceeds_threshold() {
            return None;
        }
        Some(1.0 - self.dist)
    }

    pub fn ani_low(&self) -> Option<f64> {
        if self.size_is_inaccurate {
            return None;
        }
        self.dist_high.map(|d| 1.0 - d)
    }

    pub fn ani_high(&self) -> Option<f64> {
        if self.size_is_inaccurate {
            return None;
        }
        self.dist_low.map(|d| 1.0 - d)
    }

    pub fn p_exceeds_threshold(&self) -> bool {
        self.p_nothing_in_common > self.p_threshold
    }

    pub fn je_exceeds_threshold(&self) -> bool {
        match self.jaccard_error {
            Some(err) => err > self.je_threshold,
            None => false,
        }
    }
}

fn check_distance(dist: f64) -> Result<f64, Error> {
    if (0.0..=1.0).contains(&dist) {
        Ok(dist)
    } else {
        Err(Error::ANIEstimationError {
            message: format!("distance value {:.4} is not between 0 and 1", dist),
        })
    }
}

fn r1_to_q(k: f64, r1: f64) -> f64 {
    1.0 - (1.0 - r1).powi(k as i32)
}

fn exp_n_mutated(l: f64, k: f64, r1: f64) -> f64 {
    l * r1_to_q(k, r1)
}

fn var_n_mutated(l: f64, k: f64, r1: f64) -> Result<f64, Error> {
    if r1 == 0.0 {
        return Ok(0.0);
    }

    let q = r1_to_q(k, r1);

    let var_n = l * (1.0 - q) * (q * (2.0 * k + (2.0 / r1) - 1.0) - 2.0 * k)
        + k * (k - 1.0) * (1.0 - q).powi(2)
        + (2.0 * (1.0 - q) / (r1.powi(2))) * ((1.0 + (k - 1.0) * (1.0 - q)) * r1 - q);

    if var_n < 0.0 {
        Err(Error::ANIEstimationError {
            message: "varN is less than 0.0".into(),
        })
    } else {
        Ok(var_n)
    }
}

fn exp_n_mutated_squared(l: f64, k: f64, p: f64) -> Result<f64, Error> {
    let var_n = var_n_mutated(l, k, p)?;
    Ok(var_n + exp_n_mutated(l, k, p).powi(2))
}

fn probit(p: f64) -> f64 {
    Normal::new(0.0, 1.0).unwrap().inverse_cdf(p)
}

/// Probability that two sketches of the given sizes share nothing, given
/// the estimated mutation rate.
pub fn get_exp_probability_nothing_common(
    dist: f64,
    ksize: f64,
    scaled: u64,
    n_unique_kmers: u64,
) -> f64 {
    if dist == 1.0 {
        1.0
    } else if dist == 0.0 {
        0.0
    } else {
        let f_scaled = 1.0 / scaled as f64;
        let n = n_unique_kmers as f64;
        let exp_nmut = exp_n_mutated(n, ksize, dist);
        let log_prob = (n - exp_nmut) * (1.0 - f_scaled).ln();
        if log_prob.is_infinite() {
            0.0
        } else {
            log_prob.exp()
        }
    }
}

/// Probability that `len(sketch) * scaled` is within `relative_error` of
/// the true set size, via the two-sided Chernoff bound over the binomial
/// sampling of hash space.
pub fn set_size_chernoff(set_size: f64, scaled: u64, relative_error: f64) -> f64 {
    1.0 - 2.0 * (-relative_error.powi(2) * set_size / (scaled as f64 * 3.0)).exp()
}

/// Streamlined point estimate of ANI from containment.
pub fn ani_from_containment(containment: f64, ksize: f64) -> f64 {
    if containment == 0.0 {
        0.0
    } else if containment == 1.0 {
        1.0
    } else {
        containment.powf(1.0 / ksize)
    }
}

/// Estimate distance (1 - ANI) from containment, optionally with a
/// confidence interval from the variance of the mutation model.
pub fn containment_to_distance(
    containment: f64,
    ksize: u32,
    scaled: u64,
    n_unique_kmers: u64,
    confidence: Option<f64>,
    estimate_ci: bool,
) -> Result<AniResult, Error> {
    let k = ksize as f64;
    let n = n_unique_kmers as f64;

    let point_estimate = if containment == 0.0 {
        1.0
    } else if containment == 1.0 {
        0.0
    } else {
        1.0 - containment.powf(1.0 / k)
    };

    let mut dist_low = None;
    let mut dist_high = None;

    if estimate_ci && containment > 0.0 && containment < 1.0 {
        let confidence = confidence.unwrap_or(DEFAULT_CONFIDENCE);
        let alpha = 1.0 - confidence;
        let z_alpha = probit(1.0 - alpha / 2.0);
        let f_scaled = 1.0 / scaled as f64;

        let bias_factor = 1.0 - (1.0 - f_scaled).powi(n as i32);
        let term_1 = (1.0 - f_scaled) / (f_scaled * n.powi(3) * bias_factor.powi(2));
        let term_2 = |pest: f64| {
            n * exp_n_mutated(n, k, pest) - exp_n_mutated_squared(n, k, pest).unwrap_or(0.0)
        };
        let term_3 = |pest: f64| var_n_mutated(n, k, pest).unwrap_or(0.0) / n.powi(2);

        let var_direct = |pest: f64| term_1 * term_2(pest) + term_3(pest);

        let f1 =
            |pest: f64| (1.0 - pest).powi(k as i32) + z_alpha * var_direct(pest).sqrt() - containment;
        let f2 =
            |pest: f64| (1.0 - pest).powi(k as i32) - z_alpha * var_direct(pest).sqrt() - containment;

        let mut convergency = SimpleConvergency {
            eps: 1e-15,
            max_iter: 1000,
        };
        // f1 carries the +z term, so its root is the upper distance bound
        dist_high = find_root_brent(1e-7, 0.9999999, &f1, &mut convergency).ok();
        dist_low = find_root_brent(1e-7, 0.9999999, &f2, &mut convergency).ok();
    } else if estimate_ci {
        // degenerate endpoints have a zero-width interval
        dist_low = Some(point_estimate);
        dist_high = Some(point_estimate);
    }

    let p_nothing_in_common =
        get_exp_probability_nothing_common(point_estimate, k, scaled, n_unique_kmers);

    let mut result = AniResult::new(point_estimate, p_nothing_in_common)?;
    result.dist_low = dist_low.map(check_distance).transpose()?;
    result.dist_high = dist_high.map(check_distance).transpose()?;
    Ok(result)
}

/// Estimate distance (1 - ANI) from Jaccard similarity.
///
/// The Jaccard estimate carries an additional error term; when it exceeds
/// `err_threshold` the ANI point estimate is reported as unreliable.
pub fn jaccard_to_distance(
    jaccard: f64,
    ksize: u32,
    scaled: u64,
    n_unique_kmers: u64,
    err_threshold: Option<f64>,
) -> Result<AniResult, Error> {
    let k = ksize as f64;
    let n = n_unique_kmers as f64;

    let (point_estimate, jaccard_error) = if jaccard == 0.0 {
        (1.0, 0.0)
    } else if jaccard == 1.0 {
        (0.0, 0.0)
    } else {
        let pest = 1.0 - (2.0 * jaccard / (1.0 + jaccard)).powf(1.0 / k);
        let exp_nmut = exp_n_mutated(n, k, pest);
        let var_n = var_n_mutated(n, k, pest)?;
        let err = n * var_n / (n + exp_nmut).powi(3);
        (pest, err)
    };

    let p_nothing_in_common =
        get_exp_probability_nothing_common(point_estimate, k, scaled, n_unique_kmers);

    let mut result = AniResult::new(point_estimate, p_nothing_in_common)?;
    result.jaccard_error = Some(jaccard_error);
    if let Some(je) = err_threshold {
        result.je_threshold = je;
    }
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;

    const EPS: f64 = 1e-6;

    #[test]
    fn containment_zero() {
        let res = containment_to_distance(0.0, 21, 1, 10000, None, true).unwrap();
        assert_eq!(res.dist, 1.0);
        assert_eq!(res.ani(), Some(0.0));
        assert_eq!(res.p_nothing_in_common, 1.0);
        assert_eq!(res.ani_low(), Some(0.0));
        assert_eq!(res.ani_high(), Some(0.0));
    }

    #[test]
    fn containment_one() {
        let res = containment_to_distance(1.0, 21, 1, 10000, None, true).unwrap();
        assert_eq!(res.dist, 0.0);
        assert_eq!(res.ani(), Some(1.0));
        assert_eq!(res.p_nothing_in_common, 0.0);
        assert!(!res.p_exceeds_threshold());
    }

    #[test]
    fn containment_point_estimate() {
        let res = containment_to_distance(0.9, 31, 1, 4, None, false).unwrap();
        assert!((res.dist - 0.003392957179023992).abs() < EPS);
        assert!(res.dist_low.is_none());
        assert!(res.dist_high.is_none());
    }

    #[test]
    fn containment_with_ci() {
        let res = containment_to_distance(0.1, 31, 1000, 1000, None, true).unwrap();
        let (low, high) = (res.dist_low.unwrap(), res.dist_high.unwrap());
        assert!(low <= res.dist && res.dist <= high);
        // and the ANI view flips the ordering
        assert!(res.ani_low().unwrap() <= res.ani().unwrap());
        assert!(res.ani().unwrap() <= res.ani_high().unwrap());
    }

    #[test]
    fn jaccard_point_estimate_and_error() {
        let res = jaccard_to_distance(0.5, 21, 1, 10000, None).unwrap();
        assert!((res.dist - 0.019122659390482077).abs() < EPS);
        assert!((res.jaccard_error.unwrap() - 0.00018351337045518042).abs() < EPS);
        assert!(res.je_exceeds_threshold());
        assert_eq!(res.ani(), None);
    }

    #[test]
    fn jaccard_error_threshold_override() {
        let res = jaccard_to_distance(0.5, 31, 100, 10000, Some(0.1)).unwrap();
        assert!(!res.je_exceeds_threshold());
        assert!((res.ani().unwrap() - 0.9870056455892898).abs() < EPS);
    }

    #[test]
    fn jaccard_small_values_keep_ani() {
        let res = jaccard_to_distance(0.1, 31, 100, 10000, None).unwrap();
        assert!((res.ani().unwrap() - 0.9464928391768298).abs() < EPS);
        assert!(!res.p_exceeds_threshold());
        assert!(!res.je_exceeds_threshold());
    }

    #[test]
    fn prob_nothing_in_common() {
        let p = get_exp_probability_nothing_common(0.25, 31.0, 10, 1000000);
        assert!((p - 7.437016945722123e-07).abs() < 1e-12);
    }

    #[test]
    fn chernoff_bound() {
        assert!((set_size_chernoff(1e6, 10, 0.01) - 0.928652).abs() < EPS);
        assert!((set_size_chernoff(1e4, 1, 0.05) - 0.999519).abs() < EPS);
        assert!(set_size_chernoff(10.0, 100, 0.001) < 0.0);
    }

    #[test]
    fn var_n_mutated_values() {
        assert_eq!(var_n_mutated(200.0, 31.0, 0.0).unwrap(), 0.0);
        let v = var_n_mutated(200000.0, 31.0, 0.4).unwrap();
        assert!((v - 0.10611425440741508).abs() < EPS);
    }
}
