// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Temporal decay, relevance weighting and the Beta-posterior estimator.

/// Exponential decay with the given half-life: `exp(-ln2 * age / half_life)`.
///
/// `age_days = 0` → 1.0; `age_days = half_life` → 0.5.
pub fn temporal_decay(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 0.0;
    }
    (-std::f64::consts::LN_2 * age_days.max(0.0) / half_life_days).exp()
}

/// Relevance of a memory entry: `decay(age) * (1 + 0.1 * (freq - 1))`.
///
/// Used both for retrieval ranking and for compaction eviction, with the
/// standard 30-day half-life.
pub fn relevance(age_days: f64, frequency: u32) -> f64 {
    let freq = frequency.max(1);
    temporal_decay(age_days, 30.0) * (1.0 + 0.1 * (freq - 1) as f64)
}

/// Beta-posterior point estimate and 95% interval for a success rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BetaEstimate {
    pub mean: f64,
    pub ci_low: f64,
    pub ci_high: f64,
}

/// Posterior of a Bernoulli success rate under a Beta(1, 1) prior.
///
/// Mean is `(s + 1) / (s + f + 2)`; the interval is the normal approximation
/// of the Beta posterior, clamped to `[0, 1]`.  The invariant
/// `ci_low <= mean <= ci_high` holds for all inputs.
pub fn beta_posterior(successes: u32, failures: u32) -> BetaEstimate {
    let alpha = successes as f64 + 1.0;
    let beta = failures as f64 + 1.0;
    let n = alpha + beta;
    let mean = alpha / n;
    let variance = (alpha * beta) / (n * n * (n + 1.0));
    let half = 1.96 * variance.sqrt();
    BetaEstimate {
        mean,
        ci_low: (mean - half).max(0.0),
        ci_high: (mean + half).min(1.0),
    }
}

/// Exponential moving average step.
pub fn ema(prev: f64, sample: f64, alpha: f64) -> f64 {
    if prev == 0.0 {
        return sample;
    }
    alpha * sample + (1.0 - alpha) * prev
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── temporal_decay ────────────────────────────────────────────────────────

    #[test]
    fn decay_at_zero_age_is_one() {
        assert!((temporal_decay(0.0, 30.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn decay_at_half_life_is_half() {
        assert!((temporal_decay(30.0, 30.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn decay_negative_age_clamps_to_one() {
        assert!((temporal_decay(-5.0, 30.0) - 1.0).abs() < 1e-12);
    }

    // ── relevance ─────────────────────────────────────────────────────────────

    #[test]
    fn relevance_fresh_single_use_is_one() {
        assert!((relevance(0.0, 1) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn relevance_frequency_bonus() {
        // freq 6 → bonus factor 1.5
        assert!((relevance(0.0, 6) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn relevance_zero_frequency_treated_as_one() {
        assert!((relevance(0.0, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn relevance_old_entries_score_lower() {
        assert!(relevance(60.0, 1) < relevance(1.0, 1));
    }

    // ── beta_posterior ────────────────────────────────────────────────────────

    #[test]
    fn beta_no_data_is_half() {
        let est = beta_posterior(0, 0);
        assert!((est.mean - 0.5).abs() < 1e-12);
    }

    #[test]
    fn beta_mean_formula() {
        // (3+1)/(3+1+2) = 4/6
        let est = beta_posterior(3, 1);
        assert!((est.mean - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn beta_bounds_hold_for_many_inputs() {
        for s in 0..20u32 {
            for f in 0..20u32 {
                let est = beta_posterior(s, f);
                assert!(est.ci_low <= est.mean, "s={s} f={f}");
                assert!(est.mean <= est.ci_high, "s={s} f={f}");
                assert!(est.ci_low >= 0.0 && est.ci_high <= 1.0, "s={s} f={f}");
            }
        }
    }

    #[test]
    fn beta_interval_narrows_with_samples() {
        let few = beta_posterior(2, 2);
        let many = beta_posterior(200, 200);
        assert!((many.ci_high - many.ci_low) < (few.ci_high - few.ci_low));
    }

    // ── ema ───────────────────────────────────────────────────────────────────

    #[test]
    fn ema_first_sample_passes_through() {
        assert_eq!(ema(0.0, 12.0, 0.15), 12.0);
    }

    #[test]
    fn ema_moves_toward_sample() {
        let next = ema(10.0, 20.0, 0.15);
        assert!((next - 11.5).abs() < 1e-12);
    }
}
