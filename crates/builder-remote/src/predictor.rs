// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Autoscaling predictor: exponential smoothing plus trend.
//!
//! The predictor folds load samples into `S_t = α·X_t + (1-α)·S_{t-1}` and a
//! least-squares slope over the recent window, then recommends scaling:
//!
//! - **Up** when the smoothed load crosses the high watermark, or the trend
//!   is positive while utilization already sits above the mid watermark;
//! - **Down** when the smoothed load sits below the low watermark with a
//!   non-positive trend for a full cooldown of consecutive samples;
//! - **Hold** otherwise.
//!
//! The predictor is a pure fold over samples — it recommends, it never
//! provisions, and it holds no clock (cooldown is counted in samples).

use std::collections::VecDeque;

/// Scaling recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Add capacity.
    Up,
    /// Remove capacity.
    Down,
    /// Leave capacity as is.
    Hold,
}

/// Predictor tuning.
#[derive(Debug, Clone, Copy)]
pub struct PredictorConfig {
    /// Smoothing factor α in `(0, 1]`.
    pub alpha: f64,
    /// Samples kept for the trend regression.
    pub window: usize,
    /// Load above which scale-up always fires.
    pub high_watermark: f64,
    /// Load above which a positive trend fires scale-up.
    pub mid_watermark: f64,
    /// Load below which scale-down becomes possible.
    pub low_watermark: f64,
    /// Positive slope that counts as an upward trend.
    pub slope_threshold: f64,
    /// Consecutive qualifying samples before scale-down.
    pub cooldown_samples: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            window: 12,
            high_watermark: 0.85,
            mid_watermark: 0.6,
            low_watermark: 0.25,
            slope_threshold: 0.02,
            cooldown_samples: 6,
        }
    }
}

/// Exponential-smoothing load predictor.
#[derive(Debug)]
pub struct LoadPredictor {
    config: PredictorConfig,
    smoothed: Option<f64>,
    window: VecDeque<f64>,
    below_low_streak: usize,
}

impl LoadPredictor {
    /// Predictor with the given tuning.
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config,
            smoothed: None,
            window: VecDeque::new(),
            below_low_streak: 0,
        }
    }

    /// Current smoothed load (`None` before the first sample).
    pub fn smoothed(&self) -> Option<f64> {
        self.smoothed
    }

    /// Least-squares slope over the sample window (per sample step).
    pub fn slope(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let nf = n as f64;
        let mean_x = (nf - 1.0) / 2.0;
        let mean_y: f64 = self.window.iter().sum::<f64>() / nf;
        let mut num = 0.0;
        let mut den = 0.0;
        for (i, y) in self.window.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let x = i as f64;
            num += (x - mean_x) * (y - mean_y);
            den += (x - mean_x) * (x - mean_x);
        }
        if den == 0.0 {
            0.0
        } else {
            num / den
        }
    }

    /// Fold in a load sample (utilization in `[0, 1]`, >1 = overloaded) and
    /// recommend.
    pub fn observe(&mut self, sample: f64) -> ScaleDecision {
        let smoothed = match self.smoothed {
            Some(prev) => self.config.alpha * sample + (1.0 - self.config.alpha) * prev,
            None => sample,
        };
        self.smoothed = Some(smoothed);

        self.window.push_back(sample);
        while self.window.len() > self.config.window {
            self.window.pop_front();
        }
        let slope = self.slope();

        if smoothed > self.config.high_watermark
            || (slope > self.config.slope_threshold && smoothed > self.config.mid_watermark)
        {
            self.below_low_streak = 0;
            return ScaleDecision::Up;
        }

        if smoothed < self.config.low_watermark && slope <= 0.0 {
            self.below_low_streak += 1;
            if self.below_low_streak >= self.config.cooldown_samples {
                self.below_low_streak = 0;
                return ScaleDecision::Down;
            }
        } else {
            self.below_low_streak = 0;
        }
        ScaleDecision::Hold
    }
}
