//! Softmax contextual bandit over the creative action space.
//!
//! Each dimension is scored and sampled independently:
//! `score(v) = preference(slot, dim, v) + weights(dim, v) · features`.
//! Exploration comes from sampling the softmax distribution; there is no
//! separate epsilon. The engine keeps no state of its own between calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use postloop_core::{PostloopError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::action::{
    Action, ActionValue, Creativity, Dimension, HookType, Length, TextInImage, Tone, VisualStyle,
};
use crate::context::PolicyContext;
use crate::store::{PreferenceKey, PreferenceStore, WeightKey, WeightStore};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRates {
    pub discrete: f64,
    pub continuous: f64,
}

impl Default for LearningRates {
    fn default() -> Self {
        Self {
            discrete: 0.05,
            continuous: 0.01,
        }
    }
}

/// Selected action together with the inputs needed to credit it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    /// The continuous vector the scores were computed with.
    pub features: Vec<f32>,
    /// Sampling distribution per dimension, keyed by dimension name.
    pub probabilities: BTreeMap<String, Vec<(String, f64)>>,
}

#[derive(Clone)]
pub struct PolicyEngine {
    preferences: Arc<dyn PreferenceStore>,
    weights: Arc<dyn WeightStore>,
    rates: LearningRates,
}

impl PolicyEngine {
    pub fn new(
        preferences: Arc<dyn PreferenceStore>,
        weights: Arc<dyn WeightStore>,
        rates: LearningRates,
    ) -> Self {
        Self {
            preferences,
            weights,
            rates,
        }
    }

    /// Scores every candidate of `dimension`; absent learned state scores 0.
    pub fn scores(&self, ctx: &PolicyContext, dimension: Dimension) -> Result<Vec<(&'static str, f64)>> {
        dimension
            .labels()
            .into_iter()
            .map(|label| Ok((label, self.score(ctx, dimension, label)?)))
            .collect()
    }

    /// Softmax distribution over the candidates of `dimension`.
    pub fn distribution(
        &self,
        ctx: &PolicyContext,
        dimension: Dimension,
    ) -> Result<Vec<(&'static str, f64)>> {
        let scored = self.scores(ctx, dimension)?;
        let raw: Vec<f64> = scored.iter().map(|(_, s)| *s).collect();
        let probs = softmax(&raw);
        Ok(scored
            .into_iter()
            .zip(probs)
            .map(|((label, _), p)| (label, p))
            .collect())
    }

    /// Samples one value per dimension.
    pub fn select<R: Rng + ?Sized>(&self, ctx: &PolicyContext, rng: &mut R) -> Result<Decision> {
        let mut probabilities = BTreeMap::new();
        let action = Action {
            hook_type: self.choose::<HookType, R>(ctx, rng, &mut probabilities)?,
            length: self.choose::<Length, R>(ctx, rng, &mut probabilities)?,
            tone: self.choose::<Tone, R>(ctx, rng, &mut probabilities)?,
            creativity: self.choose::<Creativity, R>(ctx, rng, &mut probabilities)?,
            text_in_image: self.choose::<TextInImage, R>(ctx, rng, &mut probabilities)?,
            visual_style: self.choose::<VisualStyle, R>(ctx, rng, &mut probabilities)?,
        };
        debug!(
            platform = %ctx.slot.platform,
            time_bucket = %ctx.slot.time_bucket,
            day_of_week = %ctx.slot.day_of_week,
            ?action,
            "policy selected action"
        );
        Ok(Decision {
            action,
            features: ctx.features.clone(),
            probabilities,
        })
    }

    /// Credits `advantage` to every (dimension, value) pair of `action`.
    ///
    /// Preference cells move by `discrete * advantage`; weight vectors by
    /// `continuous * advantage * features`. No clipping is applied. All six
    /// keys are checked before the first write: a stored vector of the wrong
    /// length or a result that would not be finite rejects the whole update.
    pub fn apply_update(&self, ctx: &PolicyContext, action: &Action, advantage: f64) -> Result<()> {
        let pref_delta = self.rates.discrete * advantage;
        let scale = self.rates.continuous * advantage;
        let weight_delta: Vec<f32> = ctx
            .features
            .iter()
            .map(|x| (scale * f64::from(*x)) as f32)
            .collect();
        if !pref_delta.is_finite() || weight_delta.iter().any(|d| !d.is_finite()) {
            return Err(PostloopError::DataIntegrity(format!(
                "advantage {advantage} gives a non-finite update"
            )));
        }

        for (dimension, value) in action.pairs() {
            self.check_update(ctx, dimension, value, pref_delta, &weight_delta)?;
        }

        for (dimension, value) in action.pairs() {
            let cell = PreferenceKey::new(&ctx.slot, dimension, value);
            let updated = self.preferences.update(&cell, pref_delta)?;
            self.weights
                .update(&WeightKey { dimension, value }, &weight_delta)?;
            debug!(
                dimension = %dimension,
                value,
                preference = updated,
                delta = pref_delta,
                "policy cell updated"
            );
        }
        Ok(())
    }

    fn check_update(
        &self,
        ctx: &PolicyContext,
        dimension: Dimension,
        value: &str,
        pref_delta: f64,
        weight_delta: &[f32],
    ) -> Result<()> {
        let current = self
            .preferences
            .preference(&PreferenceKey::new(&ctx.slot, dimension, value))?
            .unwrap_or(0.0);
        if !(current + pref_delta).is_finite() {
            return Err(PostloopError::DataIntegrity(format!(
                "preference {dimension}={value} would overflow"
            )));
        }

        if let Some(stored) = self.weights.weights(&WeightKey { dimension, value })? {
            if stored.len() != weight_delta.len() {
                return Err(PostloopError::DataIntegrity(format!(
                    "weight vector {dimension}={value} has {} entries, update has {}",
                    stored.len(),
                    weight_delta.len()
                )));
            }
            if stored.iter().zip(weight_delta).any(|(w, d)| !(w + d).is_finite()) {
                return Err(PostloopError::DataIntegrity(format!(
                    "weight vector {dimension}={value} would overflow"
                )));
            }
        }
        Ok(())
    }

    fn choose<V: ActionValue, R: Rng + ?Sized>(
        &self,
        ctx: &PolicyContext,
        rng: &mut R,
        probabilities: &mut BTreeMap<String, Vec<(String, f64)>>,
    ) -> Result<V> {
        let scores = V::ALL
            .iter()
            .map(|v| self.score(ctx, V::DIMENSION, v.label()))
            .collect::<Result<Vec<f64>>>()?;
        let probs = softmax(&scores);
        let index = sample_index(&probs, rng);

        probabilities.insert(
            V::DIMENSION.as_str().to_string(),
            V::ALL
                .iter()
                .zip(&probs)
                .map(|(v, p)| (v.label().to_string(), *p))
                .collect(),
        );

        V::ALL.get(index).copied().ok_or_else(|| {
            PostloopError::DataIntegrity(format!("{} has no candidates", V::DIMENSION))
        })
    }

    fn score(&self, ctx: &PolicyContext, dimension: Dimension, value: &str) -> Result<f64> {
        let preference = self
            .preferences
            .preference(&PreferenceKey::new(&ctx.slot, dimension, value))?
            .unwrap_or(0.0);

        let continuous = match self.weights.weights(&WeightKey { dimension, value })? {
            Some(weights) if weights.len() == ctx.features.len() => dot(&weights, &ctx.features),
            Some(weights) => {
                warn!(
                    dimension = %dimension,
                    value,
                    stored = weights.len(),
                    expected = ctx.features.len(),
                    "weight vector length mismatch, treating as zero"
                );
                0.0
            }
            None => 0.0,
        };

        Ok(preference + continuous)
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum()
}

/// Numerically stable softmax.
///
/// The maximum is subtracted before exponentiating, and every exponential is
/// floored at the smallest positive normal so no candidate ever gets
/// probability zero, whatever the score gap.
pub fn softmax(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max = scores
        .iter()
        .copied()
        .filter(|s| !s.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);

    let exps: Vec<f64> = scores
        .iter()
        .map(|&s| {
            let e = if s.is_nan() {
                0.0
            } else if max == f64::INFINITY {
                // Infinite scores share the mass.
                if s == f64::INFINITY { 1.0 } else { 0.0 }
            } else if max == f64::NEG_INFINITY {
                1.0
            } else {
                (s - max).exp()
            };
            e.max(f64::MIN_POSITIVE)
        })
        .collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Categorical draw weighted by `probs`.
pub fn sample_index<R: Rng + ?Sized>(probs: &[f64], rng: &mut R) -> usize {
    let u: f64 = rng.random();
    let mut acc = 0.0;
    for (i, p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}
