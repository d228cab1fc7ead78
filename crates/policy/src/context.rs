//! Builds the bandit context from categorical slot data and embeddings.
//!
//! The builder is a pure function of its inputs. Delayed updates rebuild the
//! exact same vector from the persisted embeddings instead of caching it.

use chrono::{DateTime, Datelike, FixedOffset, Offset, Utc, Weekday};
use postloop_core::{PostloopError, Result};
use serde::{Deserialize, Serialize};

/// The discrete half of the context; indexes policy cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoricalContext {
    pub platform: String,
    pub time_bucket: String,
    pub day_of_week: String,
}

/// Context as handed to the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub slot: CategoricalContext,
    /// Business embedding followed by topic embedding.
    pub features: Vec<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder {
    embedding_dim: usize,
}

impl ContextBuilder {
    pub fn new(embedding_dim: usize) -> Self {
        Self { embedding_dim }
    }

    /// Length of every feature vector this builder produces.
    pub fn feature_dim(&self) -> usize {
        self.embedding_dim * 2
    }

    pub fn build(
        &self,
        platform: &str,
        time_bucket: &str,
        day_of_week: &str,
        business_embedding: Option<&[f32]>,
        topic_embedding: Option<&[f32]>,
    ) -> Result<PolicyContext> {
        let business = self.check("business", business_embedding)?;
        let topic = self.check("topic", topic_embedding)?;

        let mut features = Vec::with_capacity(self.feature_dim());
        features.extend_from_slice(business);
        features.extend_from_slice(topic);

        Ok(PolicyContext {
            slot: CategoricalContext {
                platform: platform.to_string(),
                time_bucket: time_bucket.to_string(),
                day_of_week: day_of_week.to_string(),
            },
            features,
        })
    }

    fn check<'a>(&self, which: &str, embedding: Option<&'a [f32]>) -> Result<&'a [f32]> {
        let embedding = embedding.ok_or_else(|| {
            PostloopError::Configuration(format!("{which} embedding is missing"))
        })?;
        if embedding.len() != self.embedding_dim {
            return Err(PostloopError::Configuration(format!(
                "{which} embedding has {} dimensions, expected {}",
                embedding.len(),
                self.embedding_dim
            )));
        }
        Ok(embedding)
    }
}

/// Three-letter weekday ("Mon" … "Sun") of `now` in the given UTC offset.
pub fn day_of_week(now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    let weekday = local_time(now, utc_offset_minutes).weekday();
    weekday_label(weekday).to_string()
}

pub fn local_time(now: DateTime<Utc>, utc_offset_minutes: i32) -> DateTime<FixedOffset> {
    now.with_timezone(&utc_offset(utc_offset_minutes))
}

/// Out-of-range offsets fall back to UTC.
pub fn utc_offset(minutes: i32) -> FixedOffset {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| Utc.fix())
}

fn weekday_label(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenates_business_then_topic() {
        let builder = ContextBuilder::new(2);
        let ctx = builder
            .build("instagram", "evening", "Mon", Some(&[1.0, 2.0][..]), Some(&[3.0, 4.0][..]))
            .unwrap();
        assert_eq!(ctx.features, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ctx.slot.platform, "instagram");
        assert_eq!(ctx.slot.day_of_week, "Mon");
    }

    #[test]
    fn identical_inputs_give_bit_identical_vectors() {
        let builder = ContextBuilder::new(3);
        let business = [0.1_f32, -0.2, 1.0e-7];
        let topic = [f32::MIN_POSITIVE, 0.3, -0.0];
        let a = builder
            .build("facebook", "morning", "Fri", Some(&business[..]), Some(&topic[..]))
            .unwrap();
        let b = builder
            .build("facebook", "morning", "Fri", Some(&business[..]), Some(&topic[..]))
            .unwrap();
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a.features), bits(&b.features));
    }

    #[test]
    fn missing_or_short_embeddings_are_configuration_errors() {
        let builder = ContextBuilder::new(2);
        let err = builder
            .build("instagram", "evening", "Mon", None, Some(&[1.0, 2.0][..]))
            .unwrap_err();
        assert!(matches!(err, PostloopError::Configuration(_)));

        let err = builder
            .build("instagram", "evening", "Mon", Some(&[1.0, 2.0][..]), Some(&[1.0][..]))
            .unwrap_err();
        assert!(matches!(err, PostloopError::Configuration(_)));
    }

    #[test]
    fn weekday_uses_local_offset() {
        // Sunday 20:00 UTC is already Monday in UTC+05:30.
        let now = "2026-10-18T20:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(day_of_week(now, 0), "Sun");
        assert_eq!(day_of_week(now, 330), "Mon");
    }
}
