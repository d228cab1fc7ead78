//! Learned state behind the policy: discrete preferences and shared weight vectors.
//!
//! Both stores expose a read and a single atomic `update(key, delta)`. Absent
//! keys read as `None` and the engine treats them as neutral. The in-memory
//! variants are mutex-guarded maps; [`crate::utils::policy_store`] holds the
//! SQLite ones.

use std::collections::HashMap;
use std::sync::Mutex;

use postloop_core::{PostloopError, Result};

use crate::action::Dimension;
use crate::context::CategoricalContext;

/// Key of one policy cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreferenceKey<'a> {
    pub platform: &'a str,
    pub time_bucket: &'a str,
    pub day_of_week: &'a str,
    pub dimension: Dimension,
    pub value: &'a str,
}

impl<'a> PreferenceKey<'a> {
    pub fn new(slot: &'a CategoricalContext, dimension: Dimension, value: &'a str) -> Self {
        Self {
            platform: &slot.platform,
            time_bucket: &slot.time_bucket,
            day_of_week: &slot.day_of_week,
            dimension,
            value,
        }
    }
}

/// Key of one weight vector; shared by every context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightKey<'a> {
    pub dimension: Dimension,
    pub value: &'a str,
}

pub trait PreferenceStore: Send + Sync {
    fn preference(&self, key: &PreferenceKey<'_>) -> Result<Option<f64>>;

    /// Adds `delta` to the cell (creating it at 0) and returns the new value.
    fn update(&self, key: &PreferenceKey<'_>, delta: f64) -> Result<f64>;
}

pub trait WeightStore: Send + Sync {
    fn weights(&self, key: &WeightKey<'_>) -> Result<Option<Vec<f32>>>;

    /// Adds `delta` element-wise (creating a zero vector of the same length).
    fn update(&self, key: &WeightKey<'_>, delta: &[f32]) -> Result<()>;
}

type CellKey = (String, String, String, Dimension, String);

fn cell_key(key: &PreferenceKey<'_>) -> CellKey {
    (
        key.platform.to_string(),
        key.time_bucket.to_string(),
        key.day_of_week.to_string(),
        key.dimension,
        key.value.to_string(),
    )
}

#[derive(Debug, Default)]
pub struct InMemoryPreferenceStore {
    cells: Mutex<HashMap<CellKey, f64>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for InMemoryPreferenceStore {
    fn preference(&self, key: &PreferenceKey<'_>) -> Result<Option<f64>> {
        let cells = self.cells.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(cells.get(&cell_key(key)).copied())
    }

    fn update(&self, key: &PreferenceKey<'_>, delta: f64) -> Result<f64> {
        let mut cells = self.cells.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let cell = cells.entry(cell_key(key)).or_insert(0.0);
        *cell += delta;
        Ok(*cell)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWeightStore {
    vectors: Mutex<HashMap<(Dimension, String), Vec<f32>>>,
}

impl InMemoryWeightStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WeightStore for InMemoryWeightStore {
    fn weights(&self, key: &WeightKey<'_>) -> Result<Option<Vec<f32>>> {
        let vectors = self.vectors.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(vectors.get(&(key.dimension, key.value.to_string())).cloned())
    }

    fn update(&self, key: &WeightKey<'_>, delta: &[f32]) -> Result<()> {
        let mut vectors = self.vectors.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let stored = vectors
            .entry((key.dimension, key.value.to_string()))
            .or_insert_with(|| vec![0.0; delta.len()]);
        add_in_place(stored, delta, key)
    }
}

/// Element-wise `stored += delta`; lengths must agree.
pub(crate) fn add_in_place(stored: &mut [f32], delta: &[f32], key: &WeightKey<'_>) -> Result<()> {
    if stored.len() != delta.len() {
        return Err(PostloopError::DataIntegrity(format!(
            "weight vector {}={} has {} entries, update has {}",
            key.dimension,
            key.value,
            stored.len(),
            delta.len()
        )));
    }
    for (w, d) in stored.iter_mut().zip(delta) {
        *w += d;
    }
    Ok(())
}
