//! Policy module for postloop.
//!
//! A contextual bandit that picks one value per creative dimension for each
//! generated post, plus the stores holding what it has learned so far.

/// The creative dimensions and their value sets.
pub mod action;
/// Context assembly from slot data and embeddings.
pub mod context;
/// Softmax selection and reward-driven updates.
pub mod engine;
/// Store abstractions and in-memory implementations.
pub mod store;
/// Utility modules for policy functionality.
pub mod utils;

pub use action::{Action, ActionValue, Dimension};
pub use context::{CategoricalContext, ContextBuilder, PolicyContext};
pub use engine::{Decision, LearningRates, PolicyEngine};
pub use store::{PreferenceKey, PreferenceStore, WeightKey, WeightStore};
