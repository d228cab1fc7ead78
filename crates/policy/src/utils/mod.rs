/// JSONL trail of decisions and updates.
pub mod events;
/// SQLite-backed preference and weight stores.
pub mod policy_store;
