//! Storage of tracked projects.
//!  - [entities] holds the persisted shapes.
//!  - [collection::ProjectCollection] is the in-memory collection and the only writer of
//!    attribution counters.
//!  - [project_storage::JsonProjectStorage] loads and saves the collection as one JSON document,
//!    migrating older layouts forward.

pub mod collection;
pub mod entities;
pub mod project_storage;
