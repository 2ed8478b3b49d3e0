//! Core data models for the deduplicating blob store.
//!
//! Two entities back every stored blob: a content-addressed [`data::Data`]
//! row describing one physical object per distinct content per location,
//! and a name-addressed [`blob::Blob`] row pointing a workspace-scoped name
//! at such content. Both map to SQLite tables via `sqlx::FromRow` and
//! serialize as JSON via `serde`.

pub mod blob;
pub mod data;
pub mod upload;
