// src/ingest/mod.rs

mod clip_name;
mod manifest;
mod stream_sync;

pub use manifest::{discover_manifests, TripManifest};
pub use stream_sync::{ClipInput, SyncPlan};
