//! Content-addressed image store for an OCI container registry.
//!
//! The store owns a directory tree of repositories laid out per the OCI
//! image-layout, so foreign tools can read it directly. It accepts resumable
//! chunked blob uploads into per-repository scratch files, verifies digests
//! on finalize, places blobs at content-addressed paths, hard-links identical
//! blobs across repositories through a persistent dedupe index, maintains
//! each repository's `index.json`, and garbage-collects unreferenced blobs
//! behind a grace delay.
//!
//! The HTTP surface, authentication and configuration live elsewhere; this
//! crate is the storage engine only.

pub mod blobs;
pub mod cache;
pub mod gc;
pub mod layout;
pub mod manifest;
pub mod scrub;
pub mod store;
pub mod upload;

pub use cache::DedupeCache;
pub use scrub::ScrubIssue;
pub use store::{ImageStore, BLOB_UPLOAD_DIR};

pub use stevedore_types::digest::Digest;
pub use stevedore_types::error::{Result, StoreError};
pub use stevedore_types::oci;

#[cfg(test)]
mod testutil;
