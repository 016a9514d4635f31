//! facetag-azure — Azure Face API backend.
//!
//! Implements [`facetag_core::FaceService`] over the Face REST API with a
//! blocking HTTP client. Image bodies are read from local files resolved
//! through configurable URI scheme roots.

pub mod client;
pub mod files;
pub mod retry;
mod wire;

pub use client::{normalize_endpoint, AzureConfig, AzureFaceClient, DEFAULT_PERSON_GROUP};
pub use files::FileRoots;
pub use retry::RetryPolicy;
