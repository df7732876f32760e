//! Storage provider adapters.
//!
//! Each backend implements [`StorageProvider`] with identical external
//! semantics. Differences in authentication, URL signing, default HTTP verb
//! and the token shape needed to assemble a multipart upload stay inside the
//! implementation; callers only pick which adapter to talk to.

use crate::models::{
    capability::{DownloadCapability, PartToken, UploadCapability},
    session::ProviderKind,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

pub mod b2;
pub mod r2;

#[cfg(test)]
pub mod fake;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no adapter registered for provider {0}")]
    NotConfigured(ProviderKind),
    #[error("{provider} {operation} failed: {message}")]
    Request {
        provider: ProviderKind,
        operation: &'static str,
        message: String,
    },
    #[error("{provider} {operation} returned an unusable response: {message}")]
    InvalidResponse {
        provider: ProviderKind,
        operation: &'static str,
        message: String,
    },
    #[error("multipart parts must be numbered 1..={expected} in ascending order")]
    InvalidParts { expected: usize },
    #[error("no multipart upload is open for chunk {index}")]
    MissingMultipartId { index: i64 },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Uniform capability interface over one object-storage backend.
///
/// Chunk indices are 0-based everywhere in this trait's inputs; part numbers
/// handed to the backend are 1-based and owned by the implementation.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One upload capability per chunk, ordered by index.
    ///
    /// A single chunk gets a single-shot upload. More than one opens a
    /// backend multipart session and every capability carries its id.
    async fn issue_put_capabilities(
        &self,
        key: &str,
        chunk_count: i64,
    ) -> ProviderResult<Vec<UploadCapability>>;

    /// Re-derive the capability for one chunk without opening a new
    /// multipart session.
    async fn reissue_put_capability(
        &self,
        key: &str,
        chunk_count: i64,
        multipart_id: Option<&str>,
        index: i64,
    ) -> ProviderResult<UploadCapability>;

    /// One read capability per chunk, ordered by index, valid for the
    /// configured signed-URL window.
    async fn issue_get_capabilities(
        &self,
        key: &str,
        chunk_count: i64,
    ) -> ProviderResult<Vec<DownloadCapability>>;

    /// Assemble previously uploaded parts. `parts` must be numbered
    /// `1..=n` in ascending order.
    async fn finalize_multipart(
        &self,
        key: &str,
        multipart_id: &str,
        parts: &[PartToken],
    ) -> ProviderResult<()>;

    /// Remove the object and any unfinished multipart upload on `key`.
    /// Succeeds when nothing exists under the key.
    async fn delete_object(&self, key: &str) -> ProviderResult<()>;
}

/// Adapters keyed by backend, built once per process and shared.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn StorageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> ProviderResult<Arc<dyn StorageProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or(ProviderError::NotConfigured(kind))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.providers.keys().copied().collect()
    }
}

/// Backend object path for a session.
///
/// Uses two MD5-derived shard levels so keys spread across prefixes:
/// `uploads/{aa}/{bb}/{session_id}`.
pub fn object_key_for(session_id: &Uuid) -> String {
    let digest = md5::compute(session_id.as_bytes());
    format!(
        "uploads/{:02x}/{:02x}/{}",
        digest[0], digest[1], session_id
    )
}

/// Reject part lists that are not numbered `1..=n` in order.
pub(crate) fn ensure_contiguous(parts: &[PartToken]) -> ProviderResult<()> {
    let in_order = parts
        .iter()
        .enumerate()
        .all(|(i, part)| part.part_number as usize == i + 1);
    if parts.is_empty() || !in_order {
        return Err(ProviderError::InvalidParts {
            expected: parts.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(n: i32) -> PartToken {
        PartToken {
            part_number: n,
            token: format!("t{n}"),
        }
    }

    #[test]
    fn object_keys_are_sharded_and_stable() {
        let id = Uuid::new_v4();
        let key = object_key_for(&id);
        assert!(key.starts_with("uploads/"));
        assert!(key.ends_with(&id.to_string()));
        assert_eq!(key.split('/').count(), 4);
        assert_eq!(key, object_key_for(&id));
    }

    #[test]
    fn parts_must_be_contiguous_from_one() {
        assert!(ensure_contiguous(&[part(1), part(2), part(3)]).is_ok());
        assert!(ensure_contiguous(&[part(2), part(1)]).is_err());
        assert!(ensure_contiguous(&[part(1), part(3)]).is_err());
        assert!(ensure_contiguous(&[]).is_err());
    }

    #[test]
    fn registry_reports_missing_adapter() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.get(ProviderKind::R2),
            Err(ProviderError::NotConfigured(ProviderKind::R2))
        ));
    }
}
