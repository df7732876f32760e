//! In-process adapter for tests: issues deterministic URLs, records every
//! backend-side effect, and can be told to fail finalization.

use crate::models::{
    capability::{DownloadCapability, HttpMethod, PartToken, UploadCapability, part_number_for},
    session::ProviderKind,
};
use crate::providers::{ProviderError, ProviderResult, StorageProvider, ensure_contiguous};
use async_trait::async_trait;
use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Finalized {
    pub key: String,
    pub multipart_id: String,
    pub parts: Vec<PartToken>,
}

pub struct FakeProvider {
    kind: ProviderKind,
    multipart_opened: AtomicUsize,
    fail_finalize: AtomicBool,
    finalized: Mutex<Vec<Finalized>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            multipart_opened: AtomicUsize::new(0),
            fail_finalize: AtomicBool::new(false),
            finalized: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_finalize(&self, fail: bool) {
        self.fail_finalize.store(fail, Ordering::SeqCst);
    }

    pub fn multipart_opened(&self) -> usize {
        self.multipart_opened.load(Ordering::SeqCst)
    }

    pub fn finalized(&self) -> Vec<Finalized> {
        self.finalized.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn method(&self) -> HttpMethod {
        match self.kind {
            ProviderKind::B2 => HttpMethod::Post,
            ProviderKind::R2 => HttpMethod::Put,
        }
    }

    fn capability(&self, key: &str, multipart_id: Option<&str>, index: i64) -> UploadCapability {
        UploadCapability {
            chunk_index: index,
            url: format!("https://{}.test/{key}/{index}", self.kind.as_str().to_lowercase()),
            method: self.method(),
            auth_token: (self.kind == ProviderKind::B2).then(|| format!("token-{index}")),
            multipart_id: multipart_id.map(str::to_string),
            part_number: multipart_id.map(|_| part_number_for(index)),
        }
    }
}

#[async_trait]
impl StorageProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn issue_put_capabilities(
        &self,
        key: &str,
        chunk_count: i64,
    ) -> ProviderResult<Vec<UploadCapability>> {
        if chunk_count <= 1 {
            return Ok(vec![self.capability(key, None, 0)]);
        }
        let n = self.multipart_opened.fetch_add(1, Ordering::SeqCst);
        let multipart_id = format!("mp-{n}");
        Ok((0..chunk_count)
            .map(|index| self.capability(key, Some(&multipart_id), index))
            .collect())
    }

    async fn reissue_put_capability(
        &self,
        key: &str,
        chunk_count: i64,
        multipart_id: Option<&str>,
        index: i64,
    ) -> ProviderResult<UploadCapability> {
        if chunk_count <= 1 {
            return Ok(self.capability(key, None, 0));
        }
        let multipart_id = multipart_id.ok_or(ProviderError::MissingMultipartId { index })?;
        Ok(self.capability(key, Some(multipart_id), index))
    }

    async fn issue_get_capabilities(
        &self,
        key: &str,
        chunk_count: i64,
    ) -> ProviderResult<Vec<DownloadCapability>> {
        Ok((0..chunk_count)
            .map(|index| DownloadCapability {
                chunk_index: index,
                url: format!("https://{}.test/{key}", self.kind.as_str().to_lowercase()),
                method: HttpMethod::Get,
                range: None,
            })
            .collect())
    }

    async fn finalize_multipart(
        &self,
        key: &str,
        multipart_id: &str,
        parts: &[PartToken],
    ) -> ProviderResult<()> {
        ensure_contiguous(parts)?;
        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(ProviderError::Request {
                provider: self.kind,
                operation: "finalize",
                message: "injected failure".into(),
            });
        }
        self.finalized.lock().unwrap().push(Finalized {
            key: key.to_string(),
            multipart_id: multipart_id.to_string(),
            parts: parts.to_vec(),
        });
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> ProviderResult<()> {
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }
}
