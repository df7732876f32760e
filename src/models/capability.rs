//! Capability descriptors handed to clients, and the per-part tokens the
//! backends need to assemble a multipart upload.

use serde::{Deserialize, Serialize};

/// HTTP verb a client must use against a capability URL.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Put,
    Post,
}

/// A time-limited authorization to upload one chunk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadCapability {
    /// 0-based chunk index this URL accepts.
    pub chunk_index: i64,

    pub url: String,

    pub method: HttpMethod,

    /// Bearer token to send as `Authorization`, for backends that do not
    /// embed the signature in the URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Shared by every part of one multipart upload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multipart_id: Option<String>,

    /// 1-based part number, present for multipart uploads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_number: Option<i32>,
}

/// A time-limited authorization to read one chunk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCapability {
    pub chunk_index: i64,
    pub url: String,
    pub method: HttpMethod,

    /// Inclusive byte range of this chunk within the assembled object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<ByteRange>,
}

/// Inclusive on both ends, as in an HTTP `Range: bytes=start-end` header.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: i64,
    pub end: i64,
}

/// Token the backend needs for one part at finalization time.
///
/// For S3-compatible backends this is the part's ETag; for B2 it is the
/// part's SHA-1 digest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartToken {
    /// 1-based.
    pub part_number: i32,
    pub token: String,
}

/// Part number for a 0-based chunk index.
pub fn part_number_for(index: i64) -> i32 {
    (index + 1) as i32
}
