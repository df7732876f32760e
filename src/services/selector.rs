//! Placement decisions: which backend receives a new upload, and when a
//! popular object should be flagged for relocation.

use crate::models::session::ProviderKind;

/// Backend for a new upload of `declared_size` bytes.
///
/// Sizes at or below `large_file_threshold` go to B2 (the low-cost default);
/// anything larger goes to R2, whose multipart ceiling suits large objects.
pub fn select_provider(declared_size: i64, large_file_threshold: i64) -> ProviderKind {
    if declared_size <= large_file_threshold {
        ProviderKind::B2
    } else {
        ProviderKind::R2
    }
}

/// When a download should flag its session for relocation.
///
/// A session on `source` is flagged once its post-increment download count
/// reaches `popularity_threshold`. The repository evaluates this inside the
/// same atomic update that counts the download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationPolicy {
    /// Only sessions on this backend are ever flagged.
    pub source: ProviderKind,
    /// Where the external job relocates flagged objects.
    pub target: ProviderKind,
    /// Post-increment download count that triggers the flag.
    pub popularity_threshold: i64,
}

impl MigrationPolicy {
    pub fn new(popularity_threshold: i64) -> Self {
        Self {
            source: ProviderKind::B2,
            target: ProviderKind::R2,
            popularity_threshold,
        }
    }
}
