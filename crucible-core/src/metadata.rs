use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-(tenant, filename, hash) metadata of a stored file.
///
/// `remaining_downloads == None` means unlimited; `expires_at == None`
/// means the file never expires by time. Both fields only ever get
/// stricter: the download counter is monotonically non-increasing and a
/// merge never extends an expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Byte length of the blob.
    pub size: u64,

    /// When this entry was first registered.
    pub created_at: DateTime<Utc>,

    /// Downloads left, or `None` for unlimited.
    pub remaining_downloads: Option<u64>,

    /// Instant after which reads fail, or `None` for never.
    pub expires_at: Option<DateTime<Utc>>,
}

impl FileMetadata {
    #[must_use]
    pub fn new(
        size: u64,
        created_at: DateTime<Utc>,
        remaining_downloads: Option<u64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            size,
            created_at,
            remaining_downloads,
            expires_at,
        }
    }

    /// Whether the time-based expiry has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Whether the download quota is used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining_downloads == Some(0)
    }

    /// A file is live when it is neither expired nor exhausted. Only live
    /// entries are served; dead ones are eligible for reclamation.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_exhausted()
    }

    /// Merge a re-registration of the same identity, keeping the stricter
    /// policy: the smaller remaining-download count and the earlier expiry.
    /// `size` and `created_at` of the original registration are kept.
    pub fn merge_stricter(&mut self, other: &FileMetadata) {
        self.remaining_downloads = match (self.remaining_downloads, other.remaining_downloads) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        self.expires_at = match (self.expires_at, other.expires_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
    }

    /// Consume one download. Saturates at zero; unlimited stays unlimited.
    pub fn decrement(&mut self) {
        if let Some(n) = self.remaining_downloads {
            self.remaining_downloads = Some(n.saturating_sub(1));
        }
    }
}
