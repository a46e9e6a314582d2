//! Snapshot manifest
//!
//! First line of every snapshot file:
//! ```json
//! {"format_version":1,"created_at":"2026-10-19T11:30:00Z","cell_id":"...","card_count":3,"checksum":"crc32:deadbeef"}
//! ```
//! `checksum` covers the state bytes that follow the manifest line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checksum::{compute_checksum, format_checksum, parse_checksum};
use crate::errors::{ChaosError, ChaosResult};
use crate::types::CellId;

/// Current snapshot format
pub const SNAPSHOT_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotManifest {
    pub format_version: u8,
    pub created_at: DateTime<Utc>,
    pub cell_id: CellId,
    pub card_count: usize,
    /// CRC32 of the state payload (format: "crc32:XXXXXXXX")
    pub checksum: String,
}

impl SnapshotManifest {
    /// Manifest describing `payload`
    pub fn for_payload(cell_id: CellId, card_count: usize, payload: &[u8]) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            created_at: Utc::now(),
            cell_id,
            card_count,
            checksum: format_checksum(compute_checksum(payload)),
        }
    }

    /// Check format version and payload checksum
    pub fn verify(&self, payload: &[u8]) -> ChaosResult<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(ChaosError::SnapshotCorrupted(format!(
                "unsupported snapshot format version {}",
                self.format_version
            )));
        }
        let expected = parse_checksum(&self.checksum).ok_or_else(|| {
            ChaosError::SnapshotCorrupted(format!("malformed checksum {}", self.checksum))
        })?;
        let actual = compute_checksum(payload);
        if expected != actual {
            return Err(ChaosError::SnapshotCorrupted(format!(
                "snapshot checksum mismatch (expected: {}, actual: {})",
                self.checksum,
                format_checksum(actual)
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> ChaosResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> ChaosResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| ChaosError::SnapshotCorrupted(format!("failed to parse manifest: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_payload() {
        let manifest = SnapshotManifest::for_payload(CellId::generate(), 2, b"{\"cards\":[]}");
        assert_eq!(manifest.format_version, SNAPSHOT_FORMAT_VERSION);
        assert!(manifest.checksum.starts_with("crc32:"));
        assert!(manifest.verify(b"{\"cards\":[]}").is_ok());

        let err = manifest.verify(b"{\"cards\":[1]}").unwrap_err();
        assert!(err.to_string().contains("snapshot checksum mismatch"));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut manifest = SnapshotManifest::for_payload(CellId::generate(), 0, b"");
        manifest.format_version = 9;
        assert!(matches!(
            manifest.verify(b""),
            Err(ChaosError::SnapshotCorrupted(_))
        ));
    }

    #[test]
    fn test_json_is_single_line() {
        let manifest = SnapshotManifest::for_payload(CellId::generate(), 1, b"x");
        let json = manifest.to_json().unwrap();
        assert!(!json.contains('\n'));
        assert_eq!(SnapshotManifest::from_json(&json).unwrap(), manifest);
    }
}
