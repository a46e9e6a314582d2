//! Cell snapshot file
//!
//! The snapshot file holds a manifest line followed by the serialized
//! cell state. Saving writes a temporary file, fsyncs it and renames it
//! over the previous snapshot, so readers see either the old or the new
//! snapshot, never a mix.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::manifest::SnapshotManifest;
use crate::card::ReplicationCard;
use crate::coordinator::CoordinatorState;
use crate::errors::{ChaosError, ChaosResult};
use crate::manager::TableNode;
use crate::observability::{log_event_with_fields, Event};
use crate::types::CellId;

const SNAPSHOT_FILE: &str = "cell.snapshot";
const SNAPSHOT_TEMP_FILE: &str = "cell.snapshot.tmp";

/// Everything a chaos cell needs to resume after restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub cell_id: CellId,
    pub cards: Vec<ReplicationCard>,
    pub coordinators: CoordinatorState,
    #[serde(default)]
    pub table_nodes: Vec<TableNode>,
}

pub fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SNAPSHOT_FILE)
}

fn fsync_dir(path: &Path) -> ChaosResult<()> {
    let dir = OpenOptions::new().read(true).open(path)?;
    dir.sync_all()?;
    Ok(())
}

/// Atomically replace the snapshot in `data_dir`
pub fn save_snapshot(data_dir: &Path, snapshot: &CellSnapshot) -> ChaosResult<SnapshotManifest> {
    fs::create_dir_all(data_dir)?;
    let payload = serde_json::to_vec(snapshot)?;
    let manifest = SnapshotManifest::for_payload(snapshot.cell_id, snapshot.cards.len(), &payload);

    let temp_path = data_dir.join(SNAPSHOT_TEMP_FILE);
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(manifest.to_json()?.as_bytes())?;
        file.write_all(b"\n")?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, snapshot_path(data_dir))?;
    fsync_dir(data_dir)?;

    log_event_with_fields(
        Event::SnapshotSaved,
        &[
            ("cell_id", &snapshot.cell_id.to_string()),
            ("cards", &snapshot.cards.len().to_string()),
            ("checksum", &manifest.checksum),
        ],
    );
    Ok(manifest)
}

/// Load and verify the snapshot in `data_dir`; `None` if there is none
pub fn load_snapshot(data_dir: &Path) -> ChaosResult<Option<(SnapshotManifest, CellSnapshot)>> {
    let path = snapshot_path(data_dir);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    match decode(&bytes) {
        Ok((manifest, snapshot)) => {
            log_event_with_fields(
                Event::SnapshotLoaded,
                &[
                    ("cell_id", &snapshot.cell_id.to_string()),
                    ("cards", &snapshot.cards.len().to_string()),
                    ("created_at", &manifest.created_at.to_rfc3339()),
                ],
            );
            Ok(Some((manifest, snapshot)))
        }
        Err(err) => {
            log_event_with_fields(
                Event::SnapshotCorrupted,
                &[
                    ("path", &path.display().to_string()),
                    ("error", &err.to_string()),
                ],
            );
            Err(err)
        }
    }
}

fn decode(bytes: &[u8]) -> ChaosResult<(SnapshotManifest, CellSnapshot)> {
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| ChaosError::SnapshotCorrupted("missing manifest line".into()))?;
    let (header, payload) = (&bytes[..split], &bytes[split + 1..]);

    let header = std::str::from_utf8(header)
        .map_err(|e| ChaosError::SnapshotCorrupted(format!("manifest is not UTF-8: {}", e)))?;
    let manifest = SnapshotManifest::from_json(header)?;
    manifest.verify(payload)?;

    let snapshot: CellSnapshot = serde_json::from_slice(payload)
        .map_err(|e| ChaosError::SnapshotCorrupted(format!("failed to parse cell state: {}", e)))?;
    if snapshot.cell_id != manifest.cell_id {
        return Err(ChaosError::SnapshotCorrupted(format!(
            "snapshot belongs to cell {} but manifest names {}",
            snapshot.cell_id, manifest.cell_id
        )));
    }
    Ok((manifest, snapshot))
}
