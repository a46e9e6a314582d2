//! In-sync replicas
//!
//! A data replica is in sync at timestamp T when a read from it at T
//! observes every write committed up to T.

use crate::card::CardSnapshot;
use crate::replica::{TableReplica, WriteMode};
use crate::types::{Key, ReplicaId, RowKey, Timestamp};

fn progress_covers(replica: &TableReplica, keys: Option<&[RowKey]>, timestamp: Timestamp) -> bool {
    let progress = replica.replication_progress();
    match keys {
        Some(keys) => keys.iter().all(|key| {
            progress
                .timestamp_at(&Key::Row(key.clone()))
                .map_or(false, |ts| ts >= timestamp)
        }),
        None => progress.min_timestamp() >= timestamp,
    }
}

/// Direct replica that has pulled every write preceding its first direct one
fn is_caught_up_direct(replica: &TableReplica) -> bool {
    replica.effective_write_mode() == WriteMode::Direct
        && replica
            .direct_since()
            .map_or(false, |since| replica.replication_progress().min_timestamp() >= since.prev())
}

/// Whether `replica` can serve a read at `timestamp`
pub fn is_in_sync(replica: &TableReplica, keys: Option<&[RowKey]>, timestamp: Timestamp) -> bool {
    replica.is_data()
        && replica.is_enabled()
        && (progress_covers(replica, keys, timestamp) || is_caught_up_direct(replica))
}

/// Data replicas that can serve a read of `keys` (or all rows) at `timestamp`
pub fn get_in_sync_replicas(
    card: &CardSnapshot,
    keys: Option<&[RowKey]>,
    timestamp: Timestamp,
) -> Vec<ReplicaId> {
    card.replicas
        .values()
        .filter(|r| is_in_sync(r, keys, timestamp))
        .map(|r| r.replica_id())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{CardOptions, ReplicationCard};
    use crate::progress::ReplicationProgress;
    use crate::replica::{ContentType, ReplicaAttributes, ReplicaMode};
    use crate::types::{CardId, INITIAL_ERA};

    fn add_replica(
        card: &mut ReplicationCard,
        path: &str,
        content_type: ContentType,
        enabled: bool,
        progress: Timestamp,
    ) -> ReplicaId {
        let replica_id = card.generate_replica_id();
        let attributes = ReplicaAttributes::new("primary", path, content_type, ReplicaMode::Async, enabled);
        let mut replica = TableReplica::create(
            replica_id,
            attributes,
            INITIAL_ERA,
            ReplicationProgress::uniform(progress),
            Timestamp(1),
        )
        .unwrap();
        replica.commence_era(1, Timestamp(2));
        card.insert_replica(replica);
        replica_id
    }

    #[test]
    fn test_progress_decides_membership() {
        let mut card = ReplicationCard::new(CardId::generate(), None, CardOptions::default());
        let a = add_replica(&mut card, "//a", ContentType::Data, true, Timestamp(50));
        let b = add_replica(&mut card, "//b", ContentType::Data, true, Timestamp(80));
        add_replica(&mut card, "//q", ContentType::Queue, true, Timestamp(80));
        add_replica(&mut card, "//off", ContentType::Data, false, Timestamp(80));

        let card = card.snapshot();
        assert_eq!(get_in_sync_replicas(&card, None, Timestamp(50)), vec![a, b]);
        assert_eq!(get_in_sync_replicas(&card, None, Timestamp(60)), vec![b]);
        assert_eq!(
            get_in_sync_replicas(&card, Some(&[RowKey::int(3)]), Timestamp(80)),
            vec![b]
        );
        assert!(get_in_sync_replicas(&card, None, Timestamp(90)).is_empty());
    }
}
