//! Presence ("awareness") table for one shared document.
//!
//! Each participant publishes an opaque state (display name, cursor, colour)
//! tagged with a logical clock. The relay never looks inside the state; it
//! only compares clocks and tracks tombstones:
//!
//! ```text
//! incoming (id, clock, state)
//!       │
//!       ├── clock < stored clock ──────────► ignored
//!       │
//!       └── clock >= stored clock ─────────► stored (ties: last applied wins)
//!                 │
//!                 ├── none/tombstone → live      : added
//!                 ├── live → live                : updated
//!                 ├── live → tombstone           : removed
//!                 └── none/tombstone → tombstone : clock recorded, no change
//! ```
//!
//! Update encoding (lib0): `varint count`, then per entry
//! `varint id, varint clock, varstring state`. The state is JSON text and the
//! literal `null` marks a tombstone.

use std::collections::{HashMap, HashSet};

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::error::Result;

/// Participant identifier assigned by the client's replica engine.
pub type ParticipantId = u64;

const TOMBSTONE: &[u8] = b"null";

/// One row of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    /// Highest clock accepted for this participant.
    pub clock: u64,
    /// Opaque presence payload; `None` is a tombstone.
    pub state: Option<Vec<u8>>,
}

impl AwarenessEntry {
    pub fn is_live(&self) -> bool {
        self.state.is_some()
    }
}

/// Participant ids changed by one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ParticipantId>,
    pub updated: Vec<ParticipantId>,
    pub removed: Vec<ParticipantId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every changed id once, in added/updated/removed order.
    pub fn all(&self) -> Vec<ParticipantId> {
        let mut seen = HashSet::new();
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Last-writer-wins presence table keyed by participant id.
#[derive(Debug, Default)]
pub struct AwarenessTable {
    entries: HashMap<ParticipantId, AwarenessEntry>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an encoded awareness update.
    ///
    /// The whole update is decoded before anything is stored, so a malformed
    /// update leaves the table untouched.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<AwarenessChange> {
        let decoded = decode_update(update)?;
        let mut change = AwarenessChange::default();

        for (id, clock, state) in decoded {
            let previous_live = match self.entries.get(&id) {
                Some(prev) if clock < prev.clock => continue,
                Some(prev) => prev.is_live(),
                None => false,
            };

            match (&state, previous_live) {
                (Some(_), false) => change.added.push(id),
                (Some(_), true) => change.updated.push(id),
                (None, true) => change.removed.push(id),
                (None, false) => {}
            }
            self.entries.insert(id, AwarenessEntry { clock, state });
        }

        Ok(change)
    }

    /// Tombstone the given ids at their current clock.
    ///
    /// Ids that are unknown or already tombstoned are skipped. Peers accept
    /// an equal-clock tombstone for a live entry, so no clock bump is needed.
    pub fn remove_states(&mut self, ids: &[ParticipantId]) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                if entry.state.take().is_some() {
                    change.removed.push(*id);
                }
            }
        }
        change
    }

    /// Encode the current rows for `ids` as an awareness update.
    ///
    /// Ids the table has never seen are left out.
    pub fn encode_update(&self, ids: &[ParticipantId]) -> Vec<u8> {
        encode_entries(ids.iter().filter_map(|id| {
            self.entries
                .get(id)
                .map(|entry| (*id, entry.clock, entry.state.as_deref()))
        }))
    }

    /// Encode every live entry. Tombstones are not part of a snapshot.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut ids = self.live_ids();
        ids.sort_unstable();
        self.encode_update(&ids)
    }

    pub fn live_ids(&self) -> Vec<ParticipantId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn get(&self, id: ParticipantId) -> Option<&AwarenessEntry> {
        self.entries.get(&id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type DecodedEntry = (ParticipantId, u64, Option<Vec<u8>>);

/// Decode an awareness update into `(id, clock, state)` rows.
pub fn decode_update(update: &[u8]) -> Result<Vec<DecodedEntry>> {
    let mut cursor = Cursor::new(update);
    let count: u64 = cursor.read_var()?;
    let mut rows = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let id: u64 = cursor.read_var()?;
        let clock: u64 = cursor.read_var()?;
        let state = cursor.read_buf()?;
        let state = if state == TOMBSTONE {
            None
        } else {
            Some(state.to_vec())
        };
        rows.push((id, clock, state));
    }
    Ok(rows)
}

/// Encode rows into an awareness update. `None` becomes a tombstone.
pub fn encode_entries<'a>(
    rows: impl IntoIterator<Item = (ParticipantId, u64, Option<&'a [u8]>)>,
) -> Vec<u8> {
    let rows: Vec<_> = rows.into_iter().collect();
    let mut buf = Vec::new();
    buf.write_var(rows.len() as u64);
    for (id, clock, state) in rows {
        buf.write_var(id);
        buf.write_var(clock);
        buf.write_buf(state.unwrap_or(TOMBSTONE));
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(id: u64, clock: u64, json: &str) -> Vec<u8> {
        encode_entries([(id, clock, Some(json.as_bytes()))])
    }

    fn tombstone(id: u64, clock: u64) -> Vec<u8> {
        encode_entries([(id, clock, None)])
    }

    #[test]
    fn test_new_participant_is_added() {
        let mut table = AwarenessTable::new();
        let change = table.apply_update(&live(5, 1, r#"{"name":"Ann"}"#)).unwrap();

        assert_eq!(change.added, vec![5]);
        assert!(change.updated.is_empty());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(5).unwrap().clock, 1);
    }

    #[test]
    fn test_higher_clock_updates() {
        let mut table = AwarenessTable::new();
        table.apply_update(&live(5, 1, r#"{"x":1}"#)).unwrap();
        let change = table.apply_update(&live(5, 2, r#"{"x":2}"#)).unwrap();

        assert_eq!(change.updated, vec![5]);
        let entry = table.get(5).unwrap();
        assert_eq!(entry.clock, 2);
        assert_eq!(entry.state.as_deref(), Some(&br#"{"x":2}"#[..]));
    }

    #[test]
    fn test_lower_clock_is_ignored() {
        let mut table = AwarenessTable::new();
        table.apply_update(&live(5, 4, r#"{"x":4}"#)).unwrap();
        let change = table.apply_update(&live(5, 3, r#"{"x":3}"#)).unwrap();

        assert!(change.is_empty());
        assert_eq!(table.get(5).unwrap().clock, 4);
        assert_eq!(table.get(5).unwrap().state.as_deref(), Some(&br#"{"x":4}"#[..]));
    }

    #[test]
    fn test_equal_clock_last_applied_wins() {
        let mut table = AwarenessTable::new();
        table.apply_update(&live(5, 1, r#"{"by":"a"}"#)).unwrap();
        let change = table.apply_update(&live(5, 1, r#"{"by":"b"}"#)).unwrap();

        assert_eq!(change.updated, vec![5]);
        assert_eq!(table.get(5).unwrap().state.as_deref(), Some(&br#"{"by":"b"}"#[..]));
    }

    #[test]
    fn test_tombstone_at_equal_clock_removes() {
        let mut table = AwarenessTable::new();
        table.apply_update(&live(5, 3, "{}")).unwrap();
        let change = table.apply_update(&tombstone(5, 3)).unwrap();

        assert_eq!(change.removed, vec![5]);
        assert!(table.is_empty());
        assert_eq!(table.get(5).unwrap().clock, 3);
    }

    #[test]
    fn test_stale_state_cannot_resurrect_tombstone() {
        let mut table = AwarenessTable::new();
        table.apply_update(&live(5, 3, "{}")).unwrap();
        table.apply_update(&tombstone(5, 4)).unwrap();
        let change = table.apply_update(&live(5, 3, "{}")).unwrap();

        assert!(change.is_empty());
        assert!(!table.get(5).unwrap().is_live());
    }

    #[test]
    fn test_tombstone_for_unknown_id_records_clock_only() {
        let mut table = AwarenessTable::new();
        let change = table.apply_update(&tombstone(9, 2)).unwrap();
        assert!(change.is_empty());
        assert_eq!(table.get(9).unwrap().clock, 2);

        // a newer live state is then reported as added
        let change = table.apply_update(&live(9, 3, "{}")).unwrap();
        assert_eq!(change.added, vec![9]);
    }

    #[test]
    fn test_batch_reports_each_kind() {
        let mut table = AwarenessTable::new();
        table
            .apply_update(&encode_entries([
                (1, 1, Some(&b"{}"[..])),
                (2, 1, Some(&b"{}"[..])),
            ]))
            .unwrap();

        let change = table
            .apply_update(&encode_entries([
                (1, 2, Some(&b"{}"[..])),
                (2, 2, None),
                (3, 1, Some(&b"{}"[..])),
            ]))
            .unwrap();

        assert_eq!(change.added, vec![3]);
        assert_eq!(change.updated, vec![1]);
        assert_eq!(change.removed, vec![2]);
        assert_eq!(change.all(), vec![3, 1, 2]);
    }

    #[test]
    fn test_remove_states() {
        let mut table = AwarenessTable::new();
        table.apply_update(&live(1, 7, "{}")).unwrap();
        table.apply_update(&live(2, 1, "{}")).unwrap();

        let change = table.remove_states(&[1, 99]);
        assert_eq!(change.removed, vec![1]);
        assert_eq!(table.live_ids(), vec![2]);

        // removing twice reports nothing
        assert!(table.remove_states(&[1]).is_empty());

        // the removal is encoded as a tombstone at the stored clock
        let rows = decode_update(&table.encode_update(&[1])).unwrap();
        assert_eq!(rows, vec![(1, 7, None)]);
    }

    #[test]
    fn test_snapshot_skips_tombstones() {
        let mut table = AwarenessTable::new();
        table.apply_update(&live(1, 1, r#"{"a":1}"#)).unwrap();
        table.apply_update(&live(2, 1, r#"{"b":2}"#)).unwrap();
        table.remove_states(&[2]);

        let rows = decode_update(&table.snapshot()).unwrap();
        assert_eq!(rows, vec![(1, 1, Some(br#"{"a":1}"#.to_vec()))]);
    }

    #[test]
    fn test_empty_snapshot() {
        let table = AwarenessTable::new();
        assert_eq!(table.snapshot(), vec![0]);
    }

    #[test]
    fn test_malformed_update_leaves_table_untouched() {
        let mut table = AwarenessTable::new();
        let mut update = encode_entries([(1, 1, Some(&b"{}"[..])), (2, 1, Some(&b"{}"[..]))]);
        update.truncate(update.len() - 1);

        assert!(table.apply_update(&update).is_err());
        assert!(table.get(1).is_none());
    }
}
