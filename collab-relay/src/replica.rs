//! Replica engine seam.
//!
//! The relay never interprets document content. It hands opaque update blobs
//! to a [`ReplicaEngine`], which owns convergence (commutative, associative
//! and idempotent merge) and state-vector diffing. [`YrsReplica`] is the
//! production engine, backed by a `yrs::Doc`.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, Update};

use crate::error::{RelayError, Result};
use crate::payload;

/// lib0 v1 encoding of an update that carries no structs and no deletions.
pub const EMPTY_UPDATE_V1: &[u8] = &[0, 0];

/// Opaque CRDT merge primitive consumed by a shared document.
pub trait ReplicaEngine: Send + Sync {
    /// Merge an encoded update.
    ///
    /// Returns the encoded change that was actually integrated, or `None`
    /// when the update added nothing (duplicate, or still waiting on missing
    /// dependencies).
    fn apply_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Encoded state vector: highest clock held per actor.
    fn state_summary(&self) -> Vec<u8>;

    /// Everything the holder of `remote_summary` is missing.
    fn diff(&self, remote_summary: &[u8]) -> Result<Vec<u8>>;
}

/// [`ReplicaEngine`] backed by a `yrs` document.
pub struct YrsReplica {
    doc: Doc,
}

impl YrsReplica {
    /// Create an empty replica. `gc` controls garbage collection of deleted
    /// content.
    pub fn new(gc: bool) -> Self {
        let options = Options {
            skip_gc: !gc,
            ..Options::default()
        };
        Self {
            doc: Doc::with_options(options),
        }
    }

    /// Underlying document, for inspection in tests and tooling.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ReplicaEngine for YrsReplica {
    fn apply_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>> {
        payload::check_update_v1(update)?;
        let update = Update::decode_v1(update)?;

        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| RelayError::Replica(e.to_string()))?;
        let integrated = txn.encode_update_v1();

        if integrated == EMPTY_UPDATE_V1 {
            Ok(None)
        } else {
            Ok(Some(integrated))
        }
    }

    fn state_summary(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff(&self, remote_summary: &[u8]) -> Result<Vec<u8>> {
        payload::check_state_vector(remote_summary)?;
        let remote = StateVector::decode_v1(remote_summary)?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }
}
