//! Contract with the local storage engine.
//!
//! The engine never touches the backend directly; everything it needs from
//! the local server (internal operations, changelog cursors, RUV and CSN
//! generator state, persisted agreement state) goes through this trait.
//! Integration tests drive the engine against an in-memory implementation.

use async_trait::async_trait;

use crate::changelog::ChangelogIter;
use crate::entry::{AttrMod, SyncEntry};
use crate::error::SyncError;
use crate::ruv::{Csn, Ruv};

/// Result of a subtree search expected to match at most one entry.
#[derive(Debug)]
pub enum FindOutcome {
    Found(SyncEntry),
    NotFound,
    NotUnique,
}

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Fetch a live entry by its unique id, searching `subtree` only.
    async fn entry_by_uniqueid(
        &self,
        subtree: &str,
        uniqueid: &str,
    ) -> Result<Option<SyncEntry>, SyncError>;

    /// Fetch a tombstone by unique id. Split out from the live lookup
    /// because tombstone searches get expensive as tombstones accumulate.
    async fn tombstone_by_uniqueid(
        &self,
        subtree: &str,
        uniqueid: &str,
    ) -> Result<Option<SyncEntry>, SyncError>;

    async fn entry_by_dn(&self, dn: &str) -> Result<Option<SyncEntry>, SyncError>;

    /// Search `subtree` for `(attr=value)`.
    async fn find_by_attr(
        &self,
        subtree: &str,
        attr: &str,
        value: &str,
    ) -> Result<FindOutcome, SyncError>;

    /// All live entries under `subtree`, for a total refresh pass.
    async fn entries_in_subtree(&self, subtree: &str) -> Result<Vec<SyncEntry>, SyncError>;

    async fn add_entry(&self, entry: SyncEntry) -> Result<(), SyncError>;
    async fn modify_entry(&self, dn: &str, mods: &[AttrMod]) -> Result<(), SyncError>;
    async fn delete_entry(&self, dn: &str) -> Result<(), SyncError>;
    async fn rename_entry(
        &self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<(), SyncError>;

    /// Open a changelog cursor bounded by what the consumer already has.
    async fn replay_iterator(
        &self,
        consumer_ruv: &Ruv,
    ) -> Result<Box<dyn ChangelogIter>, SyncError>;

    /// The local (supplier) RUV.
    async fn local_ruv(&self) -> Result<Ruv, SyncError>;

    /// A fresh CSN for the replicated area; `None` means the CSN generator
    /// is not available, which is fatal for the session.
    async fn current_csn(&self, replica_area: &str) -> Result<Option<Csn>, SyncError>;

    /// Feed the consumer's RUV into the local CSN generator so generated
    /// CSNs stay ahead of both replicas. Fails with
    /// [`SyncError::CsnTimeSkew`] when the clocks are too far apart.
    async fn update_csngen_state(&self, consumer_ruv: &Ruv) -> Result<(), SyncError>;

    /// Consumer RUV persisted per agreement.
    async fn load_consumer_ruv(&self, agmt: &str) -> Result<Option<Ruv>, SyncError>;
    async fn save_consumer_ruv(&self, agmt: &str, ruv: &Ruv) -> Result<(), SyncError>;

    /// DirSync cookie persisted per agreement.
    async fn load_cookie(&self, agmt: &str) -> Result<Option<Vec<u8>>, SyncError>;
    async fn save_cookie(&self, agmt: &str, cookie: &[u8]) -> Result<(), SyncError>;
}
