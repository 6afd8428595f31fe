//! Bi-directional synchronization between a local LDAP directory and an
//! Active-Directory-like peer.
//!
//! The engine is organized around one [`Agreement`](agreement::Agreement)
//! per synchronized subtree pair. An agreement owns a pooled
//! [`connection`] to the peer, and its
//! [driver](protocol::WindowsIncProtocol) runs the incremental protocol:
//! acquire the consumer, replay local changelog operations
//! ([`outbound`]), pull remote deltas with the DirSync control
//! ([`inbound`]), release, and sleep until something happens. Schema and
//! naming differences between the two sides are translated by the
//! [`mapper`].
//!
//! The local storage engine and changelog are external; the engine talks
//! to them through the [`store::DirectoryStore`] and
//! [`changelog::ChangelogIter`] traits. The LDAP wire protocol comes from
//! the `ldap3` client crate.

pub mod agreement;
pub mod backoff;
pub mod changelog;
pub mod connection;
pub mod controls;
pub mod dn;
pub mod entry;
pub mod error;
pub mod events;
pub mod inbound;
pub mod mapper;
pub mod outbound;
pub mod protocol;
pub mod ruv;
pub mod store;
pub mod total;

pub use agreement::{Agreement, AgreementConfig, BindMethod, MoveAction, Schedule, SyncFlavor};
pub use connection::{
    Capability, ConnResult, ConnectionControl, RemoteDirectory, WindowsConnection,
};
pub use entry::{AttrMod, ModOp, SyncEntry};
pub use error::SyncError;
pub use protocol::{ProtocolHandle, SyncProtocol, WindowsIncProtocol};
pub use ruv::{Csn, Ruv};
pub use store::DirectoryStore;
pub use total::WindowsTotProtocol;
