//! The total refresh protocol.
//!
//! Walks every local entry in the agreement scope through the outbound
//! mapper (create-or-converge), then pulls the entire remote subtree with
//! a null DirSync cookie so the next incremental pass starts from a fresh
//! baseline. No state machine: the refresh runs once and terminates,
//! checking for shutdown between entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};

use crate::agreement::Agreement;
use crate::connection::{ConnResult, ConnectionControl, RemoteDirectory};
use crate::events::EventSet;
use crate::inbound;
use crate::outbound;
use crate::protocol::{ProtocolHandle, SyncProtocol};
use crate::store::DirectoryStore;

pub struct WindowsTotProtocol<S, C> {
    agmt: Arc<Agreement>,
    store: Arc<S>,
    conn: C,
    events: Arc<EventSet>,
    terminate: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl<S, C> WindowsTotProtocol<S, C>
where
    S: DirectoryStore,
    C: RemoteDirectory + ConnectionControl,
{
    pub fn new(agmt: Arc<Agreement>, store: Arc<S>, conn: C) -> WindowsTotProtocol<S, C> {
        WindowsTotProtocol {
            agmt,
            store,
            conn,
            events: Arc::new(EventSet::new()),
            terminate: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn terminated(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    async fn run_total_update(&mut self) {
        let name = self.agmt.long_name();
        if self.terminated() {
            return;
        }

        self.conn.cancel_linger().await;
        if self.conn.connect().await != ConnResult::Success {
            error!("{}: total update failed to connect to the consumer", name);
            self.agmt.set_last_update_status(0, -1, "Total update aborted");
            return;
        }
        self.conn.cancel_linger().await;

        info!("{}: beginning total update of the remote replica", name);
        self.agmt.set_update_in_progress(true);
        self.agmt.set_last_update_status(0, 0, "Total update in progress");

        // A null cookie makes the closing pull a full one.
        self.agmt.clear_cookie();

        let entries = match self.store.entries_in_subtree(&self.agmt.local_subtree()).await {
            Ok(entries) => entries,
            Err(err) => {
                error!("{}: total update failed to enumerate local entries: {}", name, err);
                self.agmt.set_update_in_progress(false);
                self.agmt.set_last_update_status(0, -1, "Total update aborted");
                return;
            }
        };

        let mut aborted = false;
        for entry in &entries {
            if self.terminated() {
                aborted = true;
                break;
            }
            let res = outbound::process_total_entry(&self.agmt, &mut self.conn, entry).await;
            match res {
                ConnResult::Success | ConnResult::OperationFailed => {}
                _ => {
                    // Transport trouble; the refresh cannot make progress.
                    error!(
                        "{}: total update aborted while sending \"{}\": {:?}",
                        name,
                        entry.dn(),
                        res
                    );
                    aborted = true;
                    break;
                }
            }
        }

        if !aborted && !self.terminated() {
            if inbound::dirsync_run(&self.agmt, &mut self.conn, &*self.store).await {
                if let Some(cookie) = self.agmt.cookie() {
                    if let Err(err) = self.store.save_cookie(&name, &cookie).await {
                        error!("{}: failed to save the dirsync cookie: {}", name, err);
                    }
                }
            } else {
                warn!("{}: total update completed but the closing pull failed", name);
            }
        }

        self.agmt.set_update_in_progress(false);
        if aborted {
            self.agmt.set_last_update_status(0, -1, "Total update aborted");
        } else {
            info!("{}: finished total update of the remote replica", name);
            self.agmt.set_last_update_status(0, 0, "Total update succeeded");
        }
        self.conn.start_linger().await;
    }
}

#[async_trait]
impl<S, C> SyncProtocol for WindowsTotProtocol<S, C>
where
    S: DirectoryStore,
    C: RemoteDirectory + ConnectionControl,
{
    async fn run(&mut self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.run_total_update().await;
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn handle(&self) -> ProtocolHandle {
        ProtocolHandle::new(self.events.clone(), self.terminate.clone(), self.stopped.clone())
    }
}
