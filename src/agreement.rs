//! Synchronization agreements and their runtime state.
//!
//! An [`Agreement`] pairs one local subtree with one remote subtree, plus
//! everything needed to reach and authenticate to the peer. The engine
//! treats the configuration as immutable except for a "changed" flag: an
//! operator update raises the flag, and the connection re-reads bind
//! parameters at its next transition.
//!
//! The private half holds what must survive between sessions: the DirSync
//! cookie, the cached raw remote entry consulted during mod pruning, the
//! discovered peer flavor, and user-visible status.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ldap3::controls::{Control, ControlParser, RawControl};
use log::debug;
use url::Url;

use crate::controls::{DirSync, DIRSYNC_OID};
use crate::entry::SyncEntry;
use crate::error::SyncError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindMethod {
    Simple,
    /// TLS client authentication; binds with SASL EXTERNAL.
    SslClientAuth,
    Gssapi,
    DigestMd5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Tls,
    StartTls,
}

/// Remote peer flavor as configured; the connection refines NT4/Win2k3
/// detection from the root DSE at session start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncFlavor {
    ActiveDirectory,
    Win2k3,
    Nt4,
}

/// What to do with a local entry whose remote peer moved out of the
/// agreement scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveAction {
    Delete,
    Unsync,
    Ignore,
}

/// Replication schedule. `Window` is minutes since midnight UTC with a
/// day-of-week mask (bit 0 = Sunday); a window may wrap midnight.
#[derive(Clone, Copy, Debug)]
pub enum Schedule {
    Always,
    Window { open: u16, close: u16, days: u8 },
}

impl Schedule {
    pub fn in_window_now(&self) -> bool {
        self.in_window_at(SystemTime::now())
    }

    pub fn in_window_at(&self, at: SystemTime) -> bool {
        match *self {
            Schedule::Always => true,
            Schedule::Window { open, close, days } => {
                let secs = match at.duration_since(UNIX_EPOCH) {
                    Ok(d) => d.as_secs(),
                    Err(_) => return false,
                };
                // The epoch fell on a Thursday.
                let weekday = ((secs / 86_400 + 4) % 7) as u8;
                if days != 0 && days & (1 << weekday) == 0 {
                    return false;
                }
                let minute = ((secs % 86_400) / 60) as u16;
                if open <= close {
                    minute >= open && minute < close
                } else {
                    minute >= open || minute < close
                }
            }
        }
    }
}

/// Closure used to recover the plaintext bind credential from its stored
/// (reversibly encrypted) form. Decryption failure fails the bind closed.
pub type CredentialDecryptor =
    dyn Fn(&[u8]) -> Result<String, SyncError> + Send + Sync + 'static;

pub struct AgreementConfig {
    pub long_name: String,
    pub url: Url,
    pub starttls: bool,
    pub bind_dn: String,
    pub bind_method: BindMethod,
    /// Stored (encrypted) credential bytes.
    pub credentials: Vec<u8>,
    pub local_subtree: String,
    pub remote_subtree: String,
    pub windows_domain: String,
    pub flavor: SyncFlavor,
    pub timeout: Duration,
    pub schedule: Schedule,
    /// Seconds to pause after a productive session, letting other
    /// suppliers acquire the consumer. Zero disables the pause.
    pub pausetime: i64,
    /// Seconds to wait when the consumer reports busy.
    pub busywaittime: i64,
    pub sync_new_users: bool,
    pub sync_new_groups: bool,
    pub move_action: MoveAction,
}

#[derive(Clone, Debug, Default)]
pub struct UpdateStatus {
    pub ldap_rc: u32,
    pub acquire_code: i32,
    pub message: String,
}

#[derive(Default)]
struct AgreementPrivate {
    cookie: Option<Vec<u8>>,
    dirsync_has_more: bool,
    raw_entry: Option<SyncEntry>,
    is_nt4: bool,
    is_win2k3: bool,
    status: UpdateStatus,
}

pub struct Agreement {
    config: Mutex<AgreementConfig>,
    decryptor: Box<CredentialDecryptor>,
    changed: AtomicBool,
    update_in_progress: AtomicBool,
    changes_sent: AtomicU64,
    changes_skipped: AtomicU64,
    private: Mutex<AgreementPrivate>,
}

impl Agreement {
    pub fn new(config: AgreementConfig, decryptor: Box<CredentialDecryptor>) -> Agreement {
        let mut private = AgreementPrivate::default();
        match config.flavor {
            SyncFlavor::Nt4 => private.is_nt4 = true,
            SyncFlavor::Win2k3 => private.is_win2k3 = true,
            SyncFlavor::ActiveDirectory => {}
        }
        Agreement {
            config: Mutex::new(config),
            decryptor,
            changed: AtomicBool::new(false),
            update_in_progress: AtomicBool::new(false),
            changes_sent: AtomicU64::new(0),
            changes_skipped: AtomicU64::new(0),
            private: Mutex::new(private),
        }
    }

    fn config(&self) -> std::sync::MutexGuard<'_, AgreementConfig> {
        self.config.lock().expect("agreement config lock")
    }

    fn private(&self) -> std::sync::MutexGuard<'_, AgreementPrivate> {
        self.private.lock().expect("agreement private lock")
    }

    pub fn long_name(&self) -> String {
        self.config().long_name.clone()
    }

    pub fn url(&self) -> Url {
        self.config().url.clone()
    }

    pub fn transport(&self) -> Transport {
        let cfg = self.config();
        if cfg.url.scheme() == "ldaps" {
            Transport::Tls
        } else if cfg.starttls {
            Transport::StartTls
        } else {
            Transport::Plain
        }
    }

    pub fn bind_dn(&self) -> String {
        self.config().bind_dn.clone()
    }

    pub fn bind_method(&self) -> BindMethod {
        self.config().bind_method
    }

    pub fn decrypt_credentials(&self) -> Result<String, SyncError> {
        let creds = self.config().credentials.clone();
        (self.decryptor)(&creds)
    }

    pub fn local_subtree(&self) -> String {
        self.config().local_subtree.clone()
    }

    pub fn remote_subtree(&self) -> String {
        self.config().remote_subtree.clone()
    }

    pub fn windows_domain(&self) -> String {
        self.config().windows_domain.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.config().timeout
    }

    pub fn schedule_in_window_now(&self) -> bool {
        self.config().schedule.in_window_now()
    }

    pub fn pausetime(&self) -> i64 {
        self.config().pausetime
    }

    pub fn busywaittime(&self) -> i64 {
        self.config().busywaittime
    }

    pub fn sync_new_users(&self) -> bool {
        self.config().sync_new_users
    }

    pub fn sync_new_groups(&self) -> bool {
        self.config().sync_new_groups
    }

    pub fn move_action(&self) -> MoveAction {
        self.config().move_action
    }

    /// Apply an operator configuration change and raise the changed flag.
    pub fn reconfigure<F: FnOnce(&mut AgreementConfig)>(&self, f: F) {
        f(&mut self.config());
        self.set_changed();
    }

    pub fn set_changed(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }

    /// Read and clear the changed flag.
    pub fn consume_changed(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }

    pub fn is_nt4(&self) -> bool {
        self.private().is_nt4
    }

    pub fn set_is_nt4(&self, isit: bool) {
        self.private().is_nt4 = isit;
    }

    pub fn is_win2k3(&self) -> bool {
        self.private().is_win2k3
    }

    pub fn set_is_win2k3(&self, isit: bool) {
        self.private().is_win2k3 = isit;
    }

    pub fn cookie(&self) -> Option<Vec<u8>> {
        self.private().cookie.clone()
    }

    pub fn set_cookie(&self, cookie: Option<Vec<u8>>) {
        self.private().cookie = cookie;
    }

    pub fn clear_cookie(&self) {
        let mut private = self.private();
        private.cookie = None;
        private.dirsync_has_more = false;
    }

    pub fn dirsync_has_more(&self) -> bool {
        self.private().dirsync_has_more
    }

    /// The DirSync request control carrying the current cookie.
    pub fn dirsync_control(&self) -> RawControl {
        DirSync::request(self.cookie().unwrap_or_default()).into()
    }

    /// Consume the response controls of a finished DirSync search: store
    /// the new cookie and the continuation indicator.
    pub fn update_dirsync_control(&self, ctrls: &[Control]) {
        for Control(_, raw) in ctrls {
            if raw.ctype == DIRSYNC_OID {
                if let Some(val) = raw.val.as_deref() {
                    let ds = DirSync::parse(val);
                    let mut private = self.private();
                    private.dirsync_has_more = ds.has_more();
                    private.cookie = Some(ds.cookie);
                    debug!(
                        "{}: dirsync cookie updated, has_more={}",
                        self.long_name(),
                        private.dirsync_has_more
                    );
                }
            }
        }
    }

    /// Whether a remote entry matches the agreement's deleted-entry filter.
    pub fn deleted_filter_matches(&self, e: &SyncEntry) -> bool {
        e.has_value("isDeleted", "TRUE") || e.has_attr("isDeleted")
    }

    /// Cached copy of the raw entry most recently received from the peer,
    /// replaced atomically by whoever fetches a newer one.
    pub fn raw_entry(&self) -> Option<SyncEntry> {
        self.private().raw_entry.clone()
    }

    pub fn set_raw_entry(&self, entry: Option<SyncEntry>) {
        self.private().raw_entry = entry;
    }

    pub fn set_last_update_status(&self, ldap_rc: u32, acquire_code: i32, message: &str) {
        self.private().status = UpdateStatus {
            ldap_rc,
            acquire_code,
            message: message.to_owned(),
        };
    }

    pub fn last_update_status(&self) -> UpdateStatus {
        self.private().status.clone()
    }

    pub fn set_update_in_progress(&self, in_progress: bool) {
        self.update_in_progress.store(in_progress, Ordering::SeqCst);
    }

    pub fn update_in_progress(&self) -> bool {
        self.update_in_progress.load(Ordering::SeqCst)
    }

    pub fn inc_changecount(&self, skipped: bool) {
        if skipped {
            self.changes_skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.changes_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// (replayed, skipped) counters for monitoring.
    pub fn changecounts(&self) -> (u64, u64) {
        (self.changes_sent.load(Ordering::Relaxed), self.changes_skipped.load(Ordering::Relaxed))
    }
}
