//! In-memory doubles for the engine's external collaborators: the local
//! storage engine with its changelog, and the remote directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ldap3::controls::{Control, RawControl};
use ldap3::Scope;
use url::Url;

use winsync::agreement::{
    Agreement, AgreementConfig, BindMethod, MoveAction, Schedule, SyncFlavor,
};
use winsync::changelog::{ChangelogIter, OperationRecord};
use winsync::connection::{Capability, ConnOp, ConnResult, ConnectionControl, RemoteDirectory};
use winsync::controls::DirSync;
use winsync::entry::{AttrMod, SyncEntry};
use winsync::error::{is_disconnect_error, rc, SyncError};
use winsync::mapper;
use winsync::ruv::{Csn, Ruv};
use winsync::store::{DirectoryStore, FindOutcome};

pub const LOCAL_SUBTREE: &str = "ou=People,dc=example,dc=com";
pub const REMOTE_SUBTREE: &str = "ou=People,dc=ad,dc=example,dc=com";
pub const GENERATION: &str = "gen-0001";

pub fn test_agreement() -> Arc<Agreement> {
    Arc::new(Agreement::new(
        AgreementConfig {
            long_name: "agmt=\"ad\" (ad.example.com:389)".to_owned(),
            url: Url::parse("ldap://ad.example.com:389").expect("url"),
            starttls: false,
            bind_dn: "cn=sync,cn=Users,dc=ad,dc=example,dc=com".to_owned(),
            bind_method: BindMethod::Simple,
            credentials: b"sync-password".to_vec(),
            local_subtree: LOCAL_SUBTREE.to_owned(),
            remote_subtree: REMOTE_SUBTREE.to_owned(),
            windows_domain: "ad.example.com".to_owned(),
            flavor: SyncFlavor::Win2k3,
            timeout: Duration::from_secs(30),
            schedule: Schedule::Always,
            pausetime: 0,
            busywaittime: 0,
            sync_new_users: true,
            sync_new_groups: true,
            move_action: MoveAction::Delete,
        },
        Box::new(|raw| Ok(String::from_utf8_lossy(raw).into_owned())),
    ))
}

pub fn user_entry(dn: &str, uid: &str, cn: &str, sn: &str) -> SyncEntry {
    let mut e = SyncEntry::new(dn);
    e.add_values(
        "objectclass",
        vec![
            "top".into(),
            "person".into(),
            "organizationalPerson".into(),
            "inetOrgPerson".into(),
            "ntUser".into(),
        ],
    );
    e.add_value("uid", uid);
    e.add_value("cn", cn);
    e.add_value("sn", sn);
    e.add_value("ntUserDomainId", uid);
    e.add_value("ntUserCreateNewAccount", "true");
    e.add_value("ntUserDeleteAccount", "true");
    e
}

pub fn remote_user_entry(dn: &str, sam: &str, guid: &[u8]) -> SyncEntry {
    let mut e = SyncEntry::new(dn);
    e.add_values(
        "objectclass",
        vec!["top".into(), "person".into(), "organizationalPerson".into(), "user".into()],
    );
    e.add_value("samAccountName", sam);
    e.set_bin_values("objectGUID", vec![guid.to_vec()]);
    e
}

// ---------------------------------------------------------------------------
// Local store

struct StoredEntry {
    uniqueid: String,
    entry: SyncEntry,
    tombstone: bool,
}

#[derive(Default)]
struct StoreInner {
    entries: Vec<StoredEntry>,
    local_ruv: Ruv,
    consumer_ruvs: HashMap<String, Ruv>,
    cookies: HashMap<String, Vec<u8>>,
    changelog: Vec<OperationRecord>,
    next_uniqueid: u32,
    csn_time: u32,
}

pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Arc<MemoryStore> {
        let mut inner = StoreInner::default();
        inner.local_ruv = Ruv::new(GENERATION);
        inner.csn_time = 1000;
        Arc::new(MemoryStore { inner: Mutex::new(inner) })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store lock")
    }

    pub fn seed_entry(&self, uniqueid: &str, entry: SyncEntry) {
        self.lock().entries.push(StoredEntry {
            uniqueid: uniqueid.to_owned(),
            entry,
            tombstone: false,
        });
    }

    /// Record a change in the changelog and advance the local RUV past it.
    pub fn push_change(&self, op: OperationRecord) {
        let mut inner = self.lock();
        inner.local_ruv.force_csn_update(op.csn);
        inner.changelog.push(op);
    }

    pub fn entry(&self, dn: &str) -> Option<SyncEntry> {
        self.lock()
            .entries
            .iter()
            .find(|s| !s.tombstone && winsync::dn::equal(s.entry.dn(), dn))
            .map(|s| s.entry.clone())
    }

    pub fn has_entry(&self, dn: &str) -> bool {
        self.entry(dn).is_some()
    }

    pub fn entry_count(&self) -> usize {
        self.lock().entries.iter().filter(|s| !s.tombstone).count()
    }

    pub fn consumer_ruv(&self, agmt: &str) -> Option<Ruv> {
        self.lock().consumer_ruvs.get(agmt).cloned()
    }

    pub fn set_consumer_ruv(&self, agmt: &str, ruv: Ruv) {
        self.lock().consumer_ruvs.insert(agmt.to_owned(), ruv);
    }

    pub fn cookie(&self, agmt: &str) -> Option<Vec<u8>> {
        self.lock().cookies.get(agmt).cloned()
    }
}

struct MemoryChangelog {
    ops: Vec<OperationRecord>,
    pos: usize,
}

#[async_trait]
impl ChangelogIter for MemoryChangelog {
    async fn next_operation(&mut self) -> Result<Option<OperationRecord>, SyncError> {
        let op = self.ops.get(self.pos).cloned();
        self.pos += 1;
        Ok(op)
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn entry_by_uniqueid(
        &self,
        subtree: &str,
        uniqueid: &str,
    ) -> Result<Option<SyncEntry>, SyncError> {
        Ok(self
            .lock()
            .entries
            .iter()
            .find(|s| {
                !s.tombstone
                    && s.uniqueid == uniqueid
                    && (subtree.is_empty() || winsync::dn::in_subtree(s.entry.dn(), subtree))
            })
            .map(|s| s.entry.clone()))
    }

    async fn tombstone_by_uniqueid(
        &self,
        subtree: &str,
        uniqueid: &str,
    ) -> Result<Option<SyncEntry>, SyncError> {
        Ok(self
            .lock()
            .entries
            .iter()
            .find(|s| {
                s.uniqueid == uniqueid
                    && (subtree.is_empty() || winsync::dn::in_subtree(s.entry.dn(), subtree))
            })
            .map(|s| s.entry.clone()))
    }

    async fn entry_by_dn(&self, dn: &str) -> Result<Option<SyncEntry>, SyncError> {
        Ok(self.entry(dn))
    }

    async fn find_by_attr(
        &self,
        subtree: &str,
        attr: &str,
        value: &str,
    ) -> Result<FindOutcome, SyncError> {
        let inner = self.lock();
        let mut matches = inner.entries.iter().filter(|s| {
            !s.tombstone
                && winsync::dn::in_subtree(s.entry.dn(), subtree)
                && s.entry.has_value(attr, value)
        });
        match (matches.next(), matches.next()) {
            (None, _) => Ok(FindOutcome::NotFound),
            (Some(found), None) => Ok(FindOutcome::Found(found.entry.clone())),
            (Some(_), Some(_)) => Ok(FindOutcome::NotUnique),
        }
    }

    async fn entries_in_subtree(&self, subtree: &str) -> Result<Vec<SyncEntry>, SyncError> {
        Ok(self
            .lock()
            .entries
            .iter()
            .filter(|s| !s.tombstone && winsync::dn::in_subtree(s.entry.dn(), subtree))
            .map(|s| s.entry.clone())
            .collect())
    }

    async fn add_entry(&self, entry: SyncEntry) -> Result<(), SyncError> {
        let mut inner = self.lock();
        inner.next_uniqueid += 1;
        let uniqueid = format!("uniqueid-{:08}", inner.next_uniqueid);
        inner.entries.push(StoredEntry { uniqueid, entry, tombstone: false });
        Ok(())
    }

    async fn modify_entry(&self, dn: &str, mods: &[AttrMod]) -> Result<(), SyncError> {
        let mut inner = self.lock();
        let stored = inner
            .entries
            .iter_mut()
            .find(|s| !s.tombstone && winsync::dn::equal(s.entry.dn(), dn))
            .ok_or(SyncError::NoSuchEntry)?;
        for m in mods {
            stored.entry.apply_mod(m);
        }
        Ok(())
    }

    async fn delete_entry(&self, dn: &str) -> Result<(), SyncError> {
        let mut inner = self.lock();
        let stored = inner
            .entries
            .iter_mut()
            .find(|s| !s.tombstone && winsync::dn::equal(s.entry.dn(), dn))
            .ok_or(SyncError::NoSuchEntry)?;
        stored.tombstone = true;
        Ok(())
    }

    async fn rename_entry(
        &self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<(), SyncError> {
        let mut inner = self.lock();
        let stored = inner
            .entries
            .iter_mut()
            .find(|s| !s.tombstone && winsync::dn::equal(s.entry.dn(), dn))
            .ok_or(SyncError::NoSuchEntry)?;
        let parent = match new_superior {
            Some(sup) => sup.to_owned(),
            None => winsync::dn::parent(dn).unwrap_or_default(),
        };
        let old_leaf = winsync::dn::leaf_rdn_pair(dn);
        stored.entry.set_dn(&format!("{},{}", new_rdn, parent));
        if let Some((attr, value)) = winsync::dn::leaf_rdn_pair(&format!("{},{}", new_rdn, parent))
        {
            if delete_old_rdn {
                if let Some((old_attr, old_value)) = old_leaf {
                    if old_attr.eq_ignore_ascii_case(&attr) {
                        stored.entry.apply_mod(&AttrMod::delete(&old_attr, vec![old_value]));
                    }
                }
            }
            if !stored.entry.has_value(&attr, &value) {
                stored.entry.add_value(&attr, &value);
            }
        }
        Ok(())
    }

    async fn replay_iterator(
        &self,
        consumer_ruv: &Ruv,
    ) -> Result<Box<dyn ChangelogIter>, SyncError> {
        let mut ops: Vec<OperationRecord> = self
            .lock()
            .changelog
            .iter()
            .filter(|op| !consumer_ruv.covers(op.csn))
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.csn);
        Ok(Box::new(MemoryChangelog { ops, pos: 0 }))
    }

    async fn local_ruv(&self) -> Result<Ruv, SyncError> {
        Ok(self.lock().local_ruv.clone())
    }

    async fn current_csn(&self, _replica_area: &str) -> Result<Option<Csn>, SyncError> {
        let mut inner = self.lock();
        inner.csn_time += 1;
        Ok(Some(Csn::new(inner.csn_time, 0, 1)))
    }

    async fn update_csngen_state(&self, _consumer_ruv: &Ruv) -> Result<(), SyncError> {
        Ok(())
    }

    async fn load_consumer_ruv(&self, agmt: &str) -> Result<Option<Ruv>, SyncError> {
        Ok(self.lock().consumer_ruvs.get(agmt).cloned())
    }

    async fn save_consumer_ruv(&self, agmt: &str, ruv: &Ruv) -> Result<(), SyncError> {
        self.lock().consumer_ruvs.insert(agmt.to_owned(), ruv.clone());
        Ok(())
    }

    async fn load_cookie(&self, agmt: &str) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self.lock().cookies.get(agmt).cloned())
    }

    async fn save_cookie(&self, agmt: &str, cookie: &[u8]) -> Result<(), SyncError> {
        self.lock().cookies.insert(agmt.to_owned(), cookie.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote directory

#[derive(Clone, Debug)]
pub enum RemoteOp {
    Add { dn: String, attrs: Vec<(String, Vec<String>)> },
    Modify { dn: String, mods: Vec<AttrMod> },
    ModifyBin { dn: String, attr: String, value: Vec<u8> },
    Delete { dn: String },
    Rename { dn: String, new_rdn: String, new_superior: Option<String>, delete_old_rdn: bool },
    Reanimate { tombstone_dn: String, new_dn: String },
}

#[derive(Default)]
pub struct RemoteState {
    pub entries: Vec<SyncEntry>,
    pub tombstones: Vec<SyncEntry>,
    pub connected: bool,
    pub lingering: bool,
    pub last_op: ConnOp,
    pub last_error: u32,
    /// Result code injected into the next update operation.
    pub fail_next_update: Option<u32>,
    /// dn (normalized) -> current password, for probe binds.
    pub passwords: HashMap<String, String>,
    pub log: Vec<RemoteOp>,
    /// Batches handed out by successive DirSync searches.
    pub dirsync_batches: Vec<Vec<SyncEntry>>,
    pub next_guid: u8,
}

pub struct MemoryRemote {
    agmt: Arc<Agreement>,
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    pub fn new(agmt: Arc<Agreement>) -> MemoryRemote {
        MemoryRemote { agmt, state: Arc::new(Mutex::new(RemoteState::default())) }
    }

    pub fn state(&self) -> Arc<Mutex<RemoteState>> {
        self.state.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().expect("remote lock")
    }

    /// Apply an injected failure, if one is queued. Mirrors the live
    /// connection contract: disconnect-worthy codes close the session.
    fn injected_failure(state: &mut RemoteState, op: ConnOp) -> Option<ConnResult> {
        let code = state.fail_next_update.take()?;
        state.last_op = op;
        state.last_error = code;
        if is_disconnect_error(code) {
            state.connected = false;
            Some(ConnResult::NotConnected)
        } else {
            Some(ConnResult::OperationFailed)
        }
    }

    fn find_entry<'a>(state: &'a RemoteState, dn: &str) -> Option<&'a SyncEntry> {
        if mapper::is_guid_dn(dn) {
            let hex = dn[6..dn.len() - 1].to_ascii_lowercase();
            let hex = mapper::dedash_guid(&hex);
            state
                .entries
                .iter()
                .find(|e| mapper::extract_guid_from_entry(e, false).as_deref() == Some(hex.as_str()))
        } else {
            state.entries.iter().find(|e| winsync::dn::equal(e.dn(), dn))
        }
    }

    fn matches_filter(e: &SyncEntry, filter: &str) -> bool {
        if filter == "(objectclass=*)" {
            return true;
        }
        let trimmed = filter.trim_start_matches('(').trim_end_matches(')');
        match trimmed.split_once('=') {
            Some((attr, value)) => e.has_value(attr, value),
            None => false,
        }
    }
}

#[async_trait]
impl RemoteDirectory for MemoryRemote {
    async fn search_entry(
        &mut self,
        base: &str,
        filter: &str,
        scope: Scope,
    ) -> (ConnResult, Option<SyncEntry>) {
        let mut state = self.lock();
        if !state.connected {
            return (ConnResult::NotConnected, None);
        }
        state.last_op = ConnOp::Search;
        state.last_error = rc::SUCCESS;
        let found = match scope {
            Scope::Base => {
                MemoryRemote::find_entry(&state, base).filter(|e| {
                    MemoryRemote::matches_filter(e, filter)
                })
            }
            _ => state.entries.iter().find(|e| {
                winsync::dn::in_subtree(e.dn(), base) && MemoryRemote::matches_filter(e, filter)
            }),
        }
        .cloned();
        if let Some(e) = found.as_ref() {
            self.agmt.set_raw_entry(Some(e.clone()));
        }
        (ConnResult::Success, found)
    }

    async fn search_tombstone(&mut self, dn: &str) -> (ConnResult, Option<SyncEntry>) {
        let state = self.lock();
        if !state.connected {
            return (ConnResult::NotConnected, None);
        }
        let found = state
            .tombstones
            .iter()
            .find(|e| winsync::dn::equal(e.dn(), dn))
            .cloned();
        (ConnResult::Success, found)
    }

    async fn send_add(&mut self, dn: &str, attrs: Vec<(String, Vec<String>)>) -> ConnResult {
        let mut state = self.lock();
        if !state.connected {
            return ConnResult::NotConnected;
        }
        if let Some(res) = MemoryRemote::injected_failure(&mut state, ConnOp::Add) {
            return res;
        }
        state.last_op = ConnOp::Add;
        state.log.push(RemoteOp::Add { dn: dn.to_owned(), attrs: attrs.clone() });
        if MemoryRemote::find_entry(&state, dn).is_some() {
            // entryAlreadyExists is benign for adds.
            state.last_error = rc::SUCCESS;
            return ConnResult::Success;
        }
        let mut entry = SyncEntry::new(dn);
        for (attr, values) in attrs {
            entry.add_values(&attr, values);
        }
        state.next_guid += 1;
        let guid = vec![state.next_guid; 16];
        entry.set_bin_values("objectGUID", vec![guid]);
        state.entries.push(entry);
        state.last_error = rc::SUCCESS;
        ConnResult::Success
    }

    async fn send_modify(&mut self, dn: &str, mods: Vec<AttrMod>) -> ConnResult {
        let mut state = self.lock();
        if !state.connected {
            return ConnResult::NotConnected;
        }
        if let Some(res) = MemoryRemote::injected_failure(&mut state, ConnOp::Modify) {
            return res;
        }
        state.last_op = ConnOp::Modify;
        state.log.push(RemoteOp::Modify { dn: dn.to_owned(), mods: mods.clone() });
        let target_dn = match MemoryRemote::find_entry(&state, dn) {
            Some(e) => e.dn().to_owned(),
            None => {
                state.last_error = rc::NO_SUCH_OBJECT;
                return ConnResult::OperationFailed;
            }
        };
        let entry = state
            .entries
            .iter_mut()
            .find(|e| winsync::dn::equal(e.dn(), &target_dn))
            .expect("entry just found");
        for m in &mods {
            entry.apply_mod(m);
        }
        state.last_error = rc::SUCCESS;
        ConnResult::Success
    }

    async fn send_modify_bin(&mut self, dn: &str, attr: &str, value: Vec<u8>) -> ConnResult {
        let mut state = self.lock();
        if !state.connected {
            return ConnResult::NotConnected;
        }
        if let Some(res) = MemoryRemote::injected_failure(&mut state, ConnOp::Modify) {
            return res;
        }
        state.last_op = ConnOp::Modify;
        state.log.push(RemoteOp::ModifyBin {
            dn: dn.to_owned(),
            attr: attr.to_owned(),
            value: value.clone(),
        });
        if attr.eq_ignore_ascii_case("unicodePwd") {
            // Decode the quoted UTF-16LE form back to the plaintext.
            let units: Vec<u16> = value
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            if let Ok(quoted) = String::from_utf16(&units) {
                let plain = quoted.trim_matches('"').to_owned();
                state.passwords.insert(winsync::dn::normalize(dn), plain);
            }
        }
        state.last_error = rc::SUCCESS;
        ConnResult::Success
    }

    async fn send_delete(&mut self, dn: &str) -> ConnResult {
        let mut state = self.lock();
        if !state.connected {
            return ConnResult::NotConnected;
        }
        if let Some(res) = MemoryRemote::injected_failure(&mut state, ConnOp::Delete) {
            return res;
        }
        state.last_op = ConnOp::Delete;
        state.log.push(RemoteOp::Delete { dn: dn.to_owned() });
        let target_dn = MemoryRemote::find_entry(&state, dn).map(|e| e.dn().to_owned());
        match target_dn {
            Some(target_dn) => {
                let pos = state
                    .entries
                    .iter()
                    .position(|e| winsync::dn::equal(e.dn(), &target_dn))
                    .expect("entry just found");
                let mut entry = state.entries.remove(pos);
                entry.add_value("isDeleted", "TRUE");
                state.tombstones.push(entry);
            }
            None => {
                // noSuchObject is benign for deletes.
            }
        }
        state.last_error = rc::SUCCESS;
        ConnResult::Success
    }

    async fn send_rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<&str>,
        delete_old_rdn: bool,
    ) -> ConnResult {
        let mut state = self.lock();
        if !state.connected {
            return ConnResult::NotConnected;
        }
        if let Some(res) = MemoryRemote::injected_failure(&mut state, ConnOp::Rename) {
            return res;
        }
        state.last_op = ConnOp::Rename;
        state.log.push(RemoteOp::Rename {
            dn: dn.to_owned(),
            new_rdn: new_rdn.to_owned(),
            new_superior: new_superior.map(str::to_owned),
            delete_old_rdn,
        });
        let target_dn = match MemoryRemote::find_entry(&state, dn) {
            Some(e) => e.dn().to_owned(),
            None => {
                state.last_error = rc::NO_SUCH_OBJECT;
                return ConnResult::OperationFailed;
            }
        };
        let parent = match new_superior {
            Some(sup) => sup.to_owned(),
            None => winsync::dn::parent(&target_dn).unwrap_or_default(),
        };
        let new_dn = format!("{},{}", new_rdn, parent);
        let old_leaf = winsync::dn::leaf_rdn_pair(&target_dn);
        let entry = state
            .entries
            .iter_mut()
            .find(|e| winsync::dn::equal(e.dn(), &target_dn))
            .expect("entry just found");
        entry.set_dn(&new_dn);
        if let Some((attr, value)) = winsync::dn::leaf_rdn_pair(&new_dn) {
            if delete_old_rdn {
                if let Some((old_attr, old_value)) = old_leaf {
                    if old_attr.eq_ignore_ascii_case(&attr) {
                        entry.apply_mod(&AttrMod::delete(&old_attr, vec![old_value]));
                    }
                }
            }
            if !entry.has_value(&attr, &value) {
                entry.add_value(&attr, &value);
            }
        }
        state.last_error = rc::SUCCESS;
        ConnResult::Success
    }

    async fn reanimate_tombstone(&mut self, tombstone_dn: &str, new_dn: &str) -> ConnResult {
        let mut state = self.lock();
        if !state.connected {
            return ConnResult::NotConnected;
        }
        state.last_op = ConnOp::Modify;
        state.log.push(RemoteOp::Reanimate {
            tombstone_dn: tombstone_dn.to_owned(),
            new_dn: new_dn.to_owned(),
        });
        let pos = state
            .tombstones
            .iter()
            .position(|e| winsync::dn::equal(e.dn(), tombstone_dn));
        match pos {
            Some(pos) => {
                let mut entry = state.tombstones.remove(pos);
                entry.remove_attr("isDeleted");
                entry.set_dn(new_dn);
                state.entries.push(entry);
                state.last_error = rc::SUCCESS;
                ConnResult::Success
            }
            None => {
                state.last_error = rc::NO_SUCH_OBJECT;
                ConnResult::OperationFailed
            }
        }
    }

    async fn send_dirsync_search(&mut self, _base: &str) -> (ConnResult, Vec<SyncEntry>) {
        let mut state = self.lock();
        if !state.connected {
            return (ConnResult::NotConnected, Vec::new());
        }
        state.last_op = ConnOp::Search;
        let batch = if state.dirsync_batches.is_empty() {
            Vec::new()
        } else {
            state.dirsync_batches.remove(0)
        };
        let has_more = !state.dirsync_batches.is_empty();
        // Deliver the cookie through the real response-control path.
        let cookie = vec![0xc0, state.dirsync_batches.len() as u8];
        let raw: RawControl = DirSync {
            more_results: i64::from(has_more),
            size: 0,
            cookie,
        }
        .into();
        self.agmt.update_dirsync_control(&[Control(None, raw)]);
        state.last_error = rc::SUCCESS;
        (ConnResult::Success, batch)
    }

    async fn read_entry_attribute(&mut self, dn: &str, attr: &str) -> (ConnResult, Vec<String>) {
        let state = self.lock();
        if !state.connected {
            return (ConnResult::NotConnected, Vec::new());
        }
        match MemoryRemote::find_entry(&state, dn) {
            Some(e) => (ConnResult::Success, e.attr_values(attr).to_vec()),
            None => (ConnResult::OperationFailed, Vec::new()),
        }
    }

    async fn check_user_password(&mut self, dn: &str, password: &str) -> bool {
        let state = self.lock();
        state.passwords.get(&winsync::dn::normalize(dn)).map(String::as_str) == Some(password)
    }

    async fn get_error(&self) -> (ConnOp, u32) {
        let state = self.lock();
        (state.last_op, state.last_error)
    }

    async fn set_error(&mut self, code: u32) {
        self.lock().last_error = code;
    }
}

#[async_trait]
impl ConnectionControl for MemoryRemote {
    async fn connect(&mut self) -> ConnResult {
        let mut state = self.lock();
        state.connected = true;
        ConnResult::Success
    }

    async fn disconnect(&mut self) {
        self.lock().connected = false;
    }

    async fn start_linger(&mut self) {
        self.lock().lingering = true;
    }

    async fn cancel_linger(&mut self) {
        self.lock().lingering = false;
    }

    async fn set_timeout(&mut self, _timeout: Duration) {}

    async fn set_agmt_changed(&mut self) {}

    async fn replica_supports_dirsync(&mut self) -> Capability {
        Capability::Yes
    }

    async fn replica_is_win2k3(&mut self) -> Capability {
        Capability::Yes
    }

    async fn replica_supports_ds5_repl(&mut self) -> Capability {
        Capability::No
    }

    async fn status(&self) -> &'static str {
        if self.lock().connected {
            "connected"
        } else {
            "disconnected"
        }
    }
}
