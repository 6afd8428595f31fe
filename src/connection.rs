//! The connection to the remote peer.
//!
//! One [`WindowsConnection`] per agreement carries every LDAP operation the
//! engine sends: bind, searches (including the DirSync search), updates and
//! the capability probes against the root DSE. Outcomes are folded into the
//! coarse [`ConnResult`] so the layers above never see client-level errors.
//!
//! A session that goes idle is kept open for a linger period and reused if
//! the next session starts soon enough; the linger timer is a spawned task
//! whose handle lives under the connection lock, so cancellation cannot race
//! the timer body.
//!
//! The mapper, inbound processor and replayer consume the connection through
//! the [`RemoteDirectory`] trait; the driver additionally manages its
//! lifecycle through [`ConnectionControl`]. Both are implemented here for
//! the live connection and by the in-memory double in the tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::controls::RawControl;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult, Mod, Scope, SearchEntry};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time;

use crate::agreement::{Agreement, BindMethod, Transport};
use crate::controls::{
    manage_dsa_it, return_deleted_objects, DS5_END_REPLICATION_REQUEST_OID,
    DS5_REPLICATION_ENTRY_REQUEST_OID, DS5_REPLICATION_RESPONSE_OID,
    DS5_START_REPLICATION_REQUEST_OID, DS5_UPDATE_INFO_CONTROL_OID, PW_EXPIRED_OID,
    PW_EXPIRING_OID, WIN2K3_CAPABILITY_OID,
};
use crate::dn;
use crate::entry::{AttrMod, ModOp, SyncEntry};
use crate::error::{is_disconnect_error, ldap_error_rc, rc, rc_name};

pub const DEFAULT_LINGER_TIME: Duration = Duration::from_secs(60);

/// Coarse outcome of one connection operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnResult {
    /// The operation was acknowledged (possibly via the benign-error map).
    Success,
    /// The peer returned a non-benign result code; see the last error.
    OperationFailed,
    /// A disconnect-worthy failure closed the session; reconnect first.
    NotConnected,
    /// The peer rejected acquisition with a busy indication.
    Busy,
    /// No reply within the agreement timeout.
    Timeout,
    /// Client-side failure.
    LocalError,
    /// Secure transport was requested but the TLS stack is unavailable.
    TlsNotEnabled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnOp {
    #[default]
    None,
    Add,
    Delete,
    Modify,
    Rename,
    Extended,
    Bind,
    Init,
    Search,
}

/// Tri-state capability: probed once per session, reset on disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    Unknown,
    Yes,
    No,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connected,
}

const STATUS_DISCONNECTED: &str = "disconnected";
const STATUS_CONNECTED: &str = "connected";
const STATUS_PROCESSING_ADD: &str = "processing add operation";
const STATUS_PROCESSING_DELETE: &str = "processing delete operation";
const STATUS_PROCESSING_MODIFY: &str = "processing modify operation";
const STATUS_PROCESSING_RENAME: &str = "processing rename operation";
const STATUS_PROCESSING_EXTENDED: &str = "processing extended operation";
const STATUS_LINGERING: &str = "lingering";
const STATUS_BINDING: &str = "connecting and binding";
const STATUS_SEARCHING: &str = "processing search operation";

/// Read-side operation surface of the connection, the seam the mapper,
/// inbound processor and replayer are written against.
#[async_trait]
pub trait RemoteDirectory: Send {
    /// Search expected to return at most one entry. The returned entry is
    /// also cached as the agreement's raw entry.
    async fn search_entry(
        &mut self,
        base: &str,
        filter: &str,
        scope: Scope,
    ) -> (ConnResult, Option<SyncEntry>);

    /// Subtree search from `dn` with the deleted-objects control, for
    /// tombstone existence probes.
    async fn search_tombstone(&mut self, dn: &str) -> (ConnResult, Option<SyncEntry>);

    async fn send_add(&mut self, dn: &str, attrs: Vec<(String, Vec<String>)>) -> ConnResult;
    async fn send_modify(&mut self, dn: &str, mods: Vec<AttrMod>) -> ConnResult;
    /// Replace of one binary-valued attribute (the password attribute).
    async fn send_modify_bin(&mut self, dn: &str, attr: &str, value: Vec<u8>) -> ConnResult;
    async fn send_delete(&mut self, dn: &str) -> ConnResult;
    async fn send_rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<&str>,
        delete_old_rdn: bool,
    ) -> ConnResult;

    /// Turn a tombstone back into a live entry: delete `isDeleted` and
    /// replace `distinguishedName`, under the deleted-objects control.
    async fn reanimate_tombstone(&mut self, tombstone_dn: &str, new_dn: &str) -> ConnResult;

    /// One DirSync batch against `base`; the agreement's cookie is sent
    /// and updated from the response control.
    async fn send_dirsync_search(&mut self, base: &str) -> (ConnResult, Vec<SyncEntry>);

    /// Synchronous base-scope read of a single attribute.
    async fn read_entry_attribute(&mut self, dn: &str, attr: &str) -> (ConnResult, Vec<String>);

    /// Probe whether `password` currently authenticates `dn`, without
    /// disturbing the agreement bind.
    async fn check_user_password(&mut self, dn: &str, password: &str) -> bool;

    async fn get_error(&self) -> (ConnOp, u32);
    async fn set_error(&mut self, code: u32);
}

/// Lifecycle surface of the connection, used by the agreement driver.
#[async_trait]
pub trait ConnectionControl: Send {
    async fn connect(&mut self) -> ConnResult;
    async fn disconnect(&mut self);
    async fn start_linger(&mut self);
    async fn cancel_linger(&mut self);
    async fn set_timeout(&mut self, timeout: Duration);
    async fn set_agmt_changed(&mut self);
    async fn replica_supports_dirsync(&mut self) -> Capability;
    async fn replica_is_win2k3(&mut self) -> Capability;
    async fn replica_supports_ds5_repl(&mut self) -> Capability;
    async fn status(&self) -> &'static str;
}

struct ConnInner {
    ldap: Option<Ldap>,
    state: ConnState,
    bind_dn: String,
    bind_method: BindMethod,
    timeout: Duration,
    /// Decrypted bind credential, dropped on teardown and on agreement
    /// change.
    plain: Option<String>,
    flag_agmt_changed: bool,
    last_operation: ConnOp,
    last_ldap_error: u32,
    last_logged_error: Option<u32>,
    status: &'static str,
    supports_dirsync: Capability,
    supports_ds5: Capability,
    win2k3: Capability,
    linger: Option<JoinHandle<()>>,
    linger_time: Duration,
}

impl ConnInner {
    fn connected(&self) -> bool {
        // ld != null iff state == connected, checked at every public
        // operation boundary.
        debug_assert_eq!(self.ldap.is_some(), self.state == ConnState::Connected);
        self.state == ConnState::Connected
    }
}

async fn close_connection_internal(inner: &mut ConnInner, name: &str) {
    if let Some(mut ldap) = inner.ldap.take() {
        let _ = ldap.unbind().await;
    }
    inner.state = ConnState::Disconnected;
    inner.status = STATUS_DISCONNECTED;
    inner.supports_dirsync = Capability::Unknown;
    inner.supports_ds5 = Capability::Unknown;
    inner.win2k3 = Capability::Unknown;
    inner.plain = None;
    debug!("{}: disconnected from the consumer", name);
}

pub struct WindowsConnection {
    agmt: Arc<Agreement>,
    inner: Arc<tokio::sync::Mutex<ConnInner>>,
}

impl WindowsConnection {
    pub fn new(agmt: Arc<Agreement>) -> WindowsConnection {
        let inner = ConnInner {
            ldap: None,
            state: ConnState::Disconnected,
            bind_dn: agmt.bind_dn(),
            bind_method: agmt.bind_method(),
            timeout: agmt.timeout(),
            plain: None,
            flag_agmt_changed: false,
            last_operation: ConnOp::None,
            last_ldap_error: rc::SUCCESS,
            last_logged_error: None,
            status: STATUS_DISCONNECTED,
            supports_dirsync: Capability::Unknown,
            supports_ds5: Capability::Unknown,
            win2k3: Capability::Unknown,
            linger: None,
            linger_time: DEFAULT_LINGER_TIME,
        };
        WindowsConnection { agmt, inner: Arc::new(tokio::sync::Mutex::new(inner)) }
    }

    fn build_settings(&self, timeout: Duration) -> Result<LdapConnSettings, ConnResult> {
        #[allow(unused_mut)]
        let mut settings = LdapConnSettings::new().set_conn_timeout(timeout);
        match self.agmt.transport() {
            Transport::Plain => {}
            #[cfg(feature = "tls")]
            Transport::Tls | Transport::StartTls => {
                let connector = native_tls::TlsConnector::new().map_err(|e| {
                    error!(
                        "{}: TLS not initialized, replication over TLS failed: {}",
                        self.agmt.long_name(),
                        e
                    );
                    ConnResult::TlsNotEnabled
                })?;
                settings = settings.set_connector(connector);
                if self.agmt.transport() == Transport::StartTls {
                    settings = settings.set_starttls(true);
                }
            }
            #[cfg(not(feature = "tls"))]
            Transport::Tls | Transport::StartTls => {
                error!(
                    "{}: secure transport configured but TLS support is compiled out",
                    self.agmt.long_name()
                );
                return Err(ConnResult::TlsNotEnabled);
            }
        }
        Ok(settings)
    }

    fn log_op_error(&self, inner: &mut ConnInner, code: u32, op: &str, detail: &str) {
        // Repeated identical failures are reported once, then demoted, so a
        // flapping peer does not flood the log.
        if inner.last_logged_error == Some(code) {
            debug!(
                "{}: received error {} ({}) for {} operation: {}",
                self.agmt.long_name(),
                code,
                rc_name(code),
                op,
                detail
            );
        } else {
            error!(
                "{}: received error {} ({}) for {} operation: {}",
                self.agmt.long_name(),
                code,
                rc_name(code),
                op,
                detail
            );
            inner.last_logged_error = Some(code);
        }
    }

    /// Fold the outcome of an update operation into a [`ConnResult`],
    /// applying the benign-error map and the disconnect classification.
    async fn finish_op(
        &self,
        inner: &mut ConnInner,
        op: ConnOp,
        op_string: &str,
        dn: &str,
        outcome: Result<Result<LdapResult, LdapError>, time::error::Elapsed>,
    ) -> ConnResult {
        match outcome {
            Err(_) => {
                inner.last_ldap_error = rc::TIMEOUT;
                inner.status = STATUS_CONNECTED;
                ConnResult::Timeout
            }
            Ok(Err(e)) => {
                let code = ldap_error_rc(&e);
                self.log_op_error(inner, code, op_string, &e.to_string());
                inner.last_ldap_error = code;
                if is_disconnect_error(code) {
                    close_connection_internal(inner, &self.agmt.long_name()).await;
                    ConnResult::NotConnected
                } else {
                    inner.status = STATUS_CONNECTED;
                    ConnResult::OperationFailed
                }
            }
            Ok(Ok(result)) => {
                let mut code = result.rc;
                if is_disconnect_error(code) {
                    inner.last_ldap_error = code;
                    close_connection_internal(inner, &self.agmt.long_name()).await;
                    return ConnResult::NotConnected;
                }
                // The remote already converges on these; report success so
                // the replay position can advance.
                if (code == rc::UNWILLING_TO_PERFORM && op == ConnOp::Modify)
                    || (code == rc::ALREADY_EXISTS && op == ConnOp::Add)
                    || (code == rc::NO_SUCH_OBJECT && op == ConnOp::Delete)
                {
                    code = rc::SUCCESS;
                }
                inner.last_ldap_error = code;
                let text: String = result
                    .text
                    .chars()
                    .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                    .collect();
                if code == rc::CONSTRAINT_VIOLATION {
                    error!(
                        "{}: received error [{}] when attempting to {} entry [{}]: \
                         correct the attribute named in the message and retry; see the \
                         Active Directory schema documentation",
                        self.agmt.long_name(),
                        text,
                        op_string,
                        dn.escape_default()
                    );
                } else {
                    debug!(
                        "{}: received result code {} ({}) for {} operation on {}",
                        self.agmt.long_name(),
                        code,
                        text,
                        op_string,
                        dn
                    );
                }
                inner.status = STATUS_CONNECTED;
                if code == rc::SUCCESS {
                    ConnResult::Success
                } else {
                    ConnResult::OperationFailed
                }
            }
        }
    }

    /// Inspect a bind result for password-policy response controls.
    fn log_pwpolicy_controls(&self, result: &LdapResult) {
        for ctrl in &result.ctrls {
            let raw = &ctrl.1;
            if raw.ctype == PW_EXPIRED_OID {
                warn!(
                    "{}: the password of the replication bind identity has expired",
                    self.agmt.long_name()
                );
            } else if raw.ctype == PW_EXPIRING_OID {
                info!(
                    "{}: the password of the replication bind identity is about to expire",
                    self.agmt.long_name()
                );
            }
        }
    }

    async fn probe_root_dse(
        &self,
        inner: &mut ConnInner,
        attrs: &[&str],
        needles: &[(&str, &str)],
    ) -> Result<bool, ConnResult> {
        if !inner.connected() {
            return Err(ConnResult::NotConnected);
        }
        inner.status = STATUS_SEARCHING;
        let timeout = inner.timeout;
        let ldap = inner.ldap.as_mut().expect("connected session");
        let attrs: Vec<String> = attrs.iter().map(|s| (*s).to_owned()).collect();
        let outcome =
            time::timeout(timeout, ldap.search("", Scope::Base, "(objectclass=*)", attrs)).await;
        match outcome {
            Err(_) => {
                inner.last_ldap_error = rc::TIMEOUT;
                Err(ConnResult::Timeout)
            }
            Ok(Err(e)) => {
                let code = ldap_error_rc(&e);
                inner.last_ldap_error = code;
                if is_disconnect_error(code) {
                    close_connection_internal(inner, &self.agmt.long_name()).await;
                    Err(ConnResult::NotConnected)
                } else {
                    Err(ConnResult::OperationFailed)
                }
            }
            Ok(Ok(res)) => {
                let ldap3::SearchResult(entries, result) = res;
                inner.last_ldap_error = result.rc;
                inner.status = STATUS_CONNECTED;
                if result.rc != rc::SUCCESS {
                    return Err(if is_disconnect_error(result.rc) {
                        close_connection_internal(inner, &self.agmt.long_name()).await;
                        ConnResult::NotConnected
                    } else {
                        ConnResult::OperationFailed
                    });
                }
                let entry = match entries.into_iter().next() {
                    Some(re) => SearchEntry::construct(re),
                    None => return Ok(false),
                };
                let found = needles.iter().all(|(attr, value)| {
                    entry
                        .attrs
                        .iter()
                        .find(|(name, _)| name.eq_ignore_ascii_case(attr))
                        .map(|(_, vals)| vals.iter().any(|v| v.eq_ignore_ascii_case(value)))
                        .unwrap_or(false)
                });
                Ok(found)
            }
        }
    }

    async fn connect_locked(&self, inner: &mut ConnInner) -> ConnResult {
        if inner.state == ConnState::Connected {
            return ConnResult::Success;
        }

        if inner.flag_agmt_changed {
            inner.bind_dn = self.agmt.bind_dn();
            inner.bind_method = self.agmt.bind_method();
            inner.timeout = self.agmt.timeout();
            inner.plain = None;
            inner.flag_agmt_changed = false;
        }

        if inner.plain.is_none() {
            match self.agmt.decrypt_credentials() {
                Ok(plain) => inner.plain = Some(plain),
                Err(_) => {
                    error!(
                        "{}: decoding of the replication credentials failed",
                        self.agmt.long_name()
                    );
                    inner.last_ldap_error = rc::INVALID_CREDENTIALS;
                    inner.state = ConnState::Disconnected;
                    return ConnResult::OperationFailed;
                }
            }
        }

        let settings = match self.build_settings(inner.timeout) {
            Ok(settings) => settings,
            Err(res) => {
                inner.last_operation = ConnOp::Init;
                inner.last_ldap_error = rc::INAPPROPRIATE_AUTH;
                return res;
            }
        };

        let url = self.agmt.url();
        debug!(
            "{}: trying {}{} connection to {}",
            self.agmt.long_name(),
            if self.agmt.transport() == Transport::Plain { "non-secure" } else { "secure" },
            if self.agmt.transport() == Transport::StartTls { " startTLS" } else { "" },
            url
        );

        // The client speaks protocol 3 only, never dereferences aliases and
        // never chases referrals; the settings carry the network timeout.
        let ldap = match LdapConnAsync::with_settings(settings, url.as_str()).await {
            Ok((conn, ldap)) => {
                ldap3::drive!(conn);
                ldap
            }
            Err(e) => {
                error!(
                    "{}: failed to establish connection to the consumer: {}",
                    self.agmt.long_name(),
                    e
                );
                inner.last_operation = ConnOp::Init;
                inner.last_ldap_error = rc::CONNECT_ERROR;
                inner.state = ConnState::Disconnected;
                return ConnResult::OperationFailed;
            }
        };
        inner.ldap = Some(ldap);
        inner.state = ConnState::Connected;
        inner.last_operation = ConnOp::Bind;
        inner.status = STATUS_BINDING;

        if inner.bind_method == BindMethod::DigestMd5 {
            error!(
                "{}: DIGEST-MD5 binds are not supported by this build; \
                 reconfigure the agreement bind method",
                self.agmt.long_name()
            );
            inner.last_ldap_error = rc::LOCAL_ERROR;
            close_connection_internal(inner, &self.agmt.long_name()).await;
            return ConnResult::OperationFailed;
        }
        #[cfg(not(feature = "gssapi"))]
        if inner.bind_method == BindMethod::Gssapi {
            error!(
                "{}: GSSAPI binds require the gssapi feature",
                self.agmt.long_name()
            );
            inner.last_ldap_error = rc::LOCAL_ERROR;
            close_connection_internal(inner, &self.agmt.long_name()).await;
            return ConnResult::OperationFailed;
        }

        let timeout = inner.timeout;
        let bind_dn = inner.bind_dn.clone();
        let password = inner.plain.clone().unwrap_or_default();
        let method = inner.bind_method;
        #[cfg(feature = "gssapi")]
        let server_host = url.host_str().unwrap_or_default().to_owned();
        let ldap = inner.ldap.as_mut().expect("session just opened");
        let outcome = match method {
            BindMethod::Simple => time::timeout(timeout, ldap.simple_bind(&bind_dn, &password)).await,
            BindMethod::SslClientAuth => time::timeout(timeout, ldap.sasl_external_bind()).await,
            #[cfg(feature = "gssapi")]
            BindMethod::Gssapi => {
                time::timeout(timeout, ldap.sasl_gssapi_bind(&server_host)).await
            }
            #[cfg(not(feature = "gssapi"))]
            BindMethod::Gssapi => unreachable!("rejected above"),
            BindMethod::DigestMd5 => unreachable!("rejected above"),
        };

        match outcome {
            Ok(Ok(result)) if result.rc == rc::SUCCESS => {
                if inner.last_ldap_error != rc::SUCCESS {
                    info!(
                        "{}: replication bind with {:?} auth resumed",
                        self.agmt.long_name(),
                        method
                    );
                }
                inner.last_ldap_error = rc::SUCCESS;
                self.log_pwpolicy_controls(&result);
            }
            Ok(Ok(result)) => {
                error!(
                    "{}: replication bind with {:?} auth failed: LDAP error {} ({})",
                    self.agmt.long_name(),
                    method,
                    result.rc,
                    result.text
                );
                inner.last_ldap_error = result.rc;
                close_connection_internal(inner, &self.agmt.long_name()).await;
                return ConnResult::OperationFailed;
            }
            Ok(Err(e)) => {
                error!(
                    "{}: replication bind with {:?} auth failed: {}",
                    self.agmt.long_name(),
                    method,
                    e
                );
                inner.last_ldap_error = ldap_error_rc(&e);
                close_connection_internal(inner, &self.agmt.long_name()).await;
                return ConnResult::OperationFailed;
            }
            Err(_) => {
                error!("{}: replication bind timed out", self.agmt.long_name());
                inner.last_ldap_error = rc::TIMEOUT;
                close_connection_internal(inner, &self.agmt.long_name()).await;
                return ConnResult::OperationFailed;
            }
        }

        inner.status = STATUS_CONNECTED;

        // Flavor discovery. A peer without the DirSync control is taken to
        // be the NT4 LDAP service.
        let dirsync = self.supports_dirsync_locked(inner).await;
        self.agmt.set_is_nt4(dirsync == Capability::No);
        if dirsync == Capability::No {
            debug!("{}: detected NT4 peer", self.agmt.long_name());
        }
        let win2k3 = self.is_win2k3_locked(inner).await;
        self.agmt.set_is_win2k3(win2k3 == Capability::Yes);
        if win2k3 == Capability::Yes {
            debug!("{}: detected Win2k3 peer", self.agmt.long_name());
        }

        if inner.state == ConnState::Connected {
            inner.last_ldap_error = rc::SUCCESS;
            ConnResult::Success
        } else {
            // A probe hit a disconnect-worthy error.
            ConnResult::OperationFailed
        }
    }

    async fn supports_dirsync_locked(&self, inner: &mut ConnInner) -> Capability {
        if inner.supports_dirsync == Capability::Unknown && inner.connected() {
            inner.supports_dirsync = match self
                .probe_root_dse(
                    inner,
                    &["supportedControl"],
                    &[("supportedControl", crate::controls::DIRSYNC_OID)],
                )
                .await
            {
                Ok(true) => Capability::Yes,
                Ok(false) => Capability::No,
                Err(_) => Capability::Unknown,
            };
        }
        inner.supports_dirsync
    }

    async fn is_win2k3_locked(&self, inner: &mut ConnInner) -> Capability {
        if inner.win2k3 == Capability::Unknown && inner.connected() {
            inner.win2k3 = match self
                .probe_root_dse(
                    inner,
                    &["supportedCapabilities"],
                    &[("supportedCapabilities", WIN2K3_CAPABILITY_OID)],
                )
                .await
            {
                Ok(true) => Capability::Yes,
                Ok(false) => Capability::No,
                Err(_) => Capability::Unknown,
            };
        }
        inner.win2k3
    }

    async fn supports_ds5_locked(&self, inner: &mut ConnInner) -> Capability {
        if inner.supports_ds5 == Capability::Unknown && inner.connected() {
            inner.supports_ds5 = match self
                .probe_root_dse(
                    inner,
                    &["supportedControl", "supportedExtension"],
                    &[
                        ("supportedControl", DS5_UPDATE_INFO_CONTROL_OID),
                        ("supportedExtension", DS5_START_REPLICATION_REQUEST_OID),
                        ("supportedExtension", DS5_END_REPLICATION_REQUEST_OID),
                        ("supportedExtension", DS5_REPLICATION_ENTRY_REQUEST_OID),
                        ("supportedExtension", DS5_REPLICATION_RESPONSE_OID),
                    ],
                )
                .await
            {
                Ok(true) => Capability::Yes,
                Ok(false) => Capability::No,
                Err(_) => Capability::Unknown,
            };
        }
        inner.supports_ds5
    }

    /// Send an extended operation and return its response value, if any.
    pub async fn send_extended_operation(
        &mut self,
        oid: &str,
        payload: Option<Vec<u8>>,
    ) -> (ConnResult, Option<Vec<u8>>) {
        let mut inner = self.inner.lock().await;
        if !inner.connected() {
            return (ConnResult::NotConnected, None);
        }
        inner.last_operation = ConnOp::Extended;
        inner.status = STATUS_PROCESSING_EXTENDED;
        let timeout = inner.timeout;
        let exop = ldap3::exop::Exop { name: Some(oid.to_owned()), val: payload };
        let ldap = inner.ldap.as_mut().expect("connected session");
        let outcome = time::timeout(timeout, ldap.with_controls(manage_dsa_it()).extended(exop))
            .await
            .map(|res| {
                res.map(|exop_result| {
                    let ldap3::result::ExopResult(exop, result) = exop_result;
                    (exop, result)
                })
            });
        match outcome {
            Err(_) => {
                inner.last_ldap_error = rc::TIMEOUT;
                (ConnResult::Timeout, None)
            }
            Ok(Err(e)) => {
                let code = ldap_error_rc(&e);
                self.log_op_error(&mut inner, code, "extended", &e.to_string());
                inner.last_ldap_error = code;
                if is_disconnect_error(code) {
                    close_connection_internal(&mut inner, &self.agmt.long_name()).await;
                    (ConnResult::NotConnected, None)
                } else {
                    inner.status = STATUS_CONNECTED;
                    (ConnResult::OperationFailed, None)
                }
            }
            Ok(Ok((exop, result))) => {
                inner.last_ldap_error = result.rc;
                inner.status = STATUS_CONNECTED;
                if result.rc == rc::SUCCESS {
                    (ConnResult::Success, exop.val)
                } else if is_disconnect_error(result.rc) {
                    close_connection_internal(&mut inner, &self.agmt.long_name()).await;
                    (ConnResult::NotConnected, None)
                } else {
                    (ConnResult::OperationFailed, None)
                }
            }
        }
    }

    async fn search_entry_ext(
        &mut self,
        base: &str,
        filter: &str,
        scope: Scope,
        extra_ctrls: Vec<RawControl>,
    ) -> (ConnResult, Option<SyncEntry>) {
        let mut inner = self.inner.lock().await;
        if !inner.connected() {
            return (ConnResult::NotConnected, None);
        }
        inner.last_operation = ConnOp::Search;
        inner.status = STATUS_SEARCHING;
        let timeout = inner.timeout;
        let ldap = inner.ldap.as_mut().expect("connected session");
        let outcome = time::timeout(
            timeout,
            ldap.with_controls(extra_ctrls).search(base, scope, filter, vec!["*"]),
        )
        .await;
        match outcome {
            Err(_) => {
                inner.last_ldap_error = rc::TIMEOUT;
                (ConnResult::Timeout, None)
            }
            Ok(Err(e)) => {
                let code = ldap_error_rc(&e);
                inner.last_ldap_error = code;
                if is_disconnect_error(code) {
                    close_connection_internal(&mut inner, &self.agmt.long_name()).await;
                    (ConnResult::NotConnected, None)
                } else {
                    inner.status = STATUS_CONNECTED;
                    (ConnResult::OperationFailed, None)
                }
            }
            Ok(Ok(res)) => {
                let ldap3::SearchResult(entries, result) = res;
                inner.last_ldap_error = result.rc;
                inner.status = STATUS_CONNECTED;
                if result.rc == rc::SUCCESS || result.rc == rc::NO_SUCH_OBJECT {
                    let entry = entries
                        .into_iter()
                        .next()
                        .map(|re| SyncEntry::from_remote_search(SearchEntry::construct(re)));
                    if let Some(e) = entry.as_ref() {
                        self.agmt.set_raw_entry(Some(e.clone()));
                    }
                    (ConnResult::Success, entry)
                } else if is_disconnect_error(result.rc) {
                    close_connection_internal(&mut inner, &self.agmt.long_name()).await;
                    (ConnResult::NotConnected, None)
                } else {
                    (ConnResult::OperationFailed, None)
                }
            }
        }
    }
}

fn to_ldap_mods(mods: &[AttrMod]) -> Vec<Mod<String>> {
    mods.iter()
        .map(|m| {
            let values: HashSet<String> = m.values.iter().cloned().collect();
            match m.op {
                ModOp::Add => Mod::Add(m.attr.clone(), values),
                ModOp::Delete => Mod::Delete(m.attr.clone(), values),
                ModOp::Replace => Mod::Replace(m.attr.clone(), values),
            }
        })
        .collect()
}

#[async_trait]
impl RemoteDirectory for WindowsConnection {
    async fn search_entry(
        &mut self,
        base: &str,
        filter: &str,
        scope: Scope,
    ) -> (ConnResult, Option<SyncEntry>) {
        self.search_entry_ext(base, filter, scope, vec![]).await
    }

    async fn search_tombstone(&mut self, dn: &str) -> (ConnResult, Option<SyncEntry>) {
        self.search_entry_ext(dn, "(objectclass=*)", Scope::Subtree, vec![return_deleted_objects()])
            .await
    }

    async fn send_add(&mut self, dn: &str, attrs: Vec<(String, Vec<String>)>) -> ConnResult {
        let mut inner = self.inner.lock().await;
        if !inner.connected() {
            return ConnResult::NotConnected;
        }
        inner.last_operation = ConnOp::Add;
        inner.status = STATUS_PROCESSING_ADD;
        let timeout = inner.timeout;
        let add_attrs: Vec<(String, HashSet<String>)> =
            attrs.into_iter().map(|(name, vals)| (name, vals.into_iter().collect())).collect();
        let ldap = inner.ldap.as_mut().expect("connected session");
        let outcome =
            time::timeout(timeout, ldap.with_controls(manage_dsa_it()).add(dn, add_attrs)).await;
        self.finish_op(&mut inner, ConnOp::Add, "add", dn, outcome).await
    }

    async fn send_modify(&mut self, dn: &str, mods: Vec<AttrMod>) -> ConnResult {
        let mut inner = self.inner.lock().await;
        if !inner.connected() {
            return ConnResult::NotConnected;
        }
        inner.last_operation = ConnOp::Modify;
        inner.status = STATUS_PROCESSING_MODIFY;
        let timeout = inner.timeout;
        let ldap_mods = to_ldap_mods(&mods);
        let ldap = inner.ldap.as_mut().expect("connected session");
        let outcome =
            time::timeout(timeout, ldap.with_controls(manage_dsa_it()).modify(dn, ldap_mods)).await;
        self.finish_op(&mut inner, ConnOp::Modify, "modify", dn, outcome).await
    }

    async fn send_modify_bin(&mut self, dn: &str, attr: &str, value: Vec<u8>) -> ConnResult {
        let mut inner = self.inner.lock().await;
        if !inner.connected() {
            return ConnResult::NotConnected;
        }
        inner.last_operation = ConnOp::Modify;
        inner.status = STATUS_PROCESSING_MODIFY;
        let timeout = inner.timeout;
        let mods: Vec<Mod<Vec<u8>>> = vec![Mod::Replace(
            attr.as_bytes().to_vec(),
            HashSet::from([value]),
        )];
        let ldap = inner.ldap.as_mut().expect("connected session");
        let outcome =
            time::timeout(timeout, ldap.with_controls(manage_dsa_it()).modify(dn, mods)).await;
        self.finish_op(&mut inner, ConnOp::Modify, "modify", dn, outcome).await
    }

    async fn send_delete(&mut self, dn: &str) -> ConnResult {
        let mut inner = self.inner.lock().await;
        if !inner.connected() {
            return ConnResult::NotConnected;
        }
        inner.last_operation = ConnOp::Delete;
        inner.status = STATUS_PROCESSING_DELETE;
        let timeout = inner.timeout;
        let ldap = inner.ldap.as_mut().expect("connected session");
        let outcome = time::timeout(timeout, ldap.with_controls(manage_dsa_it()).delete(dn)).await;
        self.finish_op(&mut inner, ConnOp::Delete, "delete", dn, outcome).await
    }

    async fn send_rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<&str>,
        delete_old_rdn: bool,
    ) -> ConnResult {
        let mut inner = self.inner.lock().await;
        if !inner.connected() {
            return ConnResult::NotConnected;
        }
        inner.last_operation = ConnOp::Rename;
        inner.status = STATUS_PROCESSING_RENAME;
        let timeout = inner.timeout;
        let ldap = inner.ldap.as_mut().expect("connected session");
        let outcome = time::timeout(
            timeout,
            ldap.with_controls(manage_dsa_it()).modifydn(dn, new_rdn, delete_old_rdn, new_superior),
        )
        .await;
        self.finish_op(&mut inner, ConnOp::Rename, "rename", dn, outcome).await
    }

    async fn reanimate_tombstone(&mut self, tombstone_dn: &str, new_dn: &str) -> ConnResult {
        let mut inner = self.inner.lock().await;
        if !inner.connected() {
            return ConnResult::NotConnected;
        }
        inner.last_operation = ConnOp::Modify;
        inner.status = STATUS_PROCESSING_MODIFY;
        let timeout = inner.timeout;
        let mods: Vec<Mod<String>> = vec![
            Mod::Delete("isDeleted".to_owned(), HashSet::new()),
            Mod::Replace("distinguishedName".to_owned(), HashSet::from([new_dn.to_owned()])),
        ];
        let ldap = inner.ldap.as_mut().expect("connected session");
        let outcome = time::timeout(
            timeout,
            ldap.with_controls(vec![manage_dsa_it(), return_deleted_objects()])
                .modify(tombstone_dn, mods),
        )
        .await;
        self.finish_op(&mut inner, ConnOp::Modify, "modify", tombstone_dn, outcome).await
    }

    async fn send_dirsync_search(&mut self, base: &str) -> (ConnResult, Vec<SyncEntry>) {
        let mut inner = self.inner.lock().await;
        if !inner.connected() {
            return (ConnResult::NotConnected, Vec::new());
        }
        let dirsync_supported = self.supports_dirsync_locked(&mut inner).await;
        if !inner.connected() {
            return (ConnResult::NotConnected, Vec::new());
        }
        inner.last_operation = ConnOp::Search;
        inner.status = STATUS_SEARCHING;
        // An NT4 peer has no DirSync control; the full subtree is pulled
        // every pass instead.
        let ctrls = if dirsync_supported == Capability::No {
            vec![]
        } else {
            vec![self.agmt.dirsync_control()]
        };
        // Strip the search base down to its domain components: deleted
        // entries live outside the agreement container.
        let base = dn::dc_portion(base).unwrap_or_else(|| base.to_owned());
        let timeout = inner.timeout;
        let ldap = inner.ldap.as_mut().expect("connected session");
        debug!("sending dirsync search request, base {}", base);
        let outcome = time::timeout(
            timeout,
            ldap.with_controls(ctrls).search(&base, Scope::Subtree, "(objectclass=*)", vec!["*"]),
        )
        .await;
        match outcome {
            Err(_) => {
                inner.last_ldap_error = rc::TIMEOUT;
                (ConnResult::Timeout, Vec::new())
            }
            Ok(Err(e)) => {
                let code = ldap_error_rc(&e);
                inner.last_ldap_error = code;
                if is_disconnect_error(code) {
                    close_connection_internal(&mut inner, &self.agmt.long_name()).await;
                    (ConnResult::NotConnected, Vec::new())
                } else {
                    inner.status = STATUS_CONNECTED;
                    (ConnResult::OperationFailed, Vec::new())
                }
            }
            Ok(Ok(res)) => {
                let ldap3::SearchResult(entries, result) = res;
                inner.last_ldap_error = result.rc;
                inner.status = STATUS_CONNECTED;
                if result.rc != rc::SUCCESS {
                    return if is_disconnect_error(result.rc) {
                        close_connection_internal(&mut inner, &self.agmt.long_name()).await;
                        (ConnResult::NotConnected, Vec::new())
                    } else {
                        (ConnResult::OperationFailed, Vec::new())
                    };
                }
                self.agmt.update_dirsync_control(&result.ctrls);
                if self.agmt.dirsync_has_more() {
                    debug!("received hasmore from dirsync");
                }
                let converted = entries
                    .into_iter()
                    .map(|re| SyncEntry::from_remote_search(SearchEntry::construct(re)))
                    .collect();
                (ConnResult::Success, converted)
            }
        }
    }

    async fn read_entry_attribute(&mut self, dn: &str, attr: &str) -> (ConnResult, Vec<String>) {
        let mut inner = self.inner.lock().await;
        if !inner.connected() {
            return (ConnResult::NotConnected, Vec::new());
        }
        inner.last_operation = ConnOp::Search;
        inner.status = STATUS_SEARCHING;
        let timeout = inner.timeout;
        let attrs = vec![attr.to_owned()];
        let ldap = inner.ldap.as_mut().expect("connected session");
        let outcome = time::timeout(
            timeout,
            ldap.with_controls(manage_dsa_it()).search(dn, Scope::Base, "(objectclass=*)", attrs),
        )
        .await;
        match outcome {
            Err(_) => {
                inner.last_ldap_error = rc::TIMEOUT;
                (ConnResult::Timeout, Vec::new())
            }
            Ok(Err(e)) => {
                let code = ldap_error_rc(&e);
                inner.last_ldap_error = code;
                if is_disconnect_error(code) {
                    close_connection_internal(&mut inner, &self.agmt.long_name()).await;
                    (ConnResult::NotConnected, Vec::new())
                } else {
                    inner.status = STATUS_CONNECTED;
                    (ConnResult::OperationFailed, Vec::new())
                }
            }
            Ok(Ok(res)) => {
                let ldap3::SearchResult(entries, result) = res;
                inner.last_ldap_error = result.rc;
                inner.status = STATUS_CONNECTED;
                let values = entries
                    .into_iter()
                    .next()
                    .map(|re| {
                        let se = SearchEntry::construct(re);
                        se.attrs
                            .into_iter()
                            .find(|(name, _)| name.eq_ignore_ascii_case(attr))
                            .map(|(_, vals)| vals)
                            .unwrap_or_default()
                    })
                    .unwrap_or_default();
                if result.rc == rc::SUCCESS {
                    (ConnResult::Success, values)
                } else if is_disconnect_error(result.rc) {
                    close_connection_internal(&mut inner, &self.agmt.long_name()).await;
                    (ConnResult::NotConnected, Vec::new())
                } else {
                    (ConnResult::OperationFailed, Vec::new())
                }
            }
        }
    }

    async fn check_user_password(&mut self, dn: &str, password: &str) -> bool {
        // The probe runs on its own short-lived connection so the pooled
        // session keeps its agreement bind.
        let timeout = {
            let inner = self.inner.lock().await;
            inner.timeout
        };
        let settings = match self.build_settings(timeout) {
            Ok(settings) => settings,
            Err(_) => return false,
        };
        let url = self.agmt.url();
        match LdapConnAsync::with_settings(settings, url.as_str()).await {
            Ok((conn, mut ldap)) => {
                ldap3::drive!(conn);
                let bound = match time::timeout(timeout, ldap.simple_bind(dn, password)).await {
                    Ok(Ok(result)) => result.rc == rc::SUCCESS,
                    _ => false,
                };
                let _ = ldap.unbind().await;
                bound
            }
            Err(e) => {
                debug!("{}: password probe connection failed: {}", self.agmt.long_name(), e);
                false
            }
        }
    }

    async fn get_error(&self) -> (ConnOp, u32) {
        let inner = self.inner.lock().await;
        (inner.last_operation, inner.last_ldap_error)
    }

    async fn set_error(&mut self, code: u32) {
        self.inner.lock().await.last_ldap_error = code;
    }
}

#[async_trait]
impl ConnectionControl for WindowsConnection {
    async fn connect(&mut self) -> ConnResult {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await
    }

    async fn disconnect(&mut self) {
        let mut inner = self.inner.lock().await;
        close_connection_internal(&mut inner, &self.agmt.long_name()).await;
    }

    async fn start_linger(&mut self) {
        let mut inner = self.inner.lock().await;
        debug!("{}: beginning linger on the connection", self.agmt.long_name());
        if !inner.connected() {
            debug!("{}: no linger on the closed conn", self.agmt.long_name());
            return;
        }
        if inner.linger.is_some() {
            debug!("{}: linger already active on the connection", self.agmt.long_name());
            return;
        }
        inner.status = STATUS_LINGERING;
        let shared = self.inner.clone();
        let name = self.agmt.long_name();
        let linger_time = inner.linger_time;
        inner.linger = Some(tokio::spawn(async move {
            time::sleep(linger_time).await;
            let mut inner = shared.lock().await;
            if inner.linger.take().is_some() {
                debug!("{}: linger timeout has expired on the connection", name);
                close_connection_internal(&mut inner, &name).await;
            }
        }));
    }

    async fn cancel_linger(&mut self) {
        let mut inner = self.inner.lock().await;
        match inner.linger.take() {
            Some(handle) => {
                debug!("{}: cancelling linger on the connection", self.agmt.long_name());
                handle.abort();
                inner.status = STATUS_CONNECTED;
            }
            None => {
                debug!("{}: no linger to cancel on the connection", self.agmt.long_name());
            }
        }
    }

    async fn set_timeout(&mut self, timeout: Duration) {
        self.inner.lock().await.timeout = timeout;
    }

    async fn set_agmt_changed(&mut self) {
        self.inner.lock().await.flag_agmt_changed = true;
    }

    async fn replica_supports_dirsync(&mut self) -> Capability {
        let mut inner = self.inner.lock().await;
        self.supports_dirsync_locked(&mut inner).await
    }

    async fn replica_is_win2k3(&mut self) -> Capability {
        let mut inner = self.inner.lock().await;
        self.is_win2k3_locked(&mut inner).await
    }

    async fn replica_supports_ds5_repl(&mut self) -> Capability {
        let mut inner = self.inner.lock().await;
        self.supports_ds5_locked(&mut inner).await
    }

    async fn status(&self) -> &'static str {
        self.inner.lock().await.status
    }
}
