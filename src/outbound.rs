//! Outbound replay: turn changelog operations into remote operations.
//!
//! A pass drains the changelog cursor in CSN order and issues the mapped
//! operation for each change. The pass is conflict-tolerant: errors the
//! remote has effectively already converged on are counted as skips, the
//! cursor position advances, and only transport-level trouble aborts the
//! pass. Passwords ride alongside adds and modifies and are replayed in a
//! separate step after the entry exists.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};

use crate::agreement::Agreement;
use crate::changelog::{OpPayload, OperationRecord};
use crate::connection::{ConnResult, RemoteDirectory};
use crate::dn;
use crate::entry::{AttrMod, ModOp, SyncEntry};
use crate::error::{ignore_error_and_keep_going, rc, rc_name};
use crate::events::{EventSet, EVENT_WINDOW_CLOSED};
use crate::mapper;
use crate::ruv::Ruv;
use crate::store::DirectoryStore;

/// Yield after this many changes so another supplier can acquire the
/// consumer.
pub const MAX_CHANGES_PER_SESSION: u32 = 10_000;

/// Outcome of one replay pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateResult {
    NoMoreUpdates,
    TransientError,
    FatalError,
    ScheduleWindowClosed,
    ConnectionLost,
    Timeout,
    Yield,
}

/// Drain the changelog against the consumer's update vector. Returns the
/// pass verdict and the number of changes acknowledged by the remote. The
/// consumer RUV is persisted on the way out so a restarted pass resumes
/// past everything already applied or permanently skipped.
pub async fn send_updates<R, S>(
    agmt: &Agreement,
    conn: &mut R,
    store: &S,
    remote_ruv: &Ruv,
    events: &EventSet,
    terminate: &AtomicBool,
) -> (UpdateResult, u32)
where
    R: RemoteDirectory + ?Sized,
    S: DirectoryStore + ?Sized,
{
    let mut num_changes_sent: u32 = 0;
    let mut current_ruv = remote_ruv.clone();

    let mut iterator = match store.replay_iterator(remote_ruv).await {
        Ok(iterator) => iterator,
        Err(err) => {
            error!("{}: failed to open a changelog cursor: {}", agmt.long_name(), err);
            return (UpdateResult::FatalError, 0);
        }
    };

    let mut verdict = UpdateResult::NoMoreUpdates;
    loop {
        if terminate.load(Ordering::SeqCst) {
            break;
        }
        if events.occurred(EVENT_WINDOW_CLOSED) {
            verdict = UpdateResult::ScheduleWindowClosed;
            break;
        }
        let op = match iterator.next_operation().await {
            Ok(Some(op)) => op,
            Ok(None) => {
                debug!("{}: no more updates to send", agmt.long_name());
                break;
            }
            Err(err) => {
                error!("{}: changelog cursor failed: {}", agmt.long_name(), err);
                verdict = UpdateResult::FatalError;
                break;
            }
        };
        if op.is_dummy() {
            debug!(
                "{}: changelog iteration returned a dummy entry with csn {}, skipping",
                agmt.long_name(),
                op.csn
            );
            continue;
        }

        let mut mark_record_done = false;
        match replay_update(agmt, conn, store, &op).await {
            ConnResult::Success => {
                num_changes_sent += 1;
                agmt.inc_changecount(false);
                mark_record_done = true;
            }
            ConnResult::OperationFailed => {
                let (_, code) = conn.get_error().await;
                if ignore_error_and_keep_going(code) {
                    warn!(
                        "{}: consumer failed to replay change (uniqueid {}, CSN {}): {}. Skipping.",
                        agmt.long_name(),
                        op.uniqueid,
                        op.csn,
                        rc_name(code)
                    );
                    agmt.inc_changecount(true);
                    mark_record_done = true;
                } else {
                    error!(
                        "{}: consumer failed to replay change (uniqueid {}, CSN {}): {}. \
                         Will retry later.",
                        agmt.long_name(),
                        op.uniqueid,
                        op.csn,
                        rc_name(code)
                    );
                    verdict = UpdateResult::TransientError;
                }
            }
            ConnResult::NotConnected => {
                error!(
                    "{}: consumer failed to replay change (uniqueid {}, CSN {}): \
                     connection lost. Will retry later.",
                    agmt.long_name(),
                    op.uniqueid,
                    op.csn
                );
                verdict = UpdateResult::ConnectionLost;
            }
            ConnResult::Timeout => {
                error!(
                    "{}: consumer timed out replaying change (uniqueid {}, CSN {})",
                    agmt.long_name(),
                    op.uniqueid,
                    op.csn
                );
                verdict = UpdateResult::Timeout;
            }
            ConnResult::LocalError | ConnResult::Busy | ConnResult::TlsNotEnabled => {
                error!(
                    "{}: failed to replay change (uniqueid {}, CSN {}): local error. \
                     Will retry later.",
                    agmt.long_name(),
                    op.uniqueid,
                    op.csn
                );
                verdict = UpdateResult::TransientError;
            }
        }

        if mark_record_done {
            // Bring the consumer's vector up to date so a restart resumes
            // past this change.
            current_ruv.force_csn_update(op.csn);
        } else {
            break;
        }

        if num_changes_sent >= MAX_CHANGES_PER_SESSION {
            verdict = UpdateResult::Yield;
            break;
        }
    }

    if let Err(err) = store.save_consumer_ruv(&agmt.long_name(), &current_ruv).await {
        error!("{}: failed to save the consumer RUV: {}", agmt.long_name(), err);
    }
    (verdict, num_changes_sent)
}

/// Replay one changelog operation against the remote peer.
pub async fn replay_update<R, S>(
    agmt: &Agreement,
    conn: &mut R,
    store: &S,
    op: &OperationRecord,
) -> ConnResult
where
    R: RemoteDirectory + ?Sized,
    S: DirectoryStore + ?Sized,
{
    let local_subtree = agmt.local_subtree();

    // Tombstone lookups are restricted to delete operations; searching
    // tombstones for everything gets expensive as they accumulate.
    let lookup = if matches!(op.payload, OpPayload::Delete) {
        store.tombstone_by_uniqueid(&local_subtree, &op.uniqueid).await
    } else {
        store.entry_by_uniqueid(&local_subtree, &op.uniqueid).await
    };

    let mut payload = op.payload.clone();
    let mut is_ours_force = false;
    let local_entry = match lookup {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            if matches!(payload, OpPayload::ModRdn { .. }) {
                // The entry was renamed out of the synchronized subtree;
                // find it anywhere and remove its remote peer.
                match store.entry_by_uniqueid("", &op.uniqueid).await {
                    Ok(Some(entry)) => {
                        payload = OpPayload::Delete;
                        is_ours_force = true;
                        entry
                    }
                    _ => {
                        warn!(
                            "{}: failed to fetch local entry for {} operation dn=\"{}\"",
                            agmt.long_name(),
                            op.payload.kind(),
                            op.dn
                        );
                        return ConnResult::Success;
                    }
                }
            } else {
                if mapper::is_dn_subject_of_agreement_local(&op.dn, agmt) {
                    warn!(
                        "{}: failed to fetch local entry for {} operation dn=\"{}\"",
                        agmt.long_name(),
                        op.payload.kind(),
                        op.dn
                    );
                } else {
                    debug!(
                        "{}: looking at {} operation local dn=\"{}\" (not ours)",
                        agmt.long_name(),
                        op.payload.kind(),
                        op.dn
                    );
                }
                return ConnResult::Success;
            }
        }
        Err(err) => {
            error!("{}: local lookup failed for \"{}\": {}", agmt.long_name(), op.dn, err);
            return ConnResult::LocalError;
        }
    };

    let is_ours = is_ours_force || mapper::is_subject_of_agreement_local(&local_entry, agmt);
    let is_user = mapper::is_local_user(&local_entry);
    let is_group = mapper::is_local_group(&local_entry);
    debug!(
        "{}: looking at {} operation local dn=\"{}\" ({},{},{})",
        agmt.long_name(),
        payload.kind(),
        op.dn,
        if is_ours { "ours" } else { "not ours" },
        if is_user { "user" } else { "not user" },
        if is_group { "group" } else { "not group" }
    );
    if !is_ours || (!is_user && !is_group) {
        return ConnResult::Success;
    }

    let (remote_dn, missing_entry) =
        match mapper::map_entry_dn_outbound(&local_entry, agmt, conn, true).await {
            mapper::OutboundDn::Mapped { dn, missing } => (dn, missing),
            mapper::OutboundDn::ConnFailure(res) => return res,
            mapper::OutboundDn::OutOfScope | mapper::OutboundDn::Unmappable => {
                mapper::warn_unmapped(agmt, payload.kind(), &op.dn);
                return ConnResult::Success;
            }
        };
    debug!(
        "{}: processing {} operation local dn=\"{}\" remote dn=\"{}\"",
        agmt.long_name(),
        payload.kind(),
        op.dn,
        remote_dn
    );

    let mut password: Option<String> = None;
    let mut effective_dn = remote_dn.clone();
    let is_delete = matches!(payload, OpPayload::Delete);

    let mut return_value = match &payload {
        OpPayload::Add(add_entry) => {
            let (res, pw, dn) = process_replay_add(
                agmt,
                conn,
                add_entry,
                &local_entry,
                &remote_dn,
                is_user,
                missing_entry,
            )
            .await;
            password = pw;
            effective_dn = dn;
            res
        }
        OpPayload::Modify(mods) => {
            let mut result = ConnResult::Success;
            // A modify that bolts the sync objectclass onto an existing
            // entry is the entry's first appearance remotely: add first.
            if sync_attrs_added(mods, &local_entry) {
                let (res, pw, dn) = process_replay_add(
                    agmt,
                    conn,
                    &local_entry,
                    &local_entry,
                    &remote_dn,
                    is_user,
                    missing_entry,
                )
                .await;
                info!(
                    "{}: the modify operation added the sync objectclass, so the entry \
                     was added to the peer - result {:?}",
                    agmt.long_name(),
                    res
                );
                if res != ConnResult::Success {
                    return res;
                }
                password = pw;
                effective_dn = dn;
                // The mod mapping needs the new remote entry cached.
                let _ = conn
                    .search_entry(&effective_dn, "(objectclass=*)", ldap3::Scope::Base)
                    .await;
            }

            let (mapped_mods, pw) = mapper::map_mods_for_replay(agmt, mods, is_user);
            if pw.is_some() {
                password = pw;
            }

            // A change to the naming attribute that drops the value the
            // remote RDN is built from forces a rename first.
            let remote_cn = remote_rdn_value(agmt, conn, &effective_dn).await;
            if let Some(new_rdn) =
                mapper::check_mods_for_rdn_change(mods, &local_entry, remote_cn.as_deref())
            {
                info!(
                    "{}: renaming remote entry \"{}\" with new RDN of \"{}\"",
                    agmt.long_name(),
                    effective_dn,
                    new_rdn
                );
                result = conn.send_rename(&effective_dn, &new_rdn, None, true).await;
            }

            if mapped_mods.is_empty() {
                debug!(
                    "{}: mapping produced no mods for \"{}\", nothing to replay",
                    agmt.long_name(),
                    effective_dn
                );
            } else {
                result = conn.send_modify(&effective_dn, mapped_mods).await;
            }
            result
        }
        OpPayload::Delete => {
            if mapper::delete_remote_entry_allowed(&local_entry) {
                if missing_entry {
                    debug!(
                        "{}: remote entry doesn't exist, skipping delete of \"{}\"",
                        agmt.long_name(),
                        remote_dn
                    );
                    ConnResult::Success
                } else {
                    let res = conn.send_delete(&remote_dn).await;
                    debug!(
                        "{}: deleted remote entry \"{}\", result {:?}",
                        agmt.long_name(),
                        remote_dn,
                        res
                    );
                    res
                }
            } else {
                debug!(
                    "{}: delete not allowed on remote entry \"{}\"",
                    agmt.long_name(),
                    remote_dn
                );
                ConnResult::Success
            }
        }
        OpPayload::ModRdn { new_rdn, delete_old_rdn, new_superior } => {
            if missing_entry {
                // The rename target never made it to the peer; create it.
                let (res, pw, dn) = process_replay_add(
                    agmt,
                    conn,
                    &local_entry,
                    &local_entry,
                    &remote_dn,
                    is_user,
                    missing_entry,
                )
                .await;
                password = pw;
                effective_dn = dn;
                res
            } else {
                let res = process_replay_rename(
                    agmt,
                    conn,
                    &local_entry,
                    &op.dn,
                    &remote_dn,
                    new_rdn,
                    new_superior.as_deref(),
                    *delete_old_rdn,
                    is_user,
                    is_group,
                )
                .await;
                if res == ConnResult::OperationFailed {
                    let (_, code) = conn.get_error().await;
                    if code == rc::NO_SUCH_OBJECT {
                        let (res, pw, dn) = process_replay_add(
                            agmt,
                            conn,
                            &local_entry,
                            &local_entry,
                            &remote_dn,
                            is_user,
                            missing_entry,
                        )
                        .await;
                        password = pw;
                        effective_dn = dn;
                        res
                    } else {
                        res
                    }
                } else {
                    res
                }
            }
        }
    };

    if let Some(password) = password.as_deref() {
        // A GUID-form DN cannot be used for the password probe bind;
        // resolve the natural DN first.
        let pw_result = if mapper::is_guid_dn(&effective_dn) {
            match mapper::map_entry_dn_outbound(&local_entry, agmt, conn, false).await {
                mapper::OutboundDn::Mapped { dn, .. } => {
                    send_password_modify(agmt, conn, &dn, password).await
                }
                _ => ConnResult::OperationFailed,
            }
        } else {
            send_password_modify(agmt, conn, &effective_dn, password).await
        };
        if pw_result != ConnResult::Success {
            warn!(
                "{}: password update for \"{}\" returned {:?}",
                agmt.long_name(),
                effective_dn,
                pw_result
            );
        }
        return_value = pw_result;
    }

    // A new or newly-passworded user must be flipped to a normal, enabled
    // account, or the peer leaves it unusable.
    if !is_delete
        && return_value == ConnResult::Success
        && (password.is_some() || missing_entry)
        && is_user
    {
        return_value = send_accountcontrol_modify(agmt, conn, &effective_dn, missing_entry).await;
    }

    return_value
}

/// Current value of the remote naming attribute, from the cached raw entry
/// when available.
async fn remote_rdn_value<R>(agmt: &Agreement, conn: &mut R, remote_dn: &str) -> Option<String>
where
    R: RemoteDirectory + ?Sized,
{
    if let Some(raw) = agmt.raw_entry() {
        if let Some(cn) = raw.first_value("cn") {
            return Some(cn.to_owned());
        }
    }
    let (res, entry) = conn.search_entry(remote_dn, "(objectclass=*)", ldap3::Scope::Base).await;
    if res != ConnResult::Success {
        return None;
    }
    entry.and_then(|e| e.first_value("cn").map(str::to_owned))
}

/// Does this mod set graft the sync objectclass onto the entry, and does
/// the entry still carry it?
pub fn sync_attrs_added(mods: &[AttrMod], local_entry: &SyncEntry) -> bool {
    let added = mods.iter().any(|m| {
        matches!(m.op, ModOp::Add | ModOp::Replace)
            && m.attr.eq_ignore_ascii_case("objectclass")
            && m.values
                .iter()
                .any(|v| v.eq_ignore_ascii_case("ntuser") || v.eq_ignore_ascii_case("ntgroup"))
    });
    added && mapper::add_remote_entry_allowed(local_entry)
}

/// Replay an add. When the mapped DN is a GUID form whose entry is gone, a
/// tombstone reanimation is attempted first; on success the add collapses
/// into a convergence modify of the revived entry. Returns the result, a
/// captured password, and the DN the entry ended up under.
async fn process_replay_add<R>(
    agmt: &Agreement,
    conn: &mut R,
    add_entry: &SyncEntry,
    local_entry: &SyncEntry,
    remote_dn: &str,
    is_user: bool,
    missing_entry: bool,
) -> (ConnResult, Option<String>, String)
where
    R: RemoteDirectory + ?Sized,
{
    let mut effective_dn = remote_dn.to_owned();
    let remote_add_allowed = mapper::add_remote_entry_allowed(local_entry);
    debug!(
        "{}: process_replay_add: dn=\"{}\" ({}, {})",
        agmt.long_name(),
        remote_dn,
        if missing_entry { "not present" } else { "already present" },
        if remote_add_allowed { "add allowed" } else { "add not allowed" }
    );

    if missing_entry {
        let mut reanimated = false;
        if mapper::is_guid_dn(remote_dn) {
            debug!(
                "{}: dn=\"{}\" appears to have been deleted on the remote side, \
                 searching for a tombstone",
                agmt.long_name(),
                remote_dn
            );
            let (tombstone_dn, tombstone_exists) =
                mapper::map_windows_tombstone_dn(local_entry, agmt, conn).await;
            let cn = local_entry
                .first_value("cn")
                .or_else(|| local_entry.first_value("ntUserDomainId"));
            if let Some(cn) = cn {
                let container = dn::container(local_entry.dn(), &agmt.local_subtree());
                let new_dn = format!(
                    "cn={},{}{}",
                    dn::maybe_quote_value(cn),
                    container,
                    agmt.remote_subtree()
                );
                if let (Some(tombstone_dn), true) = (tombstone_dn, tombstone_exists) {
                    info!(
                        "{}: reanimating tombstone (dn=\"{}\") to normal entry (dn=\"{}\")",
                        agmt.long_name(),
                        tombstone_dn,
                        new_dn
                    );
                    if conn.reanimate_tombstone(&tombstone_dn, &new_dn).await
                        == ConnResult::Success
                    {
                        reanimated = true;
                    } else {
                        info!(
                            "{}: reanimation of tombstone (dn=\"{}\") failed; a new entry \
                             (dn=\"{}\") will be added instead",
                            agmt.long_name(),
                            tombstone_dn,
                            new_dn
                        );
                    }
                }
                // Either way the GUID DN is no longer usable.
                effective_dn = new_dn;
            }
        }

        if reanimated {
            let res = modify_existing_remote(agmt, conn, &effective_dn, local_entry, is_user).await;
            return (res, None, effective_dn);
        }

        if !remote_add_allowed {
            return (ConnResult::Success, None, effective_dn);
        }
        let (mapped_entry, password) = match mapper::create_remote_entry(agmt, add_entry, &effective_dn)
        {
            Ok(created) => created,
            Err(err) => {
                error!(
                    "{}: failed to create mapped entry dn=\"{}\": {}",
                    agmt.long_name(),
                    effective_dn,
                    err
                );
                return (ConnResult::LocalError, None, effective_dn);
            }
        };
        info!(
            "{}: attempting to add entry \"{}\" to the peer for local entry \"{}\"",
            agmt.long_name(),
            effective_dn,
            local_entry.dn()
        );
        let res = conn.send_add(&effective_dn, mapped_entry.to_add_attrs()).await;
        if res != ConnResult::Success {
            warn!("{}: cannot replay add operation", agmt.long_name());
        }
        (res, password, effective_dn)
    } else {
        let res = modify_existing_remote(agmt, conn, &effective_dn, local_entry, is_user).await;
        (res, None, effective_dn)
    }
}

/// Converge an existing remote entry onto the local one.
async fn modify_existing_remote<R>(
    agmt: &Agreement,
    conn: &mut R,
    remote_dn: &str,
    local_entry: &SyncEntry,
    _is_user: bool,
) -> ConnResult
where
    R: RemoteDirectory + ?Sized,
{
    let (res, remote_entry) =
        conn.search_entry(remote_dn, "(objectclass=*)", ldap3::Scope::Base).await;
    if res != ConnResult::Success {
        return res;
    }
    let remote_entry = match remote_entry {
        Some(entry) => entry,
        None => return ConnResult::Success,
    };
    let mods = mapper::generate_update_mods(agmt, local_entry, &remote_entry, true);
    if mods.is_empty() {
        debug!("{}: no mods generated for remote entry \"{}\"", agmt.long_name(), remote_dn);
        return ConnResult::Success;
    }
    debug!("{}: modifying remote entry \"{}\"", agmt.long_name(), remote_dn);
    conn.send_modify(remote_entry.dn(), mods).await
}

/// Replay a rename. Users are re-anchored on their current `cn` (the peer
/// names users by cn); groups keep the operation's RDN verbatim. The new
/// superior is the operation's target parent carried across the subtree
/// roots.
#[allow(clippy::too_many_arguments)]
async fn process_replay_rename<R>(
    agmt: &Agreement,
    conn: &mut R,
    local_entry: &SyncEntry,
    local_orig_dn: &str,
    remote_dn: &str,
    new_rdn: &str,
    new_superior: Option<&str>,
    delete_old_rdn: bool,
    is_user: bool,
    is_group: bool,
) -> ConnResult
where
    R: RemoteDirectory + ?Sized,
{
    if !is_user && !is_group {
        return ConnResult::OperationFailed;
    }
    let local_subtree = agmt.local_subtree();
    let remote_subtree = agmt.remote_subtree();

    // Without an explicit new superior the entry stays under its parent.
    let new_parent = match new_superior {
        Some(sup) => sup.to_owned(),
        None => match dn::parent(local_orig_dn) {
            Some(parent) => parent,
            None => return ConnResult::OperationFailed,
        },
    };
    let remote_superior = match dn::substitute_suffix(&new_parent, &local_subtree, &remote_subtree)
    {
        Some(sup) => sup,
        None => {
            warn!(
                "{}: new superior \"{}\" is not in the local subtree \"{}\"",
                agmt.long_name(),
                new_parent,
                local_subtree
            );
            return ConnResult::OperationFailed;
        }
    };

    let remote_rdn = if is_user {
        match local_entry.first_value("cn") {
            Some(cn) => format!("cn={}", dn::maybe_quote_value(cn)),
            None => {
                warn!(
                    "{}: local entry \"{}\" has no cn to rename by",
                    agmt.long_name(),
                    local_entry.dn()
                );
                return ConnResult::OperationFailed;
            }
        }
    } else {
        new_rdn.to_owned()
    };

    // Renaming through the GUID form is unreliable. The DN lookup cached
    // the live remote entry moments ago; rename its real DN, falling back
    // to reconstruction from the pre-rename local parent.
    let rename_target = if mapper::is_guid_dn(remote_dn) {
        match agmt.raw_entry() {
            Some(raw) if !mapper::is_guid_dn(raw.dn()) => raw.dn().to_owned(),
            _ => {
                let local_parent = match dn::parent(local_orig_dn) {
                    Some(parent) => parent,
                    None => return ConnResult::OperationFailed,
                };
                match dn::substitute_suffix(&local_parent, &local_subtree, &remote_subtree) {
                    Some(parent) => format!("{},{}", remote_rdn, parent),
                    None => {
                        conn.set_error(rc::NO_SUCH_OBJECT).await;
                        return ConnResult::OperationFailed;
                    }
                }
            }
        }
    } else {
        remote_dn.to_owned()
    };

    conn.send_rename(&rename_target, &remote_rdn, Some(&remote_superior), delete_old_rdn).await
}

/// Replay a password change. The peer's current credential is probed
/// first: a password change that originated remotely would otherwise be
/// played back, doubling it in the peer's password history.
pub async fn send_password_modify<R>(
    agmt: &Agreement,
    conn: &mut R,
    target_dn: &str,
    password: &str,
) -> ConnResult
where
    R: RemoteDirectory + ?Sized,
{
    if target_dn.is_empty() || password.is_empty() {
        return ConnResult::OperationFailed;
    }
    if agmt.is_nt4() {
        // The NT4 service takes the plaintext directly.
        return conn
            .send_modify(target_dn, vec![AttrMod::replace("UnicodePwd", vec![password.to_owned()])])
            .await;
    }
    if conn.check_user_password(target_dn, password).await {
        debug!(
            "{}: peer already has the current password for {}, not sending password modify",
            agmt.long_name(),
            target_dn
        );
        return ConnResult::Success;
    }
    let encoded = mapper::encode_unicode_pwd(password);
    conn.send_modify_bin(target_dn, "unicodePwd", encoded).await
}

/// Userland account-control bit for a normal account.
const UF_NORMAL_ACCOUNT: u64 = 0x0200;
/// Bit marking a disabled account.
const UF_ACCOUNT_DISABLE: u64 = 0x2;

/// Set the normal-account bit on the peer entry, clearing the disabled bit
/// for freshly created entries. The attribute is a bit array, so existing
/// bits are fetched and preserved.
pub async fn send_accountcontrol_modify<R>(
    agmt: &Agreement,
    conn: &mut R,
    target_dn: &str,
    missing_entry: bool,
) -> ConnResult
where
    R: RemoteDirectory + ?Sized,
{
    let (_, entry) = conn.search_entry(target_dn, "(objectclass=*)", ldap3::Scope::Base).await;
    let mut acctval: u64 = entry
        .as_ref()
        .and_then(|e| e.first_value("userAccountControl"))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if missing_entry {
        debug!("{}: new entry \"{}\" will be enabled", agmt.long_name(), target_dn);
        acctval &= !UF_ACCOUNT_DISABLE;
    }
    acctval |= UF_NORMAL_ACCOUNT;
    conn.send_modify(
        target_dn,
        vec![AttrMod::replace("userAccountControl", vec![acctval.to_string()])],
    )
    .await
}

/// Push one local entry during a total refresh: create the peer entry if
/// it is absent, converge it otherwise. GUID-form DNs are not used here;
/// the walk visits live entries only. Benign convergence errors are
/// tolerated so one stubborn entry cannot abort the refresh.
pub async fn process_total_entry<R>(agmt: &Agreement, conn: &mut R, e: &SyncEntry) -> ConnResult
where
    R: RemoteDirectory + ?Sized,
{
    if !mapper::is_subject_of_agreement_local(e, agmt) {
        debug!("{}: total update: \"{}\" is not ours", agmt.long_name(), e.dn());
        return ConnResult::Success;
    }
    let is_user = mapper::is_local_user(e);
    match mapper::map_entry_dn_outbound(e, agmt, conn, false).await {
        mapper::OutboundDn::Mapped { dn, missing } => {
            let (mut res, _password, effective_dn) =
                process_replay_add(agmt, conn, e, e, &dn, is_user, missing).await;
            if res == ConnResult::OperationFailed {
                let (_, code) = conn.get_error().await;
                if ignore_error_and_keep_going(code) {
                    res = ConnResult::Success;
                }
            }
            if res == ConnResult::Success && missing && is_user {
                res = send_accountcontrol_modify(agmt, conn, &effective_dn, missing).await;
            }
            res
        }
        mapper::OutboundDn::ConnFailure(res) => res,
        mapper::OutboundDn::OutOfScope | mapper::OutboundDn::Unmappable => {
            mapper::warn_unmapped(agmt, "total update", e.dn());
            ConnResult::Success
        }
    }
}
