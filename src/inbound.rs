//! Inbound change application: one DirSync-returned entry at a time.
//!
//! Tombstones resolve to local deletes through the GUID embedded in the
//! tombstone DN. Live entries are re-fetched in full (DirSync deltas omit
//! attributes), then either converged onto the existing local entry —
//! rename first, attribute mods second — or created fresh when the
//! agreement allows it. Entries whose peer moved out of the agreement
//! scope are handled according to the configured move action.

use log::{debug, error, info, warn};

use crate::agreement::{Agreement, MoveAction};
use crate::connection::{ConnResult, RemoteDirectory};
use crate::dn;
use crate::entry::{AttrMod, SyncEntry};
use crate::error::SyncError;
use crate::mapper;
use crate::store::DirectoryStore;

/// Apply one DirSync result entry to the local store.
pub async fn process_dirsync_entry<R, S>(
    agmt: &Agreement,
    conn: &mut R,
    store: &S,
    e: &SyncEntry,
) -> Result<(), SyncError>
where
    R: RemoteDirectory + ?Sized,
    S: DirectoryStore + ?Sized,
{
    // The raw copy backs mod pruning and plugin-style inspection while
    // this entry is being applied.
    agmt.set_raw_entry(Some(e.clone()));

    if agmt.deleted_filter_matches(e) {
        match mapper::map_tombstone_dn_inbound(e, agmt, store).await? {
            Some(local_dn) => {
                info!(
                    "{}: deleting local entry \"{}\" for remote tombstone \"{}\"",
                    agmt.long_name(),
                    local_dn,
                    e.dn()
                );
                store.delete_entry(&local_dn).await?;
            }
            None => {
                debug!(
                    "{}: no local peer for tombstone \"{}\", dropping",
                    agmt.long_name(),
                    e.dn()
                );
            }
        }
        return Ok(());
    }

    if mapper::is_subject_of_agreement_remote(e, agmt, store).await {
        let mut entry = e.clone();
        let mut retried = false;
        loop {
            match mapper::map_entry_dn_inbound(&entry, agmt, store, true, true).await? {
                Some(local_dn) => {
                    apply_in_scope_entry(agmt, conn, store, &entry, &local_dn).await?;
                    return Ok(());
                }
                None if !retried => {
                    // An entry moved into scope arrives as a name-only
                    // stub; fetch the full entry and try again.
                    retried = true;
                    let (res, found) =
                        conn.search_entry(entry.dn(), "(objectclass=*)", ldap3::Scope::Base).await;
                    match (res, found) {
                        (ConnResult::Success, Some(full)) => entry = full,
                        _ => {
                            warn!(
                                "{}: failed to map inbound entry \"{}\"",
                                agmt.long_name(),
                                entry.dn()
                            );
                            return Ok(());
                        }
                    }
                }
                None => {
                    warn!(
                        "{}: failed to map inbound entry \"{}\"",
                        agmt.long_name(),
                        entry.dn()
                    );
                    return Ok(());
                }
            }
        }
    }

    // The remote entry is out of the agreement scope; it may have been
    // moved out while its local peer still exists.
    if let Some(local_dn) = mapper::map_entry_dn_inbound(e, agmt, store, true, true).await? {
        if let Some(local_entry) = store.entry_by_dn(&local_dn).await? {
            match agmt.move_action() {
                MoveAction::Delete => {
                    info!(
                        "{}: deleting out of scope entry \"{}\"",
                        agmt.long_name(),
                        local_dn
                    );
                    store.delete_entry(&local_dn).await?;
                }
                MoveAction::Unsync => {
                    unsync_entry(agmt, store, &local_entry).await?;
                }
                MoveAction::Ignore => {
                    warn!(
                        "{}: inbound entry \"{}\" shares a name with local entry \"{}\" but \
                         is outside the synchronized subtree \"{}\"; move it into scope or \
                         remove the sync attributes from the local entry",
                        agmt.long_name(),
                        e.dn(),
                        local_dn,
                        agmt.remote_subtree()
                    );
                }
            }
        }
    }
    Ok(())
}

async fn apply_in_scope_entry<R, S>(
    agmt: &Agreement,
    conn: &mut R,
    store: &S,
    e: &SyncEntry,
    local_dn: &str,
) -> Result<(), SyncError>
where
    R: RemoteDirectory + ?Sized,
    S: DirectoryStore + ?Sized,
{
    match store.entry_by_dn(local_dn).await? {
        Some(local_entry) => {
            // Fetch the full remote entry; the DirSync delta only carries
            // what changed, and convergence needs the rest (objectclass
            // above all).
            let (res, remote_entry) =
                conn.search_entry(e.dn(), "(objectclass=*)", ldap3::Scope::Base).await;
            match (res, remote_entry) {
                (ConnResult::Success, Some(mut remote_entry)) => {
                    remote_entry.propagate_deleted_attrs(e);
                    update_local_entry(agmt, store, &remote_entry, &local_entry).await?;
                }
                _ => {
                    error!(
                        "{}: failed to fetch inbound entry \"{}\"",
                        agmt.long_name(),
                        e.dn()
                    );
                }
            }
        }
        None => {
            if mapper::add_local_entry_allowed(agmt, e) {
                let local_entry = mapper::create_local_entry(agmt, e, local_dn)?;
                info!(
                    "{}: adding local entry \"{}\" for remote entry \"{}\"",
                    agmt.long_name(),
                    local_dn,
                    e.dn()
                );
                store.add_entry(local_entry).await?;
            } else {
                debug!(
                    "{}: not allowed to add entry \"{}\"",
                    agmt.long_name(),
                    e.dn()
                );
            }
        }
    }
    Ok(())
}

/// Converge an existing local entry onto the fresh remote copy: rename
/// and/or move first when the naming changed, then apply attribute-level
/// mods in a single local modify.
pub async fn update_local_entry<S>(
    agmt: &Agreement,
    store: &S,
    remote_entry: &SyncEntry,
    local_entry: &SyncEntry,
) -> Result<(), SyncError>
where
    S: DirectoryStore + ?Sized,
{
    // The mapped DN is the one a brand-new local entry would get; naming
    // differences against it are renames or moves that happened remotely.
    let mapped_dn = match mapper::map_entry_dn_inbound(remote_entry, agmt, store, false, false)
        .await?
    {
        Some(dn) => dn,
        None => {
            warn!(
                "{}: unable to map remote entry \"{}\" to a local dn",
                agmt.long_name(),
                remote_entry.dn()
            );
            return Ok(());
        }
    };

    let mut new_rdn: Option<String> = None;
    if mapper::is_remote_group(remote_entry) && !dn::equal(local_entry.dn(), &mapped_dn) {
        // Groups share their leaf RDN across the agreement; a differing
        // leaf means the group was renamed remotely.
        new_rdn = dn::leaf_rdn(&mapped_dn);
    }
    let new_superior = mapper::get_superior_change(agmt, local_entry.dn(), &mapped_dn, false);

    let mut current_entry = local_entry.clone();
    if new_rdn.is_some() || new_superior.is_some() {
        let rdn = match new_rdn {
            Some(rdn) => rdn,
            None => dn::leaf_rdn(local_entry.dn())
                .ok_or_else(|| SyncError::Mapping("entry with empty dn".to_owned()))?,
        };
        debug!(
            "{}: renaming entry \"{}\" (newrdn: \"{}\", newsuperior: \"{}\")",
            agmt.long_name(),
            local_entry.dn(),
            rdn,
            new_superior.as_deref().unwrap_or("(none)")
        );
        store
            .rename_entry(local_entry.dn(), &rdn, true, new_superior.as_deref())
            .await?;
        current_entry = match store.entry_by_dn(&mapped_dn).await? {
            Some(entry) => entry,
            None => {
                error!(
                    "{}: failed to fetch local entry \"{}\" after rename",
                    agmt.long_name(),
                    mapped_dn
                );
                return Ok(());
            }
        };
    }

    let mods = mapper::generate_update_mods(agmt, remote_entry, &current_entry, false);
    if mods.is_empty() {
        debug!("{}: no mods generated for \"{}\"", agmt.long_name(), current_entry.dn());
    } else {
        store.modify_entry(current_entry.dn(), &mods).await?;
    }
    Ok(())
}

/// Strip the synchronization objectclass and every `nt*` attribute from a
/// local entry, leaving it in place but no longer subject to the
/// agreement.
pub async fn unsync_entry<S>(
    agmt: &Agreement,
    store: &S,
    local_entry: &SyncEntry,
) -> Result<(), SyncError>
where
    S: DirectoryStore + ?Sized,
{
    let sync_oc = if local_entry.has_objectclass("ntuser") {
        "ntuser"
    } else if local_entry.has_objectclass("ntgroup") {
        "ntgroup"
    } else {
        return Ok(());
    };
    let mut mods = vec![AttrMod::delete("objectclass", vec![sync_oc.to_owned()])];
    for attr in local_entry.attr_names() {
        let nt_prefixed = attr
            .get(..2)
            .map(|head| head.eq_ignore_ascii_case("nt"))
            .unwrap_or(false);
        if nt_prefixed {
            mods.push(AttrMod::delete(attr, vec![]));
        }
    }
    info!(
        "{}: unsyncing entry \"{}\" (removing {} and nt* attributes)",
        agmt.long_name(),
        local_entry.dn(),
        sync_oc
    );
    store.modify_entry(local_entry.dn(), &mods).await
}

/// Run one full inbound pass: issue DirSync searches and apply every
/// returned entry, iterating while the server reports more changes.
/// Returns `false` when the search itself failed; per-entry failures are
/// logged and do not stop the pass.
pub async fn dirsync_run<R, S>(agmt: &Agreement, conn: &mut R, store: &S) -> bool
where
    R: RemoteDirectory + ?Sized,
    S: DirectoryStore + ?Sized,
{
    loop {
        let (res, entries) = conn.send_dirsync_search(&agmt.remote_subtree()).await;
        if res != ConnResult::Success {
            error!(
                "{}: failed to send dirsync search request: {:?}",
                agmt.long_name(),
                res
            );
            return false;
        }
        for entry in &entries {
            debug!("{}: received entry from dirsync: {}", agmt.long_name(), entry.dn());
            if let Err(err) = process_dirsync_entry(agmt, conn, store, entry).await {
                warn!(
                    "{}: failed to apply inbound entry \"{}\": {}",
                    agmt.long_name(),
                    entry.dn(),
                    err
                );
            }
        }
        if !agmt.dirsync_has_more() {
            return true;
        }
    }
}
