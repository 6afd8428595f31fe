//! Schema and DN translation between the local directory and the peer.
//!
//! The attribute maps are data: static tables keyed by entity kind and
//! direction, applied by a handful of lookup functions. Everything else in
//! here is the machinery around them — GUID normalization, tombstone DN
//! parsing and synthesis, outbound/inbound DN mapping, entry construction
//! for first-time creation, and modify mapping with pruning against the
//! cached remote entry.

use std::collections::HashSet;

use lazy_static::lazy_static;
use ldap3::{ldap_escape, Scope};
use log::{debug, warn};
use nom::bytes::complete::take_until;
use nom::character::complete::char as nom_char;
use nom::IResult;

use crate::agreement::Agreement;
use crate::connection::{ConnResult, RemoteDirectory};
use crate::dn;
use crate::entry::{AttrMod, ModOp, SyncEntry, FAKE_STREET_ATTR_NAME};
use crate::error::SyncError;
use crate::store::{DirectoryStore, FindOutcome};

/// AD limits `initials` to this many characters.
pub const AD_INITIALS_LENGTH: usize = 6;
/// Storage-scheme prefix marking a cleartext password value.
pub const PASSWD_CLEAR_PREFIX: &str = "{clear}";
/// Pseudo-attribute carrying the unhashed password alongside a change.
pub const UNHASHED_PASSWORD_ATTR: &str = "unhashed#user#password";
pub const NTUNIQUEID_LENGTH: usize = 32;
pub const AD_GUID_LENGTH: usize = 36;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapDirection {
    Bidirectional,
    ToRemoteOnly,
    FromRemoteOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Always,
    /// Filled in when creating a new entry, never changed afterwards.
    CreateOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrKind {
    Value,
    DnValued,
}

pub struct AttributeMapping {
    pub remote_name: &'static str,
    pub local_name: &'static str,
    pub direction: MapDirection,
    pub when: CreateMode,
    pub kind: AttrKind,
}

macro_rules! map_row {
    ($remote:expr, $local:expr, $dir:ident, $when:ident, $kind:ident) => {
        AttributeMapping {
            remote_name: $remote,
            local_name: $local,
            direction: MapDirection::$dir,
            when: CreateMode::$when,
            kind: AttrKind::$kind,
        }
    };
}

pub static USER_ATTRIBUTE_MAP: &[AttributeMapping] = &[
    map_row!("homeDirectory", "ntUserHomeDir", Bidirectional, Always, Value),
    map_row!("scriptPath", "ntUserScriptPath", Bidirectional, Always, Value),
    map_row!("lastLogon", "ntUserLastLogon", FromRemoteOnly, Always, Value),
    map_row!("lastLogoff", "ntUserLastLogoff", FromRemoteOnly, Always, Value),
    map_row!("accountExpires", "ntUserAcctExpires", Bidirectional, Always, Value),
    map_row!("codePage", "ntUserCodePage", Bidirectional, Always, Value),
    map_row!("logonHours", "ntUserLogonHours", Bidirectional, Always, Value),
    map_row!("maxStorage", "ntUserMaxStorage", Bidirectional, Always, Value),
    map_row!("profilePath", "ntUserProfile", Bidirectional, Always, Value),
    // The IETF schema aliases street and streetAddress; Microsoft's does
    // not, hence the asymmetric pair.
    map_row!("streetAddress", "street", ToRemoteOnly, Always, Value),
    map_row!(FAKE_STREET_ATTR_NAME, "street", FromRemoteOnly, Always, Value),
    map_row!("userParameters", "ntUserParms", Bidirectional, Always, Value),
    map_row!("userWorkstations", "ntUserWorkstations", Bidirectional, Always, Value),
    map_row!("sAMAccountName", "ntUserDomainId", Bidirectional, Always, Value),
    // AD anchors on cn. Outbound it is create-only; inbound, where the
    // naming attribute is uid, changes are safe to accept.
    map_row!("cn", "cn", ToRemoteOnly, CreateOnly, Value),
    map_row!("name", "cn", FromRemoteOnly, Always, Value),
    map_row!("manager", "manager", Bidirectional, Always, DnValued),
    map_row!("seeAlso", "seeAlso", Bidirectional, Always, DnValued),
];

pub static GROUP_ATTRIBUTE_MAP: &[AttributeMapping] = &[
    map_row!("groupType", "ntGroupType", Bidirectional, CreateOnly, Value),
    map_row!("sAMAccountName", "ntUserDomainId", Bidirectional, Always, Value),
    map_row!("streetAddress", "street", ToRemoteOnly, Always, Value),
    map_row!(FAKE_STREET_ATTR_NAME, "street", FromRemoteOnly, Always, Value),
    map_row!("member", "uniqueMember", Bidirectional, Always, DnValued),
];

static USER_MATCHING_ATTRIBUTES: &[&str] = &[
    "description",
    "destinationIndicator",
    "facsimileTelephoneNumber",
    "givenName",
    "homePhone",
    "homePostalAddress",
    "initials",
    "l",
    "mail",
    "mobile",
    "o",
    "ou",
    "pager",
    "physicalDeliveryOfficeName",
    "postOfficeBox",
    "postalAddress",
    "postalCode",
    "registeredAddress",
    "sn",
    "st",
    "telephoneNumber",
    "teletexTerminalIdentifier",
    "telexNumber",
    "title",
    "userCertificate",
    "x121Address",
];

static GROUP_MATCHING_ATTRIBUTES: &[&str] = &[
    "description",
    "destinationIndicator",
    "facsimileTelephoneNumber",
    "givenName",
    "homePhone",
    "homePostalAddress",
    "initials",
    "l",
    "mail",
    "manager",
    "mobile",
    "o",
    "ou",
    "pager",
    "physicalDeliveryOfficeName",
    "postOfficeBox",
    "postalAddress",
    "postalCode",
    "preferredDeliveryMethod",
    "registeredAddress",
    "sn",
    "st",
    "telephoneNumber",
    "teletexTerminalIdentifier",
    "telexNumber",
    "title",
    "userCertificate",
    "x121Address",
];

static NT4_USER_MATCHING_ATTRIBUTES: &[&str] = &["description"];
static NT4_GROUP_MATCHING_ATTRIBUTES: &[&str] = &["description"];

/// Attributes that are single-valued on the remote side while the local
/// schema allows multiple values.
static SINGLE_VALUED_REMOTE_ATTRIBUTES: &[&str] = &[
    "facsimileTelephoneNumber",
    "givenName",
    "homePhone",
    "homePostalAddress",
    "initials",
    "l",
    "mail",
    "mobile",
    "pager",
    "physicalDeliveryOfficeName",
    "postalCode",
    "sn",
    "st",
    "street",
    FAKE_STREET_ATTR_NAME,
    "streetAddress",
    "telephoneNumber",
    "title",
];

lazy_static! {
    static ref SINGLE_VALUED_SET: HashSet<String> = SINGLE_VALUED_REMOTE_ATTRIBUTES
        .iter()
        .map(|a| a.to_ascii_lowercase())
        .collect();
    static ref USER_MATCHING_SET: HashSet<String> =
        USER_MATCHING_ATTRIBUTES.iter().map(|a| a.to_ascii_lowercase()).collect();
    static ref GROUP_MATCHING_SET: HashSet<String> =
        GROUP_MATCHING_ATTRIBUTES.iter().map(|a| a.to_ascii_lowercase()).collect();
    static ref NT4_USER_MATCHING_SET: HashSet<String> =
        NT4_USER_MATCHING_ATTRIBUTES.iter().map(|a| a.to_ascii_lowercase()).collect();
    static ref NT4_GROUP_MATCHING_SET: HashSet<String> =
        NT4_GROUP_MATCHING_ATTRIBUTES.iter().map(|a| a.to_ascii_lowercase()).collect();
}

pub fn is_straight_mapped_attr(attr: &str, is_user: bool, is_nt4: bool) -> bool {
    let set = match (is_user, is_nt4) {
        (true, false) => &*USER_MATCHING_SET,
        (true, true) => &*NT4_USER_MATCHING_SET,
        (false, false) => &*GROUP_MATCHING_SET,
        (false, true) => &*NT4_GROUP_MATCHING_SET,
    };
    set.contains(&attr.to_ascii_lowercase())
}

pub fn is_single_valued_attr(attr: &str) -> bool {
    SINGLE_VALUED_SET.contains(&attr.to_ascii_lowercase())
}

/// Map an attribute name across the agreement. `to_remote` selects the
/// direction, `is_create` enables the create-only rows. Returns the mapped
/// name and whether the attribute is DN-valued.
pub fn map_attr_name(
    attr: &str,
    to_remote: bool,
    is_user: bool,
    is_create: bool,
) -> Option<(String, bool)> {
    let table = if is_user { USER_ATTRIBUTE_MAP } else { GROUP_ATTRIBUTE_MAP };
    for row in table {
        let our_name = if to_remote { row.local_name } else { row.remote_name };
        let their_name = if to_remote { row.remote_name } else { row.local_name };
        if !attr.eq_ignore_ascii_case(our_name) {
            continue;
        }
        if !is_create && row.when == CreateMode::CreateOnly {
            continue;
        }
        let direction_ok = match row.direction {
            MapDirection::Bidirectional => true,
            MapDirection::ToRemoteOnly => to_remote,
            MapDirection::FromRemoteOnly => !to_remote,
        };
        if direction_ok {
            return Some((their_name.to_owned(), row.kind == AttrKind::DnValued));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// GUID handling

/// Lowercase hex rendering of a binary GUID, the form stored in
/// `ntUniqueId`.
pub fn guid_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn dedash_guid(guid: &str) -> String {
    guid.chars().filter(|c| *c != '-').collect()
}

/// Insert dashes into a 32-hex GUID to obtain the 8-4-4-4-12 form used in
/// DNs. Anything of the wrong length is rejected.
pub fn dash_guid(guid: &str) -> Option<String> {
    if guid.len() != NTUNIQUEID_LENGTH {
        return None;
    }
    let mut out = String::with_capacity(AD_GUID_LENGTH);
    for (i, c) in guid.chars().enumerate() {
        if i == 8 || i == 12 || i == 16 || i == 20 {
            out.push('-');
        }
        out.push(c);
    }
    Some(out)
}

/// The GUID inside a tombstone DN comes back byte-shuffled; this fixed
/// permutation recovers the canonical order. It is an involution, so the
/// same call produces the shuffled form for tombstone DN synthesis.
pub fn permute_guid(guid: &str) -> String {
    const OFFSETS: [usize; 32] = [
        6, 7, 4, 5, 2, 3, 0, 1, 10, 11, 8, 9, 14, 15, 12, 13, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31,
    ];
    let bytes = guid.as_bytes();
    if bytes.len() != NTUNIQUEID_LENGTH {
        return guid.to_owned();
    }
    OFFSETS.iter().map(|&i| bytes[i] as char).collect()
}

fn guid_in_tombstone_dn(i: &str) -> IResult<&str, &str> {
    let (i, _) = take_until(":")(i)?;
    let (i, _) = nom_char(':')(i)?;
    take_until(",")(i)
}

/// Pull the canonical 32-hex GUID out of a tombstone DN of the form
/// `CN=<name>\0ADEL:<dashed-guid>,CN=Deleted Objects,...`.
pub fn extract_guid_from_tombstone_dn(dn: &str) -> Option<String> {
    match guid_in_tombstone_dn(dn) {
        Ok((_, raw)) => {
            let guid = dedash_guid(raw);
            if guid.len() == NTUNIQUEID_LENGTH {
                Some(permute_guid(&guid))
            } else {
                None
            }
        }
        Err(_) => None,
    }
}

pub fn is_guid_dn(dn: &str) -> bool {
    dn.get(..6).map(|head| head.eq_ignore_ascii_case("<GUID=")).unwrap_or(false)
}

pub fn make_guid_dn(guid: &str, is_nt4: bool, suffix: &str) -> String {
    if is_nt4 {
        format!("GUID={},{}", guid, suffix)
    } else {
        format!("<GUID={}>", guid)
    }
}

/// GUID of a remote entry, in the form stored locally. NT4 puts a SID
/// string in `objectGUID`, kept verbatim; AD returns the binary GUID.
pub fn extract_guid_from_entry(e: &SyncEntry, is_nt4: bool) -> Option<String> {
    if is_nt4 {
        return e.first_value("objectGUID").map(str::to_owned);
    }
    e.bin_values("objectGUID").first().map(|bytes| guid_to_hex(bytes))
}

// ---------------------------------------------------------------------------
// Entry kind and policy checks

pub fn is_local_user(e: &SyncEntry) -> bool {
    e.has_objectclass("ntuser")
}

pub fn is_local_group(e: &SyncEntry) -> bool {
    e.has_objectclass("ntgroup")
}

pub fn is_remote_user(e: &SyncEntry) -> bool {
    e.has_objectclass("person")
}

pub fn is_remote_group(e: &SyncEntry) -> bool {
    e.has_objectclass("group")
}

/// Whether this local entry may be created on the remote side.
pub fn add_remote_entry_allowed(e: &SyncEntry) -> bool {
    let (is_user, is_group) = (is_local_user(e), is_local_group(e));
    if is_user == is_group {
        return false;
    }
    let flag = if is_user { "ntUserCreateNewAccount" } else { "ntGroupCreateNewGroup" };
    e.has_value(flag, "true")
}

/// Whether this local entry's remote peer may be deleted.
pub fn delete_remote_entry_allowed(e: &SyncEntry) -> bool {
    let (is_user, is_group) = (is_local_user(e), is_local_group(e));
    if is_user == is_group {
        return false;
    }
    let flag = if is_user { "ntUserDeleteAccount" } else { "ntGroupDeleteGroup" };
    e.has_value(flag, "true")
}

/// Whether the agreement permits creating a local copy of this remote
/// entry.
pub fn add_local_entry_allowed(agmt: &Agreement, e: &SyncEntry) -> bool {
    if is_remote_user(e) {
        agmt.sync_new_users()
    } else if is_remote_group(e) {
        agmt.sync_new_groups()
    } else {
        false
    }
}

/// In the local subtree and of a synchronized kind?
pub fn is_subject_of_agreement_local(e: &SyncEntry, agmt: &Agreement) -> bool {
    dn::in_subtree(e.dn(), &agmt.local_subtree()) && (is_local_user(e) || is_local_group(e))
}

pub fn is_dn_subject_of_agreement_local(target: &str, agmt: &Agreement) -> bool {
    dn::in_subtree(target, &agmt.local_subtree())
}

/// In the remote subtree, with a parent the agreement can see: either the
/// subtree root itself, or a container whose mapped local entry exists.
pub async fn is_subject_of_agreement_remote<S: DirectoryStore + ?Sized>(
    e: &SyncEntry,
    agmt: &Agreement,
    store: &S,
) -> bool {
    let remote_subtree = agmt.remote_subtree();
    if !dn::in_subtree(e.dn(), &remote_subtree) {
        return false;
    }
    let parent = match dn::parent(e.dn()) {
        Some(parent) => parent,
        None => return false,
    };
    if dn::equal(&parent, &remote_subtree) {
        return true;
    }
    let local_parent =
        match dn::substitute_suffix(&parent, &remote_subtree, &agmt.local_subtree()) {
            Some(dn) => dn,
            None => return false,
        };
    matches!(store.entry_by_dn(&local_parent).await, Ok(Some(_)))
}

pub fn extract_ntuserdomainid(e: &SyncEntry) -> Option<String> {
    e.first_value("ntUserDomainId").map(str::to_owned)
}

pub fn extract_username_from_entry(e: &SyncEntry) -> Option<String> {
    e.first_value("samAccountName").map(str::to_owned)
}

// ---------------------------------------------------------------------------
// DN-valued attribute values

/// Map DN-valued attribute values (group members, manager links) across
/// the agreement by suffix substitution. Values outside the source
/// subtree are dropped; with `return_originals` the surviving values are
/// returned unmapped, which restricts a value set to agreement scope.
pub fn map_dn_values(
    agmt: &Agreement,
    values: &[String],
    to_remote: bool,
    return_originals: bool,
) -> Vec<String> {
    let (from, to) = if to_remote {
        (agmt.local_subtree(), agmt.remote_subtree())
    } else {
        (agmt.remote_subtree(), agmt.local_subtree())
    };
    values
        .iter()
        .filter_map(|v| {
            dn::substitute_suffix(v, &from, &to)
                .map(|mapped| if return_originals { v.clone() } else { mapped })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Outbound DN mapping

#[derive(Debug)]
pub enum OutboundDn {
    Mapped { dn: String, missing: bool },
    /// The peer entry exists but has left the agreement scope.
    OutOfScope,
    /// Could not talk to the peer; retry the operation later.
    ConnFailure(ConnResult),
    /// The local entry carries nothing to map from.
    Unmappable,
}

/// Given a non-tombstone local entry, find or synthesize the DN of its
/// remote peer. With `want_guid` and a recorded GUID the `<GUID=...>` form
/// is preferred so tombstone reanimation can run; when the GUID lookup
/// misses on a pre-Win2k3 peer the DN falls back to a CN-based form.
pub async fn map_entry_dn_outbound<R: RemoteDirectory + ?Sized>(
    e: &SyncEntry,
    agmt: &Agreement,
    conn: &mut R,
    want_guid: bool,
) -> OutboundDn {
    let is_nt4 = agmt.is_nt4();
    let suffix = agmt.remote_subtree();
    let guid = e.first_value("ntUniqueId").map(str::to_owned);
    debug!(
        "{}: mapping outbound dn for \"{}\" guid={}",
        agmt.long_name(),
        e.dn(),
        guid.as_deref().unwrap_or("(none)")
    );

    if let (Some(guid), true) = (guid, want_guid) {
        let guid_dn = make_guid_dn(&guid, is_nt4, &suffix);
        let (res, remote_entry) = conn.search_entry(&guid_dn, "(objectclass=*)", Scope::Base).await;
        if res != ConnResult::Success {
            return OutboundDn::ConnFailure(res);
        }
        match remote_entry {
            Some(remote_entry) => {
                if !dn::in_subtree(remote_entry.dn(), &suffix) {
                    // The remote entry was moved out from under the
                    // agreement.
                    return OutboundDn::OutOfScope;
                }
                OutboundDn::Mapped { dn: guid_dn, missing: false }
            }
            None => {
                // A recorded GUID without a live remote entry: deleted on
                // the peer, or re-added locally with a stale ntUniqueId.
                if agmt.is_win2k3() {
                    OutboundDn::Mapped { dn: guid_dn, missing: true }
                } else {
                    match synthesized_remote_dn(e, agmt) {
                        Some(dn) => OutboundDn::Mapped { dn, missing: true },
                        None => OutboundDn::Unmappable,
                    }
                }
            }
        }
    } else {
        let username = match extract_ntuserdomainid(e) {
            Some(username) => username,
            None => return OutboundDn::Unmappable,
        };
        let filter = format!("(samAccountName={})", ldap_escape(&username));
        let (res, remote_entry) = conn.search_entry(&suffix, &filter, Scope::Subtree).await;
        if res != ConnResult::Success {
            return OutboundDn::ConnFailure(res);
        }
        match remote_entry {
            Some(remote_entry) => {
                OutboundDn::Mapped { dn: remote_entry.dn().to_owned(), missing: false }
            }
            None => match synthesized_remote_dn(e, agmt) {
                Some(dn) => OutboundDn::Mapped { dn, missing: true },
                None => OutboundDn::Unmappable,
            },
        }
    }
}

/// Remote DN a brand-new peer entry would get: the preserved container
/// chain under the remote subtree with a cn (samaccountname on NT4) leaf.
fn synthesized_remote_dn(e: &SyncEntry, agmt: &Agreement) -> Option<String> {
    let is_nt4 = agmt.is_nt4();
    let name = if is_nt4 {
        e.first_value("ntUserDomainId")
    } else {
        e.first_value("cn").or_else(|| e.first_value("ntUserDomainId"))
    }?;
    let container = dn::container(e.dn(), &agmt.local_subtree());
    let rdn_attr = if is_nt4 { "samaccountname" } else { "cn" };
    Some(format!(
        "{}={},{}{}",
        rdn_attr,
        dn::maybe_quote_value(name),
        container,
        agmt.remote_subtree()
    ))
}

// ---------------------------------------------------------------------------
// Inbound DN mapping

/// Given a remote tombstone, find its local peer by the GUID embedded in
/// the tombstone DN. `None` when there is nothing to delete locally.
pub async fn map_tombstone_dn_inbound<S: DirectoryStore + ?Sized>(
    e: &SyncEntry,
    agmt: &Agreement,
    store: &S,
) -> Result<Option<String>, SyncError> {
    let guid = match extract_guid_from_tombstone_dn(e.dn()) {
        Some(guid) => guid,
        None => return Ok(None),
    };
    match store.find_by_attr(&agmt.local_subtree(), "ntUniqueId", &guid).await? {
        FindOutcome::Found(local) => Ok(Some(local.dn().to_owned())),
        FindOutcome::NotFound => Ok(None),
        FindOutcome::NotUnique => Err(SyncError::NotUnique),
    }
}

/// Given a live remote entry, find its local peer or synthesize the DN it
/// would get. `use_guid`/`use_username` select the lookup phases; both off
/// yields the purely synthesized DN, used to detect renames.
pub async fn map_entry_dn_inbound<S: DirectoryStore + ?Sized>(
    e: &SyncEntry,
    agmt: &Agreement,
    store: &S,
    use_guid: bool,
    use_username: bool,
) -> Result<Option<String>, SyncError> {
    let is_nt4 = agmt.is_nt4();

    if use_guid {
        if let Some(guid) = extract_guid_from_entry(e, is_nt4) {
            match store.find_by_attr(&agmt.local_subtree(), "ntUniqueId", &guid).await? {
                FindOutcome::Found(local) => return Ok(Some(local.dn().to_owned())),
                FindOutcome::NotFound => {}
                FindOutcome::NotUnique => return Err(SyncError::NotUnique),
            }
        } else {
            debug!("{}: remote entry \"{}\" has no guid", agmt.long_name(), e.dn());
        }
    }

    let username = extract_username_from_entry(e);
    if use_username {
        if let Some(username) = username.as_deref() {
            match store.find_by_attr(&agmt.local_subtree(), "ntUserDomainId", username).await? {
                FindOutcome::Found(local) => return Ok(Some(local.dn().to_owned())),
                FindOutcome::NotFound => {}
                FindOutcome::NotUnique => return Err(SyncError::NotUnique),
            }
        }
    }

    // No local match: invent the DN a fresh entry would get, preserving
    // the container chain between the leaf and the remote subtree.
    let username = match username {
        Some(username) => username,
        None => return Ok(None),
    };
    let container = dn::container(e.dn(), &agmt.remote_subtree());
    let rdn_attr = if is_remote_user(e) { "uid" } else { "cn" };
    Ok(Some(format!(
        "{}={},{}{}",
        rdn_attr,
        dn::maybe_quote_value(&username),
        container,
        agmt.local_subtree()
    )))
}

/// Map a local entry to the DN its remote tombstone would carry and probe
/// whether that tombstone exists.
pub async fn map_windows_tombstone_dn<R: RemoteDirectory + ?Sized>(
    e: &SyncEntry,
    agmt: &Agreement,
    conn: &mut R,
) -> (Option<String>, bool) {
    let cn = e.first_value("cn").or_else(|| e.first_value("ntUserDomainId"));
    let guid = e
        .first_value("ntUniqueId")
        .map(|g| permute_guid(g))
        .and_then(|g| dash_guid(&g));
    // Tombstones live directly under the deleted-objects container of the
    // naming context; containers are discarded.
    let suffix = dn::dc_portion(&agmt.remote_subtree());
    match (cn, guid, suffix) {
        (Some(cn), Some(guid), Some(suffix)) => {
            let tombstone_dn = format!("cn={}\\0ADEL:{},cn=Deleted Objects,{}", cn, guid, suffix);
            let (_, tombstone) = conn.search_tombstone(&tombstone_dn).await;
            let exists = tombstone.is_some();
            (Some(tombstone_dn), exists)
        }
        _ => {
            debug!(
                "{}: failed to map dn=\"{}\" to a tombstone dn",
                agmt.long_name(),
                e.dn()
            );
            (None, false)
        }
    }
}

// ---------------------------------------------------------------------------
// Password handling

/// Recover a cleartext password from its stored form: a `{clear}`-prefixed
/// value or an unprefixed cleartext. Hashed values cannot be synchronized
/// and yield `None`.
pub fn extract_password(value: &str) -> Option<String> {
    if value.starts_with('{') {
        if value.contains('}') {
            let prefixed = value
                .get(..PASSWD_CLEAR_PREFIX.len())
                .map(|head| head.eq_ignore_ascii_case(PASSWD_CLEAR_PREFIX))
                .unwrap_or(false);
            if prefixed && value.len() > PASSWD_CLEAR_PREFIX.len() {
                return Some(value[PASSWD_CLEAR_PREFIX.len()..].to_owned());
            }
            debug!("password value is already hashed, not syncing");
            return None;
        }
        // A '{' with no closing brace: a cleartext password that just
        // happens to start with the brace character.
        return Some(value.to_owned());
    }
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

/// The quoted UTF-16LE rendering AD expects in `unicodePwd`.
pub fn encode_unicode_pwd(password: &str) -> Vec<u8> {
    let quoted = format!("\"{}\"", password);
    let mut out = Vec::with_capacity(quoted.len() * 2);
    for unit in quoted.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

// ---------------------------------------------------------------------------
// Entry construction

fn truncate_to_first(values: &mut Vec<String>) {
    if values.len() > 1 {
        values.truncate(1);
    }
}

fn trim_initials(values: &mut [String]) {
    for v in values.iter_mut() {
        if v.len() > AD_INITIALS_LENGTH {
            debug!("trimming initials attribute to {} characters", AD_INITIALS_LENGTH);
            let mut cut = AD_INITIALS_LENGTH;
            while !v.is_char_boundary(cut) {
                cut -= 1;
            }
            v.truncate(cut);
        }
    }
}

/// Build the remote entry for a first-time outbound create, streaming the
/// local attributes through the map. A captured cleartext password is
/// returned separately; it must be replayed after the add.
pub fn create_remote_entry(
    agmt: &Agreement,
    local_entry: &SyncEntry,
    remote_dn: &str,
) -> Result<(SyncEntry, Option<String>), SyncError> {
    let is_user = is_local_user(local_entry);
    let is_nt4 = agmt.is_nt4();
    let mut password = None;

    let username = extract_ntuserdomainid(local_entry)
        .ok_or_else(|| SyncError::Mapping(format!("entry {} has no ntUserDomainId", local_entry.dn())))?;

    let mut new_entry = SyncEntry::new(remote_dn);
    if is_user {
        new_entry.add_values(
            "objectclass",
            vec!["top".into(), "person".into(), "organizationalPerson".into(), "user".into()],
        );
        new_entry.add_value(
            "userPrincipalName",
            &format!("{}@{}", username, agmt.windows_domain()),
        );
    } else {
        new_entry.add_values("objectclass", vec!["top".into(), "group".into()]);
    }

    for attr in local_entry.attr_names().map(str::to_owned).collect::<Vec<_>>() {
        let mut values: Vec<String> = local_entry.attr_values(&attr).to_vec();
        if is_straight_mapped_attr(&attr, is_user, is_nt4) {
            if is_single_valued_attr(&attr) {
                truncate_to_first(&mut values);
            }
            if attr.eq_ignore_ascii_case("initials") {
                trim_initials(&mut values);
            }
            new_entry.add_values(&attr, values);
        } else if let Some((new_type, is_dn_valued)) = map_attr_name(&attr, true, is_user, true) {
            if is_dn_valued {
                let mapped = map_dn_values(agmt, &values, true, false);
                if !mapped.is_empty() {
                    new_entry.add_values(&new_type, mapped);
                }
            } else {
                // cn and streetAddress are single-valued on the remote in
                // addition to anything the single-valued set says.
                if is_single_valued_attr(&new_type)
                    || new_type.eq_ignore_ascii_case("cn")
                    || new_type.eq_ignore_ascii_case("streetAddress")
                {
                    truncate_to_first(&mut values);
                }
                if new_type.eq_ignore_ascii_case("initials") {
                    trim_initials(&mut values);
                }
                new_entry.add_values(&new_type, values);
            }
        } else if attr.eq_ignore_ascii_case(UNHASHED_PASSWORD_ATTR) {
            if let Some(value) = local_entry.first_value(&attr) {
                password = extract_password(value);
            }
        }
    }

    // NT4 requires groupType; default new groups to global.
    if is_nt4 && !is_user && !new_entry.has_attr("groupType") {
        new_entry.add_value("groupType", "2");
    }

    Ok((new_entry, password))
}

/// Build the local entry for a first-time inbound create.
pub fn create_local_entry(
    agmt: &Agreement,
    remote_entry: &SyncEntry,
    local_dn: &str,
) -> Result<SyncEntry, SyncError> {
    let is_user = is_remote_user(remote_entry);
    let is_nt4 = agmt.is_nt4();
    let username = extract_username_from_entry(remote_entry)
        .ok_or_else(|| SyncError::Mapping(format!("entry {} has no samAccountName", remote_entry.dn())))?;

    let mut local_entry = SyncEntry::new(local_dn);
    if is_user {
        local_entry.add_values(
            "objectclass",
            vec![
                "top".into(),
                "person".into(),
                "organizationalPerson".into(),
                "inetOrgPerson".into(),
                "ntUser".into(),
            ],
        );
        local_entry.add_value("ntUserDeleteAccount", "true");
        local_entry.add_value("uid", &username);
    } else {
        local_entry.add_values(
            "objectclass",
            vec!["top".into(), "groupOfUniqueNames".into(), "ntGroup".into()],
        );
        local_entry.add_value("ntGroupDeleteGroup", "true");
        local_entry.add_value("cn", &username);
    }

    for attr in remote_entry.attr_names().map(str::to_owned).collect::<Vec<_>>() {
        let values: Vec<String> = remote_entry.attr_values(&attr).to_vec();
        if is_straight_mapped_attr(&attr, is_user, is_nt4) {
            local_entry.add_values(&attr, values);
        } else if let Some((new_type, is_dn_valued)) = map_attr_name(&attr, false, is_user, true) {
            if is_dn_valued {
                let mapped = map_dn_values(agmt, &values, false, false);
                if !mapped.is_empty() {
                    local_entry.add_values(&new_type, mapped);
                }
            } else {
                local_entry.add_values(&new_type, values);
            }
        }
    }

    match extract_guid_from_entry(remote_entry, is_nt4) {
        Some(guid) => local_entry.set_values("ntUniqueId", vec![guid]),
        None => {
            return Err(SyncError::Mapping(format!(
                "failed to extract the guid from remote entry {}",
                remote_entry.dn()
            )))
        }
    }

    // NT4 users have no surname; satisfy the person objectclass.
    if is_nt4 && is_user && !local_entry.has_attr("sn") {
        local_entry.add_value("sn", &username);
    }

    Ok(local_entry)
}

// ---------------------------------------------------------------------------
// Modify mapping

/// Discard the parts of a mod the remote entry already reflects: add
/// values already present, delete values already absent, deletes of absent
/// attributes. Kept mods are applied to the cached copy so later mods in
/// the same operation see their effect. Returns `false` when the whole mod
/// should be dropped.
fn mod_still_needed(m: &mut AttrMod, ad_entry: &mut Option<SyncEntry>) -> bool {
    let entry = match ad_entry {
        Some(entry) => entry,
        // No cached remote copy; send as-is and let the peer sort it out.
        None => return true,
    };
    let keep = match m.op {
        ModOp::Add => {
            m.values.retain(|v| !entry.has_value(&m.attr, v));
            if m.values.is_empty() {
                debug!("remote entry attr [{}] already has all values - will not send", m.attr);
                false
            } else {
                true
            }
        }
        ModOp::Delete => {
            if !entry.has_attr(&m.attr) {
                debug!("remote entry attr [{}] already deleted - will not send", m.attr);
                false
            } else if m.values.is_empty() {
                true
            } else {
                m.values.retain(|v| entry.has_value(&m.attr, v));
                if m.values.is_empty() {
                    debug!(
                        "remote entry attr [{}] had all mod values removed - will not send",
                        m.attr
                    );
                    false
                } else {
                    true
                }
            }
        }
        ModOp::Replace => true,
    };
    if keep {
        entry.apply_mod(m);
    }
    keep
}

/// Map the modifications of a local modify operation for replay against
/// the remote peer. Returns the pruned mod list and any captured cleartext
/// password.
pub fn map_mods_for_replay(
    agmt: &Agreement,
    mods: &[AttrMod],
    is_user: bool,
) -> (Vec<AttrMod>, Option<String>) {
    let is_nt4 = agmt.is_nt4();
    let mut ad_entry = agmt.raw_entry();
    let mut mapped: Vec<AttrMod> = Vec::new();
    let mut password = None;

    for m in mods {
        let mut out: Option<AttrMod> = None;
        if is_straight_mapped_attr(&m.attr, is_user, is_nt4) {
            let mut new_mod = m.clone();
            if is_single_valued_attr(&m.attr) {
                truncate_to_first(&mut new_mod.values);
            }
            if m.attr.eq_ignore_ascii_case("initials") {
                trim_initials(&mut new_mod.values);
            }
            out = Some(new_mod);
        } else if let Some((mapped_type, is_dn_valued)) = map_attr_name(&m.attr, true, is_user, false)
        {
            if is_dn_valued {
                let values = map_dn_values(agmt, &m.values, true, false);
                if !values.is_empty() {
                    out = Some(AttrMod { op: m.op.clone(), attr: mapped_type, values });
                } else if m.op == ModOp::Delete {
                    // A delete of the whole attribute carries no values.
                    out = Some(AttrMod::delete(&mapped_type, vec![]));
                }
            } else {
                let mut new_mod = m.clone();
                new_mod.attr = mapped_type;
                if is_single_valued_attr(&new_mod.attr) {
                    truncate_to_first(&mut new_mod.values);
                }
                out = Some(new_mod);
            }
        } else if m.attr.eq_ignore_ascii_case(UNHASHED_PASSWORD_ATTR) {
            if let Some(value) = m.values.first() {
                password = extract_password(value);
            }
        }

        if let Some(mut new_mod) = out {
            if mod_still_needed(&mut new_mod, &mut ad_entry) {
                mapped.push(new_mod);
            }
        }
    }

    (mapped, password)
}

/// Detect a modify that invalidates the remote RDN: the value AD names the
/// entry by is being replaced away or deleted. Returns the new RDN to
/// rename to first.
pub fn check_mods_for_rdn_change(
    mods: &[AttrMod],
    local_entry: &SyncEntry,
    remote_rdn_value: Option<&str>,
) -> Option<String> {
    let remote_value = remote_rdn_value?;
    let mut need_rename = false;
    let mut new_rdn: Option<String> = None;

    for m in mods {
        if !m.attr.eq_ignore_ascii_case("cn") {
            continue;
        }
        match m.op {
            ModOp::Replace => {
                // The rename is needed unless the value AD has survives
                // the replace.
                if m.values.iter().any(|v| v.eq_ignore_ascii_case(remote_value)) {
                    new_rdn = None;
                    need_rename = false;
                } else if let Some(first) = m.values.first() {
                    new_rdn = Some(format!("cn={}", first));
                    need_rename = false;
                }
            }
            ModOp::Delete => {
                if m.values.is_empty()
                    || m.values.iter().any(|v| v.eq_ignore_ascii_case(remote_value))
                {
                    need_rename = true;
                }
            }
            ModOp::Add => {
                if need_rename {
                    if let Some(first) = m.values.first() {
                        new_rdn = Some(format!("cn={}", first));
                        need_rename = false;
                    }
                }
            }
        }
    }

    if need_rename {
        // The deleting mod had no replacement in this operation; fall back
        // to whatever the local entry is left with.
        if let Some(value) = local_entry.first_value("cn") {
            new_rdn = Some(format!("cn={}", value));
        }
    }
    new_rdn
}

fn values_equal(a: &[String], b: &[String], prefix: usize) -> bool {
    if a.len() != b.len() {
        return false;
    }
    values_present(a, b, prefix)
}

/// All values of `a` present in `b`, comparing at most `prefix` leading
/// characters when `prefix` is non-zero.
fn values_present(a: &[String], b: &[String], prefix: usize) -> bool {
    a.iter().all(|va| {
        b.iter().any(|vb| {
            if prefix == 0 || va.len() < prefix || vb.len() < prefix {
                va.eq_ignore_ascii_case(vb)
            } else {
                va.is_char_boundary(prefix)
                    && vb.is_char_boundary(prefix)
                    && va[..prefix].eq_ignore_ascii_case(&vb[..prefix])
            }
        })
    })
}

/// Generate the modifications that bring `target` into line with `source`.
/// Used in both directions: `to_remote` selects the map direction and
/// which side's single-valued constraints apply. The caller applies the
/// result to the target side in one modify.
pub fn generate_update_mods(
    agmt: &Agreement,
    source: &SyncEntry,
    target: &SyncEntry,
    to_remote: bool,
) -> Vec<AttrMod> {
    let is_nt4 = agmt.is_nt4();
    let is_user = if to_remote { is_local_user(source) } else { is_remote_user(source) };
    let mut mods: Vec<AttrMod> = Vec::new();

    for attr in source.attr_names().map(str::to_owned).collect::<Vec<_>>() {
        let mut values: Vec<String> = source.attr_values(&attr).to_vec();
        let mut is_guid = false;
        let mut is_dn_valued = false;

        let target_type = if !to_remote && attr.eq_ignore_ascii_case("objectGuid") {
            is_guid = true;
            Some("ntUniqueId".to_owned())
        } else if is_straight_mapped_attr(&attr, is_user, is_nt4) {
            Some(attr.clone())
        } else {
            match map_attr_name(&attr, to_remote, is_user, false) {
                Some((name, dn_valued)) => {
                    is_dn_valued = dn_valued;
                    Some(name)
                }
                None => None,
            }
        };
        let target_type = match target_type {
            Some(t) => t,
            None => continue,
        };

        // The converted remote entry stores streetAddress under the local
        // stand-in name.
        let lookup_type = if to_remote && target_type.eq_ignore_ascii_case("streetAddress") {
            FAKE_STREET_ATTR_NAME
        } else {
            target_type.as_str()
        };
        let present = target.has_attr(lookup_type);

        if present && !is_guid {
            if !is_dn_valued {
                let target_values = target.attr_values(lookup_type);
                let equal = if !to_remote && attr.eq_ignore_ascii_case("name") {
                    values_present(&values, target_values, 0)
                } else if attr.eq_ignore_ascii_case("initials") {
                    values_present(&values, target_values, AD_INITIALS_LENGTH)
                } else if !to_remote && is_single_valued_attr(&attr) {
                    values_present(&values, target_values, 0)
                } else if to_remote && is_single_valued_attr(&attr) {
                    values_present(target_values, &values, 0)
                } else {
                    values_equal(&values, target_values, 0)
                };
                if !equal {
                    debug!(
                        "generate_update_mods: {}, {}: values are different",
                        target.dn(),
                        target_type
                    );
                    if to_remote && is_single_valued_attr(&target_type) {
                        truncate_to_first(&mut values);
                    }
                    if to_remote && target_type.eq_ignore_ascii_case("initials") {
                        trim_initials(&mut values);
                    }
                    mods.push(AttrMod::replace(&target_type, values));
                }
            } else {
                // DN-valued attributes converge value by value, ignoring
                // values outside the agreement scope on either side.
                let mapped_source = map_dn_values(agmt, &values, to_remote, false);
                let target_values: Vec<String> = target.attr_values(lookup_type).to_vec();
                let restricted_target = map_dn_values(agmt, &target_values, !to_remote, true);
                for value in &mapped_source {
                    if !restricted_target.iter().any(|t| dn::equal(t, value)) {
                        mods.push(AttrMod::add(&target_type, vec![value.clone()]));
                    }
                }
                for value in &restricted_target {
                    if !mapped_source.iter().any(|s| dn::equal(s, value)) {
                        mods.push(AttrMod::delete(&target_type, vec![value.clone()]));
                    }
                }
            }
        } else if !present {
            debug!(
                "generate_update_mods: {}, {}: values not present on peer entry",
                target.dn(),
                target_type
            );
            if is_guid {
                if let Some(guid) = extract_guid_from_entry(source, is_nt4) {
                    mods.push(AttrMod::add(&target_type, vec![guid]));
                }
            } else if is_dn_valued {
                let mapped = map_dn_values(agmt, &values, to_remote, false);
                if !mapped.is_empty() {
                    mods.push(AttrMod::add(&target_type, mapped));
                }
            } else {
                if to_remote && is_single_valued_attr(&target_type) {
                    truncate_to_first(&mut values);
                }
                if to_remote && target_type.eq_ignore_ascii_case("initials") {
                    trim_initials(&mut values);
                }
                mods.push(AttrMod::add(&target_type, values));
            }
        }
    }

    // A binary objectGUID never shows up in the string-attribute walk;
    // record it as ntUniqueId on first sight.
    if !to_remote && !target.has_attr("ntUniqueId") && !source.has_attr("objectGUID") {
        if let Some(guid) = extract_guid_from_entry(source, is_nt4) {
            mods.push(AttrMod::add("ntUniqueId", vec![guid]));
        }
    }

    // Attributes the source entry reports as deleted come off the target.
    for attr in source.deleted_attrs() {
        let target_type = if is_straight_mapped_attr(attr, is_user, is_nt4) {
            Some(attr.clone())
        } else {
            map_attr_name(attr, to_remote, is_user, false).map(|(name, _)| name)
        };
        if let Some(target_type) = target_type {
            if target.has_attr(&target_type) {
                debug!("generate_update_mods: deleting {} attribute from peer entry", target_type);
                mods.push(AttrMod::delete(&target_type, vec![]));
            }
        }
    }

    mods
}

/// Compare the parents of a local DN and its mapped peer DN; when they
/// differ, return the new superior on the side selected by `to_remote`.
pub fn get_superior_change(
    agmt: &Agreement,
    local_dn: &str,
    mapped_dn: &str,
    to_remote: bool,
) -> Option<String> {
    if dn::equal(local_dn, mapped_dn) {
        return None;
    }
    let local_subtree = agmt.local_subtree();
    let remote_subtree = agmt.remote_subtree();
    let local_parent = dn::parent(local_dn)?;
    let mapped_parent = dn::parent(mapped_dn)?;
    // Compare the container chains relative to their subtree roots.
    let local_container =
        dn::substitute_suffix(&local_parent, &local_subtree, "")?.to_ascii_lowercase();
    let mapped_container =
        dn::substitute_suffix(&mapped_parent, &local_subtree, "")?.to_ascii_lowercase();
    if local_container == mapped_container {
        return None;
    }
    if to_remote {
        dn::substitute_suffix(&local_parent, &local_subtree, &remote_subtree)
    } else {
        Some(mapped_parent)
    }
}

/// Escape-print a DN for operator-facing log lines.
pub fn escape_dn_for_log(target: &str) -> String {
    target.escape_default().to_string()
}

pub fn warn_unmapped(agmt: &Agreement, op: &str, target: &str) {
    warn!(
        "{}: failed to map dn for {} operation dn=\"{}\"",
        agmt.long_name(),
        op,
        escape_dn_for_log(target)
    );
}
