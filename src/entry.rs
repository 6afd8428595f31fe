//! Directory-neutral entry and modification types.
//!
//! Both directories are manipulated through [`SyncEntry`], an attribute
//! multimap with the quirks of DirSync result handling baked in: attribute
//! names compare case-insensitively, binary values are kept apart from
//! string values, and attributes a DirSync delta reports with an empty
//! value set are remembered as deleted-attribute markers rather than as
//! empty attributes.

use std::collections::HashMap;

use ldap3::SearchEntry;

/// AD returns these with values that are binary and, for system-only
/// multi-valued attributes, occasionally duplicated; they are of no use to
/// synchronization and break value handling, so they are dropped on
/// conversion.
const SKIPPED_REMOTE_ATTRS: [&str; 3] = ["dnsrecord", "dnsproperty", "dscorepropagationdata"];

/// Local attribute standing in for AD's `streetAddress`. The IETF schema
/// aliases `street` and `streetAddress`; Microsoft's does not, so inbound
/// values are parked under a name that cannot collide.
pub const FAKE_STREET_ATTR_NAME: &str = "in#place#of#streetaddress";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModOp {
    Add,
    Delete,
    Replace,
}

/// One attribute modification. Values keep their order; several remote
/// attributes are single-valued and only the first value may be sent.
#[derive(Clone, Debug)]
pub struct AttrMod {
    pub op: ModOp,
    pub attr: String,
    pub values: Vec<String>,
}

impl AttrMod {
    pub fn add(attr: &str, values: Vec<String>) -> AttrMod {
        AttrMod { op: ModOp::Add, attr: attr.to_owned(), values }
    }

    pub fn delete(attr: &str, values: Vec<String>) -> AttrMod {
        AttrMod { op: ModOp::Delete, attr: attr.to_owned(), values }
    }

    pub fn replace(attr: &str, values: Vec<String>) -> AttrMod {
        AttrMod { op: ModOp::Replace, attr: attr.to_owned(), values }
    }
}

#[derive(Clone, Debug)]
struct Attribute {
    /// Name as first seen, for the wire.
    name: String,
    values: Vec<String>,
}

/// An entry as the engine sees it, on either side of the agreement.
#[derive(Clone, Debug, Default)]
pub struct SyncEntry {
    dn: String,
    attrs: Vec<Attribute>,
    bin_attrs: HashMap<String, Vec<Vec<u8>>>,
    deleted_attrs: Vec<String>,
}

impl SyncEntry {
    pub fn new(dn: &str) -> SyncEntry {
        SyncEntry { dn: dn.to_owned(), ..Default::default() }
    }

    /// Convert a search result coming back from the remote peer. Skips the
    /// troublesome AD system attributes, renames `streetAddress` to the
    /// local stand-in, and records empty-valued attributes (how DirSync
    /// reports attribute deletion) as deleted-attribute markers.
    pub fn from_remote_search(se: SearchEntry) -> SyncEntry {
        let mut entry = SyncEntry::new(&se.dn);
        for (name, values) in se.attrs {
            let lower = name.to_ascii_lowercase();
            if SKIPPED_REMOTE_ATTRS.contains(&lower.as_str()) {
                continue;
            }
            let name = if lower == "streetaddress" { FAKE_STREET_ATTR_NAME.to_owned() } else { name };
            if values.is_empty() {
                entry.mark_attr_deleted(&name);
            } else {
                entry.add_values(&name, values);
            }
        }
        for (name, values) in se.bin_attrs {
            let lower = name.to_ascii_lowercase();
            if SKIPPED_REMOTE_ATTRS.contains(&lower.as_str()) {
                continue;
            }
            entry.bin_attrs.insert(name, values);
        }
        entry
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn set_dn(&mut self, dn: &str) {
        self.dn = dn.to_owned();
    }

    fn find(&self, attr: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.name.eq_ignore_ascii_case(attr))
    }

    fn find_mut(&mut self, attr: &str) -> Option<&mut Attribute> {
        self.attrs.iter_mut().find(|a| a.name.eq_ignore_ascii_case(attr))
    }

    pub fn has_attr(&self, attr: &str) -> bool {
        self.find(attr).is_some()
    }

    pub fn attr_values(&self, attr: &str) -> &[String] {
        self.find(attr).map(|a| a.values.as_slice()).unwrap_or(&[])
    }

    pub fn first_value(&self, attr: &str) -> Option<&str> {
        self.find(attr).and_then(|a| a.values.first()).map(String::as_str)
    }

    /// Case-insensitive value membership, the usual matching rule for the
    /// directory strings the engine compares (objectclass values, flags).
    pub fn has_value(&self, attr: &str, value: &str) -> bool {
        self.attr_values(attr).iter().any(|v| v.eq_ignore_ascii_case(value))
    }

    pub fn has_objectclass(&self, oc: &str) -> bool {
        self.has_value("objectclass", oc)
    }

    pub fn add_value(&mut self, attr: &str, value: &str) {
        self.add_values(attr, vec![value.to_owned()]);
    }

    pub fn add_values(&mut self, attr: &str, mut values: Vec<String>) {
        match self.find_mut(attr) {
            Some(a) => a.values.append(&mut values),
            None => self.attrs.push(Attribute { name: attr.to_owned(), values }),
        }
    }

    pub fn set_values(&mut self, attr: &str, values: Vec<String>) {
        match self.find_mut(attr) {
            Some(a) => a.values = values,
            None => self.attrs.push(Attribute { name: attr.to_owned(), values }),
        }
    }

    pub fn remove_attr(&mut self, attr: &str) {
        self.attrs.retain(|a| !a.name.eq_ignore_ascii_case(attr));
    }

    pub fn attr_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.iter().map(|a| a.name.as_str())
    }

    pub fn bin_values(&self, attr: &str) -> &[Vec<u8>] {
        self.bin_attrs
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attr))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn set_bin_values(&mut self, attr: &str, values: Vec<Vec<u8>>) {
        self.bin_attrs.insert(attr.to_owned(), values);
    }

    pub fn mark_attr_deleted(&mut self, attr: &str) {
        if !self.deleted_attrs.iter().any(|a| a.eq_ignore_ascii_case(attr)) {
            self.deleted_attrs.push(attr.to_owned());
        }
    }

    pub fn deleted_attrs(&self) -> &[String] {
        &self.deleted_attrs
    }

    /// Carry the deleted-attribute markers of a DirSync delta over to a
    /// freshly fetched full copy of the same entry.
    pub fn propagate_deleted_attrs(&mut self, delta: &SyncEntry) {
        for attr in delta.deleted_attrs() {
            self.mark_attr_deleted(attr);
        }
    }

    /// Attribute list in the shape an LDAP Add operation wants.
    pub fn to_add_attrs(&self) -> Vec<(String, Vec<String>)> {
        self.attrs
            .iter()
            .filter(|a| !a.values.is_empty())
            .map(|a| (a.name.clone(), a.values.clone()))
            .collect()
    }

    /// Apply a modification to this in-memory copy. Used to keep the
    /// cached remote entry current while a multi-mod operation is pruned,
    /// so later mods see the effect of earlier ones.
    pub fn apply_mod(&mut self, m: &AttrMod) {
        match m.op {
            ModOp::Replace => {
                if m.values.is_empty() {
                    self.remove_attr(&m.attr);
                } else {
                    self.set_values(&m.attr, m.values.clone());
                }
            }
            ModOp::Add => self.add_values(&m.attr, m.values.clone()),
            ModOp::Delete => {
                if m.values.is_empty() {
                    self.remove_attr(&m.attr);
                } else if let Some(a) = self.find_mut(&m.attr) {
                    a.values.retain(|v| !m.values.iter().any(|d| d.eq_ignore_ascii_case(v)));
                    if a.values.is_empty() {
                        self.remove_attr(&m.attr);
                    }
                }
            }
        }
    }
}
