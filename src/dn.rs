//! Small distinguished-name helpers.
//!
//! Enough DN surgery for suffix substitution, scope tests and container
//! extraction: splitting on unescaped separators, normalizing for
//! comparison, taking parents and leaf RDNs. Full DN syntax (multi-valued
//! RDNs, hex escapes) is not needed here; backslash escapes are honored.

/// Split a DN into its RDN components, respecting backslash escapes.
pub fn split_rdns(dn: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut escaped = false;
    for c in dn.chars() {
        if escaped {
            cur.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                cur.push(c);
                escaped = true;
            }
            ',' => {
                parts.push(cur.trim().to_owned());
                cur = String::new();
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() || !parts.is_empty() {
        parts.push(cur.trim().to_owned());
    }
    parts
}

/// Normalized form for comparisons: trimmed components, lowercased,
/// single-comma separated.
pub fn normalize(dn: &str) -> String {
    split_rdns(dn)
        .iter()
        .map(|rdn| rdn.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn equal(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Parent DN, or `None` for a single-component DN.
pub fn parent(dn: &str) -> Option<String> {
    let parts = split_rdns(dn);
    if parts.len() < 2 {
        return None;
    }
    Some(parts[1..].join(","))
}

/// Leaf RDN as written.
pub fn leaf_rdn(dn: &str) -> Option<String> {
    split_rdns(dn).into_iter().next()
}

/// Leaf RDN split into attribute type and value; quotes around the value
/// are dropped.
pub fn leaf_rdn_pair(dn: &str) -> Option<(String, String)> {
    let rdn = leaf_rdn(dn)?;
    let (attr, value) = rdn.split_once('=')?;
    Some((attr.trim().to_owned(), value.trim().trim_matches('"').to_owned()))
}

/// Subtree scope test: is `dn` the suffix entry itself or below it?
pub fn in_subtree(dn: &str, suffix: &str) -> bool {
    let ndn = normalize(dn);
    let nsuffix = normalize(suffix);
    if ndn == nsuffix {
        return true;
    }
    ndn.ends_with(&format!(",{}", nsuffix))
}

/// Quote an RDN value only when it contains DN metacharacters; plain
/// values stay unquoted so synthesized DNs compare cleanly against
/// normalized ones.
pub fn maybe_quote_value(value: &str) -> String {
    let needs_quoting = value.starts_with(' ')
        || value.ends_with(' ')
        || value.chars().any(|c| matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';'));
    if needs_quoting && !(value.starts_with('"') && value.ends_with('"')) {
        format!("\"{}\"", value)
    } else {
        value.to_owned()
    }
}

/// The portion of `dn` strictly between its leaf RDN and `suffix`, as a
/// comma-terminated prefix usable in DN synthesis ("" when the entry sits
/// directly under the suffix).
pub fn container(dn: &str, suffix: &str) -> String {
    if !in_subtree(dn, suffix) {
        return String::new();
    }
    let total = split_rdns(dn);
    let suffix_len = split_rdns(suffix).len();
    if total.len() <= suffix_len + 1 {
        return String::new();
    }
    let mut out = String::new();
    for rdn in &total[1..total.len() - suffix_len] {
        match rdn.split_once('=') {
            Some((attr, value)) => {
                out.push_str(attr.trim());
                out.push('=');
                out.push_str(&maybe_quote_value(value.trim().trim_matches('"')));
                out.push(',');
            }
            None => {
                out.push_str(rdn);
                out.push(',');
            }
        }
    }
    out
}

/// Replace the `from` suffix of `dn` with `to`. Returns `None` when `dn`
/// is not within `from`.
pub fn substitute_suffix(dn: &str, from: &str, to: &str) -> Option<String> {
    if !in_subtree(dn, from) {
        return None;
    }
    let total = split_rdns(dn);
    let from_len = split_rdns(from).len();
    if total.len() == from_len {
        return Some(to.to_owned());
    }
    let mut head = total[..total.len() - from_len].join(",");
    head.push(',');
    head.push_str(to);
    Some(head)
}

/// First component of the suffix consisting only of domain components,
/// i.e. the DN trimmed down to its `dc=` tail.
pub fn dc_portion(dn: &str) -> Option<String> {
    let parts = split_rdns(dn);
    let pos = parts
        .iter()
        .position(|rdn| rdn.to_ascii_lowercase().starts_with("dc="))?;
    Some(parts[pos..].join(","))
}
