//! Request controls and OIDs the engine puts on the wire.
//!
//! The DirSync control value is a BER sequence in both directions; only the
//! meaning of the integers differs between request and response, so a single
//! struct covers both, with `DirSync::parse()` used on the response side.

use bytes::BytesMut;
use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structures::{ASNTag, Integer, OctetString, Sequence, Tag};
use lber::universal::Types;
use lber::write;
use ldap3::controls::{ControlParser, MakeCritical, RawControl};

/// Manage DSA IT (RFC 3296); attached to every outbound operation so that
/// referral objects are manipulated as ordinary entries.
pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";

/// The Active Directory DirSync control.
pub const DIRSYNC_OID: &str = "1.2.840.113556.1.4.841";

/// "Return deleted objects": makes tombstones visible to search and modify.
pub const RETURN_DELETED_OBJECTS_OID: &str = "1.2.840.113556.1.4.417";

/// Advertised in `supportedCapabilities` on the root DSE by Windows 2003
/// and later forests.
pub const WIN2K3_CAPABILITY_OID: &str = "1.2.840.113556.1.4.1670";

/// Password-policy response controls that may accompany a bind result.
pub const PW_EXPIRED_OID: &str = "2.16.840.1.113730.3.4.4";
pub const PW_EXPIRING_OID: &str = "2.16.840.1.113730.3.4.5";

/// The DS5 replication suite; their joint presence on the root DSE marks a
/// peer that speaks DS5 replication.
pub const DS5_UPDATE_INFO_CONTROL_OID: &str = "2.16.840.1.113730.3.4.5.1";
pub const DS5_START_REPLICATION_REQUEST_OID: &str = "2.16.840.1.113730.3.5.3";
pub const DS5_END_REPLICATION_REQUEST_OID: &str = "2.16.840.1.113730.3.5.5";
pub const DS5_REPLICATION_ENTRY_REQUEST_OID: &str = "2.16.840.1.113730.3.5.6";
pub const DS5_REPLICATION_RESPONSE_OID: &str = "2.16.840.1.113730.3.5.4";

/// DirSync request flags.
pub const DIRSYNC_OBJECT_SECURITY: i64 = 0x1;

pub fn manage_dsa_it() -> RawControl {
    RawControl { ctype: MANAGE_DSA_IT_OID.to_owned(), crit: false, val: None }
}

pub fn return_deleted_objects() -> RawControl {
    RawControl { ctype: RETURN_DELETED_OBJECTS_OID.to_owned(), crit: true, val: None }
}

/// DirSync control. For requests, `more_results` carries the flags and
/// `size` the attribute-count limit; for responses, `more_results` is the
/// server's continuation indicator and `size` is unused.
#[derive(Clone, Debug)]
pub struct DirSync {
    pub more_results: i64,
    pub size: i64,
    pub cookie: Vec<u8>,
}

impl DirSync {
    pub fn request(cookie: Vec<u8>) -> DirSync {
        DirSync { more_results: DIRSYNC_OBJECT_SECURITY, size: 0, cookie }
    }

    pub fn has_more(&self) -> bool {
        self.more_results != 0
    }
}

impl MakeCritical for DirSync {}

impl From<DirSync> for RawControl {
    fn from(ds: DirSync) -> RawControl {
        let cookie_len = ds.cookie.len();
        let cval = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer { inner: ds.more_results, ..Default::default() }),
                Tag::Integer(Integer { inner: ds.size, ..Default::default() }),
                Tag::OctetString(OctetString { inner: ds.cookie, ..Default::default() }),
            ],
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::with_capacity(cookie_len + 16);
        write::encode_into(&mut buf, cval).expect("encoded");
        RawControl { ctype: DIRSYNC_OID.to_owned(), crit: true, val: Some(Vec::from(&buf[..])) }
    }
}

impl ControlParser for DirSync {
    fn parse(val: &[u8]) -> DirSync {
        let mut ds_comps = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("failed to parse dirsync control value"),
        }
        .expect_constructed()
        .expect("dirsync components")
        .into_iter();
        let more_results = match parse_uint(
            ds_comps
                .next()
                .expect("element")
                .match_class(TagClass::Universal)
                .and_then(|t| t.match_id(Types::Integer as u64))
                .and_then(|t| t.expect_primitive())
                .expect("more results")
                .as_slice(),
        ) {
            Ok((_, more)) => more as i64,
            _ => panic!("failed to parse dirsync more results"),
        };
        let size = match parse_uint(
            ds_comps
                .next()
                .expect("element")
                .match_class(TagClass::Universal)
                .and_then(|t| t.match_id(Types::Integer as u64))
                .and_then(|t| t.expect_primitive())
                .expect("size")
                .as_slice(),
        ) {
            Ok((_, size)) => size as i64,
            _ => panic!("failed to parse dirsync size"),
        };
        let cookie = ds_comps.next().expect("element").expect_primitive().expect("octet string");
        DirSync { more_results, size, cookie }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirsync_control_round_trip() {
        let ctl: RawControl = DirSync::request(vec![0xde, 0xad, 0xbe, 0xef]).into();
        assert_eq!(ctl.ctype, DIRSYNC_OID);
        assert!(ctl.crit);
        let parsed = DirSync::parse(ctl.val.as_deref().expect("value"));
        assert_eq!(parsed.more_results, DIRSYNC_OBJECT_SECURITY);
        assert_eq!(parsed.size, 0);
        assert_eq!(parsed.cookie, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn dirsync_empty_cookie() {
        let ctl: RawControl = DirSync::request(Vec::new()).into();
        let parsed = DirSync::parse(ctl.val.as_deref().expect("value"));
        assert!(parsed.cookie.is_empty());
    }

    #[test]
    fn more_results_signals_continuation() {
        assert!(DirSync { more_results: 1, size: 0, cookie: vec![] }.has_more());
        assert!(!DirSync { more_results: 0, size: 0, cookie: vec![] }.has_more());
    }
}
