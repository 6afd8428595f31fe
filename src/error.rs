//! Error types and LDAP result-code classification.
//!
//! The engine carries LDAP result codes numerically, the way they appear on
//! the wire, and classifies them through two explicit tables: the
//! disconnect-worthy set (the session is closed and the driver retries after
//! backoff) and the keep-going set (the replay loop records a skip for the
//! change and moves on). Keeping the sets as constants lets the tests
//! enumerate them.

use ldap3::LdapError;
use thiserror::Error;

/// LDAP result codes used by the engine. Values are the RFC 4511 codes,
/// plus the client-side codes (0x51 and up) the OpenLDAP family assigns
/// to local conditions.
pub mod rc {
    pub const SUCCESS: u32 = 0;
    pub const OPERATIONS_ERROR: u32 = 1;
    pub const PROTOCOL_ERROR: u32 = 2;
    pub const TIMELIMIT_EXCEEDED: u32 = 3;
    pub const SIZELIMIT_EXCEEDED: u32 = 4;
    pub const NO_SUCH_ATTRIBUTE: u32 = 16;
    pub const UNDEFINED_TYPE: u32 = 17;
    pub const CONSTRAINT_VIOLATION: u32 = 19;
    pub const TYPE_OR_VALUE_EXISTS: u32 = 20;
    pub const INVALID_SYNTAX: u32 = 21;
    pub const NO_SUCH_OBJECT: u32 = 32;
    pub const INVALID_DN_SYNTAX: u32 = 34;
    pub const IS_LEAF: u32 = 35;
    pub const INAPPROPRIATE_AUTH: u32 = 48;
    pub const INVALID_CREDENTIALS: u32 = 49;
    pub const INSUFFICIENT_ACCESS: u32 = 50;
    pub const BUSY: u32 = 51;
    pub const UNAVAILABLE: u32 = 52;
    pub const UNWILLING_TO_PERFORM: u32 = 53;
    pub const NAMING_VIOLATION: u32 = 64;
    pub const OBJECT_CLASS_VIOLATION: u32 = 65;
    pub const NOT_ALLOWED_ON_NONLEAF: u32 = 66;
    pub const NOT_ALLOWED_ON_RDN: u32 = 67;
    pub const ALREADY_EXISTS: u32 = 68;
    pub const NO_OBJECT_CLASS_MODS: u32 = 69;
    pub const OTHER: u32 = 80;
    pub const SERVER_DOWN: u32 = 81;
    pub const LOCAL_ERROR: u32 = 82;
    pub const TIMEOUT: u32 = 85;
    pub const CONNECT_ERROR: u32 = 91;
}

/// Errors which close the session; the caller must reconnect before
/// retrying, and the driver schedules the reconnect after backoff.
pub const DISCONNECT_ERRORS: [u32; 5] = [
    rc::SERVER_DOWN,
    rc::CONNECT_ERROR,
    rc::INVALID_CREDENTIALS,
    rc::INAPPROPRIATE_AUTH,
    rc::LOCAL_ERROR,
];

/// Result codes after which the replay loop keeps going: the remote has
/// either already converged or will never accept this particular change,
/// so retrying it later cannot help. The change is recorded as skipped
/// and the cursor advances.
pub const KEEP_GOING_ERRORS: [u32; 16] = [
    rc::SUCCESS,
    rc::NO_SUCH_ATTRIBUTE,
    rc::UNDEFINED_TYPE,
    rc::CONSTRAINT_VIOLATION,
    rc::TYPE_OR_VALUE_EXISTS,
    rc::INVALID_SYNTAX,
    rc::NO_SUCH_OBJECT,
    rc::INVALID_DN_SYNTAX,
    rc::IS_LEAF,
    rc::INSUFFICIENT_ACCESS,
    rc::NAMING_VIOLATION,
    rc::OBJECT_CLASS_VIOLATION,
    rc::NOT_ALLOWED_ON_NONLEAF,
    rc::NOT_ALLOWED_ON_RDN,
    rc::ALREADY_EXISTS,
    rc::NO_OBJECT_CLASS_MODS,
];

pub fn is_disconnect_error(code: u32) -> bool {
    DISCONNECT_ERRORS.contains(&code)
}

pub fn ignore_error_and_keep_going(code: u32) -> bool {
    KEEP_GOING_ERRORS.contains(&code)
}

/// Human-readable name for a result code, for log messages.
pub fn rc_name(code: u32) -> &'static str {
    match code {
        0 => "success",
        1 => "operationsError",
        2 => "protocolError",
        3 => "timeLimitExceeded",
        4 => "sizeLimitExceeded",
        16 => "noSuchAttribute",
        17 => "undefinedAttributeType",
        19 => "constraintViolation",
        20 => "attributeOrValueExists",
        21 => "invalidAttributeSyntax",
        32 => "noSuchObject",
        34 => "invalidDNSyntax",
        35 => "isLeaf",
        48 => "inappropriateAuthentication",
        49 => "invalidCredentials",
        50 => "insufficientAccessRights",
        51 => "busy",
        52 => "unavailable",
        53 => "unwillingToPerform",
        64 => "namingViolation",
        65 => "objectClassViolation",
        66 => "notAllowedOnNonLeaf",
        67 => "notAllowedOnRDN",
        68 => "entryAlreadyExists",
        69 => "objectClassModsProhibited",
        80 => "other",
        81 => "serverDown",
        82 => "localError",
        85 => "timeout",
        91 => "connectError",
        _ => "unknown",
    }
}

/// Extract the LDAP result code from a client error. Anything that is not
/// a protocol-level result (I/O failures, closed channels, TLS trouble)
/// means the session is unusable and maps to `serverDown`.
pub fn ldap_error_rc(err: &LdapError) -> u32 {
    match err {
        LdapError::LdapResult { result } => result.rc,
        _ => rc::SERVER_DOWN,
    }
}

/// Engine-level error, for the seams where an operation can fail for a
/// reason other than an LDAP result code.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("directory store error: {0}")]
    Store(String),
    #[error("LDAP client error: {0}")]
    Ldap(#[from] LdapError),
    #[error("entry mapping failed: {0}")]
    Mapping(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("credential decryption failed")]
    Credentials,
    #[error("no matching entry")]
    NoSuchEntry,
    #[error("multiple matching entries")]
    NotUnique,
    #[error("changelog error: {0}")]
    Changelog(String),
    #[error("clock skew between replicas is too large")]
    CsnTimeSkew,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_set_is_exact() {
        for code in DISCONNECT_ERRORS {
            assert!(is_disconnect_error(code), "{} must disconnect", rc_name(code));
        }
        assert!(!is_disconnect_error(rc::BUSY));
        assert!(!is_disconnect_error(rc::UNWILLING_TO_PERFORM));
        assert!(!is_disconnect_error(rc::ALREADY_EXISTS));
        assert!(!is_disconnect_error(rc::TIMEOUT));
    }

    #[test]
    fn keep_going_set_is_exact() {
        for code in KEEP_GOING_ERRORS {
            assert!(ignore_error_and_keep_going(code));
        }
        // Representative members of the stop-and-retry set.
        for code in [
            rc::OPERATIONS_ERROR,
            rc::PROTOCOL_ERROR,
            rc::BUSY,
            rc::UNAVAILABLE,
            rc::UNWILLING_TO_PERFORM,
            rc::SERVER_DOWN,
            rc::LOCAL_ERROR,
            rc::TIMEOUT,
            rc::CONNECT_ERROR,
            rc::OTHER,
        ] {
            assert!(!ignore_error_and_keep_going(code), "{} must not be ignored", rc_name(code));
        }
    }

    #[test]
    fn disconnect_and_keep_going_are_disjoint_except_success() {
        for code in DISCONNECT_ERRORS {
            assert!(!ignore_error_and_keep_going(code));
        }
    }
}
