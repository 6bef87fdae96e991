#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The reserved 16-bit identifier value. Never a valid live Object,
/// Instance, Resource or Resource Instance ID; collections never contain it.
pub const ID_INVALID: u16 = 0xFFFF;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Object ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Oid(pub u16);

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.0)
    }
}

/// Object Instance ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Iid(pub u16);

impl std::fmt::Display for Iid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Rid(pub u16);

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource Instance ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Riid(pub u16);

impl std::fmt::Display for Riid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Short Server ID.
///
/// `Ssid::ANY` (0) matches any server in ACL entries and is never a concrete
/// server; `Ssid::BOOTSTRAP` identifies the bootstrap server and is reserved
/// in most contexts that take an SSID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Ssid(pub u16);

impl Ssid {
    pub const ANY: Ssid = Ssid(0);
    pub const BOOTSTRAP: Ssid = Ssid(ID_INVALID);
}

impl std::fmt::Display for Ssid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Reserved data-model identifiers ──────────────────────────────────────────

pub const OID_SECURITY: Oid = Oid(0);
pub const OID_SERVER: Oid = Oid(1);
pub const OID_ACCESS_CONTROL: Oid = Oid(2);

/// Server URI resource of the Security object.
pub const RID_SECURITY_SERVER_URI: Rid = Rid(0);
/// Short Server ID resource of the Security object.
pub const RID_SECURITY_SSID: Rid = Rid(10);
/// Short Server ID resource of the Server object.
pub const RID_SERVER_SSID: Rid = Rid(0);

pub const RID_ACCESS_CONTROL_OID: Rid = Rid(0);
pub const RID_ACCESS_CONTROL_OIID: Rid = Rid(1);
pub const RID_ACCESS_CONTROL_ACL: Rid = Rid(2);
pub const RID_ACCESS_CONTROL_OWNER: Rid = Rid(3);
