//! Shared vocabulary of the data-model core: identifiers, ordered-by-key
//! collections, notification attribute payloads, access masks, resource
//! values and the LwM2M-facing error taxonomy.

pub mod attrs;
pub mod error;
pub mod keyed;
pub mod mask;
pub mod types;
pub mod value;

#[cfg(test)]
mod tests;

pub use attrs::{CommonAttrs, ResourceAttrs};
pub use error::DmError;
pub use keyed::{Keyed, KeyedVec};
pub use mask::AccessMask;
pub use types::{
    Iid, Oid, Rid, Riid, Ssid, ID_INVALID, OID_ACCESS_CONTROL, OID_SECURITY, OID_SERVER,
    RID_ACCESS_CONTROL_ACL, RID_ACCESS_CONTROL_OID, RID_ACCESS_CONTROL_OIID,
    RID_ACCESS_CONTROL_OWNER, RID_SECURITY_SERVER_URI, RID_SECURITY_SSID, RID_SERVER_SSID,
};
pub use value::Value;
