//! Binary persistence of Access Control state.
//!
//! Stream layout: magic `"ACO" 0x01`, then `u32` instance count, then per
//! instance `u16 target.oid`, `u16 iid`, `u16 target.iid` (`0xFFFF` =
//! object level), `u16 owner`, `u8 has_acl`, and — only when `has_acl` —
//! `u32` entry count followed by `(u16 mask, u16 ssid)` pairs. Big-endian
//! throughout.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{info, warn};

use petrel_domain::{AccessMask, DmError, Iid, KeyedVec, Oid, Ssid, OID_SECURITY};
use petrel_registry::Registry;

use crate::control::{AccessControl, AclEntry, AclInstance, AclTarget, TargetIid};

const MAGIC: [u8; 4] = [b'A', b'C', b'O', 0x01];

impl AccessControl {
    /// Persists the ACL state. While a transaction is open, the
    /// pre-transaction snapshot is what gets written.
    pub fn persist<W: Write>(&mut self, out: &mut W) -> Result<(), DmError> {
        out.write_all(&MAGIC)?;
        let instances = match &self.saved {
            Some(saved) => &saved.instances,
            None => &self.current.instances,
        };
        out.write_u32::<BigEndian>(
            u32::try_from(instances.len())
                .map_err(|_| DmError::Internal("too many ACL instances".to_string()))?,
        )?;
        for inst in instances {
            let target_iid = inst.target.iid.to_wire().ok_or_else(|| {
                DmError::Internal(format!(
                    "ACL instance {} has no target instance set",
                    inst.iid
                ))
            })?;
            out.write_u16::<BigEndian>(inst.target.oid.0)?;
            out.write_u16::<BigEndian>(inst.iid.0)?;
            out.write_u16::<BigEndian>(target_iid)?;
            out.write_u16::<BigEndian>(inst.owner.0)?;
            out.write_u8(u8::from(inst.has_acl))?;
            if inst.has_acl {
                out.write_u32::<BigEndian>(
                    u32::try_from(inst.acl.len())
                        .map_err(|_| DmError::Internal("ACL list too long".to_string()))?,
                )?;
                for entry in &inst.acl {
                    out.write_u16::<BigEndian>(entry.mask.bits())?;
                    out.write_u16::<BigEndian>(entry.ssid.0)?;
                }
            }
        }
        self.current.modified_since_persist = false;
        info!("access control state persisted");
        Ok(())
    }

    /// Restores ACL state from `input`, replacing the current state.
    ///
    /// Instances whose target object is not currently registered (or is the
    /// Security object) are skipped. Any decoding error clears the state and
    /// raises the modified flag, so the next persist writes a clean stream.
    pub fn restore<R: Read>(&mut self, registry: &Registry, input: &mut R) -> Result<(), DmError> {
        if self.saved.is_some() {
            return Err(DmError::Internal(
                "cannot restore access control state while in a transaction".to_string(),
            ));
        }
        match restore_instances(registry, input) {
            Ok(instances) => {
                self.current.instances = instances;
                self.current.modified_since_persist = false;
                self.needs_validation = false;
                info!("access control state restored");
                Ok(())
            }
            Err(err) => {
                warn!(%err, "access control restore failed");
                self.current.instances.clear();
                self.current.modified_since_persist = true;
                self.needs_validation = false;
                Err(err)
            }
        }
    }
}

fn restore_instances<R: Read>(
    registry: &Registry,
    input: &mut R,
) -> Result<KeyedVec<AclInstance>, DmError> {
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic).map_err(DmError::from_read_error)?;
    if magic != MAGIC {
        return Err(DmError::BadMessage("bad access control magic".to_string()));
    }

    let count = input
        .read_u32::<BigEndian>()
        .map_err(DmError::from_read_error)?;
    if count > u32::from(u16::MAX) {
        return Err(DmError::BadMessage(format!(
            "unreasonable ACL instance count {}",
            count
        )));
    }

    let mut instances = KeyedVec::new();
    for _ in 0..count {
        let target_oid = Oid(input
            .read_u16::<BigEndian>()
            .map_err(DmError::from_read_error)?);
        let iid = Iid(input
            .read_u16::<BigEndian>()
            .map_err(DmError::from_read_error)?);
        let target_iid = TargetIid::from_wire(
            input
                .read_u16::<BigEndian>()
                .map_err(DmError::from_read_error)?,
        );
        let owner = Ssid(input
            .read_u16::<BigEndian>()
            .map_err(DmError::from_read_error)?);
        let has_acl = input.read_u8().map_err(DmError::from_read_error)? != 0;

        let mut acl = KeyedVec::new();
        if has_acl {
            let acl_len = input
                .read_u32::<BigEndian>()
                .map_err(DmError::from_read_error)?;
            for _ in 0..acl_len {
                let mask_bits = input
                    .read_u16::<BigEndian>()
                    .map_err(DmError::from_read_error)?;
                let ssid = Ssid(input
                    .read_u16::<BigEndian>()
                    .map_err(DmError::from_read_error)?);
                let mask = AccessMask::from_bits(mask_bits).ok_or_else(|| {
                    DmError::BadMessage(format!("invalid access mask {:#x}", mask_bits))
                })?;
                acl.insert(AclEntry { ssid, mask }).map_err(|_| {
                    DmError::BadMessage(format!("duplicate ACL entry for SSID {}", ssid))
                })?;
            }
        }

        if target_oid == OID_SECURITY || !registry.contains(target_oid) {
            // stale target, silently dropped
            continue;
        }
        instances
            .insert(AclInstance {
                iid,
                target: AclTarget {
                    oid: target_oid,
                    iid: target_iid,
                },
                owner,
                has_acl,
                acl,
            })
            .map_err(|_| DmError::BadMessage(format!("duplicate ACL instance {}", iid)))?;
    }
    Ok(instances)
}
