use tracing::{debug, warn};

use petrel_domain::{
    AccessMask, DmError, Iid, Keyed, KeyedVec, Oid, Rid, Riid, Ssid, Value, ID_INVALID,
    OID_ACCESS_CONTROL, RID_ACCESS_CONTROL_ACL, RID_ACCESS_CONTROL_OID, RID_ACCESS_CONTROL_OIID,
    RID_ACCESS_CONTROL_OWNER,
};
use petrel_notify::NotifyQueue;
use petrel_registry::{ObjectHandler, Registry, ResourceDef, ResourceKind};

/// The instance the ACL applies to.
///
/// `Unset` only exists on freshly created instances; it must be written
/// before the enclosing transaction validates. `Object` addresses the whole
/// object (only the `CREATE` permission makes sense there).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetIid {
    Unset,
    Object,
    Instance(Iid),
}

impl TargetIid {
    pub(crate) fn to_wire(self) -> Option<u16> {
        match self {
            TargetIid::Unset => None,
            TargetIid::Object => Some(ID_INVALID),
            TargetIid::Instance(iid) => Some(iid.0),
        }
    }

    pub(crate) fn from_wire(raw: u16) -> TargetIid {
        if raw == ID_INVALID {
            TargetIid::Object
        } else {
            TargetIid::Instance(Iid(raw))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclTarget {
    pub oid: Oid,
    pub iid: TargetIid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclEntry {
    pub ssid: Ssid,
    pub mask: AccessMask,
}

impl Keyed for AclEntry {
    type Key = Ssid;

    fn key(&self) -> Ssid {
        self.ssid
    }
}

/// One Access Control object instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclInstance {
    pub iid: Iid,
    pub target: AclTarget,
    pub owner: Ssid,
    /// Set once the ACL resource has been written at least once; an empty
    /// list with `has_acl` still reports the resource as present.
    pub has_acl: bool,
    pub acl: KeyedVec<AclEntry>,
}

impl Keyed for AclInstance {
    type Key = Iid;

    fn key(&self) -> Iid {
        self.iid
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AclState {
    pub instances: KeyedVec<AclInstance>,
    pub modified_since_persist: bool,
}

/// The Access Control subsystem. Registered as an object (OID 2) and driven
/// both by server writes through the object handlers and by the host API
/// (`set_acl` / `set_owner`).
#[derive(Debug, Default)]
pub struct AccessControl {
    pub(crate) current: AclState,
    pub(crate) saved: Option<AclState>,
    pub(crate) needs_validation: bool,
}

pub(crate) fn target_oid_valid(oid: Oid) -> bool {
    oid.0 >= 1 && oid != OID_ACCESS_CONTROL && oid.0 < ID_INVALID
}

/// An SSID usable as an ACL entry key: "any server" or a known server.
fn acl_entry_ssid_valid(registry: &Registry, ssid: Ssid) -> bool {
    ssid != Ssid::BOOTSTRAP && (ssid == Ssid::ANY || registry.server_ssid_exists(ssid))
}

impl AccessControl {
    pub fn new() -> AccessControl {
        AccessControl::default()
    }

    /// Whether the persisted state is out of date. While a transaction is
    /// open this reports the pre-transaction flag, matching what `persist`
    /// would write.
    pub fn is_modified(&self) -> bool {
        match &self.saved {
            Some(saved) => saved.modified_since_persist,
            None => self.current.modified_since_persist,
        }
    }

    pub(crate) fn mark_modified(&mut self) {
        self.current.modified_since_persist = true;
    }

    pub fn instances(&self) -> impl Iterator<Item = &AclInstance> {
        self.current.instances.iter()
    }

    /// Drops every ACL instance.
    pub fn purge(&mut self, queue: &mut NotifyQueue) {
        self.current.instances.clear();
        self.needs_validation = false;
        self.mark_modified();
        queue.mark_unknown_change(OID_ACCESS_CONTROL);
    }

    fn find_instance(&self, iid: Iid) -> Option<&AclInstance> {
        self.current.instances.find(iid)
    }

    fn find_instance_mut(&mut self, iid: Iid) -> Option<&mut AclInstance> {
        self.current.instances.find_mut(iid)
    }

    fn find_by_target(&self, oid: Oid, iid: TargetIid) -> Option<Iid> {
        self.current
            .instances
            .iter()
            .find(|inst| inst.target.oid == oid && inst.target.iid == iid)
            .map(|inst| inst.iid)
    }

    fn lowest_free_iid(&self) -> Result<Iid, DmError> {
        let mut candidate = 0u16;
        for key in self.current.instances.keys() {
            if key.0 != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate == ID_INVALID {
            return Err(DmError::Internal("no free ACL instance ids left".to_string()));
        }
        Ok(Iid(candidate))
    }

    fn target_reachable(&self, registry: &Registry, oid: Oid, iid: TargetIid) -> bool {
        if !target_oid_valid(oid) || !registry.contains(oid) {
            return false;
        }
        match iid {
            TargetIid::Unset => false,
            TargetIid::Object => true,
            TargetIid::Instance(iid) => registry.instance_present(oid, iid).unwrap_or(false),
        }
    }

    fn set_acl_in_instance(
        registry: &Registry,
        inst: &mut AclInstance,
        ssid: Ssid,
        mask: AccessMask,
    ) -> Result<(), DmError> {
        if mask.is_empty() {
            // granting nothing removes the entry
            inst.acl.remove(ssid);
            inst.has_acl = true;
            return Ok(());
        }
        if inst.acl.find(ssid).is_none() && !acl_entry_ssid_valid(registry, ssid) {
            warn!(%ssid, "cannot set ACL: server does not exist");
            return Err(DmError::BadRequest(format!(
                "server with SSID {} does not exist",
                ssid
            )));
        }
        inst.acl
            .find_or_create_with(ssid, || AclEntry {
                ssid,
                mask: AccessMask::EMPTY,
            })
            .mask = mask;
        inst.has_acl = true;
        Ok(())
    }

    /// Grants `ssid` the permissions in `mask` on `(oid, iid)`, creating the
    /// ACL instance (owned by the bootstrap server, lowest free IID) when
    /// none targets that entity yet. `iid == None` addresses the object
    /// level, where only `CREATE` is meaningful.
    pub fn set_acl(
        &mut self,
        registry: &Registry,
        queue: &mut NotifyQueue,
        oid: Oid,
        iid: Option<Iid>,
        ssid: Ssid,
        mask: AccessMask,
    ) -> Result<(), DmError> {
        if ssid == Ssid::BOOTSTRAP {
            return Err(DmError::BadRequest(format!(
                "SSID {} is a reserved value",
                ssid
            )));
        }
        match iid {
            Some(_) if mask.contains(AccessMask::CREATE) => {
                return Err(DmError::BadRequest(
                    "the Create permission makes no sense for an instance".to_string(),
                ));
            }
            None if mask != AccessMask::CREATE => {
                return Err(DmError::BadRequest(
                    "only the Create permission makes sense at the object level".to_string(),
                ));
            }
            _ => {}
        }
        let target_iid = match iid {
            Some(iid) => TargetIid::Instance(iid),
            None => TargetIid::Object,
        };

        if let Some(acl_iid) = self.find_by_target(oid, target_iid) {
            let inst = self
                .find_instance_mut(acl_iid)
                .ok_or_else(|| DmError::Internal("ACL instance vanished".to_string()))?;
            Self::set_acl_in_instance(registry, inst, ssid, mask)?;
            self.mark_modified();
            queue.mark_resource_changed(OID_ACCESS_CONTROL, acl_iid, RID_ACCESS_CONTROL_ACL);
            return Ok(());
        }

        if !self.target_reachable(registry, oid, target_iid) {
            warn!(oid = oid.0, "cannot set ACL: target does not exist");
            return Err(DmError::BadRequest(format!(
                "ACL target in object {} does not exist",
                oid
            )));
        }
        let mut inst = AclInstance {
            iid: self.lowest_free_iid()?,
            target: AclTarget {
                oid,
                iid: target_iid,
            },
            owner: Ssid::BOOTSTRAP,
            has_acl: true,
            acl: KeyedVec::new(),
        };
        Self::set_acl_in_instance(registry, &mut inst, ssid, mask)?;
        let new_iid = inst.iid;
        self.current
            .instances
            .insert(inst)
            .map_err(|_| DmError::Internal("duplicate ACL instance id".to_string()))?;
        self.mark_modified();
        queue.mark_instance_created(OID_ACCESS_CONTROL, new_iid);
        debug!(iid = new_iid.0, "created ACL instance");
        Ok(())
    }

    /// Sets the owner of the ACL instance for `(target_oid, target_iid)`,
    /// creating it if needed.
    ///
    /// `acl_iid` is an in/out parameter: on input an optional preferred ACL
    /// instance ID, on output the ID actually used. If an instance for the
    /// target already exists under a different ID than requested, the call
    /// fails and writes the existing ID back.
    pub fn set_owner(
        &mut self,
        registry: &Registry,
        queue: &mut NotifyQueue,
        target_oid: Oid,
        target_iid: Option<Iid>,
        owner: Ssid,
        acl_iid: &mut Option<Iid>,
    ) -> Result<(), DmError> {
        if owner == Ssid::ANY {
            return Err(DmError::BadRequest(
                "SSID 0 cannot own an ACL instance".to_string(),
            ));
        }
        let target_iid = match target_iid {
            Some(iid) => TargetIid::Instance(iid),
            None => TargetIid::Object,
        };

        let existing = self.find_by_target(target_oid, target_iid);
        if let Some(existing_iid) = existing {
            if let Some(preferred) = *acl_iid {
                if preferred != existing_iid {
                    warn!(
                        preferred = preferred.0,
                        existing = existing_iid.0,
                        "conflicting ACL instance"
                    );
                    *acl_iid = Some(existing_iid);
                    return Err(DmError::BadRequest(format!(
                        "ACL instance {} already covers this target",
                        existing_iid
                    )));
                }
            }
            if owner != Ssid::BOOTSTRAP && !registry.server_ssid_exists(owner) {
                return Err(DmError::BadRequest(format!(
                    "server with SSID {} does not exist",
                    owner
                )));
            }
            let inst = self
                .find_instance_mut(existing_iid)
                .ok_or_else(|| DmError::Internal("ACL instance vanished".to_string()))?;
            if inst.owner != owner {
                inst.owner = owner;
                self.mark_modified();
                queue.mark_resource_changed(
                    OID_ACCESS_CONTROL,
                    existing_iid,
                    RID_ACCESS_CONTROL_OWNER,
                );
            }
            *acl_iid = Some(existing_iid);
            return Ok(());
        }

        if !self.target_reachable(registry, target_oid, target_iid) {
            return Err(DmError::BadRequest(format!(
                "ACL target in object {} does not exist",
                target_oid
            )));
        }
        if owner != Ssid::BOOTSTRAP && !registry.server_ssid_exists(owner) {
            return Err(DmError::BadRequest(format!(
                "server with SSID {} does not exist",
                owner
            )));
        }
        let iid = match *acl_iid {
            Some(preferred) => {
                if self.current.instances.contains(preferred) {
                    return Err(DmError::BadRequest(format!(
                        "ACL instance {} already exists",
                        preferred
                    )));
                }
                preferred
            }
            None => self.lowest_free_iid()?,
        };
        let inst = AclInstance {
            iid,
            target: AclTarget {
                oid: target_oid,
                iid: target_iid,
            },
            owner,
            has_acl: true,
            acl: KeyedVec::new(),
        };
        self.current
            .instances
            .insert(inst)
            .map_err(|_| DmError::Internal("duplicate ACL instance id".to_string()))?;
        self.mark_modified();
        queue.mark_instance_created(OID_ACCESS_CONTROL, iid);
        *acl_iid = Some(iid);
        Ok(())
    }

    fn validate_all(&self, registry: &Registry) -> Result<(), DmError> {
        let mut seen_targets: Vec<(Oid, TargetIid)> = Vec::new();
        let mut ssids: Vec<Ssid> = Vec::new();
        for inst in &self.current.instances {
            if !target_oid_valid(inst.target.oid) {
                return Err(DmError::BadRequest(format!(
                    "invalid ACL target object {}",
                    inst.target.oid
                )));
            }
            let target = (inst.target.oid, inst.target.iid);
            if seen_targets.contains(&target) {
                return Err(DmError::BadRequest(format!(
                    "duplicate ACL instance for target in object {}",
                    inst.target.oid
                )));
            }
            seen_targets.push(target);
            if !self.target_reachable(registry, inst.target.oid, inst.target.iid) {
                warn!(
                    oid = inst.target.oid.0,
                    iid = inst.iid.0,
                    "ACL validation failed for target"
                );
                return Err(DmError::BadRequest(format!(
                    "ACL target in object {} does not exist",
                    inst.target.oid
                )));
            }
            if inst.owner != Ssid::BOOTSTRAP {
                ssids.push(inst.owner);
            }
            ssids.extend(inst.acl.iter().map(|entry| entry.ssid));
        }
        ssids.sort_unstable();
        ssids.dedup();
        for ssid in ssids {
            if !acl_entry_ssid_valid(registry, ssid) {
                warn!(%ssid, "ACL validation failed: invalid SSID");
                return Err(DmError::BadRequest(format!("invalid SSID {}", ssid)));
            }
        }
        Ok(())
    }
}

impl ObjectHandler for AccessControl {
    fn oid(&self) -> Oid {
        OID_ACCESS_CONTROL
    }

    fn list_instances(&self) -> Result<Vec<Iid>, DmError> {
        Ok(self.current.instances.keys().collect())
    }

    fn list_resources(&self, iid: Iid) -> Result<Vec<ResourceDef>, DmError> {
        let inst = self
            .find_instance(iid)
            .ok_or_else(|| DmError::NotFound(format!("{}/{}", OID_ACCESS_CONTROL, iid)))?;
        Ok(vec![
            ResourceDef::present(RID_ACCESS_CONTROL_OID, ResourceKind::R),
            ResourceDef::present(RID_ACCESS_CONTROL_OIID, ResourceKind::R),
            if inst.has_acl {
                ResourceDef::present(RID_ACCESS_CONTROL_ACL, ResourceKind::Rwm)
            } else {
                ResourceDef::absent(RID_ACCESS_CONTROL_ACL, ResourceKind::Rwm)
            },
            ResourceDef::present(RID_ACCESS_CONTROL_OWNER, ResourceKind::Rw),
        ])
    }

    fn list_resource_instances(&self, iid: Iid, rid: Rid) -> Result<Vec<Riid>, DmError> {
        let inst = self
            .find_instance(iid)
            .ok_or_else(|| DmError::NotFound(format!("{}/{}", OID_ACCESS_CONTROL, iid)))?;
        match rid {
            RID_ACCESS_CONTROL_ACL => {
                Ok(inst.acl.iter().map(|entry| Riid(entry.ssid.0)).collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn resource_read(&self, iid: Iid, rid: Rid, riid: Option<Riid>) -> Result<Value, DmError> {
        let inst = self
            .find_instance(iid)
            .ok_or_else(|| DmError::NotFound(format!("{}/{}", OID_ACCESS_CONTROL, iid)))?;
        match rid {
            RID_ACCESS_CONTROL_OID => Ok(Value::Int(i64::from(inst.target.oid.0))),
            RID_ACCESS_CONTROL_OIID => Ok(Value::Int(match inst.target.iid {
                TargetIid::Unset => -1,
                TargetIid::Object => i64::from(ID_INVALID),
                TargetIid::Instance(iid) => i64::from(iid.0),
            })),
            RID_ACCESS_CONTROL_ACL => {
                let riid = riid.ok_or_else(|| {
                    DmError::BadRequest("the ACL resource has multiple instances".to_string())
                })?;
                let entry = inst.acl.find(Ssid(riid.0)).ok_or_else(|| {
                    DmError::NotFound(format!("no ACL entry for SSID {}", riid))
                })?;
                Ok(Value::Int(i64::from(entry.mask.bits())))
            }
            RID_ACCESS_CONTROL_OWNER => Ok(Value::Int(i64::from(inst.owner.0))),
            _ => Err(DmError::NotFound(format!(
                "{}/{}/{} does not exist",
                OID_ACCESS_CONTROL, iid, rid
            ))),
        }
    }

    fn resource_write(
        &mut self,
        _registry: &Registry,
        iid: Iid,
        rid: Rid,
        riid: Option<Riid>,
        value: &Value,
    ) -> Result<(), DmError> {
        let inst = self
            .current
            .instances
            .find_mut(iid)
            .ok_or_else(|| DmError::NotFound(format!("{}/{}", OID_ACCESS_CONTROL, iid)))?;
        match rid {
            RID_ACCESS_CONTROL_OID => {
                let oid = value
                    .as_i64()
                    .ok_or_else(|| DmError::BadRequest("expected an integer".to_string()))?;
                if !(0..=i64::from(u16::MAX)).contains(&oid) || !target_oid_valid(Oid(oid as u16)) {
                    return Err(DmError::BadRequest(format!("invalid target object {}", oid)));
                }
                inst.target.oid = Oid(oid as u16);
            }
            RID_ACCESS_CONTROL_OIID => {
                let oiid = value
                    .as_i64()
                    .ok_or_else(|| DmError::BadRequest("expected an integer".to_string()))?;
                if !(0..=i64::from(u16::MAX)).contains(&oiid) {
                    return Err(DmError::BadRequest(format!(
                        "invalid target instance {}",
                        oiid
                    )));
                }
                inst.target.iid = TargetIid::from_wire(oiid as u16);
            }
            RID_ACCESS_CONTROL_ACL => {
                let riid = riid.ok_or_else(|| {
                    DmError::BadRequest("the ACL resource has multiple instances".to_string())
                })?;
                let raw = value
                    .as_i64()
                    .ok_or_else(|| DmError::BadRequest("expected an integer".to_string()))?;
                let mask = u16::try_from(raw)
                    .ok()
                    .and_then(AccessMask::from_bits)
                    .ok_or_else(|| {
                        DmError::BadRequest(format!("invalid access mask {:#x}", raw))
                    })?;
                let ssid = Ssid(riid.0);
                inst.acl
                    .find_or_create_with(ssid, || AclEntry {
                        ssid,
                        mask: AccessMask::EMPTY,
                    })
                    .mask = mask;
                inst.has_acl = true;
            }
            RID_ACCESS_CONTROL_OWNER => {
                let owner = value
                    .as_i64()
                    .ok_or_else(|| DmError::BadRequest("expected an integer".to_string()))?;
                if !(1..=i64::from(ID_INVALID)).contains(&owner) {
                    return Err(DmError::BadRequest(format!("invalid owner SSID {}", owner)));
                }
                inst.owner = Ssid(owner as u16);
            }
            _ => {
                return Err(DmError::NotFound(format!(
                    "{}/{}/{} does not exist",
                    OID_ACCESS_CONTROL, iid, rid
                )))
            }
        }
        self.needs_validation = true;
        self.mark_modified();
        Ok(())
    }

    /// Clears the ACL list; the resource stays present.
    fn resource_reset(&mut self, _registry: &Registry, iid: Iid, rid: Rid) -> Result<(), DmError> {
        if rid != RID_ACCESS_CONTROL_ACL {
            return Err(DmError::MethodNotAllowed(format!(
                "{}/{}/{} cannot be reset",
                OID_ACCESS_CONTROL, iid, rid
            )));
        }
        let inst = self
            .current
            .instances
            .find_mut(iid)
            .ok_or_else(|| DmError::NotFound(format!("{}/{}", OID_ACCESS_CONTROL, iid)))?;
        inst.acl.clear();
        inst.has_acl = true;
        self.needs_validation = true;
        self.mark_modified();
        Ok(())
    }

    fn instance_create(&mut self, _registry: &Registry, iid: Iid) -> Result<(), DmError> {
        let inst = AclInstance {
            iid,
            target: AclTarget {
                oid: Oid(0),
                iid: TargetIid::Unset,
            },
            owner: Ssid::BOOTSTRAP,
            has_acl: false,
            acl: KeyedVec::new(),
        };
        self.current.instances.insert(inst).map_err(|_| {
            DmError::BadRequest(format!("{}/{} already exists", OID_ACCESS_CONTROL, iid))
        })?;
        self.needs_validation = true;
        self.mark_modified();
        Ok(())
    }

    fn instance_remove(&mut self, _registry: &Registry, iid: Iid) -> Result<(), DmError> {
        self.current
            .instances
            .remove(iid)
            .ok_or_else(|| DmError::NotFound(format!("{}/{}", OID_ACCESS_CONTROL, iid)))?;
        self.mark_modified();
        Ok(())
    }

    fn instance_reset(&mut self, _registry: &Registry, iid: Iid) -> Result<(), DmError> {
        let inst = self
            .current
            .instances
            .find_mut(iid)
            .ok_or_else(|| DmError::NotFound(format!("{}/{}", OID_ACCESS_CONTROL, iid)))?;
        inst.acl.clear();
        inst.has_acl = false;
        inst.owner = Ssid::ANY;
        self.needs_validation = true;
        self.mark_modified();
        Ok(())
    }

    fn transaction_begin(&mut self) -> Result<(), DmError> {
        if self.saved.is_some() {
            return Err(DmError::Internal(
                "access control transaction already open".to_string(),
            ));
        }
        self.saved = Some(self.current.clone());
        Ok(())
    }

    fn transaction_validate(&mut self, registry: &Registry) -> Result<(), DmError> {
        if self.saved.is_none() {
            return Err(DmError::Internal(
                "access control transaction not open".to_string(),
            ));
        }
        if self.needs_validation {
            self.validate_all(registry)?;
            self.needs_validation = false;
        }
        Ok(())
    }

    fn transaction_commit(&mut self) -> Result<(), DmError> {
        self.saved = None;
        self.needs_validation = false;
        Ok(())
    }

    fn transaction_rollback(&mut self) -> Result<(), DmError> {
        match self.saved.take() {
            Some(saved) => {
                self.current = saved;
                self.needs_validation = false;
                Ok(())
            }
            None => Err(DmError::Internal(
                "access control transaction not open".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use petrel_registry::testing::MockObject;

    use super::*;

    fn registry_fixture() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(Rc::new(RefCell::new(MockObject::server(&[(0, 2), (1, 14)]))))
            .unwrap();
        let obj = Rc::new(RefCell::new(MockObject::new(Oid(42))));
        obj.borrow_mut().add_instance(Iid(1));
        registry.register(obj).unwrap();
        registry
    }

    #[test]
    fn set_acl_creates_instance_with_lowest_free_iid() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();

        ac.set_acl(
            &registry,
            &mut queue,
            Oid(42),
            Some(Iid(1)),
            Ssid(2),
            AccessMask::READ,
        )
        .unwrap();

        let inst = ac.find_instance(Iid(0)).unwrap();
        assert_eq!(inst.target.oid, Oid(42));
        assert_eq!(inst.target.iid, TargetIid::Instance(Iid(1)));
        assert_eq!(inst.owner, Ssid::BOOTSTRAP);
        assert!(inst.has_acl);
        assert_eq!(inst.acl.find(Ssid(2)).unwrap().mask, AccessMask::READ);

        let entries = queue.take_entries();
        assert_eq!(entries[0].oid, OID_ACCESS_CONTROL);
        assert_eq!(entries[0].instance_changes.added, vec![Iid(0)]);
    }

    #[test]
    fn set_acl_updates_existing_entry_in_place() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();

        ac.set_acl(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(2), AccessMask::READ)
            .unwrap();
        ac.set_acl(
            &registry,
            &mut queue,
            Oid(42),
            Some(Iid(1)),
            Ssid(2),
            AccessMask::READ | AccessMask::WRITE,
        )
        .unwrap();

        assert_eq!(ac.current.instances.len(), 1);
        let inst = ac.find_instance(Iid(0)).unwrap();
        assert_eq!(
            inst.acl.find(Ssid(2)).unwrap().mask,
            AccessMask::READ | AccessMask::WRITE
        );
    }

    #[test]
    fn set_acl_then_empty_mask_round_trip() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();

        ac.set_acl(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(2), AccessMask::READ)
            .unwrap();
        ac.set_acl(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(2), AccessMask::EMPTY)
            .unwrap();

        // an empty mask removes the entry; the instance itself stays
        let inst = ac.find_instance(Iid(0)).unwrap();
        assert!(inst.acl.find(Ssid(2)).is_none());
        assert!(inst.has_acl);
    }

    #[test]
    fn set_acl_boundary_rules() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();

        // bootstrap SSID is reserved
        let err = ac
            .set_acl(
                &registry,
                &mut queue,
                Oid(42),
                Some(Iid(1)),
                Ssid::BOOTSTRAP,
                AccessMask::READ,
            )
            .unwrap_err();
        assert!(matches!(err, DmError::BadRequest(_)));

        // Create is rejected on instances
        let err = ac
            .set_acl(
                &registry,
                &mut queue,
                Oid(42),
                Some(Iid(1)),
                Ssid(2),
                AccessMask::CREATE | AccessMask::READ,
            )
            .unwrap_err();
        assert!(matches!(err, DmError::BadRequest(_)));

        // object level accepts only Create
        let err = ac
            .set_acl(&registry, &mut queue, Oid(42), None, Ssid(2), AccessMask::READ)
            .unwrap_err();
        assert!(matches!(err, DmError::BadRequest(_)));
        ac.set_acl(&registry, &mut queue, Oid(42), None, Ssid(2), AccessMask::CREATE)
            .unwrap();

        // ssid 0 is a valid ACL entry key
        ac.set_acl(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid::ANY, AccessMask::READ)
            .unwrap();
    }

    #[test]
    fn set_acl_rejects_unreachable_targets() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();

        // unknown object
        assert!(ac
            .set_acl(&registry, &mut queue, Oid(99), Some(Iid(1)), Ssid(2), AccessMask::READ)
            .is_err());
        // absent instance
        assert!(ac
            .set_acl(&registry, &mut queue, Oid(42), Some(Iid(9)), Ssid(2), AccessMask::READ)
            .is_err());
        // the Access Control object itself
        assert!(ac
            .set_acl(
                &registry,
                &mut queue,
                OID_ACCESS_CONTROL,
                Some(Iid(0)),
                Ssid(2),
                AccessMask::READ
            )
            .is_err());
        // unknown server for a fresh entry
        assert!(ac
            .set_acl(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(7), AccessMask::READ)
            .is_err());
        assert!(ac.current.instances.is_empty());
    }

    #[test]
    fn set_owner_conflict_protocol() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();

        let mut acl_iid = None;
        ac.set_owner(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(14), &mut acl_iid)
            .unwrap();
        assert_eq!(acl_iid, Some(Iid(0)));

        // asking for a different ACL IID for the same target fails and
        // reports the existing one
        let mut conflicting = Some(Iid(5));
        let err = ac
            .set_owner(
                &registry,
                &mut queue,
                Oid(42),
                Some(Iid(1)),
                Ssid(2),
                &mut conflicting,
            )
            .unwrap_err();
        assert!(matches!(err, DmError::BadRequest(_)));
        assert_eq!(conflicting, Some(Iid(0)));
        assert_eq!(ac.find_instance(Iid(0)).unwrap().owner, Ssid(14));
    }

    #[test]
    fn set_owner_validates_ssids() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();

        let mut acl_iid = None;
        // ssid 0 can never own an instance
        assert!(ac
            .set_owner(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid::ANY, &mut acl_iid)
            .is_err());
        // unknown server
        assert!(ac
            .set_owner(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(7), &mut acl_iid)
            .is_err());
        assert!(ac.current.instances.is_empty());
        // the bootstrap server is allowed here
        ac.set_owner(
            &registry,
            &mut queue,
            Oid(42),
            Some(Iid(1)),
            Ssid::BOOTSTRAP,
            &mut acl_iid,
        )
        .unwrap();
        assert_eq!(acl_iid, Some(Iid(0)));
    }

    #[test]
    fn transaction_rollback_restores_state() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();

        let mut acl_iid = None;
        ac.set_owner(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(14), &mut acl_iid)
            .unwrap();
        ac.set_acl(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(2), AccessMask::READ)
            .unwrap();

        ac.transaction_begin().unwrap();
        // a server write adds an entry for an unknown server; validation is
        // deferred to the transaction
        ac.resource_write(
            &registry,
            Iid(0),
            RID_ACCESS_CONTROL_ACL,
            Some(Riid(7)),
            &Value::Int(i64::from(AccessMask::WRITE.bits())),
        )
        .unwrap();
        let err = ac.transaction_validate(&registry).unwrap_err();
        assert!(matches!(err, DmError::BadRequest(_)));
        ac.transaction_rollback().unwrap();

        let inst = ac.find_instance(Iid(0)).unwrap();
        let ssids: Vec<Ssid> = inst.acl.keys().collect();
        assert_eq!(ssids, vec![Ssid(2)]);
        assert_eq!(inst.acl.find(Ssid(2)).unwrap().mask, AccessMask::READ);
        assert_eq!(inst.owner, Ssid(14));
        assert!(!ac.needs_validation);
    }

    #[test]
    fn validate_rejects_duplicate_targets() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();

        ac.transaction_begin().unwrap();
        ac.instance_create(&registry, Iid(0)).unwrap();
        ac.instance_create(&registry, Iid(1)).unwrap();
        for iid in [Iid(0), Iid(1)] {
            ac.resource_write(&registry, iid, RID_ACCESS_CONTROL_OID, None, &Value::Int(42))
                .unwrap();
            ac.resource_write(&registry, iid, RID_ACCESS_CONTROL_OIID, None, &Value::Int(1))
                .unwrap();
        }
        let err = ac.transaction_validate(&registry).unwrap_err();
        assert!(matches!(err, DmError::BadRequest(_)));
        ac.transaction_rollback().unwrap();
        assert!(ac.current.instances.is_empty());
    }

    #[test]
    fn validate_rejects_unset_targets() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();

        ac.transaction_begin().unwrap();
        ac.instance_create(&registry, Iid(3)).unwrap();
        let err = ac.transaction_validate(&registry).unwrap_err();
        assert!(matches!(err, DmError::BadRequest(_)));
        ac.transaction_rollback().unwrap();
    }

    #[test]
    fn validate_passes_clean_state_and_clears_flag() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();
        ac.set_acl(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(2), AccessMask::READ)
            .unwrap();

        ac.transaction_begin().unwrap();
        ac.resource_write(&registry, Iid(0), RID_ACCESS_CONTROL_OWNER, None, &Value::Int(14))
            .unwrap();
        assert!(ac.needs_validation);
        ac.transaction_validate(&registry).unwrap();
        assert!(!ac.needs_validation);
        ac.transaction_commit().unwrap();
        assert_eq!(ac.find_instance(Iid(0)).unwrap().owner, Ssid(14));
    }

    #[test]
    fn instance_lifecycle_through_handlers() {
        let registry = Registry::new();
        let mut ac = AccessControl::new();
        ac.instance_create(&registry, Iid(2)).unwrap();
        let inst = ac.find_instance(Iid(2)).unwrap();
        assert_eq!(inst.owner, Ssid::BOOTSTRAP);
        assert!(!inst.has_acl);
        assert_eq!(inst.target.iid, TargetIid::Unset);

        // duplicate create is rejected
        assert!(ac.instance_create(&registry, Iid(2)).is_err());

        ac.instance_reset(&registry, Iid(2)).unwrap();
        let inst = ac.find_instance(Iid(2)).unwrap();
        assert_eq!(inst.owner, Ssid::ANY);
        assert!(!inst.has_acl);

        ac.instance_remove(&registry, Iid(2)).unwrap();
        assert!(matches!(
            ac.instance_remove(&registry, Iid(2)),
            Err(DmError::NotFound(_))
        ));
    }

    #[test]
    fn acl_resource_reset_keeps_resource_present() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();
        ac.set_acl(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(2), AccessMask::READ)
            .unwrap();

        ac.resource_reset(&registry, Iid(0), RID_ACCESS_CONTROL_ACL)
            .unwrap();
        let inst = ac.find_instance(Iid(0)).unwrap();
        assert!(inst.acl.is_empty());
        assert!(inst.has_acl);

        let defs = ac.list_resources(Iid(0)).unwrap();
        let acl_def = defs
            .iter()
            .find(|def| def.rid == RID_ACCESS_CONTROL_ACL)
            .unwrap();
        assert!(acl_def.is_present());
    }

    #[test]
    fn resource_reads() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();
        ac.set_acl(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(2), AccessMask::READ)
            .unwrap();

        assert_eq!(
            ac.resource_read(Iid(0), RID_ACCESS_CONTROL_OID, None).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            ac.resource_read(Iid(0), RID_ACCESS_CONTROL_OIID, None).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            ac.resource_read(Iid(0), RID_ACCESS_CONTROL_ACL, Some(Riid(2)))
                .unwrap(),
            Value::Int(i64::from(AccessMask::READ.bits()))
        );
        assert!(matches!(
            ac.resource_read(Iid(0), RID_ACCESS_CONTROL_ACL, Some(Riid(9))),
            Err(DmError::NotFound(_))
        ));
        assert_eq!(
            ac.resource_read(Iid(0), RID_ACCESS_CONTROL_OWNER, None).unwrap(),
            Value::Int(i64::from(Ssid::BOOTSTRAP.0))
        );
        let riids = ac
            .list_resource_instances(Iid(0), RID_ACCESS_CONTROL_ACL)
            .unwrap();
        assert_eq!(riids, vec![Riid(2)]);
    }

    #[test]
    fn resource_write_validations() {
        let registry = Registry::new();
        let mut ac = AccessControl::new();
        ac.instance_create(&registry, Iid(0)).unwrap();

        // target oid must be valid
        assert!(ac
            .resource_write(&registry, Iid(0), RID_ACCESS_CONTROL_OID, None, &Value::Int(0))
            .is_err());
        assert!(ac
            .resource_write(
                &registry,
                Iid(0),
                RID_ACCESS_CONTROL_OID,
                None,
                &Value::Int(i64::from(ID_INVALID))
            )
            .is_err());
        // owner 0 is rejected on write
        assert!(ac
            .resource_write(&registry, Iid(0), RID_ACCESS_CONTROL_OWNER, None, &Value::Int(0))
            .is_err());
        // unknown mask bits are rejected
        assert!(ac
            .resource_write(
                &registry,
                Iid(0),
                RID_ACCESS_CONTROL_ACL,
                Some(Riid(2)),
                &Value::Int(0x100)
            )
            .is_err());
        // the ACL resource needs a resource instance
        assert!(ac
            .resource_write(&registry, Iid(0), RID_ACCESS_CONTROL_ACL, None, &Value::Int(1))
            .is_err());
    }

    #[test]
    fn purge_clears_everything() {
        let registry = registry_fixture();
        let mut ac = AccessControl::new();
        let mut queue = NotifyQueue::new();
        ac.set_acl(&registry, &mut queue, Oid(42), Some(Iid(1)), Ssid(2), AccessMask::READ)
            .unwrap();
        queue.take_entries();

        ac.purge(&mut queue);
        assert!(ac.current.instances.is_empty());
        assert!(ac.is_modified());
        let entries = queue.take_entries();
        assert_eq!(entries[0].oid, OID_ACCESS_CONTROL);
    }
}
