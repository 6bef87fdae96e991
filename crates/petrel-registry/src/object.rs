use std::cell::RefCell;
use std::rc::Rc;

use petrel_domain::{CommonAttrs, DmError, Iid, Oid, ResourceAttrs, Rid, Riid, Ssid, Value};

use crate::registry::Registry;

/// An installed object, shared between the registry and whatever module owns
/// its state. Single-threaded by design; see the crate docs.
pub type SharedObject = Rc<RefCell<dyn ObjectHandler>>;

/// Operations a resource supports, and whether it may hold multiple
/// resource instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Read-only.
    R,
    /// Write-only.
    W,
    /// Read/write.
    Rw,
    /// Read-only, multiple instances.
    Rm,
    /// Write-only, multiple instances.
    Wm,
    /// Read/write, multiple instances.
    Rwm,
    /// Executable.
    E,
    /// Readable and writable only by the bootstrap server.
    BsRw,
}

impl ResourceKind {
    pub fn is_multiple(self) -> bool {
        matches!(self, ResourceKind::Rm | ResourceKind::Wm | ResourceKind::Rwm)
    }

    pub fn is_readable(self) -> bool {
        matches!(
            self,
            ResourceKind::R | ResourceKind::Rw | ResourceKind::Rm | ResourceKind::Rwm
        )
    }

    pub fn is_writable(self) -> bool {
        matches!(
            self,
            ResourceKind::W | ResourceKind::Rw | ResourceKind::Wm | ResourceKind::Rwm
        )
    }
}

/// Whether a declared resource currently holds a value.
///
/// Absent resources are still reported by `list_resources` so that
/// reconciliation can react to their disappearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePresence {
    Present,
    Absent,
}

/// One entry of a `list_resources` enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDef {
    pub rid: Rid,
    pub kind: ResourceKind,
    pub presence: ResourcePresence,
}

impl ResourceDef {
    pub fn present(rid: Rid, kind: ResourceKind) -> ResourceDef {
        ResourceDef {
            rid,
            kind,
            presence: ResourcePresence::Present,
        }
    }

    pub fn absent(rid: Rid, kind: ResourceKind) -> ResourceDef {
        ResourceDef {
            rid,
            kind,
            presence: ResourcePresence::Absent,
        }
    }

    pub fn is_present(&self) -> bool {
        self.presence == ResourcePresence::Present
    }
}

/// The capability set of an installed object.
///
/// `list_instances`, `list_resources` and `list_resource_instances` must
/// report identifiers in ascending order; the registry normalizes the lists
/// before handing them to the merge sweeps that rely on the ordering.
///
/// Handlers must not re-enter their own object through the [`Registry`]
/// reference passed to `transaction_validate`; all other objects are fair
/// game.
pub trait ObjectHandler {
    fn oid(&self) -> Oid;

    /// Object version advertised during registration, e.g. `"1.1"`.
    fn version(&self) -> Option<&str> {
        None
    }

    fn list_instances(&self) -> Result<Vec<Iid>, DmError>;

    fn list_resources(&self, iid: Iid) -> Result<Vec<ResourceDef>, DmError>;

    fn list_resource_instances(&self, _iid: Iid, _rid: Rid) -> Result<Vec<Riid>, DmError> {
        Ok(Vec::new())
    }

    fn resource_read(&self, iid: Iid, rid: Rid, riid: Option<Riid>) -> Result<Value, DmError>;

    fn resource_write(
        &mut self,
        _registry: &Registry,
        iid: Iid,
        rid: Rid,
        _riid: Option<Riid>,
        _value: &Value,
    ) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed(format!(
            "{}/{}/{} is not writable",
            self.oid(),
            iid,
            rid
        )))
    }

    /// Clears a multiple-instance resource as part of a partial-update write.
    fn resource_reset(&mut self, _registry: &Registry, iid: Iid, rid: Rid) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed(format!(
            "{}/{}/{} cannot be reset",
            self.oid(),
            iid,
            rid
        )))
    }

    fn resource_execute(
        &mut self,
        _registry: &Registry,
        iid: Iid,
        rid: Rid,
        _args: &str,
    ) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed(format!(
            "{}/{}/{} is not executable",
            self.oid(),
            iid,
            rid
        )))
    }

    fn instance_create(&mut self, _registry: &Registry, _iid: Iid) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed(format!(
            "{} does not support instance creation",
            self.oid()
        )))
    }

    fn instance_remove(&mut self, _registry: &Registry, _iid: Iid) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed(format!(
            "{} does not support instance removal",
            self.oid()
        )))
    }

    fn instance_reset(&mut self, _registry: &Registry, _iid: Iid) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed(format!(
            "{} does not support instance reset",
            self.oid()
        )))
    }

    fn transaction_begin(&mut self) -> Result<(), DmError> {
        Ok(())
    }

    fn transaction_validate(&mut self, _registry: &Registry) -> Result<(), DmError> {
        Ok(())
    }

    fn transaction_commit(&mut self) -> Result<(), DmError> {
        Ok(())
    }

    fn transaction_rollback(&mut self) -> Result<(), DmError> {
        Ok(())
    }

    // ── Optional self-managed notification attributes ────────────────────────
    // An object that answers `true` here takes over attribute handling for
    // the given level; the built-in attribute storage becomes a pass-through.

    fn has_own_object_attrs(&self) -> bool {
        false
    }

    fn has_own_instance_attrs(&self) -> bool {
        false
    }

    fn has_own_resource_attrs(&self) -> bool {
        false
    }

    fn read_object_default_attrs(&self, _ssid: Ssid) -> Result<CommonAttrs, DmError> {
        Ok(CommonAttrs::EMPTY)
    }

    fn write_object_default_attrs(
        &mut self,
        _ssid: Ssid,
        _attrs: &CommonAttrs,
    ) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed(format!(
            "{} does not manage object attributes",
            self.oid()
        )))
    }

    fn read_instance_default_attrs(&self, _iid: Iid, _ssid: Ssid) -> Result<CommonAttrs, DmError> {
        Ok(CommonAttrs::EMPTY)
    }

    fn write_instance_default_attrs(
        &mut self,
        _iid: Iid,
        _ssid: Ssid,
        _attrs: &CommonAttrs,
    ) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed(format!(
            "{} does not manage instance attributes",
            self.oid()
        )))
    }

    /// Covers both the resource level (`riid == None`) and the
    /// resource-instance level.
    fn read_resource_attrs(
        &self,
        _iid: Iid,
        _rid: Rid,
        _riid: Option<Riid>,
        _ssid: Ssid,
    ) -> Result<ResourceAttrs, DmError> {
        Ok(ResourceAttrs::EMPTY)
    }

    fn write_resource_attrs(
        &mut self,
        _iid: Iid,
        _rid: Rid,
        _riid: Option<Riid>,
        _ssid: Ssid,
        _attrs: &ResourceAttrs,
    ) -> Result<(), DmError> {
        Err(DmError::MethodNotAllowed(format!(
            "{} does not manage resource attributes",
            self.oid()
        )))
    }
}
