use tracing::{debug, info, warn};

use petrel_domain::{CommonAttrs, DmError, Iid, Keyed, KeyedVec, Oid, ResourceAttrs, Rid, Riid, Ssid};
use petrel_notify::NotifyQueue;
use petrel_registry::Registry;

use crate::persistence;

// ── Tree entries ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DefaultAttrsEntry {
    pub ssid: Ssid,
    pub attrs: CommonAttrs,
}

impl Keyed for DefaultAttrsEntry {
    type Key = Ssid;

    fn key(&self) -> Ssid {
        self.ssid
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResourceAttrsEntry {
    pub ssid: Ssid,
    pub attrs: ResourceAttrs,
}

impl Keyed for ResourceAttrsEntry {
    type Key = Ssid;

    fn key(&self) -> Ssid {
        self.ssid
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResourceInstanceEntry {
    pub riid: Riid,
    pub attrs: KeyedVec<ResourceAttrsEntry>,
}

impl ResourceInstanceEntry {
    pub fn new(riid: Riid) -> ResourceInstanceEntry {
        ResourceInstanceEntry {
            riid,
            attrs: KeyedVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

impl Keyed for ResourceInstanceEntry {
    type Key = Riid;

    fn key(&self) -> Riid {
        self.riid
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResourceEntry {
    pub rid: Rid,
    pub attrs: KeyedVec<ResourceAttrsEntry>,
    pub instances: KeyedVec<ResourceInstanceEntry>,
}

impl ResourceEntry {
    pub fn new(rid: Rid) -> ResourceEntry {
        ResourceEntry {
            rid,
            attrs: KeyedVec::new(),
            instances: KeyedVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty() && self.instances.is_empty()
    }
}

impl Keyed for ResourceEntry {
    type Key = Rid;

    fn key(&self) -> Rid {
        self.rid
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InstanceEntry {
    pub iid: Iid,
    pub default_attrs: KeyedVec<DefaultAttrsEntry>,
    pub resources: KeyedVec<ResourceEntry>,
}

impl InstanceEntry {
    pub fn new(iid: Iid) -> InstanceEntry {
        InstanceEntry {
            iid,
            default_attrs: KeyedVec::new(),
            resources: KeyedVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.default_attrs.is_empty() && self.resources.is_empty()
    }
}

impl Keyed for InstanceEntry {
    type Key = Iid;

    fn key(&self) -> Iid {
        self.iid
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ObjectEntry {
    pub oid: Oid,
    pub default_attrs: KeyedVec<DefaultAttrsEntry>,
    pub instances: KeyedVec<InstanceEntry>,
}

impl ObjectEntry {
    pub fn new(oid: Oid) -> ObjectEntry {
        ObjectEntry {
            oid,
            default_attrs: KeyedVec::new(),
            instances: KeyedVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.default_attrs.is_empty() && self.instances.is_empty()
    }
}

impl Keyed for ObjectEntry {
    type Key = Oid;

    fn key(&self) -> Oid {
        self.oid
    }
}

// ── Attribute storage ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SavedState {
    depth: usize,
    data: Vec<u8>,
    modified_since_persist: bool,
}

/// The attribute store.
///
/// Entries exist only while they hold at least one non-empty attribute
/// record somewhere in their subtree; every mutation path prunes emptied
/// parents from the deepest touched level upward.
#[derive(Debug, Default)]
pub struct AttrStorage {
    pub(crate) objects: KeyedVec<ObjectEntry>,
    pub(crate) modified_since_persist: bool,
    saved: SavedState,
}

fn upsert_default_attrs(
    list: &mut KeyedVec<DefaultAttrsEntry>,
    ssid: Ssid,
    attrs: &CommonAttrs,
    modified: &mut bool,
) {
    if attrs.is_empty() {
        if list.remove(ssid).is_some() {
            *modified = true;
        }
    } else {
        list.find_or_create_with(ssid, || DefaultAttrsEntry {
            ssid,
            attrs: CommonAttrs::EMPTY,
        })
        .attrs = *attrs;
        *modified = true;
    }
}

fn upsert_resource_attrs(
    list: &mut KeyedVec<ResourceAttrsEntry>,
    ssid: Ssid,
    attrs: &ResourceAttrs,
    modified: &mut bool,
) {
    if attrs.is_empty() {
        if list.remove(ssid).is_some() {
            *modified = true;
        }
    } else {
        list.find_or_create_with(ssid, || ResourceAttrsEntry {
            ssid,
            attrs: ResourceAttrs::EMPTY,
        })
        .attrs = *attrs;
        *modified = true;
    }
}

fn read_default_attrs(list: Option<&KeyedVec<DefaultAttrsEntry>>, ssid: Ssid) -> CommonAttrs {
    list.and_then(|list| list.find(ssid))
        .map(|entry| entry.attrs)
        .unwrap_or(CommonAttrs::EMPTY)
}

fn read_resource_attrs_list(
    list: Option<&KeyedVec<ResourceAttrsEntry>>,
    ssid: Ssid,
) -> ResourceAttrs {
    list.and_then(|list| list.find(ssid))
        .map(|entry| entry.attrs)
        .unwrap_or(ResourceAttrs::EMPTY)
}

impl AttrStorage {
    pub fn new() -> AttrStorage {
        AttrStorage::default()
    }

    /// Whether any structural change happened since the last successful
    /// `persist`.
    pub fn is_modified(&self) -> bool {
        self.modified_since_persist
    }

    pub(crate) fn mark_modified(&mut self) {
        self.modified_since_persist = true;
    }

    /// Drops all stored attributes and marks the store modified.
    pub fn purge(&mut self) {
        self.objects.clear();
        self.mark_modified();
    }

    /// Drops the whole subtree of `oid` (unregister cascade).
    pub fn remove_object(&mut self, oid: Oid) {
        if self.objects.remove(oid).is_some() {
            self.mark_modified();
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn object_attrs(
        &self,
        registry: &Registry,
        oid: Oid,
        ssid: Ssid,
    ) -> Result<CommonAttrs, DmError> {
        let obj = registry
            .find(oid)
            .ok_or_else(|| DmError::NotFound(format!("object {} is not registered", oid)))?;
        if obj.borrow().has_own_object_attrs() {
            return obj.borrow().read_object_default_attrs(ssid);
        }
        Ok(read_default_attrs(
            self.objects.find(oid).map(|entry| &entry.default_attrs),
            ssid,
        ))
    }

    pub fn instance_attrs(
        &self,
        registry: &Registry,
        oid: Oid,
        iid: Iid,
        ssid: Ssid,
    ) -> Result<CommonAttrs, DmError> {
        let obj = registry
            .find(oid)
            .ok_or_else(|| DmError::NotFound(format!("object {} is not registered", oid)))?;
        if obj.borrow().has_own_instance_attrs() {
            return obj.borrow().read_instance_default_attrs(iid, ssid);
        }
        Ok(read_default_attrs(
            self.objects
                .find(oid)
                .and_then(|entry| entry.instances.find(iid))
                .map(|inst| &inst.default_attrs),
            ssid,
        ))
    }

    pub fn resource_attrs(
        &self,
        registry: &Registry,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        ssid: Ssid,
    ) -> Result<ResourceAttrs, DmError> {
        let obj = registry
            .find(oid)
            .ok_or_else(|| DmError::NotFound(format!("object {} is not registered", oid)))?;
        if obj.borrow().has_own_resource_attrs() {
            return obj.borrow().read_resource_attrs(iid, rid, None, ssid);
        }
        Ok(read_resource_attrs_list(
            self.objects
                .find(oid)
                .and_then(|entry| entry.instances.find(iid))
                .and_then(|inst| inst.resources.find(rid))
                .map(|res| &res.attrs),
            ssid,
        ))
    }

    pub fn resource_instance_attrs(
        &self,
        registry: &Registry,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        riid: Riid,
        ssid: Ssid,
    ) -> Result<ResourceAttrs, DmError> {
        let obj = registry
            .find(oid)
            .ok_or_else(|| DmError::NotFound(format!("object {} is not registered", oid)))?;
        if obj.borrow().has_own_resource_attrs() {
            return obj.borrow().read_resource_attrs(iid, rid, Some(riid), ssid);
        }
        Ok(read_resource_attrs_list(
            self.objects
                .find(oid)
                .and_then(|entry| entry.instances.find(iid))
                .and_then(|inst| inst.resources.find(rid))
                .and_then(|res| res.instances.find(riid))
                .map(|ri| &ri.attrs),
            ssid,
        ))
    }

    // ── Raw writes ───────────────────────────────────────────────────────────
    // No SSID or presence validation; used by the dm dispatch layer which has
    // already resolved the target, and by tests. An all-`NONE` payload
    // removes the record.

    pub fn write_object_attrs(&mut self, oid: Oid, ssid: Ssid, attrs: &CommonAttrs) {
        let AttrStorage {
            objects,
            modified_since_persist,
            ..
        } = self;
        let entry = objects.find_or_create_with(oid, || ObjectEntry::new(oid));
        upsert_default_attrs(&mut entry.default_attrs, ssid, attrs, modified_since_persist);
        objects.remove_if(oid, ObjectEntry::is_empty);
    }

    pub fn write_instance_attrs(&mut self, oid: Oid, iid: Iid, ssid: Ssid, attrs: &CommonAttrs) {
        let AttrStorage {
            objects,
            modified_since_persist,
            ..
        } = self;
        let entry = objects.find_or_create_with(oid, || ObjectEntry::new(oid));
        let inst = entry.instances.find_or_create_with(iid, || InstanceEntry::new(iid));
        upsert_default_attrs(&mut inst.default_attrs, ssid, attrs, modified_since_persist);
        entry.instances.remove_if(iid, InstanceEntry::is_empty);
        objects.remove_if(oid, ObjectEntry::is_empty);
    }

    pub fn write_resource_attrs(
        &mut self,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        ssid: Ssid,
        attrs: &ResourceAttrs,
    ) {
        let AttrStorage {
            objects,
            modified_since_persist,
            ..
        } = self;
        let entry = objects.find_or_create_with(oid, || ObjectEntry::new(oid));
        let inst = entry.instances.find_or_create_with(iid, || InstanceEntry::new(iid));
        let res = inst.resources.find_or_create_with(rid, || ResourceEntry::new(rid));
        upsert_resource_attrs(&mut res.attrs, ssid, attrs, modified_since_persist);
        inst.resources.remove_if(rid, ResourceEntry::is_empty);
        entry.instances.remove_if(iid, InstanceEntry::is_empty);
        objects.remove_if(oid, ObjectEntry::is_empty);
    }

    pub fn write_resource_instance_attrs(
        &mut self,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        riid: Riid,
        ssid: Ssid,
        attrs: &ResourceAttrs,
    ) {
        let AttrStorage {
            objects,
            modified_since_persist,
            ..
        } = self;
        let entry = objects.find_or_create_with(oid, || ObjectEntry::new(oid));
        let inst = entry.instances.find_or_create_with(iid, || InstanceEntry::new(iid));
        let res = inst.resources.find_or_create_with(rid, || ResourceEntry::new(rid));
        let ri = res
            .instances
            .find_or_create_with(riid, || ResourceInstanceEntry::new(riid));
        upsert_resource_attrs(&mut ri.attrs, ssid, attrs, modified_since_persist);
        res.instances.remove_if(riid, ResourceInstanceEntry::is_empty);
        inst.resources.remove_if(rid, ResourceEntry::is_empty);
        entry.instances.remove_if(iid, InstanceEntry::is_empty);
        objects.remove_if(oid, ObjectEntry::is_empty);
    }

    // ── Validated setters ────────────────────────────────────────────────────

    fn check_set_preconditions(
        &self,
        registry: &Registry,
        ssid: Ssid,
        oid: Oid,
    ) -> Result<petrel_registry::SharedObject, DmError> {
        if ssid == Ssid::BOOTSTRAP || !registry.server_ssid_exists(ssid) {
            warn!(%ssid, "attribute write with unusable SSID");
            return Err(DmError::BadRequest(format!("SSID {} does not exist", ssid)));
        }
        registry
            .find(oid)
            .ok_or_else(|| DmError::NotFound(format!("object {} is not registered", oid)))
    }

    pub fn set_object_attrs(
        &mut self,
        registry: &Registry,
        queue: &mut NotifyQueue,
        ssid: Ssid,
        oid: Oid,
        attrs: &CommonAttrs,
    ) -> Result<(), DmError> {
        let obj = self.check_set_preconditions(registry, ssid, oid)?;
        if obj.borrow().has_own_object_attrs() {
            return Err(DmError::MethodNotAllowed(format!(
                "object {} manages its own object-level attributes",
                oid
            )));
        }
        self.write_object_attrs(oid, ssid, attrs);
        queue.mark_unknown_change(oid);
        Ok(())
    }

    pub fn set_instance_attrs(
        &mut self,
        registry: &Registry,
        queue: &mut NotifyQueue,
        ssid: Ssid,
        oid: Oid,
        iid: Iid,
        attrs: &CommonAttrs,
    ) -> Result<(), DmError> {
        let obj = self.check_set_preconditions(registry, ssid, oid)?;
        if obj.borrow().has_own_instance_attrs() {
            return Err(DmError::MethodNotAllowed(format!(
                "object {} manages its own instance-level attributes",
                oid
            )));
        }
        if !registry.instance_present(oid, iid)? {
            return Err(DmError::NotFound(format!("{}/{} does not exist", oid, iid)));
        }
        self.write_instance_attrs(oid, iid, ssid, attrs);
        queue.mark_unknown_change(oid);
        Ok(())
    }

    pub fn set_resource_attrs(
        &mut self,
        registry: &Registry,
        queue: &mut NotifyQueue,
        ssid: Ssid,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        attrs: &ResourceAttrs,
    ) -> Result<(), DmError> {
        let obj = self.check_set_preconditions(registry, ssid, oid)?;
        if obj.borrow().has_own_resource_attrs() {
            return Err(DmError::MethodNotAllowed(format!(
                "object {} manages its own resource-level attributes",
                oid
            )));
        }
        if !registry.instance_present(oid, iid)? {
            return Err(DmError::NotFound(format!("{}/{} does not exist", oid, iid)));
        }
        if !registry.resource_present(oid, iid, rid)? {
            return Err(DmError::NotFound(format!(
                "{}/{}/{} does not exist",
                oid, iid, rid
            )));
        }
        self.write_resource_attrs(oid, iid, rid, ssid, attrs);
        queue.mark_unknown_change(oid);
        Ok(())
    }

    pub fn set_resource_instance_attrs(
        &mut self,
        registry: &Registry,
        queue: &mut NotifyQueue,
        ssid: Ssid,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        riid: Riid,
        attrs: &ResourceAttrs,
    ) -> Result<(), DmError> {
        let obj = self.check_set_preconditions(registry, ssid, oid)?;
        if obj.borrow().has_own_resource_attrs() {
            return Err(DmError::MethodNotAllowed(format!(
                "object {} manages its own resource-level attributes",
                oid
            )));
        }
        if !registry.instance_present(oid, iid)? {
            return Err(DmError::NotFound(format!("{}/{} does not exist", oid, iid)));
        }
        if !registry.resource_present(oid, iid, rid)? {
            return Err(DmError::NotFound(format!(
                "{}/{}/{} does not exist",
                oid, iid, rid
            )));
        }
        if !registry.resource_instance_present(oid, iid, rid, riid)? {
            return Err(DmError::NotFound(format!(
                "{}/{}/{}/{} does not exist",
                oid, iid, rid, riid
            )));
        }
        self.write_resource_instance_attrs(oid, iid, rid, riid, ssid, attrs);
        queue.mark_unknown_change(oid);
        Ok(())
    }

    // ── Transactions ─────────────────────────────────────────────────────────

    /// Snapshots the tree on the outermost `begin`. Nested begins only bump
    /// the depth counter.
    pub fn transaction_begin(&mut self) -> Result<(), DmError> {
        if self.saved.depth == 0 {
            let mut data = Vec::new();
            persistence::persist_tree(&self.objects, &mut data)?;
            self.saved.data = data;
            self.saved.modified_since_persist = self.modified_since_persist;
        }
        self.saved.depth += 1;
        Ok(())
    }

    pub fn transaction_commit(&mut self) {
        debug_assert!(self.saved.depth > 0);
        self.saved.depth = self.saved.depth.saturating_sub(1);
        if self.saved.depth == 0 {
            self.saved.data.clear();
        }
    }

    /// Restores the snapshot taken by the outermost `begin`. A failing
    /// restore leaves the store cleared with the modified flag raised.
    pub fn transaction_rollback(&mut self, registry: &Registry) -> Result<(), DmError> {
        debug_assert!(self.saved.depth > 0);
        self.saved.depth = self.saved.depth.saturating_sub(1);
        if self.saved.depth > 0 {
            return Ok(());
        }
        let data = std::mem::take(&mut self.saved.data);
        match persistence::restore_inner(self, registry, &mut data.as_slice()) {
            Ok(()) => {
                self.modified_since_persist = self.saved.modified_since_persist;
                debug!("attribute storage rolled back");
                Ok(())
            }
            Err(err) => {
                self.modified_since_persist = true;
                Err(DmError::Internal(format!(
                    "attribute storage rollback failed: {}",
                    err
                )))
            }
        }
    }

    // ── Persistence entry points ─────────────────────────────────────────────

    pub fn persist<W: std::io::Write>(&mut self, out: &mut W) -> Result<(), DmError> {
        persistence::persist_tree(&self.objects, out)?;
        self.modified_since_persist = false;
        info!("attribute storage persisted");
        Ok(())
    }

    pub fn restore<R: std::io::Read>(
        &mut self,
        registry: &Registry,
        input: &mut R,
    ) -> Result<(), DmError> {
        let result = persistence::restore_inner(self, registry, input);
        self.modified_since_persist = result.is_err();
        if result.is_ok() {
            info!("attribute storage restored");
        }
        result
    }
}
