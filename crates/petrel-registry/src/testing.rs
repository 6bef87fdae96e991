//! Scriptable object implementations for tests across the workspace.

use std::collections::BTreeMap;

use petrel_domain::{
    DmError, Iid, Oid, Rid, Riid, Value, OID_SECURITY, OID_SERVER, RID_SECURITY_SSID,
    RID_SERVER_SSID,
};

use crate::object::{ObjectHandler, ResourceDef, ResourceKind, ResourcePresence};
use crate::registry::Registry;

#[derive(Debug, Clone)]
struct MockResource {
    kind: ResourceKind,
    presence: ResourcePresence,
    value: Value,
    instances: BTreeMap<Riid, Value>,
}

/// An object whose instances, resources and values are set up imperatively
/// by the test.
#[derive(Debug, Clone)]
pub struct MockObject {
    oid: Oid,
    version: Option<String>,
    instances: BTreeMap<Iid, BTreeMap<Rid, MockResource>>,
    in_transaction: bool,
}

impl MockObject {
    pub fn new(oid: Oid) -> MockObject {
        MockObject {
            oid,
            version: None,
            instances: BTreeMap::new(),
            in_transaction: false,
        }
    }

    /// A Server object announcing the given `(iid, ssid)` pairs.
    pub fn server(instances: &[(u16, u16)]) -> MockObject {
        let mut obj = MockObject::new(OID_SERVER);
        for &(iid, ssid) in instances {
            obj.add_instance(Iid(iid));
            obj.set_resource(
                Iid(iid),
                RID_SERVER_SSID,
                ResourceKind::R,
                Value::Int(i64::from(ssid)),
            );
        }
        obj
    }

    /// A Security object announcing the given `(iid, ssid)` pairs; pass
    /// `ssid == 0` for a bootstrap-server instance.
    pub fn security(instances: &[(u16, u16)]) -> MockObject {
        let mut obj = MockObject::new(OID_SECURITY);
        for &(iid, ssid) in instances {
            obj.add_instance(Iid(iid));
            obj.set_resource(
                Iid(iid),
                RID_SECURITY_SSID,
                ResourceKind::R,
                Value::Int(i64::from(ssid)),
            );
        }
        obj
    }

    pub fn with_version(mut self, version: &str) -> MockObject {
        self.version = Some(version.to_string());
        self
    }

    pub fn add_instance(&mut self, iid: Iid) {
        self.instances.entry(iid).or_default();
    }

    pub fn remove_instance(&mut self, iid: Iid) {
        self.instances.remove(&iid);
    }

    pub fn set_resource(&mut self, iid: Iid, rid: Rid, kind: ResourceKind, value: Value) {
        self.instances.entry(iid).or_default().insert(
            rid,
            MockResource {
                kind,
                presence: ResourcePresence::Present,
                value,
                instances: BTreeMap::new(),
            },
        );
    }

    /// Declares a resource that is currently absent (no value).
    pub fn set_resource_absent(&mut self, iid: Iid, rid: Rid, kind: ResourceKind) {
        self.instances.entry(iid).or_default().insert(
            rid,
            MockResource {
                kind,
                presence: ResourcePresence::Absent,
                value: Value::Int(0),
                instances: BTreeMap::new(),
            },
        );
    }

    pub fn remove_resource(&mut self, iid: Iid, rid: Rid) {
        if let Some(resources) = self.instances.get_mut(&iid) {
            resources.remove(&rid);
        }
    }

    pub fn set_resource_instance(&mut self, iid: Iid, rid: Rid, riid: Riid, value: Value) {
        if let Some(res) = self
            .instances
            .get_mut(&iid)
            .and_then(|resources| resources.get_mut(&rid))
        {
            res.instances.insert(riid, value);
        }
    }

    pub fn remove_resource_instance(&mut self, iid: Iid, rid: Rid, riid: Riid) {
        if let Some(res) = self
            .instances
            .get_mut(&iid)
            .and_then(|resources| resources.get_mut(&rid))
        {
            res.instances.remove(&riid);
        }
    }

    /// Whether a transaction is currently open on this object.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn resource(&self, iid: Iid, rid: Rid) -> Result<&MockResource, DmError> {
        self.instances
            .get(&iid)
            .and_then(|resources| resources.get(&rid))
            .ok_or_else(|| DmError::NotFound(format!("{}/{}/{}", self.oid, iid, rid)))
    }
}

impl ObjectHandler for MockObject {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn list_instances(&self) -> Result<Vec<Iid>, DmError> {
        Ok(self.instances.keys().copied().collect())
    }

    fn list_resources(&self, iid: Iid) -> Result<Vec<ResourceDef>, DmError> {
        let resources = self
            .instances
            .get(&iid)
            .ok_or_else(|| DmError::NotFound(format!("{}/{}", self.oid, iid)))?;
        Ok(resources
            .iter()
            .map(|(rid, res)| ResourceDef {
                rid: *rid,
                kind: res.kind,
                presence: res.presence,
            })
            .collect())
    }

    fn list_resource_instances(&self, iid: Iid, rid: Rid) -> Result<Vec<Riid>, DmError> {
        Ok(self.resource(iid, rid)?.instances.keys().copied().collect())
    }

    fn resource_read(&self, iid: Iid, rid: Rid, riid: Option<Riid>) -> Result<Value, DmError> {
        let res = self.resource(iid, rid)?;
        match riid {
            None => Ok(res.value.clone()),
            Some(riid) => res
                .instances
                .get(&riid)
                .cloned()
                .ok_or_else(|| DmError::NotFound(format!("{}/{}/{}/{}", self.oid, iid, rid, riid))),
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
        let oid = self.oid;
        let res = self
            .instances
            .get_mut(&iid)
            .and_then(|resources| resources.get_mut(&rid))
            .ok_or_else(|| DmError::NotFound(format!("{}/{}/{}", oid, iid, rid)))?;
        match riid {
            None => res.value = value.clone(),
            Some(riid) => {
                res.instances.insert(riid, value.clone());
            }
        }
        res.presence = ResourcePresence::Present;
        Ok(())
    }

    fn instance_create(&mut self, _registry: &Registry, iid: Iid) -> Result<(), DmError> {
        if self.instances.contains_key(&iid) {
            return Err(DmError::BadRequest(format!(
                "{}/{} already exists",
                self.oid, iid
            )));
        }
        self.add_instance(iid);
        Ok(())
    }

    fn instance_remove(&mut self, _registry: &Registry, iid: Iid) -> Result<(), DmError> {
        self.instances
            .remove(&iid)
            .map(|_| ())
            .ok_or_else(|| DmError::NotFound(format!("{}/{}", self.oid, iid)))
    }

    fn transaction_begin(&mut self) -> Result<(), DmError> {
        self.in_transaction = true;
        Ok(())
    }

    fn transaction_commit(&mut self) -> Result<(), DmError> {
        self.in_transaction = false;
        Ok(())
    }

    fn transaction_rollback(&mut self) -> Result<(), DmError> {
        self.in_transaction = false;
        Ok(())
    }
}
