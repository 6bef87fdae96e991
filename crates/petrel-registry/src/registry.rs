use tracing::{debug, warn};

use petrel_domain::{
    DmError, Iid, Keyed, KeyedVec, Oid, Rid, Riid, Ssid, ID_INVALID, OID_SECURITY, OID_SERVER,
    RID_SECURITY_SSID, RID_SERVER_SSID,
};

use crate::object::{ResourceDef, SharedObject};

struct RegisteredObject {
    oid: Oid,
    handler: SharedObject,
}

impl Keyed for RegisteredObject {
    type Key = Oid;

    fn key(&self) -> Oid {
        self.oid
    }
}

/// Registry of installed objects, ordered by OID.
///
/// The registry hands out shared handles; object state lives with whichever
/// module created the object. Iteration helpers normalize handler output so
/// the ascending-order merge sweeps downstream can rely on it.
#[derive(Default)]
pub struct Registry {
    objects: KeyedVec<RegisteredObject>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            objects: KeyedVec::new(),
        }
    }

    pub fn register(&mut self, handler: SharedObject) -> Result<(), DmError> {
        let oid = handler.borrow().oid();
        if oid.0 == ID_INVALID {
            return Err(DmError::BadRequest(format!(
                "{} is not a valid Object ID",
                oid
            )));
        }
        self.objects
            .insert(RegisteredObject { oid, handler })
            .map_err(|_| DmError::BadRequest(format!("object {} is already registered", oid)))?;
        debug!(oid = oid.0, "object registered");
        Ok(())
    }

    /// Removes an object. The caller is responsible for the unregister
    /// cascade (dropping queued notifications and stored attributes).
    pub fn unregister(&mut self, oid: Oid) -> Result<SharedObject, DmError> {
        match self.objects.remove(oid) {
            Some(entry) => {
                debug!(oid = oid.0, "object unregistered");
                Ok(entry.handler)
            }
            None => Err(DmError::NotFound(format!("object {} is not registered", oid))),
        }
    }

    pub fn find(&self, oid: Oid) -> Option<SharedObject> {
        self.objects.find(oid).map(|entry| entry.handler.clone())
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.objects.contains(oid)
    }

    pub fn oids(&self) -> Vec<Oid> {
        self.objects.keys().collect()
    }

    /// Shared handles to every installed object, in ascending OID order.
    pub fn objects(&self) -> impl Iterator<Item = (Oid, SharedObject)> + '_ {
        self.objects
            .iter()
            .map(|entry| (entry.oid, entry.handler.clone()))
    }

    fn require(&self, oid: Oid) -> Result<SharedObject, DmError> {
        self.find(oid)
            .ok_or_else(|| DmError::NotFound(format!("object {} is not registered", oid)))
    }

    // ── Iteration helpers ────────────────────────────────────────────────────

    pub fn list_instances(&self, oid: Oid) -> Result<Vec<Iid>, DmError> {
        let obj = self.require(oid)?;
        let mut iids = obj.borrow().list_instances()?;
        iids.sort_unstable();
        iids.dedup();
        Ok(iids)
    }

    pub fn list_resources(&self, oid: Oid, iid: Iid) -> Result<Vec<ResourceDef>, DmError> {
        let obj = self.require(oid)?;
        let mut resources = obj.borrow().list_resources(iid)?;
        resources.sort_unstable_by_key(|def| def.rid);
        resources.dedup_by_key(|def| def.rid);
        Ok(resources)
    }

    pub fn list_resource_instances(
        &self,
        oid: Oid,
        iid: Iid,
        rid: Rid,
    ) -> Result<Vec<Riid>, DmError> {
        let obj = self.require(oid)?;
        let mut riids = obj.borrow().list_resource_instances(iid, rid)?;
        riids.sort_unstable();
        riids.dedup();
        Ok(riids)
    }

    // ── Presence queries ─────────────────────────────────────────────────────

    pub fn instance_present(&self, oid: Oid, iid: Iid) -> Result<bool, DmError> {
        Ok(self.list_instances(oid)?.contains(&iid))
    }

    pub fn resource_def(&self, oid: Oid, iid: Iid, rid: Rid) -> Result<Option<ResourceDef>, DmError> {
        Ok(self
            .list_resources(oid, iid)?
            .into_iter()
            .find(|def| def.rid == rid))
    }

    pub fn resource_present(&self, oid: Oid, iid: Iid, rid: Rid) -> Result<bool, DmError> {
        Ok(self
            .resource_def(oid, iid, rid)?
            .map_or(false, |def| def.is_present()))
    }

    pub fn resource_instance_present(
        &self,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        riid: Riid,
    ) -> Result<bool, DmError> {
        Ok(self.list_resource_instances(oid, iid, rid)?.contains(&riid))
    }

    // ── Value queries ────────────────────────────────────────────────────────

    /// Reads a single-instance resource and coerces it to an integer.
    pub fn read_i64(&self, oid: Oid, iid: Iid, rid: Rid) -> Result<i64, DmError> {
        let obj = self.require(oid)?;
        let value = obj.borrow().resource_read(iid, rid, None)?;
        value.as_i64().ok_or_else(|| {
            DmError::Internal(format!("{}/{}/{} did not read as an integer", oid, iid, rid))
        })
    }

    // ── Short Server ID queries ──────────────────────────────────────────────

    /// The two objects whose instances carry Short Server IDs and therefore
    /// drive the which-servers-exist filter.
    pub fn is_ssid_reference_object(oid: Oid) -> bool {
        oid == OID_SECURITY || oid == OID_SERVER
    }

    /// The SSID announced by a Security or Server object instance.
    ///
    /// Failing reads and out-of-range values mean "a bootstrap-server
    /// instance" and yield `None`.
    pub fn query_ssid(&self, oid: Oid, iid: Iid) -> Option<Ssid> {
        let rid = match oid {
            OID_SECURITY => RID_SECURITY_SSID,
            OID_SERVER => RID_SERVER_SSID,
            _ => return None,
        };
        match self.read_i64(oid, iid, rid) {
            Ok(ssid) if ssid > 0 && ssid < i64::from(ID_INVALID) => Some(Ssid(ssid as u16)),
            Ok(_) => None,
            Err(err) => {
                warn!(oid = oid.0, iid = iid.0, %err, "could not query Short Server ID");
                None
            }
        }
    }

    /// Whether a non-bootstrap server with the given SSID is currently known,
    /// i.e. announced by some Server object instance.
    pub fn server_ssid_exists(&self, ssid: Ssid) -> bool {
        if ssid == Ssid::ANY || ssid == Ssid::BOOTSTRAP {
            return false;
        }
        let Ok(iids) = self.list_instances(OID_SERVER) else {
            return false;
        };
        iids.into_iter()
            .any(|iid| self.query_ssid(OID_SERVER, iid) == Some(ssid))
    }
}
