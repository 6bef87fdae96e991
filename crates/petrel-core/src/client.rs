use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use petrel_acl::AccessControl;
use petrel_attrs::AttrStorage;
use petrel_domain::{
    AccessMask, CommonAttrs, DmError, Iid, Oid, ResourceAttrs, Rid, Riid, Ssid, Value,
};
use petrel_fwu::{
    Clock, DownloadStatus, Downloader, FwHandlers, FwUpdate, InitialState, Severity, State,
    SystemClock, UpdateResult,
};
use petrel_notify::{NotifyQueue, ObjectChanges};
use petrel_registry::{Registry, SharedObject};

/// Receives flushed change batches, e.g. to trigger observe notifications.
/// Entries arrive in ascending OID order.
pub trait NotificationSink {
    fn object_changed(&mut self, changes: &ObjectChanges);
}

/// The data-model core.
///
/// Single-writer by construction: every mutating entry point takes
/// `&mut self`, and everything below it runs synchronously. Host callbacks
/// invoked on the way may re-enter the public API of *other* objects, never
/// their own.
pub struct Client {
    registry: Registry,
    queue: Rc<RefCell<NotifyQueue>>,
    attrs: AttrStorage,
    acl: Option<Rc<RefCell<AccessControl>>>,
    fwu: Option<Rc<RefCell<FwUpdate>>>,
    sink: Option<Box<dyn NotificationSink>>,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    pub fn new() -> Client {
        Client {
            registry: Registry::new(),
            queue: Rc::new(RefCell::new(NotifyQueue::new())),
            attrs: AttrStorage::new(),
            acl: None,
            fwu: None,
            sink: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_notification_sink(&mut self, sink: Box<dyn NotificationSink>) {
        self.sink = Some(sink);
    }

    // ── Object management ────────────────────────────────────────────────────

    pub fn register_object(&mut self, object: SharedObject) -> Result<(), DmError> {
        self.registry.register(object)
    }

    /// Unregisters an object and cascades: pending notifications for the OID
    /// are dropped and its attribute subtree is removed.
    pub fn unregister_object(&mut self, oid: Oid) -> Result<(), DmError> {
        self.registry.unregister(oid)?;
        self.queue.borrow_mut().remove_object(oid);
        self.attrs.remove_object(oid);
        Ok(())
    }

    // ── Module installation ──────────────────────────────────────────────────

    pub fn install_access_control(&mut self) -> Result<(), DmError> {
        if self.acl.is_some() {
            return Err(DmError::BadRequest(
                "access control is already installed".to_string(),
            ));
        }
        let acl = Rc::new(RefCell::new(AccessControl::new()));
        self.registry.register(acl.clone())?;
        self.acl = Some(acl);
        Ok(())
    }

    pub fn install_firmware_update(
        &mut self,
        clock: Rc<dyn Clock>,
        downloader: Box<dyn Downloader>,
    ) -> Result<(), DmError> {
        if self.fwu.is_some() {
            return Err(DmError::BadRequest(
                "firmware update is already installed".to_string(),
            ));
        }
        let fwu = Rc::new(RefCell::new(FwUpdate::new(
            self.queue.clone(),
            clock,
            downloader,
        )));
        self.registry.register(fwu.clone())?;
        self.fwu = Some(fwu);
        Ok(())
    }

    /// [`install_firmware_update`](Client::install_firmware_update) with the
    /// system clock.
    pub fn install_firmware_update_default(
        &mut self,
        downloader: Box<dyn Downloader>,
    ) -> Result<(), DmError> {
        self.install_firmware_update(Rc::new(SystemClock), downloader)
    }

    fn acl_module(&self) -> Result<Rc<RefCell<AccessControl>>, DmError> {
        self.acl.clone().ok_or_else(|| {
            DmError::Internal("access control is not installed".to_string())
        })
    }

    fn fwu_module(&self) -> Result<Rc<RefCell<FwUpdate>>, DmError> {
        self.fwu.clone().ok_or_else(|| {
            DmError::Internal("firmware update is not installed".to_string())
        })
    }

    // ── Transactions ─────────────────────────────────────────────────────────

    /// Runs `f` inside a transaction: attribute storage snapshots first,
    /// then every object in ascending OID order. On success every
    /// participant validates and commits and the notification queue is
    /// flushed; on any failure everything rolls back in reverse order and
    /// the original error is returned.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Client) -> Result<T, DmError>,
    ) -> Result<T, DmError> {
        self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                self.validate_and_commit()?;
                self.flush_notifications()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback_transaction();
                // changes queued before the failure would reference rolled
                // back state
                self.queue.borrow_mut().take_entries();
                Err(err)
            }
        }
    }

    fn begin_transaction(&mut self) -> Result<(), DmError> {
        self.attrs.transaction_begin()?;
        let objects: Vec<(Oid, SharedObject)> = self.registry.objects().collect();
        for (index, (oid, object)) in objects.iter().enumerate() {
            if let Err(err) = object.borrow_mut().transaction_begin() {
                warn!(oid = oid.0, %err, "transaction begin failed");
                for (oid, begun) in objects[..index].iter().rev() {
                    if let Err(err) = begun.borrow_mut().transaction_rollback() {
                        warn!(oid = oid.0, %err, "rollback after failed begin failed");
                    }
                }
                if let Err(err) = self.attrs.transaction_rollback(&self.registry) {
                    warn!(%err, "attribute storage rollback after failed begin failed");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn validate_and_commit(&mut self) -> Result<(), DmError> {
        let objects: Vec<(Oid, SharedObject)> = self.registry.objects().collect();
        for (oid, object) in &objects {
            let validate_result = object.borrow_mut().transaction_validate(&self.registry);
            if let Err(err) = validate_result {
                debug!(oid = oid.0, %err, "transaction validation failed");
                self.rollback_transaction();
                self.queue.borrow_mut().take_entries();
                return Err(err);
            }
        }
        let mut first_error = None;
        for (oid, object) in &objects {
            if let Err(err) = object.borrow_mut().transaction_commit() {
                warn!(oid = oid.0, %err, "transaction commit failed");
                first_error.get_or_insert(err);
            }
        }
        self.attrs.transaction_commit();
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn rollback_transaction(&mut self) {
        let objects: Vec<(Oid, SharedObject)> = self.registry.objects().collect();
        for (oid, object) in objects.iter().rev() {
            if let Err(err) = object.borrow_mut().transaction_rollback() {
                warn!(oid = oid.0, %err, "transaction rollback failed");
            }
        }
        if let Err(err) = self.attrs.transaction_rollback(&self.registry) {
            warn!(%err, "attribute storage rollback failed");
        }
    }

    // ── Notification flushing ────────────────────────────────────────────────

    /// Drains the queue in ascending OID order, reconciles attribute storage
    /// and hands each batch to the notification sink. Reconciliation errors
    /// do not stop the remaining entries.
    pub fn flush_notifications(&mut self) -> Result<(), DmError> {
        let entries = self.queue.borrow_mut().take_entries();
        if entries.is_empty() {
            return Ok(());
        }
        let result = self.attrs.notify(&self.registry, &entries);
        if let Some(sink) = &mut self.sink {
            for entry in &entries {
                sink.object_changed(entry);
            }
        }
        result
    }

    // ── Data-model dispatch ──────────────────────────────────────────────────

    fn require_object(&self, oid: Oid) -> Result<SharedObject, DmError> {
        self.registry
            .find(oid)
            .ok_or_else(|| DmError::NotFound(format!("object {} is not registered", oid)))
    }

    pub fn read_resource(
        &self,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        riid: Option<Riid>,
    ) -> Result<Value, DmError> {
        let object = self.require_object(oid)?;
        let value = object.borrow().resource_read(iid, rid, riid);
        value
    }

    pub fn write_resource(
        &mut self,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        riid: Option<Riid>,
        value: &Value,
    ) -> Result<(), DmError> {
        self.transaction(|client| {
            let object = client.require_object(oid)?;
            let result = object
                .borrow_mut()
                .resource_write(&client.registry, iid, rid, riid, value);
            if result.is_ok() {
                client.queue.borrow_mut().mark_resource_changed(oid, iid, rid);
            }
            result
        })
    }

    pub fn reset_resource(&mut self, oid: Oid, iid: Iid, rid: Rid) -> Result<(), DmError> {
        self.transaction(|client| {
            let object = client.require_object(oid)?;
            let result = object
                .borrow_mut()
                .resource_reset(&client.registry, iid, rid);
            if result.is_ok() {
                client.queue.borrow_mut().mark_resource_changed(oid, iid, rid);
            }
            result
        })
    }

    pub fn execute_resource(
        &mut self,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        args: &str,
    ) -> Result<(), DmError> {
        self.transaction(|client| {
            let object = client.require_object(oid)?;
            let result = object
                .borrow_mut()
                .resource_execute(&client.registry, iid, rid, args);
            result
        })
    }

    pub fn create_instance(&mut self, oid: Oid, iid: Iid) -> Result<(), DmError> {
        self.transaction(|client| {
            let object = client.require_object(oid)?;
            let result = object.borrow_mut().instance_create(&client.registry, iid);
            if result.is_ok() {
                client.queue.borrow_mut().mark_instance_created(oid, iid);
            }
            result
        })
    }

    pub fn delete_instance(&mut self, oid: Oid, iid: Iid) -> Result<(), DmError> {
        self.transaction(|client| {
            let object = client.require_object(oid)?;
            let result = object.borrow_mut().instance_remove(&client.registry, iid);
            if result.is_ok() {
                client.queue.borrow_mut().mark_instance_removed(oid, iid);
            }
            result
        })
    }

    // ── Notification attributes ──────────────────────────────────────────────
    // Reads and the unvalidated write path defer to objects implementing
    // their own attribute handlers; the `set_*` functions additionally
    // validate the SSID and target presence.

    pub fn object_attrs(&self, oid: Oid, ssid: Ssid) -> Result<CommonAttrs, DmError> {
        self.attrs.object_attrs(&self.registry, oid, ssid)
    }

    pub fn instance_attrs(&self, oid: Oid, iid: Iid, ssid: Ssid) -> Result<CommonAttrs, DmError> {
        self.attrs.instance_attrs(&self.registry, oid, iid, ssid)
    }

    pub fn resource_attrs(
        &self,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        ssid: Ssid,
    ) -> Result<ResourceAttrs, DmError> {
        self.attrs.resource_attrs(&self.registry, oid, iid, rid, ssid)
    }

    pub fn resource_instance_attrs(
        &self,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        riid: Riid,
        ssid: Ssid,
    ) -> Result<ResourceAttrs, DmError> {
        self.attrs
            .resource_instance_attrs(&self.registry, oid, iid, rid, riid, ssid)
    }

    pub fn set_object_attrs(
        &mut self,
        ssid: Ssid,
        oid: Oid,
        attrs: &CommonAttrs,
    ) -> Result<(), DmError> {
        self.attrs.set_object_attrs(
            &self.registry,
            &mut self.queue.borrow_mut(),
            ssid,
            oid,
            attrs,
        )
    }

    pub fn set_instance_attrs(
        &mut self,
        ssid: Ssid,
        oid: Oid,
        iid: Iid,
        attrs: &CommonAttrs,
    ) -> Result<(), DmError> {
        self.attrs.set_instance_attrs(
            &self.registry,
            &mut self.queue.borrow_mut(),
            ssid,
            oid,
            iid,
            attrs,
        )
    }

    pub fn set_resource_attrs(
        &mut self,
        ssid: Ssid,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        attrs: &ResourceAttrs,
    ) -> Result<(), DmError> {
        self.attrs.set_resource_attrs(
            &self.registry,
            &mut self.queue.borrow_mut(),
            ssid,
            oid,
            iid,
            rid,
            attrs,
        )
    }

    pub fn set_resource_instance_attrs(
        &mut self,
        ssid: Ssid,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        riid: Riid,
        attrs: &ResourceAttrs,
    ) -> Result<(), DmError> {
        self.attrs.set_resource_instance_attrs(
            &self.registry,
            &mut self.queue.borrow_mut(),
            ssid,
            oid,
            iid,
            rid,
            riid,
            attrs,
        )
    }

    /// Write-Attributes dispatch at the object level: no SSID validation,
    /// deferring to the object's own handlers when it has them.
    pub fn write_object_attrs(
        &mut self,
        ssid: Ssid,
        oid: Oid,
        attrs: &CommonAttrs,
    ) -> Result<(), DmError> {
        let object = self.require_object(oid)?;
        if object.borrow().has_own_object_attrs() {
            return object.borrow_mut().write_object_default_attrs(ssid, attrs);
        }
        self.attrs.write_object_attrs(oid, ssid, attrs);
        Ok(())
    }

    /// Write-Attributes dispatch at the instance level.
    pub fn write_instance_attrs(
        &mut self,
        ssid: Ssid,
        oid: Oid,
        iid: Iid,
        attrs: &CommonAttrs,
    ) -> Result<(), DmError> {
        let object = self.require_object(oid)?;
        if object.borrow().has_own_instance_attrs() {
            return object
                .borrow_mut()
                .write_instance_default_attrs(iid, ssid, attrs);
        }
        self.attrs.write_instance_attrs(oid, iid, ssid, attrs);
        Ok(())
    }

    /// Write-Attributes dispatch at the resource and resource-instance
    /// levels.
    pub fn write_resource_attrs(
        &mut self,
        ssid: Ssid,
        oid: Oid,
        iid: Iid,
        rid: Rid,
        riid: Option<Riid>,
        attrs: &ResourceAttrs,
    ) -> Result<(), DmError> {
        let object = self.require_object(oid)?;
        if object.borrow().has_own_resource_attrs() {
            return object
                .borrow_mut()
                .write_resource_attrs(iid, rid, riid, ssid, attrs);
        }
        match riid {
            None => self.attrs.write_resource_attrs(oid, iid, rid, ssid, attrs),
            Some(riid) => self
                .attrs
                .write_resource_instance_attrs(oid, iid, rid, riid, ssid, attrs),
        }
        Ok(())
    }

    pub fn attr_storage_persist<W: std::io::Write>(&mut self, out: &mut W) -> Result<(), DmError> {
        self.attrs.persist(out)
    }

    pub fn attr_storage_restore<R: std::io::Read>(
        &mut self,
        input: &mut R,
    ) -> Result<(), DmError> {
        self.attrs.restore(&self.registry, input)
    }

    pub fn attr_storage_purge(&mut self) {
        self.attrs.purge();
    }

    pub fn attr_storage_is_modified(&self) -> bool {
        self.attrs.is_modified()
    }

    // ── Access control ───────────────────────────────────────────────────────

    pub fn access_control_set_acl(
        &mut self,
        oid: Oid,
        iid: Option<Iid>,
        ssid: Ssid,
        mask: AccessMask,
    ) -> Result<(), DmError> {
        let acl = self.acl_module()?;
        let result = acl.borrow_mut().set_acl(
            &self.registry,
            &mut self.queue.borrow_mut(),
            oid,
            iid,
            ssid,
            mask,
        );
        result
    }

    pub fn access_control_set_owner(
        &mut self,
        target_oid: Oid,
        target_iid: Option<Iid>,
        owner: Ssid,
        acl_iid: &mut Option<Iid>,
    ) -> Result<(), DmError> {
        let acl = self.acl_module()?;
        let result = acl.borrow_mut().set_owner(
            &self.registry,
            &mut self.queue.borrow_mut(),
            target_oid,
            target_iid,
            owner,
            acl_iid,
        );
        result
    }

    pub fn access_control_purge(&mut self) -> Result<(), DmError> {
        let acl = self.acl_module()?;
        acl.borrow_mut().purge(&mut self.queue.borrow_mut());
        Ok(())
    }

    pub fn access_control_is_modified(&self) -> Result<bool, DmError> {
        Ok(self.acl_module()?.borrow().is_modified())
    }

    pub fn access_control_persist<W: std::io::Write>(
        &mut self,
        out: &mut W,
    ) -> Result<(), DmError> {
        self.acl_module()?.borrow_mut().persist(out)
    }

    pub fn access_control_restore<R: std::io::Read>(
        &mut self,
        input: &mut R,
    ) -> Result<(), DmError> {
        let acl = self.acl_module()?;
        let result = acl.borrow_mut().restore(&self.registry, input);
        result
    }

    // ── Firmware update ──────────────────────────────────────────────────────

    pub fn firmware_instance_add(
        &mut self,
        iid: Iid,
        component_name: Option<&str>,
        handlers: Box<dyn FwHandlers>,
        initial: &InitialState,
    ) -> Result<(), DmError> {
        let fwu = self.fwu_module()?;
        let result = fwu
            .borrow_mut()
            .instance_add(&self.registry, iid, component_name, handlers, initial);
        result
    }

    pub fn firmware_state(&self, iid: Iid) -> Result<State, DmError> {
        self.fwu_module()?.borrow().state(iid)
    }

    pub fn firmware_result(&self, iid: Iid) -> Result<UpdateResult, DmError> {
        self.fwu_module()?.borrow().result(iid)
    }

    pub fn firmware_severity(&self, iid: Iid) -> Result<Severity, DmError> {
        self.fwu_module()?.borrow().severity(iid)
    }

    pub fn firmware_set_state_and_result(
        &mut self,
        iid: Iid,
        state: State,
        result: UpdateResult,
    ) -> Result<(), DmError> {
        self.fwu_module()?
            .borrow_mut()
            .set_state_and_result(iid, state, result)
    }

    pub fn firmware_linked_instances(&self, iid: Iid) -> Result<Vec<Iid>, DmError> {
        Ok(self.fwu_module()?.borrow().linked_instances(iid)?.to_vec())
    }

    pub fn firmware_conflicting_instances(&self, iid: Iid) -> Result<Vec<Iid>, DmError> {
        Ok(self
            .fwu_module()?
            .borrow()
            .conflicting_instances(iid)?
            .to_vec())
    }

    pub fn firmware_set_linked_instances(
        &mut self,
        iid: Iid,
        targets: &[Iid],
    ) -> Result<(), DmError> {
        self.fwu_module()?
            .borrow_mut()
            .set_linked_instances(iid, targets)
    }

    pub fn firmware_set_conflicting_instances(
        &mut self,
        iid: Iid,
        targets: &[Iid],
    ) -> Result<(), DmError> {
        self.fwu_module()?
            .borrow_mut()
            .set_conflicting_instances(iid, targets)
    }

    pub fn firmware_pull_suspend(&mut self) -> Result<(), DmError> {
        self.fwu_module()?.borrow_mut().pull_suspend();
        Ok(())
    }

    pub fn firmware_pull_reconnect(&mut self) -> Result<(), DmError> {
        self.fwu_module()?.borrow_mut().pull_reconnect()
    }

    /// Transport entry point: a block of pull-download data arrived.
    pub fn firmware_download_block(&mut self, iid: Iid, data: &[u8]) -> Result<(), DmError> {
        let fwu = self.fwu_module()?;
        let result = fwu.borrow_mut().on_download_block(iid, data);
        let flush = self.flush_notifications();
        result.and(flush)
    }

    /// Transport entry point: the current pull download ended.
    pub fn firmware_download_finished(
        &mut self,
        iid: Iid,
        status: DownloadStatus,
    ) -> Result<(), DmError> {
        let fwu = self.fwu_module()?;
        let result = fwu.borrow_mut().on_download_finished(&self.registry, iid, status);
        let flush = self.flush_notifications();
        result.and(flush)
    }

    /// Runs deferred firmware jobs, then flushes the notifications they
    /// produced. The host calls this from its scheduler loop.
    pub fn run_scheduled_jobs(&mut self) -> Result<(), DmError> {
        if let Some(fwu) = self.fwu.clone() {
            fwu.borrow_mut().run_scheduled_jobs();
        }
        self.flush_notifications()
    }

    /// Whether another scheduler pass is needed.
    pub fn has_pending_jobs(&self) -> bool {
        self.fwu
            .as_ref()
            .map_or(false, |fwu| fwu.borrow().has_pending_jobs())
    }
}
