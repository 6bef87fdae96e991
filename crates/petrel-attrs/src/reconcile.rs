//! Reconciliation of stored attributes against data-model change
//! notifications.
//!
//! After a flush, no attribute record may reference an entity the data model
//! no longer reports: vanished instances, resources and resource instances
//! lose their subtrees, and records keyed by an SSID that no longer belongs
//! to any known server are dropped tree-wide.

use tracing::{debug, warn};

use petrel_domain::{DmError, Iid, Oid, Ssid};
use petrel_notify::ObjectChanges;
use petrel_registry::Registry;

use crate::storage::{AttrStorage, InstanceEntry, ObjectEntry};

impl AttrStorage {
    /// Processes one flushed batch of change notifications, in the order
    /// given (ascending OID). Errors from individual objects are remembered
    /// but later entries are still processed, so the tree converges on a
    /// legal state.
    pub fn notify(
        &mut self,
        registry: &Registry,
        changes: &[ObjectChanges],
    ) -> Result<(), DmError> {
        let mut first_error = None;
        for entry in changes {
            if let Err(err) = self.reconcile_object(registry, entry) {
                warn!(oid = entry.oid.0, %err, "attribute reconciliation failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn reconcile_object(
        &mut self,
        registry: &Registry,
        entry: &ObjectChanges,
    ) -> Result<(), DmError> {
        self.remove_absent_instances(registry, entry.oid)?;

        if self.objects.contains(entry.oid) {
            let mut last_iid = None;
            for &(iid, _rid) in &entry.resources_changed {
                if last_iid != Some(iid) {
                    self.remove_absent_resources(registry, entry.oid, iid)?;
                }
                last_iid = Some(iid);
            }
            self.objects.remove_if(entry.oid, ObjectEntry::is_empty);
        }
        Ok(())
    }

    /// Drops stored instance subtrees whose IID the object no longer
    /// reports. For the Security/Server reference objects this pass also
    /// collects the currently announced SSIDs and filters the whole tree
    /// against that list.
    fn remove_absent_instances(&mut self, registry: &Registry, oid: Oid) -> Result<(), DmError> {
        let has_entry = self.objects.contains(oid);
        let is_reference = Registry::is_ssid_reference_object(oid);
        if !has_entry && !is_reference {
            return Ok(());
        }

        if !registry.contains(oid) {
            if has_entry {
                debug!(oid = oid.0, "object gone, dropping attribute subtree");
                self.remove_object(oid);
            }
            return Ok(());
        }

        let live_iids = registry.list_instances(oid)?;
        let mut removed_any = false;
        if let Some(object) = self.objects.find_mut(oid) {
            let before = object.instances.len();
            object
                .instances
                .retain(|inst| live_iids.binary_search(&inst.iid).is_ok());
            removed_any = object.instances.len() != before;
        }
        if removed_any {
            self.mark_modified();
        }
        self.objects.remove_if(oid, ObjectEntry::is_empty);

        if is_reference {
            let mut ssids: Vec<Ssid> = live_iids
                .iter()
                .filter_map(|&iid| registry.query_ssid(oid, iid))
                .collect();
            ssids.sort_unstable();
            ssids.dedup();
            self.remove_servers_not_on_list(&ssids);
        }
        Ok(())
    }

    /// Two-cursor sweep of one stored instance against the live resource
    /// list: resources that vanished or are reported absent lose their
    /// entries, and resource-instance entries are reconciled for
    /// multiple-instance resources (and dropped under single-instance ones).
    fn remove_absent_resources(
        &mut self,
        registry: &Registry,
        oid: Oid,
        iid: Iid,
    ) -> Result<(), DmError> {
        if !registry.contains(oid) {
            return Ok(());
        }
        let instance_stored = self
            .objects
            .find(oid)
            .map_or(false, |object| object.instances.contains(iid));
        if !instance_stored {
            return Ok(());
        }

        let live = registry.list_resources(oid, iid)?;

        let mut removed_any = false;
        let mut ri_queries = Vec::new();
        if let Some(inst) = self
            .objects
            .find_mut(oid)
            .and_then(|object| object.instances.find_mut(iid))
        {
            let before = inst.resources.len();
            inst.resources.retain(|res| {
                live.binary_search_by_key(&res.rid, |def| def.rid)
                    .map(|i| live[i].is_present())
                    .unwrap_or(false)
            });
            removed_any |= inst.resources.len() != before;

            for res in &inst.resources {
                if !res.instances.is_empty() {
                    ri_queries.push(res.rid);
                }
            }
        }

        for rid in ri_queries {
            let multiple = live
                .binary_search_by_key(&rid, |def| def.rid)
                .map(|i| live[i].kind.is_multiple())
                .unwrap_or(false);
            let live_riids = if multiple {
                registry.list_resource_instances(oid, iid, rid)?
            } else {
                Vec::new()
            };
            if let Some(res) = self
                .objects
                .find_mut(oid)
                .and_then(|object| object.instances.find_mut(iid))
                .and_then(|inst| inst.resources.find_mut(rid))
            {
                let before = res.instances.len();
                res.instances
                    .retain(|ri| live_riids.binary_search(&ri.riid).is_ok());
                removed_any |= res.instances.len() != before;
            }
        }

        if let Some(object) = self.objects.find_mut(oid) {
            if let Some(inst) = object.instances.find_mut(iid) {
                inst.resources.retain(|res| !res.is_empty());
            }
            object.instances.remove_if(iid, InstanceEntry::is_empty);
        }

        if removed_any {
            self.mark_modified();
        }
        Ok(())
    }

    /// Removes every attribute record (at all four levels) whose SSID is not
    /// on the sorted `ssids` list, pruning emptied entries afterwards.
    fn remove_servers_not_on_list(&mut self, ssids: &[Ssid]) {
        let mut removed_any = false;
        for object in &mut self.objects {
            let before = object.default_attrs.len();
            object
                .default_attrs
                .retain(|entry| ssids.binary_search(&entry.ssid).is_ok());
            removed_any |= object.default_attrs.len() != before;

            for inst in &mut object.instances {
                let before = inst.default_attrs.len();
                inst.default_attrs
                    .retain(|entry| ssids.binary_search(&entry.ssid).is_ok());
                removed_any |= inst.default_attrs.len() != before;

                for res in &mut inst.resources {
                    let before = res.attrs.len();
                    res.attrs
                        .retain(|entry| ssids.binary_search(&entry.ssid).is_ok());
                    removed_any |= res.attrs.len() != before;

                    for ri in &mut res.instances {
                        let before = ri.attrs.len();
                        ri.attrs
                            .retain(|entry| ssids.binary_search(&entry.ssid).is_ok());
                        removed_any |= ri.attrs.len() != before;
                    }
                    res.instances.retain(|ri| !ri.is_empty());
                }
                inst.resources.retain(|res| !res.is_empty());
            }
            object.instances.retain(|inst| !inst.is_empty());
        }
        self.objects.retain(|object| !object.is_empty());
        if removed_any {
            self.mark_modified();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use petrel_domain::{CommonAttrs, ResourceAttrs, Rid, Riid, Value};
    use petrel_notify::NotifyQueue;
    use petrel_registry::testing::MockObject;
    use petrel_registry::ResourceKind;

    use super::*;

    fn common(min_period: i32) -> CommonAttrs {
        CommonAttrs {
            min_period: Some(min_period),
            ..CommonAttrs::EMPTY
        }
    }

    fn resource_attrs(step: f64) -> ResourceAttrs {
        ResourceAttrs {
            step: Some(step),
            ..ResourceAttrs::EMPTY
        }
    }

    fn flush(storage: &mut AttrStorage, registry: &Registry, queue: &mut NotifyQueue) {
        let entries = queue.take_entries();
        storage.notify(registry, &entries).unwrap();
    }

    #[test]
    fn unknown_change_removes_vanished_instance_subtree() {
        let mut registry = Registry::new();
        let obj = Rc::new(RefCell::new(MockObject::new(Oid(42))));
        obj.borrow_mut().add_instance(Iid(1));
        obj.borrow_mut().add_instance(Iid(2));
        registry.register(obj.clone()).unwrap();

        let mut storage = AttrStorage::new();
        storage.write_instance_attrs(Oid(42), Iid(1), Ssid(2), &common(7));

        // the data model forgets instance 1
        obj.borrow_mut().remove_instance(Iid(1));
        let mut queue = NotifyQueue::new();
        queue.mark_unknown_change(Oid(42));
        flush(&mut storage, &registry, &mut queue);

        // instance entry gone, and it was the only child, so the object
        // entry is gone too
        assert!(storage.objects.is_empty());
    }

    #[test]
    fn surviving_instances_keep_their_attributes() {
        let mut registry = Registry::new();
        let obj = Rc::new(RefCell::new(MockObject::new(Oid(42))));
        obj.borrow_mut().add_instance(Iid(1));
        obj.borrow_mut().add_instance(Iid(2));
        registry.register(obj.clone()).unwrap();

        let mut storage = AttrStorage::new();
        storage.write_instance_attrs(Oid(42), Iid(1), Ssid(2), &common(7));
        storage.write_instance_attrs(Oid(42), Iid(2), Ssid(2), &common(9));

        obj.borrow_mut().remove_instance(Iid(1));
        let mut queue = NotifyQueue::new();
        queue.mark_unknown_change(Oid(42));
        flush(&mut storage, &registry, &mut queue);

        let object = storage.objects.find(Oid(42)).unwrap();
        let iids: Vec<Iid> = object.instances.keys().collect();
        assert_eq!(iids, vec![Iid(2)]);
    }

    #[test]
    fn unregistered_object_loses_whole_subtree() {
        let registry = Registry::new();
        let mut storage = AttrStorage::new();
        storage.write_object_attrs(Oid(42), Ssid(2), &common(1));

        let mut queue = NotifyQueue::new();
        queue.mark_unknown_change(Oid(42));
        flush(&mut storage, &registry, &mut queue);

        assert!(storage.objects.is_empty());
    }

    #[test]
    fn resource_change_sweeps_absent_resources() {
        let mut registry = Registry::new();
        let obj = Rc::new(RefCell::new(MockObject::new(Oid(42))));
        obj.borrow_mut().add_instance(Iid(1));
        obj.borrow_mut()
            .set_resource(Iid(1), Rid(3), ResourceKind::Rw, Value::Int(0));
        obj.borrow_mut()
            .set_resource(Iid(1), Rid(5), ResourceKind::Rw, Value::Int(0));
        registry.register(obj.clone()).unwrap();

        let mut storage = AttrStorage::new();
        storage.write_resource_attrs(Oid(42), Iid(1), Rid(3), Ssid(2), &resource_attrs(1.0));
        storage.write_resource_attrs(Oid(42), Iid(1), Rid(5), Ssid(2), &resource_attrs(2.0));

        // rid 3 disappears, rid 5 becomes absent
        obj.borrow_mut().remove_resource(Iid(1), Rid(3));
        obj.borrow_mut()
            .set_resource_absent(Iid(1), Rid(5), ResourceKind::Rw);

        let mut queue = NotifyQueue::new();
        queue.mark_resource_changed(Oid(42), Iid(1), Rid(3));
        queue.mark_resource_changed(Oid(42), Iid(1), Rid(5));
        flush(&mut storage, &registry, &mut queue);

        assert!(storage.objects.is_empty());
    }

    #[test]
    fn resource_instance_entries_follow_live_set() {
        let mut registry = Registry::new();
        let obj = Rc::new(RefCell::new(MockObject::new(Oid(42))));
        obj.borrow_mut().add_instance(Iid(1));
        obj.borrow_mut()
            .set_resource(Iid(1), Rid(3), ResourceKind::Rwm, Value::Int(0));
        obj.borrow_mut()
            .set_resource_instance(Iid(1), Rid(3), Riid(1), Value::Int(0));
        obj.borrow_mut()
            .set_resource_instance(Iid(1), Rid(3), Riid(2), Value::Int(0));
        registry.register(obj.clone()).unwrap();

        let mut storage = AttrStorage::new();
        storage.write_resource_instance_attrs(
            Oid(42),
            Iid(1),
            Rid(3),
            Riid(1),
            Ssid(2),
            &resource_attrs(1.0),
        );
        storage.write_resource_instance_attrs(
            Oid(42),
            Iid(1),
            Rid(3),
            Riid(2),
            Ssid(2),
            &resource_attrs(2.0),
        );

        obj.borrow_mut().remove_resource_instance(Iid(1), Rid(3), Riid(1));
        let mut queue = NotifyQueue::new();
        queue.mark_resource_changed(Oid(42), Iid(1), Rid(3));
        flush(&mut storage, &registry, &mut queue);

        let riids: Vec<Riid> = storage
            .objects
            .find(Oid(42))
            .unwrap()
            .instances
            .find(Iid(1))
            .unwrap()
            .resources
            .find(Rid(3))
            .unwrap()
            .instances
            .keys()
            .collect();
        assert_eq!(riids, vec![Riid(2)]);
    }

    #[test]
    fn server_removal_filters_every_level() {
        let mut registry = Registry::new();
        let server = Rc::new(RefCell::new(MockObject::server(&[(0, 2), (1, 14)])));
        registry.register(server.clone()).unwrap();
        let obj = Rc::new(RefCell::new(MockObject::new(Oid(42))));
        obj.borrow_mut().add_instance(Iid(1));
        obj.borrow_mut()
            .set_resource(Iid(1), Rid(3), ResourceKind::Rw, Value::Int(0));
        registry.register(obj).unwrap();

        let mut storage = AttrStorage::new();
        storage.write_object_attrs(Oid(42), Ssid(2), &common(1));
        storage.write_object_attrs(Oid(42), Ssid(14), &common(2));
        storage.write_resource_attrs(Oid(42), Iid(1), Rid(3), Ssid(14), &resource_attrs(3.0));

        // server 14 disappears
        server.borrow_mut().remove_instance(Iid(1));
        let mut queue = NotifyQueue::new();
        queue.mark_unknown_change(petrel_domain::OID_SERVER);
        flush(&mut storage, &registry, &mut queue);

        let object = storage.objects.find(Oid(42)).unwrap();
        let ssids: Vec<Ssid> = object.default_attrs.keys().collect();
        assert_eq!(ssids, vec![Ssid(2)]);
        // the resource entry for ssid 14 is gone, with its parents pruned
        assert!(object.instances.is_empty());
    }

    #[test]
    fn notify_continues_after_per_object_errors() {
        struct Broken;
        impl petrel_registry::ObjectHandler for Broken {
            fn oid(&self) -> Oid {
                Oid(10)
            }
            fn list_instances(&self) -> Result<Vec<Iid>, DmError> {
                Err(DmError::Internal("host failure".to_string()))
            }
            fn list_resources(
                &self,
                _iid: Iid,
            ) -> Result<Vec<petrel_registry::ResourceDef>, DmError> {
                Ok(Vec::new())
            }
            fn resource_read(
                &self,
                _iid: Iid,
                _rid: Rid,
                _riid: Option<Riid>,
            ) -> Result<Value, DmError> {
                Err(DmError::NotFound("no resources".to_string()))
            }
        }

        let mut registry = Registry::new();
        registry.register(Rc::new(RefCell::new(Broken))).unwrap();
        let obj = Rc::new(RefCell::new(MockObject::new(Oid(42))));
        registry.register(obj).unwrap();

        let mut storage = AttrStorage::new();
        storage.write_object_attrs(Oid(10), Ssid(2), &common(1));
        storage.write_instance_attrs(Oid(42), Iid(9), Ssid(2), &common(2));

        let mut queue = NotifyQueue::new();
        queue.mark_unknown_change(Oid(10));
        queue.mark_unknown_change(Oid(42));
        let entries = queue.take_entries();
        let err = storage.notify(&registry, &entries).unwrap_err();
        assert!(matches!(err, DmError::Internal(_)));

        // the second entry was still reconciled: instance 9 does not exist
        assert!(storage.objects.find(Oid(42)).is_none());
    }

    #[test]
    fn reference_object_without_entry_still_triggers_ssid_filter() {
        let mut registry = Registry::new();
        let server = Rc::new(RefCell::new(MockObject::server(&[(0, 2)])));
        registry.register(server).unwrap();
        let obj = Rc::new(RefCell::new(MockObject::new(Oid(42))));
        registry.register(obj).unwrap();

        let mut storage = AttrStorage::new();
        // no attributes on the Server object itself, but a stale ssid 33
        // record elsewhere in the tree
        storage.write_object_attrs(Oid(42), Ssid(33), &common(1));

        let mut queue = NotifyQueue::new();
        queue.mark_unknown_change(petrel_domain::OID_SERVER);
        flush(&mut storage, &registry, &mut queue);

        assert!(storage.objects.is_empty());
    }
}
