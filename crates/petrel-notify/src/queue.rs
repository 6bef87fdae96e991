use tracing::trace;

use petrel_domain::{Iid, Keyed, KeyedVec, Oid, Rid};

/// What happened to the instance set of one object since the last flush.
///
/// `full_rescan` means the set changed in a way the producer could not
/// describe; it dominates (and clears) the known-added/known-removed sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSetChanges {
    pub full_rescan: bool,
    pub added: Vec<Iid>,
    pub removed: Vec<Iid>,
}

impl InstanceSetChanges {
    pub fn is_empty(&self) -> bool {
        !self.full_rescan && self.added.is_empty() && self.removed.is_empty()
    }

    fn mark_added(&mut self, iid: Iid) {
        if self.full_rescan {
            return;
        }
        if let Ok(i) = self.removed.binary_search(&iid) {
            self.removed.remove(i);
        }
        if let Err(i) = self.added.binary_search(&iid) {
            self.added.insert(i, iid);
        }
    }

    fn mark_removed(&mut self, iid: Iid) {
        if self.full_rescan {
            return;
        }
        if let Ok(i) = self.added.binary_search(&iid) {
            self.added.remove(i);
        }
        if let Err(i) = self.removed.binary_search(&iid) {
            self.removed.insert(i, iid);
        }
    }

    fn mark_unknown(&mut self) {
        self.full_rescan = true;
        self.added.clear();
        self.removed.clear();
    }
}

/// Queued changes for one object: the instance-set delta plus the sorted
/// `(iid, rid)` list of resources whose values changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectChanges {
    pub oid: Oid,
    pub instance_changes: InstanceSetChanges,
    pub resources_changed: Vec<(Iid, Rid)>,
}

impl ObjectChanges {
    fn new(oid: Oid) -> ObjectChanges {
        ObjectChanges {
            oid,
            instance_changes: InstanceSetChanges::default(),
            resources_changed: Vec::new(),
        }
    }
}

impl Keyed for ObjectChanges {
    type Key = Oid;

    fn key(&self) -> Oid {
        self.oid
    }
}

/// The notification queue: one foldable entry per object, ordered by OID.
#[derive(Debug, Default)]
pub struct NotifyQueue {
    entries: KeyedVec<ObjectChanges>,
}

impl NotifyQueue {
    pub fn new() -> NotifyQueue {
        NotifyQueue {
            entries: KeyedVec::new(),
        }
    }

    fn entry(&mut self, oid: Oid) -> &mut ObjectChanges {
        self.entries
            .find_or_create_with(oid, || ObjectChanges::new(oid))
    }

    pub fn mark_instance_created(&mut self, oid: Oid, iid: Iid) {
        trace!(oid = oid.0, iid = iid.0, "queue: instance created");
        self.entry(oid).instance_changes.mark_added(iid);
    }

    pub fn mark_instance_removed(&mut self, oid: Oid, iid: Iid) {
        trace!(oid = oid.0, iid = iid.0, "queue: instance removed");
        self.entry(oid).instance_changes.mark_removed(iid);
    }

    /// The instance set changed in an unspecified way; consumers must rescan.
    pub fn mark_unknown_change(&mut self, oid: Oid) {
        trace!(oid = oid.0, "queue: unknown instance-set change");
        self.entry(oid).instance_changes.mark_unknown();
    }

    pub fn mark_resource_changed(&mut self, oid: Oid, iid: Iid, rid: Rid) {
        trace!(oid = oid.0, iid = iid.0, rid = rid.0, "queue: resource changed");
        let entry = self.entry(oid);
        if let Err(i) = entry.resources_changed.binary_search(&(iid, rid)) {
            entry.resources_changed.insert(i, (iid, rid));
        }
    }

    /// Drops everything queued for `oid` (unregister cascade).
    pub fn remove_object(&mut self, oid: Oid) {
        self.entries.remove(oid);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drains the queue, returning entries in ascending OID order.
    pub fn take_entries(&mut self) -> Vec<ObjectChanges> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}
