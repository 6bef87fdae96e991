//! Versioned big-endian persistence of the attribute tree.
//!
//! Stream layout (current version 5):
//!
//! ```text
//! "FAS" <version:u8>
//! <object count:u32>
//!   <oid:u16> <default-attrs count:u32> { <ssid:u16> <common payload> }
//!   <instance count:u32>
//!     <iid:u16> <default-attrs count:u32> { <ssid:u16> <common payload> }
//!     <resource count:u32>
//!       <rid:u16> <attrs count:u32> { <ssid:u16> <resource payload> }
//!       <resource-instance count:u32>                       (v3+)
//!         <riid:u16> <attrs count:u32> { <ssid:u16> <resource payload> }
//! ```
//!
//! Common payload: `min_period` `max_period` (`i32`), `min_eval_period`
//! `max_eval_period` (`i32`, v4+), `hqmax` (`i32`, v5+), confirmable (`u8`).
//! Resource payload: common payload, then `gt` `lt` `st` (`f64`), then
//! `edge` (`u8`, v5+). Integer "none" is `0xFFFF_FFFF`, float "none" is the
//! quiet NaN `0x7FF8_0000_0000_0000`, flag "none" is `0xFF`.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use petrel_domain::{
    CommonAttrs, DmError, Iid, KeyedVec, Oid, ResourceAttrs, Rid, Riid, Ssid,
};
use petrel_registry::Registry;

use crate::storage::{
    AttrStorage, DefaultAttrsEntry, InstanceEntry, ObjectEntry, ResourceAttrsEntry, ResourceEntry,
    ResourceInstanceEntry,
};

const MAGIC: &[u8; 3] = b"FAS";

/// v2: no resource-instance lists, no eval periods.
const VERSION_MIN: u8 = 2;
/// v3 adds resource-instance lists.
const VERSION_RESOURCE_INSTANCES: u8 = 3;
/// v4 adds min/max evaluation periods.
const VERSION_EVAL_PERIODS: u8 = 4;
/// v5 adds the hqmax and edge attributes.
const VERSION_HQMAX_EDGE: u8 = 5;

pub(crate) const VERSION_CURRENT: u8 = VERSION_HQMAX_EDGE;

const NONE_I32: u32 = 0xFFFF_FFFF;
const NONE_F64_BITS: u64 = 0x7FF8_0000_0000_0000;
const NONE_FLAG: u8 = 0xFF;

// ── Scalar codecs ────────────────────────────────────────────────────────────

fn write_opt_i32<W: Write>(out: &mut W, value: Option<i32>) -> Result<(), DmError> {
    let raw = value.map(|v| v as u32).unwrap_or(NONE_I32);
    out.write_u32::<BigEndian>(raw)?;
    Ok(())
}

fn read_opt_i32<R: Read>(input: &mut R) -> Result<Option<i32>, DmError> {
    let raw = input.read_u32::<BigEndian>().map_err(DmError::from_read_error)?;
    Ok(if raw == NONE_I32 { None } else { Some(raw as i32) })
}

fn write_opt_f64<W: Write>(out: &mut W, value: Option<f64>) -> Result<(), DmError> {
    let bits = value.map(f64::to_bits).unwrap_or(NONE_F64_BITS);
    out.write_u64::<BigEndian>(bits)?;
    Ok(())
}

fn read_opt_f64<R: Read>(input: &mut R) -> Result<Option<f64>, DmError> {
    let bits = input.read_u64::<BigEndian>().map_err(DmError::from_read_error)?;
    let value = f64::from_bits(bits);
    Ok(if value.is_nan() { None } else { Some(value) })
}

fn write_opt_flag<W: Write>(out: &mut W, value: Option<bool>) -> Result<(), DmError> {
    out.write_u8(match value {
        None => NONE_FLAG,
        Some(false) => 0,
        Some(true) => 1,
    })?;
    Ok(())
}

fn read_opt_flag<R: Read>(input: &mut R) -> Result<Option<bool>, DmError> {
    match input.read_u8().map_err(DmError::from_read_error)? {
        NONE_FLAG => Ok(None),
        0 => Ok(Some(false)),
        1 => Ok(Some(true)),
        other => Err(DmError::BadMessage(format!(
            "invalid flag byte 0x{:02X}",
            other
        ))),
    }
}

fn write_u16_id<W: Write>(out: &mut W, id: u16) -> Result<(), DmError> {
    out.write_u16::<BigEndian>(id)?;
    Ok(())
}

fn read_u16_id<R: Read>(input: &mut R) -> Result<u16, DmError> {
    input.read_u16::<BigEndian>().map_err(DmError::from_read_error)
}

fn write_count<W: Write>(out: &mut W, count: usize) -> Result<(), DmError> {
    let count = u32::try_from(count)
        .map_err(|_| DmError::Internal("collection too large to persist".to_string()))?;
    out.write_u32::<BigEndian>(count)?;
    Ok(())
}

fn read_count<R: Read>(input: &mut R) -> Result<u32, DmError> {
    input.read_u32::<BigEndian>().map_err(DmError::from_read_error)
}

// ── Attribute payloads ───────────────────────────────────────────────────────

fn write_common<W: Write>(out: &mut W, attrs: &CommonAttrs, version: u8) -> Result<(), DmError> {
    write_opt_i32(out, attrs.min_period)?;
    write_opt_i32(out, attrs.max_period)?;
    if version >= VERSION_EVAL_PERIODS {
        write_opt_i32(out, attrs.min_eval_period)?;
        write_opt_i32(out, attrs.max_eval_period)?;
    }
    if version >= VERSION_HQMAX_EDGE {
        write_opt_i32(out, attrs.hqmax)?;
    }
    write_opt_flag(out, attrs.confirmable)
}

fn read_common<R: Read>(input: &mut R, version: u8) -> Result<CommonAttrs, DmError> {
    let min_period = read_opt_i32(input)?;
    let max_period = read_opt_i32(input)?;
    let (min_eval_period, max_eval_period) = if version >= VERSION_EVAL_PERIODS {
        (read_opt_i32(input)?, read_opt_i32(input)?)
    } else {
        (None, None)
    };
    let hqmax = if version >= VERSION_HQMAX_EDGE {
        read_opt_i32(input)?
    } else {
        None
    };
    let confirmable = read_opt_flag(input)?;
    Ok(CommonAttrs {
        min_period,
        max_period,
        min_eval_period,
        max_eval_period,
        hqmax,
        confirmable,
    })
}

fn write_resource<W: Write>(out: &mut W, attrs: &ResourceAttrs, version: u8) -> Result<(), DmError> {
    write_common(out, &attrs.common, version)?;
    write_opt_f64(out, attrs.greater_than)?;
    write_opt_f64(out, attrs.less_than)?;
    write_opt_f64(out, attrs.step)?;
    if version >= VERSION_HQMAX_EDGE {
        write_opt_flag(out, attrs.edge)?;
    }
    Ok(())
}

fn read_resource<R: Read>(input: &mut R, version: u8) -> Result<ResourceAttrs, DmError> {
    let common = read_common(input, version)?;
    let greater_than = read_opt_f64(input)?;
    let less_than = read_opt_f64(input)?;
    let step = read_opt_f64(input)?;
    let edge = if version >= VERSION_HQMAX_EDGE {
        read_opt_flag(input)?
    } else {
        None
    };
    Ok(ResourceAttrs {
        common,
        greater_than,
        less_than,
        step,
        edge,
    })
}

// ── Store side ───────────────────────────────────────────────────────────────

fn persist_default_attrs<W: Write>(
    out: &mut W,
    list: &KeyedVec<DefaultAttrsEntry>,
    version: u8,
) -> Result<(), DmError> {
    write_count(out, list.len())?;
    for entry in list {
        write_u16_id(out, entry.ssid.0)?;
        write_common(out, &entry.attrs, version)?;
    }
    Ok(())
}

fn persist_resource_attrs<W: Write>(
    out: &mut W,
    list: &KeyedVec<ResourceAttrsEntry>,
    version: u8,
) -> Result<(), DmError> {
    write_count(out, list.len())?;
    for entry in list {
        write_u16_id(out, entry.ssid.0)?;
        write_resource(out, &entry.attrs, version)?;
    }
    Ok(())
}

/// Serializes the tree with the current format version. Used both by
/// `persist` and by transaction snapshots.
pub(crate) fn persist_tree<W: Write>(
    objects: &KeyedVec<ObjectEntry>,
    out: &mut W,
) -> Result<(), DmError> {
    let version = VERSION_CURRENT;
    out.write_all(MAGIC)?;
    out.write_u8(version)?;
    write_count(out, objects.len())?;
    for object in objects {
        write_u16_id(out, object.oid.0)?;
        persist_default_attrs(out, &object.default_attrs, version)?;
        write_count(out, object.instances.len())?;
        for instance in &object.instances {
            write_u16_id(out, instance.iid.0)?;
            persist_default_attrs(out, &instance.default_attrs, version)?;
            write_count(out, instance.resources.len())?;
            for resource in &instance.resources {
                write_u16_id(out, resource.rid.0)?;
                persist_resource_attrs(out, &resource.attrs, version)?;
                write_count(out, resource.instances.len())?;
                for ri in &resource.instances {
                    write_u16_id(out, ri.riid.0)?;
                    persist_resource_attrs(out, &ri.attrs, version)?;
                }
            }
        }
    }
    Ok(())
}

// ── Restore side ─────────────────────────────────────────────────────────────
// Ids on the wire must be strictly ascending and no record may be empty; a
// violation fails the whole restore with `BadMessage`.

struct AscendingCheck {
    last: Option<u16>,
    what: &'static str,
}

impl AscendingCheck {
    fn new(what: &'static str) -> AscendingCheck {
        AscendingCheck { last: None, what }
    }

    fn check(&mut self, id: u16) -> Result<(), DmError> {
        if self.last.map_or(false, |last| id <= last) {
            return Err(DmError::BadMessage(format!(
                "{} ids not strictly ascending",
                self.what
            )));
        }
        self.last = Some(id);
        Ok(())
    }
}

fn restore_default_attrs<R: Read>(
    input: &mut R,
    version: u8,
) -> Result<KeyedVec<DefaultAttrsEntry>, DmError> {
    let count = read_count(input)?;
    let mut ascending = AscendingCheck::new("ssid");
    let mut list = KeyedVec::new();
    for _ in 0..count {
        let ssid = read_u16_id(input)?;
        ascending.check(ssid)?;
        let attrs = read_common(input, version)?;
        if attrs.is_empty() {
            return Err(DmError::BadMessage("empty attribute record".to_string()));
        }
        let _ = list.insert(DefaultAttrsEntry {
            ssid: Ssid(ssid),
            attrs,
        });
    }
    Ok(list)
}

fn restore_resource_attrs<R: Read>(
    input: &mut R,
    version: u8,
) -> Result<KeyedVec<ResourceAttrsEntry>, DmError> {
    let count = read_count(input)?;
    let mut ascending = AscendingCheck::new("ssid");
    let mut list = KeyedVec::new();
    for _ in 0..count {
        let ssid = read_u16_id(input)?;
        ascending.check(ssid)?;
        let attrs = read_resource(input, version)?;
        if attrs.is_empty() {
            return Err(DmError::BadMessage("empty attribute record".to_string()));
        }
        let _ = list.insert(ResourceAttrsEntry {
            ssid: Ssid(ssid),
            attrs,
        });
    }
    Ok(list)
}

fn restore_tree<R: Read>(input: &mut R, version: u8) -> Result<KeyedVec<ObjectEntry>, DmError> {
    let object_count = read_count(input)?;
    let mut objects = KeyedVec::new();
    let mut oid_check = AscendingCheck::new("object");
    for _ in 0..object_count {
        let oid = read_u16_id(input)?;
        oid_check.check(oid)?;
        let mut object = ObjectEntry::new(Oid(oid));
        object.default_attrs = restore_default_attrs(input, version)?;

        let instance_count = read_count(input)?;
        let mut iid_check = AscendingCheck::new("instance");
        for _ in 0..instance_count {
            let iid = read_u16_id(input)?;
            iid_check.check(iid)?;
            let mut instance = InstanceEntry::new(Iid(iid));
            instance.default_attrs = restore_default_attrs(input, version)?;

            let resource_count = read_count(input)?;
            let mut rid_check = AscendingCheck::new("resource");
            for _ in 0..resource_count {
                let rid = read_u16_id(input)?;
                rid_check.check(rid)?;
                let mut resource = ResourceEntry::new(Rid(rid));
                resource.attrs = restore_resource_attrs(input, version)?;

                if version >= VERSION_RESOURCE_INSTANCES {
                    let ri_count = read_count(input)?;
                    let mut riid_check = AscendingCheck::new("resource instance");
                    for _ in 0..ri_count {
                        let riid = read_u16_id(input)?;
                        riid_check.check(riid)?;
                        let mut ri = ResourceInstanceEntry::new(Riid(riid));
                        ri.attrs = restore_resource_attrs(input, version)?;
                        let _ = resource.instances.insert(ri);
                    }
                }
                let _ = instance.resources.insert(resource);
            }
            let _ = object.instances.insert(instance);
        }
        let _ = objects.insert(object);
    }
    Ok(objects)
}

/// Removes restored entries whose targets do not exist in the registry. This
/// reconciliation is not an error.
fn clear_nonexistent(
    objects: &mut KeyedVec<ObjectEntry>,
    registry: &Registry,
) -> Result<(), DmError> {
    let oids: Vec<Oid> = objects.keys().collect();
    for oid in oids {
        if !registry.contains(oid) {
            objects.remove(oid);
            continue;
        }
        let live_iids = registry.list_instances(oid)?;
        let mut resource_lists: Vec<(Iid, Vec<petrel_registry::ResourceDef>)> = Vec::new();
        if let Some(object) = objects.find_mut(oid) {
            object
                .instances
                .retain(|inst| live_iids.binary_search(&inst.iid).is_ok());
            for inst in &object.instances {
                resource_lists.push((inst.iid, Vec::new()));
            }
        }
        for (iid, defs) in &mut resource_lists {
            *defs = registry.list_resources(oid, *iid)?;
        }
        let mut ri_queries: Vec<(Iid, Rid)> = Vec::new();
        if let Some(object) = objects.find_mut(oid) {
            for (iid, defs) in &resource_lists {
                if let Some(inst) = object.instances.find_mut(*iid) {
                    inst.resources.retain(|res| {
                        defs.binary_search_by_key(&res.rid, |def| def.rid)
                            .map(|i| defs[i].is_present())
                            .unwrap_or(false)
                    });
                    for res in &inst.resources {
                        if !res.instances.is_empty() {
                            ri_queries.push((*iid, res.rid));
                        }
                    }
                }
            }
        }
        for (iid, rid) in ri_queries {
            let def = registry.resource_def(oid, iid, rid)?;
            let multiple = def.map_or(false, |def| def.kind.is_multiple());
            let live_riids = if multiple {
                registry.list_resource_instances(oid, iid, rid)?
            } else {
                Vec::new()
            };
            if let Some(res) = objects
                .find_mut(oid)
                .and_then(|object| object.instances.find_mut(iid))
                .and_then(|inst| inst.resources.find_mut(rid))
            {
                res.instances
                    .retain(|ri| live_riids.binary_search(&ri.riid).is_ok());
            }
        }
        if let Some(object) = objects.find_mut(oid) {
            for inst in &mut object.instances {
                inst.resources.retain(|res| !res.is_empty());
            }
            object.instances.retain(|inst| !inst.is_empty());
        }
        objects.remove_if(oid, ObjectEntry::is_empty);
    }
    Ok(())
}

/// Restore implementation shared by the public `restore` and transaction
/// rollback. Clears the store first; on any failure the store stays cleared.
pub(crate) fn restore_inner<R: Read>(
    storage: &mut AttrStorage,
    registry: &Registry,
    input: &mut R,
) -> Result<(), DmError> {
    storage.objects.clear();

    let mut first = [0u8; 1];
    let n = input.read(&mut first)?;
    if n == 0 {
        // empty stream restores to empty state
        return Ok(());
    }

    let result = (|| {
        let mut rest = [0u8; 2];
        input.read_exact(&mut rest).map_err(DmError::from_read_error)?;
        if [first[0], rest[0], rest[1]] != *MAGIC {
            return Err(DmError::BadMessage("bad magic".to_string()));
        }
        let version = input.read_u8().map_err(DmError::from_read_error)?;
        if !(VERSION_MIN..=VERSION_CURRENT).contains(&version) {
            return Err(DmError::NotSupported(format!(
                "unknown attribute storage format version {}",
                version
            )));
        }
        let mut objects = restore_tree(input, version)?;
        clear_nonexistent(&mut objects, registry)?;
        Ok(objects)
    })();

    match result {
        Ok(objects) => {
            storage.objects = objects;
            Ok(())
        }
        Err(err) => {
            warn!(%err, "attribute storage restore failed");
            storage.objects.clear();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::{Seek, SeekFrom, Write as _};
    use std::rc::Rc;

    use petrel_notify::NotifyQueue;
    use petrel_registry::testing::MockObject;
    use petrel_registry::ResourceKind;
    use petrel_domain::Value;

    use super::*;

    const NONE32: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
    const NONE64: [u8; 8] = [0x7F, 0xF8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

    fn scenario_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(Rc::new(RefCell::new(MockObject::server(&[(0, 2), (1, 33)]))))
            .unwrap();
        registry
            .register(Rc::new(RefCell::new(MockObject::new(Oid(4)))))
            .unwrap();
        let obj42 = Rc::new(RefCell::new(MockObject::new(Oid(42))));
        obj42.borrow_mut().add_instance(Iid(1));
        obj42
            .borrow_mut()
            .set_resource(Iid(1), Rid(3), ResourceKind::Rw, Value::Int(0));
        registry.register(obj42).unwrap();
        registry
            .register(Rc::new(RefCell::new(MockObject::new(Oid(517)))))
            .unwrap();
        registry
    }

    fn scenario_storage(registry: &Registry) -> AttrStorage {
        let mut storage = AttrStorage::new();
        let mut queue = NotifyQueue::new();
        storage
            .set_object_attrs(
                registry,
                &mut queue,
                Ssid(33),
                Oid(4),
                &CommonAttrs {
                    min_period: Some(42),
                    ..CommonAttrs::EMPTY
                },
            )
            .unwrap();
        storage
            .set_instance_attrs(
                registry,
                &mut queue,
                Ssid(2),
                Oid(42),
                Iid(1),
                &CommonAttrs {
                    min_period: Some(7),
                    max_period: Some(13),
                    ..CommonAttrs::EMPTY
                },
            )
            .unwrap();
        storage
            .set_resource_attrs(
                registry,
                &mut queue,
                Ssid(2),
                Oid(42),
                Iid(1),
                Rid(3),
                &ResourceAttrs {
                    greater_than: Some(1.0),
                    less_than: Some(-1.0),
                    ..ResourceAttrs::EMPTY
                },
            )
            .unwrap();
        storage
    }

    fn scenario_stream() -> Vec<u8> {
        let mut v: Vec<u8> = Vec::new();
        v.extend_from_slice(b"FAS\x05");
        v.extend_from_slice(&[0, 0, 0, 2]); // 2 objects

        v.extend_from_slice(&[0, 4]); // OID 4
        v.extend_from_slice(&[0, 0, 0, 1]); // 1 object-level default attr
        v.extend_from_slice(&[0, 33]); // SSID 33
        v.extend_from_slice(&[0, 0, 0, 42]); // min period
        v.extend_from_slice(&NONE32); // max period
        v.extend_from_slice(&NONE32); // min eval period
        v.extend_from_slice(&NONE32); // max eval period
        v.extend_from_slice(&NONE32); // hqmax
        v.push(0xFF); // confirmable
        v.extend_from_slice(&[0, 0, 0, 0]); // 0 instance entries

        v.extend_from_slice(&[0, 42]); // OID 42
        v.extend_from_slice(&[0, 0, 0, 0]); // 0 object-level default attrs
        v.extend_from_slice(&[0, 0, 0, 1]); // 1 instance entry
        v.extend_from_slice(&[0, 1]); // IID 1
        v.extend_from_slice(&[0, 0, 0, 1]); // 1 instance-level default attr
        v.extend_from_slice(&[0, 2]); // SSID 2
        v.extend_from_slice(&[0, 0, 0, 7]); // min period
        v.extend_from_slice(&[0, 0, 0, 13]); // max period
        v.extend_from_slice(&NONE32); // min eval period
        v.extend_from_slice(&NONE32); // max eval period
        v.extend_from_slice(&NONE32); // hqmax
        v.push(0xFF); // confirmable
        v.extend_from_slice(&[0, 0, 0, 1]); // 1 resource entry
        v.extend_from_slice(&[0, 3]); // RID 3
        v.extend_from_slice(&[0, 0, 0, 1]); // 1 resource attr
        v.extend_from_slice(&[0, 2]); // SSID 2
        v.extend_from_slice(&NONE32); // min period
        v.extend_from_slice(&NONE32); // max period
        v.extend_from_slice(&NONE32); // min eval period
        v.extend_from_slice(&NONE32); // max eval period
        v.extend_from_slice(&NONE32); // hqmax
        v.push(0xFF); // confirmable
        v.extend_from_slice(&1.0f64.to_be_bytes()); // greater than
        v.extend_from_slice(&(-1.0f64).to_be_bytes()); // less than
        v.extend_from_slice(&NONE64); // step
        v.push(0xFF); // edge
        v.extend_from_slice(&[0, 0, 0, 0]); // 0 resource instance entries
        v
    }

    #[test]
    fn persist_produces_the_documented_v5_stream() {
        let registry = scenario_registry();
        let mut storage = scenario_storage(&registry);
        let mut out = Vec::new();
        storage.persist(&mut out).unwrap();
        assert_eq!(out, scenario_stream());
        assert!(!storage.is_modified());
    }

    #[test]
    fn restore_then_persist_is_byte_identical() {
        let registry = scenario_registry();
        let mut storage = AttrStorage::new();
        storage
            .restore(&registry, &mut scenario_stream().as_slice())
            .unwrap();
        assert!(!storage.is_modified());

        let mut out = Vec::new();
        storage.persist(&mut out).unwrap();
        assert_eq!(out, scenario_stream());
    }

    #[test]
    fn persist_empty_storage() {
        let mut storage = AttrStorage::new();
        let mut out = Vec::new();
        storage.persist(&mut out).unwrap();
        assert_eq!(out, b"FAS\x05\x00\x00\x00\x00");
    }

    #[test]
    fn restore_empty_stream_yields_empty_state() {
        let registry = scenario_registry();
        let mut storage = scenario_storage(&registry);
        let mut empty: &[u8] = &[];
        storage.restore(&registry, &mut empty).unwrap();
        assert!(storage.objects.is_empty());
        assert!(!storage.is_modified());
    }

    #[test]
    fn restore_rejects_bad_magic() {
        let registry = Registry::new();
        let mut storage = AttrStorage::new();
        let err = storage
            .restore(&registry, &mut b"FAX\x05\x00\x00\x00\x00".as_slice())
            .unwrap_err();
        assert!(matches!(err, DmError::BadMessage(_)));
        assert!(storage.is_modified());
    }

    #[test]
    fn restore_rejects_unknown_versions() {
        let registry = Registry::new();
        let mut storage = AttrStorage::new();
        for stream in [b"FAS\x06\x00\x00\x00\x00", b"FAS\x01\x00\x00\x00\x00"] {
            let err = storage.restore(&registry, &mut stream.as_slice()).unwrap_err();
            assert!(matches!(err, DmError::NotSupported(_)));
        }
    }

    #[test]
    fn restore_rejects_truncated_stream() {
        let registry = scenario_registry();
        let mut storage = AttrStorage::new();
        let mut stream = scenario_stream();
        stream.truncate(stream.len() - 7);
        let err = storage.restore(&registry, &mut stream.as_slice()).unwrap_err();
        assert!(matches!(err, DmError::BadMessage(_)));
        assert!(storage.objects.is_empty());
        assert!(storage.is_modified());
    }

    #[test]
    fn restore_failure_clears_previous_state() {
        let registry = scenario_registry();
        let mut storage = scenario_storage(&registry);
        let err = storage
            .restore(&registry, &mut b"FAS\x05\x00\x00".as_slice())
            .unwrap_err();
        assert!(matches!(err, DmError::BadMessage(_)));
        assert!(storage.objects.is_empty());
        assert!(storage.is_modified());
    }

    #[test]
    fn restore_rejects_descending_ids() {
        let registry = scenario_registry();
        let mut storage = AttrStorage::new();
        // two objects with descending OIDs
        let mut v: Vec<u8> = Vec::new();
        v.extend_from_slice(b"FAS\x05");
        v.extend_from_slice(&[0, 0, 0, 2]);
        for oid in [42u16, 4] {
            v.extend_from_slice(&oid.to_be_bytes());
            v.extend_from_slice(&[0, 0, 0, 1]);
            v.extend_from_slice(&[0, 2]); // SSID 2
            v.extend_from_slice(&[0, 0, 0, 1]); // min period 1
            v.extend_from_slice(&NONE32);
            v.extend_from_slice(&NONE32);
            v.extend_from_slice(&NONE32);
            v.extend_from_slice(&NONE32);
            v.push(0xFF);
            v.extend_from_slice(&[0, 0, 0, 0]);
        }
        let err = storage.restore(&registry, &mut v.as_slice()).unwrap_err();
        assert!(matches!(err, DmError::BadMessage(_)));
    }

    #[test]
    fn restore_rejects_empty_attribute_records() {
        let registry = scenario_registry();
        let mut storage = AttrStorage::new();
        let mut v: Vec<u8> = Vec::new();
        v.extend_from_slice(b"FAS\x05");
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&[0, 4]);
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&[0, 2]); // SSID 2, all attributes unset
        v.extend_from_slice(&NONE32);
        v.extend_from_slice(&NONE32);
        v.extend_from_slice(&NONE32);
        v.extend_from_slice(&NONE32);
        v.extend_from_slice(&NONE32);
        v.push(0xFF);
        v.extend_from_slice(&[0, 0, 0, 0]);
        let err = storage.restore(&registry, &mut v.as_slice()).unwrap_err();
        assert!(matches!(err, DmError::BadMessage(_)));
    }

    #[test]
    fn restore_drops_entries_for_unregistered_objects() {
        // same stream, but only the Server object and object 4 exist now
        let mut registry = Registry::new();
        registry
            .register(Rc::new(RefCell::new(MockObject::server(&[(0, 2), (1, 33)]))))
            .unwrap();
        registry
            .register(Rc::new(RefCell::new(MockObject::new(Oid(4)))))
            .unwrap();

        let mut storage = AttrStorage::new();
        storage
            .restore(&registry, &mut scenario_stream().as_slice())
            .unwrap();
        let oids: Vec<Oid> = storage.objects.keys().collect();
        assert_eq!(oids, vec![Oid(4)]);
    }

    #[test]
    fn restore_drops_entries_for_absent_instances_and_resources() {
        let registry = scenario_registry();
        // stream with an extra instance 9 under object 42
        let mut storage = scenario_storage(&registry);
        storage.write_instance_attrs(
            Oid(42),
            Iid(9),
            Ssid(2),
            &CommonAttrs {
                min_period: Some(1),
                ..CommonAttrs::EMPTY
            },
        );
        let mut stream = Vec::new();
        persist_tree(&storage.objects, &mut stream).unwrap();

        let mut restored = AttrStorage::new();
        restored.restore(&registry, &mut stream.as_slice()).unwrap();
        let object = restored.objects.find(Oid(42)).unwrap();
        let iids: Vec<Iid> = object.instances.keys().collect();
        assert_eq!(iids, vec![Iid(1)]);
    }

    #[test]
    fn restore_reads_v4_streams_without_extensions() {
        let registry = scenario_registry();
        let mut v: Vec<u8> = Vec::new();
        v.extend_from_slice(b"FAS\x04");
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&[0, 4]);
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&[0, 33]); // SSID 33
        v.extend_from_slice(&NONE32); // min period
        v.extend_from_slice(&[0, 0, 0, 3]); // max period
        v.extend_from_slice(&[0, 0, 0, 10]); // min eval period
        v.extend_from_slice(&[0, 0, 0, 20]); // max eval period
        v.push(0x01); // confirmable
        v.extend_from_slice(&[0, 0, 0, 0]);

        let mut storage = AttrStorage::new();
        storage.restore(&registry, &mut v.as_slice()).unwrap();
        let attrs = storage.object_attrs(&registry, Oid(4), Ssid(33)).unwrap();
        assert_eq!(
            attrs,
            CommonAttrs {
                min_period: None,
                max_period: Some(3),
                min_eval_period: Some(10),
                max_eval_period: Some(20),
                hqmax: None,
                confirmable: Some(true),
            }
        );
    }

    #[test]
    fn restore_reads_v2_streams_without_eval_periods_or_riids() {
        let registry = scenario_registry();
        let mut v: Vec<u8> = Vec::new();
        v.extend_from_slice(b"FAS\x02");
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&[0, 42]); // OID 42
        v.extend_from_slice(&[0, 0, 0, 0]);
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&[0, 1]); // IID 1
        v.extend_from_slice(&[0, 0, 0, 0]);
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&[0, 3]); // RID 3
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&[0, 2]); // SSID 2
        v.extend_from_slice(&[0, 0, 0, 7]); // min period
        v.extend_from_slice(&NONE32); // max period
        v.push(0x00); // confirmable
        v.extend_from_slice(&1.5f64.to_be_bytes()); // greater than
        v.extend_from_slice(&NONE64); // less than
        v.extend_from_slice(&NONE64); // step
        // no resource-instance list before v3

        let mut storage = AttrStorage::new();
        storage.restore(&registry, &mut v.as_slice()).unwrap();
        let attrs = storage
            .resource_attrs(&registry, Oid(42), Iid(1), Rid(3), Ssid(2))
            .unwrap();
        assert_eq!(attrs.common.min_period, Some(7));
        assert_eq!(attrs.common.min_eval_period, None);
        assert_eq!(attrs.common.confirmable, Some(false));
        assert_eq!(attrs.greater_than, Some(1.5));
        assert_eq!(attrs.edge, None);
    }

    #[test]
    fn file_backed_round_trip() {
        let registry = scenario_registry();
        let mut storage = scenario_storage(&registry);

        let mut file = tempfile::tempfile().unwrap();
        storage.persist(&mut file).unwrap();
        file.flush().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut restored = AttrStorage::new();
        restored.restore(&registry, &mut file).unwrap();

        let mut again = Vec::new();
        restored.persist(&mut again).unwrap();
        assert_eq!(again, scenario_stream());
    }

    #[test]
    fn invalid_flag_byte_is_a_bad_message() {
        let registry = Registry::new();
        let mut storage = AttrStorage::new();
        let mut v: Vec<u8> = Vec::new();
        v.extend_from_slice(b"FAS\x05");
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&[0, 4]);
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&[0, 2]);
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&NONE32);
        v.extend_from_slice(&NONE32);
        v.extend_from_slice(&NONE32);
        v.extend_from_slice(&NONE32);
        v.push(0x02); // neither none nor a boolean
        v.extend_from_slice(&[0, 0, 0, 0]);
        let err = storage.restore(&registry, &mut v.as_slice()).unwrap_err();
        assert!(matches!(err, DmError::BadMessage(_)));
    }
}
