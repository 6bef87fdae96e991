//! Property tests: after an arbitrary write sequence the persisted tree has
//! strictly ascending ids at every level and no empty entries, and
//! persist/restore is the identity when the data model is unchanged.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;

use petrel_attrs::AttrStorage;
use petrel_domain::{CommonAttrs, Iid, Oid, ResourceAttrs, Rid, Riid, Ssid};
use petrel_registry::testing::MockObject;
use petrel_registry::{Registry, ResourceKind};

#[derive(Debug, Clone)]
enum Op {
    Object(Oid, Ssid, CommonAttrs),
    Instance(Oid, Iid, Ssid, CommonAttrs),
    Resource(Oid, Iid, Rid, Ssid, ResourceAttrs),
    ResourceInstance(Oid, Iid, Rid, Riid, Ssid, ResourceAttrs),
}

fn common_attrs() -> impl Strategy<Value = CommonAttrs> {
    prop_oneof![
        Just(CommonAttrs::EMPTY),
        (0..1000i32).prop_map(|p| CommonAttrs {
            min_period: Some(p),
            ..CommonAttrs::EMPTY
        }),
        (0..1000i32, proptest::option::of(any::<bool>())).prop_map(|(p, con)| CommonAttrs {
            max_period: Some(p),
            confirmable: con,
            ..CommonAttrs::EMPTY
        }),
    ]
}

fn resource_attrs() -> impl Strategy<Value = ResourceAttrs> {
    prop_oneof![
        Just(ResourceAttrs::EMPTY),
        (0..1000i32).prop_map(|p| ResourceAttrs {
            common: CommonAttrs {
                min_period: Some(p),
                ..CommonAttrs::EMPTY
            },
            ..ResourceAttrs::EMPTY
        }),
        ((-100..100i32), proptest::option::of(any::<bool>())).prop_map(|(gt, edge)| {
            ResourceAttrs {
                greater_than: Some(f64::from(gt)),
                edge,
                ..ResourceAttrs::EMPTY
            }
        }),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    let oid = (3u16..8).prop_map(Oid);
    let iid = (0u16..4).prop_map(Iid);
    let rid = (0u16..4).prop_map(Rid);
    let riid = (0u16..3).prop_map(Riid);
    let ssid = (1u16..5).prop_map(Ssid);
    prop_oneof![
        (oid.clone(), ssid.clone(), common_attrs()).prop_map(|(o, s, a)| Op::Object(o, s, a)),
        (oid.clone(), iid.clone(), ssid.clone(), common_attrs())
            .prop_map(|(o, i, s, a)| Op::Instance(o, i, s, a)),
        (oid.clone(), iid.clone(), rid.clone(), ssid.clone(), resource_attrs())
            .prop_map(|(o, i, r, s, a)| Op::Resource(o, i, r, s, a)),
        (oid, iid, rid, riid, ssid, resource_attrs())
            .prop_map(|(o, i, r, ri, s, a)| Op::ResourceInstance(o, i, r, ri, s, a)),
    ]
}

fn apply(storage: &mut AttrStorage, ops: &[Op]) {
    for op in ops {
        match op.clone() {
            Op::Object(oid, ssid, attrs) => storage.write_object_attrs(oid, ssid, &attrs),
            Op::Instance(oid, iid, ssid, attrs) => {
                storage.write_instance_attrs(oid, iid, ssid, &attrs)
            }
            Op::Resource(oid, iid, rid, ssid, attrs) => {
                storage.write_resource_attrs(oid, iid, rid, ssid, &attrs)
            }
            Op::ResourceInstance(oid, iid, rid, riid, ssid, attrs) => {
                storage.write_resource_instance_attrs(oid, iid, rid, riid, ssid, &attrs)
            }
        }
    }
}

/// A registry where every id the op generator may produce exists.
fn full_registry() -> Registry {
    let mut registry = Registry::new();
    for oid in 3u16..8 {
        let obj = Rc::new(RefCell::new(MockObject::new(Oid(oid))));
        {
            let mut obj = obj.borrow_mut();
            for iid in 0u16..4 {
                obj.add_instance(Iid(iid));
                for rid in 0u16..4 {
                    obj.set_resource(
                        Iid(iid),
                        Rid(rid),
                        ResourceKind::Rwm,
                        petrel_domain::Value::Int(0),
                    );
                    for riid in 0u16..3 {
                        obj.set_resource_instance(
                            Iid(iid),
                            Rid(rid),
                            Riid(riid),
                            petrel_domain::Value::Int(0),
                        );
                    }
                }
            }
        }
        registry.register(obj).unwrap();
    }
    registry
}

// ── A minimal reader for the persisted stream ───────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let b = self.data[self.pos];
        self.pos += 1;
        b
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes([self.u8(), self.u8()])
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes([self.u8(), self.u8(), self.u8(), self.u8()])
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

fn check_ascending(ids: &[u16]) {
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1], "ids not strictly ascending: {:?}", ids);
    }
}

/// Walks the persisted stream, asserting strict id ordering and that no
/// entry is childless.
fn check_stream_invariants(data: &[u8]) {
    let mut r = Reader::new(data);
    assert_eq!([r.u8(), r.u8(), r.u8()], *b"FAS");
    assert_eq!(r.u8(), 5);

    let object_count = r.u32();
    let mut oids = Vec::new();
    for _ in 0..object_count {
        oids.push(r.u16());

        let default_count = r.u32();
        let mut ssids = Vec::new();
        for _ in 0..default_count {
            ssids.push(r.u16());
            r.skip(21); // common payload
        }
        check_ascending(&ssids);

        let instance_count = r.u32();
        assert!(
            default_count + instance_count > 0,
            "object entry without children"
        );
        let mut iids = Vec::new();
        for _ in 0..instance_count {
            iids.push(r.u16());
            let inst_default_count = r.u32();
            let mut inst_ssids = Vec::new();
            for _ in 0..inst_default_count {
                inst_ssids.push(r.u16());
                r.skip(21);
            }
            check_ascending(&inst_ssids);

            let resource_count = r.u32();
            assert!(
                inst_default_count + resource_count > 0,
                "instance entry without children"
            );
            let mut rids = Vec::new();
            for _ in 0..resource_count {
                rids.push(r.u16());
                let attr_count = r.u32();
                let mut res_ssids = Vec::new();
                for _ in 0..attr_count {
                    res_ssids.push(r.u16());
                    r.skip(46); // resource payload
                }
                check_ascending(&res_ssids);

                let ri_count = r.u32();
                assert!(attr_count + ri_count > 0, "resource entry without children");
                let mut riids = Vec::new();
                for _ in 0..ri_count {
                    riids.push(r.u16());
                    let ri_attr_count = r.u32();
                    assert!(ri_attr_count > 0, "resource-instance entry without children");
                    let mut ri_ssids = Vec::new();
                    for _ in 0..ri_attr_count {
                        ri_ssids.push(r.u16());
                        r.skip(46);
                    }
                    check_ascending(&ri_ssids);
                }
                check_ascending(&riids);
            }
            check_ascending(&rids);
        }
        check_ascending(&iids);
    }
    check_ascending(&oids);
    assert_eq!(r.pos, data.len(), "trailing bytes in stream");
}

proptest! {
    #[test]
    fn write_sequences_preserve_tree_invariants(ops in proptest::collection::vec(op(), 0..40)) {
        let mut storage = AttrStorage::new();
        apply(&mut storage, &ops);

        let mut out = Vec::new();
        storage.persist(&mut out).unwrap();
        check_stream_invariants(&out);
    }

    #[test]
    fn persist_restore_is_identity(ops in proptest::collection::vec(op(), 0..40)) {
        let registry = full_registry();
        let mut storage = AttrStorage::new();
        apply(&mut storage, &ops);

        let mut first = Vec::new();
        storage.persist(&mut first).unwrap();

        let mut restored = AttrStorage::new();
        restored.restore(&registry, &mut first.as_slice()).unwrap();

        let mut second = Vec::new();
        restored.persist(&mut second).unwrap();
        prop_assert_eq!(first, second);
    }
}
