use crate::attrs::{CommonAttrs, ResourceAttrs};
use crate::keyed::{Keyed, KeyedVec};
use crate::mask::AccessMask;
use crate::types::*;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    id: u16,
    children: u32,
}

impl Keyed for Entry {
    type Key = u16;

    fn key(&self) -> u16 {
        self.id
    }
}

fn entry(id: u16) -> Entry {
    Entry { id, children: 0 }
}

#[test]
fn keyed_vec_keeps_ascending_order() {
    let mut v = KeyedVec::new();
    for id in [42u16, 4, 517, 0, 69] {
        v.insert(entry(id)).unwrap();
    }
    let keys: Vec<u16> = v.keys().collect();
    assert_eq!(keys, vec![0, 4, 42, 69, 517]);
}

#[test]
fn keyed_vec_rejects_duplicates() {
    let mut v = KeyedVec::new();
    v.insert(entry(7)).unwrap();
    assert!(v.insert(entry(7)).is_err());
    assert_eq!(v.len(), 1);
}

#[test]
fn find_or_create_splices_in_sorted_position() {
    let mut v = KeyedVec::new();
    v.insert(entry(1)).unwrap();
    v.insert(entry(9)).unwrap();

    let created = v.find_or_create_with(5, || entry(5));
    created.children = 3;
    assert_eq!(v.keys().collect::<Vec<_>>(), vec![1, 5, 9]);

    // second lookup must return the same element, not a fresh one
    assert_eq!(v.find_or_create_with(5, || entry(5)).children, 3);
}

#[test]
fn remove_if_honors_emptiness_predicate() {
    let mut v = KeyedVec::new();
    v.insert(Entry { id: 3, children: 1 }).unwrap();

    assert!(!v.remove_if(3, |e| e.children == 0));
    assert!(v.contains(3));

    v.find_mut(3).unwrap().children = 0;
    assert!(v.remove_if(3, |e| e.children == 0));
    assert!(!v.contains(3));
}

#[test]
fn find_returns_none_for_absent_key() {
    let mut v = KeyedVec::new();
    v.insert(entry(2)).unwrap();
    v.insert(entry(4)).unwrap();
    assert!(v.find(3).is_none());
    assert!(v.remove(3).is_none());
}

#[test]
fn common_attrs_emptiness() {
    assert!(CommonAttrs::EMPTY.is_empty());
    let attrs = CommonAttrs {
        min_period: Some(42),
        ..CommonAttrs::EMPTY
    };
    assert!(!attrs.is_empty());
}

#[test]
fn resource_attrs_emptiness_covers_thresholds() {
    assert!(ResourceAttrs::EMPTY.is_empty());
    let attrs = ResourceAttrs {
        step: Some(0.5),
        ..ResourceAttrs::EMPTY
    };
    assert!(!attrs.is_empty());
}

#[test]
fn reserved_ssids() {
    assert_eq!(Ssid::ANY, Ssid(0));
    assert_eq!(Ssid::BOOTSTRAP, Ssid(ID_INVALID));
}

#[test]
fn access_mask_display() {
    let mask = AccessMask::READ | AccessMask::DELETE;
    assert_eq!(mask.to_string(), "RD");
    assert_eq!(AccessMask::FULL.to_string(), "RWEDC");
}

#[test]
fn value_integer_coercion() {
    assert_eq!(Value::Int(-3).as_i64(), Some(-3));
    assert_eq!(Value::Uint(7).as_i64(), Some(7));
    assert_eq!(Value::Uint(u64::MAX).as_i64(), None);
    assert_eq!(Value::String("x".into()).as_i64(), None);
}
