//! Integration test: SlotTable
//!
//! Exercises the generational arena behind every kiln handle: slot reuse,
//! stale-handle rejection, the reserved index 0 and the capacity bound.
//!
//! Run with: cargo test -p kiln-core --test slot_table_test -- --nocapture

use kiln_core::error::CoreError;
use kiln_core::handle::{Buffer, BufferHandle};
use kiln_core::SlotTable;

#[test]
fn test_insert_and_get() {
    let mut table: SlotTable<Buffer, &'static str> = SlotTable::new(8);
    let a = table.insert("a").expect("insert a");
    let b = table.insert("b").expect("insert b");

    assert_ne!(a, b);
    assert_ne!(a.index(), 0, "index 0 is reserved");
    assert_eq!(table.get(a), Some(&"a"));
    assert_eq!(table.get(b), Some(&"b"));
    assert_eq!(table.len(), 2);
    println!("handles: {:?} {:?}", a, b);
}

#[test]
fn test_none_handle_is_never_valid() {
    let mut table: SlotTable<Buffer, u32> = SlotTable::new(4);
    table.insert(7).expect("insert");

    assert!(BufferHandle::NONE.is_none());
    assert!(!table.contains(BufferHandle::NONE));
    assert!(!table.contains(BufferHandle::default()));
    assert!(table.remove(BufferHandle::NONE).is_none());
}

#[test]
fn test_remove_never_created_handle_is_rejected() {
    let mut table: SlotTable<Buffer, u32> = SlotTable::new(4);
    let forged = BufferHandle::from_raw_parts(3, 1);

    assert!(table.remove(forged).is_none());
    assert!(table.is_empty());
}

#[test]
fn test_stale_handle_rejected_after_slot_reuse() {
    let mut table: SlotTable<Buffer, u32> = SlotTable::new(4);
    let old = table.insert(1).expect("insert");
    assert_eq!(table.remove(old), Some(1));

    // The freed slot is handed out again with a newer generation.
    let new = table.insert(2).expect("reinsert");
    assert_eq!(old.index(), new.index());
    assert_ne!(old.generation(), new.generation());

    assert!(table.get(old).is_none());
    assert!(table.remove(old).is_none(), "stale handle must not free the new value");
    assert_eq!(table.get(new), Some(&2));
}

#[test]
fn test_double_remove_is_rejected() {
    let mut table: SlotTable<Buffer, u32> = SlotTable::new(4);
    let h = table.insert(9).expect("insert");

    assert_eq!(table.remove(h), Some(9));
    assert_eq!(table.remove(h), None);
    assert_eq!(table.len(), 0);
}

#[test]
fn test_capacity_bound() {
    let mut table: SlotTable<Buffer, u32> = SlotTable::new(2);
    let first = table.insert(1).expect("first");
    table.insert(2).expect("second");

    match table.insert(3) {
        Err(CoreError::TableFull { table, capacity }) => {
            assert_eq!(table, "buffer");
            assert_eq!(capacity, 2);
        }
        other => panic!("expected TableFull, got {:?}", other),
    }

    // Freeing a slot makes room again.
    table.remove(first);
    assert!(table.insert(3).is_ok());
}

#[test]
fn test_iter_and_drain_visit_live_slots() {
    let mut table: SlotTable<Buffer, u32> = SlotTable::new(8);
    let a = table.insert(10).expect("a");
    let b = table.insert(20).expect("b");
    let c = table.insert(30).expect("c");
    table.remove(b);

    let live: Vec<_> = table.iter().map(|(h, v)| (h, *v)).collect();
    assert_eq!(live, vec![(a, 10), (c, 30)]);

    let drained = table.drain();
    assert_eq!(drained.len(), 2);
    assert!(table.is_empty());
    assert!(!table.contains(a));
    assert!(!table.contains(c));
}
