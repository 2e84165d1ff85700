use tracing_test::traced_test;

use super::{
    error::HeapError,
    ptr::{Ptr, Void},
    store::{FileStore, MemStore, Storage},
    Heap,
};

#[test]
#[traced_test]
fn initializing_heap_doesnt_crash() {
    let heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    heap.close().expect("failed to close heap");
}

#[test]
#[traced_test]
fn alloc_write_read() {
    let mut heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    let a = heap.alloc(24).unwrap();
    let b = heap.alloc(64).unwrap();
    heap.put_u64(a, 0x928374ABEE1).unwrap();
    heap.put_u32(a.offset(8), 77).unwrap();
    heap.put_u64(b, u64::MAX).unwrap();
    assert_eq!(heap.get_u64(a).unwrap(), 0x928374ABEE1);
    assert_eq!(heap.get_u32(a.offset(8)).unwrap(), 77);
    assert_eq!(heap.get_u64(b).unwrap(), u64::MAX);
    heap.close().expect("failed to close heap");
}

#[test]
#[traced_test]
fn fresh_chunks_are_zeroed() {
    let mut heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    let a = heap.alloc(32).unwrap();
    for i in 0..4 {
        assert_eq!(heap.get_u64(a.offset(i * 8)).unwrap(), 0);
    }
}

#[test]
#[traced_test]
fn free_list_reuses_chunks() {
    let mut heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    let a = heap.alloc(48).unwrap();
    heap.put_u64(a, 0xDEAD).unwrap();
    heap.free(a).expect("failed to free");
    let b = heap.alloc(48).unwrap();
    assert_eq!(a, b, "freed chunk of the same size was not reused");
    // reused chunks must come back zeroed
    assert_eq!(heap.get_u64(b).unwrap(), 0);
    // a different size must not land on the freed chunk
    heap.free(b).unwrap();
    let c = heap.alloc(64).unwrap();
    assert_ne!(b, c);
}

#[test]
#[traced_test]
fn double_free_errors() {
    let mut heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    let a = heap.alloc(16).unwrap();
    heap.free(a).expect("failed to free");
    assert_eq!(
        heap.free(a),
        Err(HeapError::DoubleFree),
        "double-free did not error!"
    );
}

#[test]
#[traced_test]
fn bad_pointer_errors() {
    let mut heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    let a = heap.alloc(16).unwrap();
    assert_eq!(
        heap.free(a.offset(4)),
        Err(HeapError::PointerMismatch),
        "`free` did not catch a pointer into the middle of a chunk"
    );
    let past_end = Ptr::<Void>::with(heap.used() + 100);
    assert!(matches!(
        heap.get_u64(past_end),
        Err(HeapError::OutOfBounds { .. })
    ));
    assert!(matches!(
        heap.put_u64(past_end, 1),
        Err(HeapError::OutOfBounds { .. })
    ));
}

#[test]
#[traced_test]
fn null_reads_are_rejected() {
    let mut heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    assert!(matches!(
        heap.get_u64(Ptr::null()),
        Err(HeapError::OutOfBounds { .. })
    ));
}

#[test]
#[traced_test]
fn strings_roundtrip() {
    let mut heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    let s = heap.new_string("hello, heap").unwrap();
    assert_eq!(heap.get_string(s).unwrap(), "hello, heap");
    assert!(heap.string_eq(s, "hello, heap").unwrap());
    assert!(!heap.string_eq(s, "hello, heap!").unwrap());
    assert!(!heap.string_eq(s, "").unwrap());
    heap.free_string(s).expect("failed to free string");
}

#[test]
#[traced_test]
fn empty_and_unicode_strings() {
    let mut heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    let empty = heap.new_string("").unwrap();
    assert!(!empty.is_null(), "interned empty string must be a real chunk");
    assert_eq!(heap.get_string(empty).unwrap(), "");
    let uni = heap.new_string("snow: \u{2603}").unwrap();
    assert_eq!(heap.get_string(uni).unwrap(), "snow: \u{2603}");
    assert!(heap.string_eq(uni, "snow: \u{2603}").unwrap());
}

#[test]
#[traced_test]
fn same_size_class_strings_reuse_chunks() {
    let mut heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    let a = heap.new_string("0123456789").unwrap();
    heap.free_string(a).unwrap();
    // different length, same power-of-two size class
    let b = heap.new_string("01234").unwrap();
    assert_eq!(a, b);
    assert_eq!(heap.get_string(b).unwrap(), "01234");
}

#[test]
#[traced_test]
fn index_roots_persist_in_the_header() {
    let mut heap = Heap::new(MemStore::new(), false).expect("failed to create heap");
    assert!(heap.index_root(0).unwrap().is_null());
    let a = heap.alloc(32).unwrap();
    heap.set_index_root(0, a).unwrap();
    heap.set_index_root(3, a.offset(8)).unwrap();
    assert_eq!(heap.index_root(0).unwrap(), a);
    assert_eq!(heap.index_root(3).unwrap(), a.offset(8));
    assert!(heap.index_root(1).unwrap().is_null());
}

#[test]
#[traced_test]
fn refuses_stores_that_are_not_heaps() {
    let mut store = MemStore::new();
    store.expand_by(1024).unwrap();
    store
        .write_buf(Ptr::null(), 16, b"definitely not a")
        .unwrap();
    match Heap::new(store, false) {
        Err(HeapError::NotAHeap) => {}
        other => panic!("expected NotAHeap, got {other:?}"),
    }
}

#[test]
#[traced_test]
fn init_overwrite_reclaims_foreign_stores() {
    let mut store = MemStore::new();
    store.expand_by(1024).unwrap();
    store
        .write_buf(Ptr::null(), 16, b"definitely not a")
        .unwrap();
    let mut heap = Heap::new(store, true).expect("init_overwrite should reinitialize");
    let a = heap.alloc(16).unwrap();
    heap.put_u64(a, 42).unwrap();
    assert_eq!(heap.get_u64(a).unwrap(), 42);
}

#[test]
#[traced_test]
fn file_store_persists_across_reopen() {
    let path = std::env::temp_dir().join(format!("tangle-heap-test-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);

    // Safety: the file is private to this test
    let store = unsafe { FileStore::new(&path, false) }.expect("failed to open file store");
    let mut heap = Heap::new(store, false).expect("failed to create heap");
    let a = heap.alloc(32).unwrap();
    heap.put_u64(a, 0xCAFE).unwrap();
    let s = heap.new_string("persistent").unwrap();
    heap.put_ptr(a.offset(8), s).unwrap();
    heap.close().expect("failed to close heap");

    // Safety: as above
    let store = unsafe { FileStore::new(&path, false) }.expect("failed to reopen file store");
    let mut heap = Heap::new(store, false).expect("failed to reopen heap");
    assert_eq!(heap.get_u64(a).unwrap(), 0xCAFE);
    let s = heap.get_ptr(a.offset(8)).unwrap();
    assert_eq!(heap.get_string(s).unwrap(), "persistent");
    heap.close().unwrap();

    let _ = std::fs::remove_file(&path);
}
