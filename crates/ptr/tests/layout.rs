//! Layout guarantees that stored pools rely on

use pmkit_ptr::{AtomicRelPtr, AtomicTaggedPtr, RelPtr, TaggedPtr};
use static_assertions::{assert_eq_size, assert_impl_all, assert_not_impl_any};

struct Node {
    _value: u64,
}

assert_eq_size!(RelPtr<Node>, isize);
assert_eq_size!(AtomicRelPtr<Node>, isize);
assert_eq_size!(TaggedPtr<Node, u32>, isize);
assert_eq_size!(AtomicTaggedPtr<Node, u32>, isize);

assert_impl_all!(RelPtr<Node>: Send, Sync, Default);
assert_impl_all!(AtomicRelPtr<Node>: Send, Sync, Default);
assert_impl_all!(AtomicTaggedPtr<Node, u32>: Send, Sync);

// Copying a relative pointer by value would silently retarget it
assert_not_impl_any!(RelPtr<Node>: Clone, Copy);
assert_not_impl_any!(AtomicRelPtr<Node>: Clone, Copy);
assert_not_impl_any!(TaggedPtr<Node, u32>: Clone, Copy);

#[test]
fn test_null_is_zero_word() {
    let p: RelPtr<Node> = RelPtr::null();
    assert_eq!(p.raw_offset(), 0);
    assert!(p.is_null());
}

#[test]
fn test_alignment_matches_word() {
    assert_eq!(std::mem::align_of::<RelPtr<u8>>(), std::mem::align_of::<isize>());
    assert_eq!(std::mem::align_of::<AtomicRelPtr<u8>>(), std::mem::align_of::<isize>());
}
