//! Best-fit allocator over the shared arena.
//!
//! The arena is a doubly-linked list of nodes that spans it exactly: the
//! first node starts at arena offset 0, each node's `next_offset` is the
//! start of the following node (so a node's real size is `next - self`),
//! and the last node has a null `next_offset`. Adjacent free nodes are
//! merged on free, so no two free neighbors ever coexist.
//!
//! The caller holds the heap mutex around every operation; the same mutex
//! is an OS object shared with the peer process, making the allocator
//! cross-process safe.

use crate::error::IpcError;
use crate::layout::{HeapHeader, HeapNode, NODE_MAGIC, NODE_SIZE};
use crate::NULL_OFFSET;

/// Node flag: payload is live.
pub const FLAG_ALLOCATED: u32 = 1;

/// A free remainder at least this large is split off into its own node;
/// anything smaller stays as internal slack of the allocation.
const SPLIT_THRESHOLD: u32 = 4096;

/// Node headers are placed on 16-byte boundaries within the arena.
const NODE_ALIGN: u32 = 16;

/// Write the initial spanning free node of a fresh arena.
///
/// # Safety
///
/// `header` must point at an initialized [`HeapHeader`] whose arena lies
/// within the mapping.
pub(crate) unsafe fn init_arena(header: *mut HeapHeader) {
    let arena = unsafe { (header as *mut u8).add((*header).buffer_offset as usize) };
    let first = arena as *mut HeapNode;
    unsafe {
        (*first).magic = NODE_MAGIC;
        (*first).prev_offset = NULL_OFFSET;
        (*first).next_offset = NULL_OFFSET;
        (*first).flags = 0;
    }
}

/// Accessor over the heap structure inside the shared segment. The caller
/// is responsible for holding the heap mutex around every operation.
pub struct Heap {
    header: *mut HeapHeader,
}

impl Heap {
    /// Wrap a heap header inside a mapped segment.
    ///
    /// # Safety
    ///
    /// `header` must point at a validated [`HeapHeader`] whose arena lies
    /// entirely within the mapping, and must stay valid for the lifetime of
    /// the returned value.
    pub unsafe fn from_raw(header: *mut HeapHeader) -> Self {
        Self { header }
    }

    fn header(&self) -> &HeapHeader {
        unsafe { &*self.header }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut HeapHeader {
        unsafe { &mut *self.header }
    }

    /// Base address of the arena; heap offsets carried in commands are
    /// relative to this.
    pub fn arena(&self) -> *mut u8 {
        unsafe { (self.header as *mut u8).add(self.header().buffer_offset as usize) }
    }

    /// Arena size in bytes.
    pub fn capacity(&self) -> u32 {
        let header = self.header();
        header.size - header.buffer_offset
    }

    /// Sum of the real sizes of allocated nodes, node headers included.
    pub fn usage(&self) -> u32 {
        self.header().buffer_usage
    }

    /// OS mutex handle stored by the master, adopted by the slave.
    pub fn mutex_handle(&self) -> u32 {
        self.header().mutex_handle
    }

    pub fn set_mutex_handle(&self, handle: u32) {
        self.header_mut().mutex_handle = handle;
    }

    #[allow(clippy::mut_from_ref)]
    fn node(&self, offset: u32) -> &mut HeapNode {
        unsafe { &mut *(self.arena().add(offset as usize) as *mut HeapNode) }
    }

    fn node_magic_ok(&self, offset: u32) -> bool {
        self.node(offset).magic == NODE_MAGIC
    }

    /// Real end of a node: its `next_offset`, or the arena end for the last
    /// node.
    fn real_next(&self, node: &HeapNode) -> u32 {
        if node.next_offset == NULL_OFFSET {
            self.capacity()
        } else {
            node.next_offset
        }
    }

    /// Reserve `size` payload bytes and return the arena-relative offset of
    /// the payload (just past the node header).
    pub fn alloc(&self, size: u32) -> Result<u32, IpcError> {
        let capacity = self.capacity();
        let full = || IpcError::HeapFull {
            requested: size,
            available: capacity - self.usage(),
        };

        if size > capacity - NODE_SIZE {
            return Err(full());
        }
        let total = size + NODE_SIZE;
        if total > capacity - self.usage() {
            return Err(full());
        }

        let start = match self.header().last_free_offset {
            NULL_OFFSET => 0,
            hint => hint,
        };

        // Forward scan from the hint.
        let mut offset = start;
        loop {
            let node = self.node(offset);
            debug_assert_eq!(node.magic, NODE_MAGIC);

            let real_next = self.real_next(node);
            let node_size = real_next - offset;

            if node.flags & FLAG_ALLOCATED == 0 && total < node_size {
                return Ok(self.place(offset, total, node_size));
            }

            match node.next_offset {
                NULL_OFFSET => break,
                next => offset = next,
            }
        }

        // Backward scan from the hint.
        let mut offset = match self.node(start).prev_offset {
            NULL_OFFSET => return Err(full()),
            prev => prev,
        };
        loop {
            let node = self.node(offset);
            debug_assert_eq!(node.magic, NODE_MAGIC);

            let real_next = self.real_next(node);
            let node_size = real_next - offset;

            if node.flags & FLAG_ALLOCATED == 0 && total < node_size {
                return Ok(self.place(offset, total, node_size));
            }

            match node.prev_offset {
                NULL_OFFSET => break,
                prev => offset = prev,
            }
        }

        Err(full())
    }

    /// Mark the node at `offset` allocated, splitting off the tail if the
    /// slack is worth a node of its own. Returns the payload offset.
    fn place(&self, offset: u32, total: u32, node_size: u32) -> u32 {
        if node_size - total >= SPLIT_THRESHOLD {
            self.split(offset, total);
        }

        let node = self.node(offset);
        node.flags |= FLAG_ALLOCATED;
        let real_next = self.real_next(node);
        self.header_mut().buffer_usage += real_next - offset;
        offset + NODE_SIZE
    }

    /// Insert a new free node at `offset + align16(total)` and truncate the
    /// node at `offset` to end there.
    fn split(&self, offset: u32, total: u32) {
        let alloc_size = total.next_multiple_of(NODE_ALIGN);
        let node = self.node(offset);
        let old_next = node.next_offset;

        let new_offset = offset + alloc_size;
        let new_node = self.node(new_offset);
        new_node.magic = NODE_MAGIC;
        new_node.prev_offset = offset;
        new_node.next_offset = old_next;
        new_node.flags = 0;

        if old_next != NULL_OFFSET {
            self.node(old_next).prev_offset = new_offset;
        }
        self.node(offset).next_offset = new_offset;
    }

    /// Release the allocation whose payload starts at `payload_offset`,
    /// merging it with free neighbors on both sides.
    pub fn free(&self, payload_offset: u32) -> Result<(), IpcError> {
        let capacity = self.capacity();
        let mut offset = payload_offset
            .checked_sub(NODE_SIZE)
            .ok_or(IpcError::BadPointer)?;
        if offset > capacity - NODE_SIZE || !self.node_magic_ok(offset) {
            return Err(IpcError::BadPointer);
        }

        {
            let node = self.node(offset);
            if node.flags & FLAG_ALLOCATED == 0 {
                return Err(IpcError::BadPointer);
            }

            let real_size = self.real_next(node) - offset;
            debug_assert!(real_size <= self.usage());
            node.flags &= !FLAG_ALLOCATED;
            self.header_mut().buffer_usage -= real_size;
        }

        // Absorb free successors.
        loop {
            let next_offset = self.node(offset).next_offset;
            if next_offset == NULL_OFFSET {
                break;
            }
            let next = self.node(next_offset);
            debug_assert_eq!(next.magic, NODE_MAGIC);
            if next.flags & FLAG_ALLOCATED != 0 {
                break;
            }

            let after = next.next_offset;
            next.magic = [0; 4];
            self.node(offset).next_offset = after;
            if after != NULL_OFFSET {
                self.node(after).prev_offset = offset;
            }
        }

        // Fold into free predecessors.
        loop {
            let prev_offset = self.node(offset).prev_offset;
            if prev_offset == NULL_OFFSET {
                break;
            }
            let prev = self.node(prev_offset);
            debug_assert_eq!(prev.magic, NODE_MAGIC);
            if prev.flags & FLAG_ALLOCATED != 0 {
                break;
            }

            let after = self.node(offset).next_offset;
            prev.next_offset = after;
            if after != NULL_OFFSET {
                self.node(after).prev_offset = prev_offset;
            }
            self.node(offset).magic = [0; 4];
            offset = prev_offset;
        }

        self.header_mut().last_free_offset = offset;
        Ok(())
    }

    /// Bounds-check an arena-relative offset.
    pub fn check_offset(&self, offset: u32) -> Result<(), IpcError> {
        if offset >= self.capacity() {
            return Err(IpcError::OutOfBounds);
        }
        Ok(())
    }

    /// Walk the node list and verify every structural invariant. Used by
    /// tests and debug logging.
    pub fn validate(&self) -> Result<HeapStats, IpcError> {
        let capacity = self.capacity();
        let mut offset = 0u32;
        let mut prev = NULL_OFFSET;
        let mut allocated_bytes = 0u32;
        let mut nodes = 0usize;
        let mut last_was_free = false;

        loop {
            if offset > capacity - NODE_SIZE {
                return Err(IpcError::OutOfBounds);
            }
            let node = self.node(offset);
            if node.magic != NODE_MAGIC {
                return Err(IpcError::BadPointer);
            }
            if node.prev_offset != prev {
                return Err(IpcError::Ipc(format!(
                    "node at {offset} has prev {} instead of {prev}",
                    node.prev_offset
                )));
            }

            let free = node.flags & FLAG_ALLOCATED == 0;
            if free && last_was_free {
                return Err(IpcError::Ipc(format!("adjacent free nodes at {offset}")));
            }
            last_was_free = free;

            let real_next = self.real_next(node);
            if real_next <= offset {
                return Err(IpcError::Ipc(format!("node at {offset} is not ordered")));
            }
            if !free {
                allocated_bytes += real_next - offset;
            }
            nodes += 1;

            match node.next_offset {
                NULL_OFFSET => break,
                next => {
                    prev = offset;
                    offset = next;
                }
            }
        }

        if allocated_bytes != self.usage() {
            return Err(IpcError::Ipc(format!(
                "usage counter {} does not match allocated bytes {allocated_bytes}",
                self.usage()
            )));
        }

        Ok(HeapStats {
            nodes,
            allocated_bytes,
        })
    }
}

/// Summary produced by [`Heap::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Total nodes in the list.
    pub nodes: usize,
    /// Bytes held by allocated nodes, headers included.
    pub allocated_bytes: u32,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layout::{HEAP_HEADER_SIZE, HEAP_MAGIC};

    /// A 16-byte-aligned byte region standing in for a mapped segment.
    pub(crate) struct AlignedRegion {
        storage: Vec<u128>,
    }

    impl AlignedRegion {
        pub(crate) fn new(len: usize) -> Self {
            Self {
                storage: vec![0u128; len.div_ceil(16)],
            }
        }

        pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
            self.storage.as_mut_ptr() as *mut u8
        }
    }

    const ARENA: u32 = 256 * 1024;

    fn make_heap(region: &mut AlignedRegion) -> Heap {
        let header = region.as_mut_ptr() as *mut HeapHeader;
        unsafe {
            (*header).magic = HEAP_MAGIC;
            (*header).size = HEAP_HEADER_SIZE + ARENA;
            (*header).buffer_offset = HEAP_HEADER_SIZE;
            (*header).buffer_usage = 0;
            (*header).last_free_offset = NULL_OFFSET;
            init_arena(header);
            Heap::from_raw(header)
        }
    }

    #[test]
    fn alloc_then_free_collapses_to_one_node() {
        let mut region = AlignedRegion::new((HEAP_HEADER_SIZE + ARENA) as usize);
        let heap = make_heap(&mut region);

        let offset = heap.alloc(1000).unwrap();
        assert_eq!(offset, NODE_SIZE);
        assert!(heap.usage() >= 1000 + NODE_SIZE);
        heap.validate().unwrap();

        heap.free(offset).unwrap();
        assert_eq!(heap.usage(), 0);
        let stats = heap.validate().unwrap();
        assert_eq!(stats.nodes, 1);
    }

    #[test]
    fn allocations_are_distinct_and_non_overlapping() {
        let mut region = AlignedRegion::new((HEAP_HEADER_SIZE + ARENA) as usize);
        let heap = make_heap(&mut region);

        let mut spans: Vec<(u32, u32)> = Vec::new();
        for size in [1u32, 17, 4096, 100, 9000] {
            let offset = heap.alloc(size).unwrap();
            for &(other, other_size) in &spans {
                assert!(
                    offset + size <= other || other + other_size <= offset,
                    "allocation [{offset}, +{size}) overlaps [{other}, +{other_size})"
                );
            }
            spans.push((offset, size));
        }
        heap.validate().unwrap();

        for (offset, _) in spans {
            heap.free(offset).unwrap();
        }
        assert_eq!(heap.usage(), 0);
        assert_eq!(heap.validate().unwrap().nodes, 1);
    }

    #[test]
    fn small_remainder_is_not_split() {
        let mut region = AlignedRegion::new((HEAP_HEADER_SIZE + ARENA) as usize);
        let heap = make_heap(&mut region);

        // First fill all but a sliver of the arena, then allocate into the
        // sliver; the leftover after the second fit is below the split
        // threshold, so the node keeps its slack.
        let big = heap.alloc(ARENA - NODE_SIZE - 4160).unwrap();
        let small = heap.alloc(100).unwrap();
        let stats = heap.validate().unwrap();
        assert_eq!(stats.nodes, 2);
        assert_eq!(heap.usage(), ARENA);

        heap.free(small).unwrap();
        heap.free(big).unwrap();
        assert_eq!(heap.validate().unwrap().nodes, 1);
    }

    #[test]
    fn free_merges_with_both_neighbors() {
        let mut region = AlignedRegion::new((HEAP_HEADER_SIZE + ARENA) as usize);
        let heap = make_heap(&mut region);

        let a = heap.alloc(8192).unwrap();
        let b = heap.alloc(8192).unwrap();
        let c = heap.alloc(8192).unwrap();
        heap.validate().unwrap();

        heap.free(a).unwrap();
        heap.free(c).unwrap();
        heap.validate().unwrap();

        // Freeing the middle block coalesces all three plus the tail.
        heap.free(b).unwrap();
        assert_eq!(heap.usage(), 0);
        assert_eq!(heap.validate().unwrap().nodes, 1);
    }

    #[test]
    fn exhaustion_reports_heap_full_and_recovers() {
        let mut region = AlignedRegion::new((HEAP_HEADER_SIZE + ARENA) as usize);
        let heap = make_heap(&mut region);

        let mut held = Vec::new();
        loop {
            match heap.alloc(16 * 1024) {
                Ok(offset) => held.push(offset),
                Err(IpcError::HeapFull { requested, available }) => {
                    assert_eq!(requested, 16 * 1024);
                    assert!(available < 16 * 1024 + NODE_SIZE);
                    break;
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert!(!held.is_empty());
        heap.validate().unwrap();

        // Freeing the block next to the leftover tail coalesces the two;
        // the hint points at the merged region and the next same-sized
        // allocation lands exactly where the freed one was.
        let victim = held.pop().unwrap();
        heap.free(victim).unwrap();
        let replacement = heap.alloc(16 * 1024).unwrap();
        assert_eq!(replacement, victim);

        heap.free(replacement).unwrap();
        for offset in held {
            heap.free(offset).unwrap();
        }
        assert_eq!(heap.usage(), 0);
        assert_eq!(heap.validate().unwrap().nodes, 1);
    }

    #[test]
    fn backward_scan_accounts_usage() {
        let mut region = AlignedRegion::new((HEAP_HEADER_SIZE + ARENA) as usize);
        let heap = make_heap(&mut region);

        // Layout: [a][b][rest][gap]. Free `a`, then free the small gap at
        // the end so the hint points past everything that is still live. A
        // request too large for the gap finds nothing on the forward scan
        // and must walk backward to `a`'s hole; the usage counter has to
        // account for it all the same.
        let a = heap.alloc(32 * 1024).unwrap();
        let b = heap.alloc(8192).unwrap();
        let rest = heap.alloc(216_704).unwrap();
        let gap = heap.alloc(4000).unwrap();

        heap.free(a).unwrap();
        heap.free(gap).unwrap();

        let hole = heap.alloc(16 * 1024).unwrap();
        assert!(hole < b);
        heap.validate().unwrap();

        for offset in [b, rest, hole] {
            heap.free(offset).unwrap();
        }
        assert_eq!(heap.usage(), 0);
    }

    #[test]
    fn freeing_a_bad_pointer_is_rejected() {
        let mut region = AlignedRegion::new((HEAP_HEADER_SIZE + ARENA) as usize);
        let heap = make_heap(&mut region);

        let offset = heap.alloc(64).unwrap();
        assert!(matches!(heap.free(offset + 4), Err(IpcError::BadPointer)));
        assert!(matches!(heap.free(8), Err(IpcError::BadPointer)));

        heap.free(offset).unwrap();
        // Double free: the node is free again, which the flag check catches.
        assert!(matches!(heap.free(offset), Err(IpcError::BadPointer)));
        heap.validate().unwrap();
    }

    #[test]
    fn oversized_request_fails_up_front() {
        let mut region = AlignedRegion::new((HEAP_HEADER_SIZE + ARENA) as usize);
        let heap = make_heap(&mut region);

        assert!(matches!(
            heap.alloc(ARENA),
            Err(IpcError::HeapFull { .. })
        ));
        assert_eq!(heap.usage(), 0);
        heap.validate().unwrap();
    }

    #[test]
    fn random_alloc_free_sequence_keeps_invariants() {
        let mut region = AlignedRegion::new((HEAP_HEADER_SIZE + ARENA) as usize);
        let heap = make_heap(&mut region);

        // Deterministic pseudo-random workload.
        let mut state = 0x2545F491u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        let mut held: Vec<u32> = Vec::new();
        for _ in 0..2000 {
            if next() % 3 != 0 || held.is_empty() {
                let size = next() % 3000 + 1;
                match heap.alloc(size) {
                    Ok(offset) => held.push(offset),
                    Err(IpcError::HeapFull { .. }) => {
                        let offset = held.swap_remove(next() as usize % held.len());
                        heap.free(offset).unwrap();
                    }
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            } else {
                let offset = held.swap_remove(next() as usize % held.len());
                heap.free(offset).unwrap();
            }
            heap.validate().unwrap();
        }

        for offset in held {
            heap.free(offset).unwrap();
        }
        assert_eq!(heap.usage(), 0);
        assert_eq!(heap.validate().unwrap().nodes, 1);
    }
}
