//! Control structures of the shared segment.
//!
//! Segment layout (little-endian, offsets fixed at initialization):
//! ```text
//! ┌─────────────────────────────┐ 0
//! │ SegmentHeader "avsw"        │
//! ├─────────────────────────────┤ MASTER_QUEUE_OFFSET
//! │ QueueHeader "cmdq" + ring   │   master -> slave
//! ├─────────────────────────────┤ + QUEUE_SIZE
//! │ QueueHeader "cmdq" + ring   │   slave -> master
//! ├─────────────────────────────┤ + QUEUE_SIZE
//! │ HeapHeader "heap"           │
//! │ arena (doubly-linked nodes) │
//! └─────────────────────────────┘ segment size
//! ```
//!
//! The segment may map at different virtual addresses in each process, so
//! every pointer stored inside it is a `u32` offset relative to a
//! documented base. The slave validates every header before touching
//! anything else; a master that wrote garbage is a fatal error, never UB on
//! this side of the boundary.

use crate::error::IpcError;
use crate::heap;
use crate::{NULL_OFFSET, QUEUE_SIZE, VERSION};

pub const SEGMENT_MAGIC: [u8; 4] = *b"avsw";
pub const QUEUE_MAGIC: [u8; 4] = *b"cmdq";
pub const HEAP_MAGIC: [u8; 4] = *b"heap";
pub const NODE_MAGIC: [u8; 4] = *b"memz";

/// Offset of the master->slave queue; the slave->master queue and the heap
/// follow contiguously.
pub const MASTER_QUEUE_OFFSET: u32 = 64;

/// Header at offset 0 of the shared segment.
#[repr(C)]
pub struct SegmentHeader {
    pub magic: [u8; 4],
    pub size: u32,
    pub version: u32,
    pub master_queue_offset: u32,
    pub slave_queue_offset: u32,
    pub heap_offset: u32,
}

/// Header of one queue. The ring buffer follows at `buffer_offset` bytes
/// from the start of this header.
///
/// `event_handle` and `mutex_handle` carry the OS primitives created by the
/// master with inheritable attributes; the slave adopts them after attach.
#[repr(C)]
pub struct QueueHeader {
    pub magic: [u8; 4],
    pub size: u32,
    pub buffer_offset: u32,
    pub buffer_usage: u32,
    pub read_pos: u32,
    pub write_pos: u32,
    pub event_handle: u32,
    pub mutex_handle: u32,
}

/// Header of the heap. The arena follows at `buffer_offset` bytes from the
/// start of this header and is 16-byte aligned relative to the segment.
#[repr(C)]
pub struct HeapHeader {
    pub magic: [u8; 4],
    pub size: u32,
    pub buffer_offset: u32,
    pub buffer_usage: u32,
    pub last_free_offset: u32,
    pub mutex_handle: u32,
    _pad: [u32; 2],
}

/// Node header inside the heap arena, immediately followed by the user
/// payload. Offsets are relative to the arena base; the node's real size is
/// `next_offset - own offset` (or arena end for the last node).
#[repr(C)]
pub struct HeapNode {
    pub magic: [u8; 4],
    pub prev_offset: u32,
    pub next_offset: u32,
    pub flags: u32,
}

pub const QUEUE_HEADER_SIZE: u32 = size_of::<QueueHeader>() as u32;
pub const HEAP_HEADER_SIZE: u32 = size_of::<HeapHeader>() as u32;
pub const NODE_SIZE: u32 = size_of::<HeapNode>() as u32;

/// Raw pointers to the control structures of an initialized segment.
pub struct SegmentView {
    pub header: *mut SegmentHeader,
    pub master_queue: *mut QueueHeader,
    pub slave_queue: *mut QueueHeader,
    pub heap: *mut HeapHeader,
}

/// Minimum segment size that leaves the heap a non-trivial arena.
pub const MIN_SEGMENT_SIZE: u32 = MASTER_QUEUE_OFFSET + 2 * QUEUE_SIZE + HEAP_HEADER_SIZE + 4096;

fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

/// Initialize the control structures of a freshly mapped, zeroed segment.
/// The event and mutex handle fields are left for the caller to fill in.
///
/// # Safety
///
/// `base` must point at a writable mapping of at least `size` bytes, and
/// `size` must be at least [`MIN_SEGMENT_SIZE`].
pub unsafe fn init_segment(base: *mut u8, size: u32) -> SegmentView {
    debug_assert!(size >= MIN_SEGMENT_SIZE);

    let master_queue_offset = MASTER_QUEUE_OFFSET;
    let slave_queue_offset = master_queue_offset + QUEUE_SIZE;
    let heap_offset = slave_queue_offset + QUEUE_SIZE;

    let header = base as *mut SegmentHeader;
    unsafe {
        (*header).magic = SEGMENT_MAGIC;
        (*header).size = size;
        (*header).version = VERSION;
        (*header).master_queue_offset = master_queue_offset;
        (*header).slave_queue_offset = slave_queue_offset;
        (*header).heap_offset = heap_offset;
    }

    let master_queue = unsafe { base.add(master_queue_offset as usize) } as *mut QueueHeader;
    let slave_queue = unsafe { base.add(slave_queue_offset as usize) } as *mut QueueHeader;
    for queue in [master_queue, slave_queue] {
        unsafe {
            (*queue).magic = QUEUE_MAGIC;
            (*queue).size = QUEUE_SIZE;
            (*queue).buffer_offset = QUEUE_HEADER_SIZE;
            (*queue).buffer_usage = 0;
            (*queue).read_pos = 0;
            (*queue).write_pos = 0;
            (*queue).event_handle = 0;
            (*queue).mutex_handle = 0;
        }
    }

    let heap_ptr = unsafe { base.add(heap_offset as usize) } as *mut HeapHeader;
    unsafe {
        (*heap_ptr).magic = HEAP_MAGIC;
        (*heap_ptr).size = size - heap_offset;
        (*heap_ptr).buffer_offset = HEAP_HEADER_SIZE;
        (*heap_ptr).buffer_usage = 0;
        (*heap_ptr).last_free_offset = NULL_OFFSET;
        (*heap_ptr).mutex_handle = 0;
        heap::init_arena(heap_ptr);
    }

    SegmentView {
        header,
        master_queue,
        slave_queue,
        heap: heap_ptr,
    }
}

/// Validate the headers of a mapped segment and return pointers into it.
/// This is the slave-side half of the handshake: every magic, the version,
/// the size, and every stored offset are checked before use.
///
/// # Safety
///
/// `base` must point at a readable and writable mapping of `size` bytes.
pub unsafe fn attach_segment(base: *mut u8, size: u32) -> Result<SegmentView, IpcError> {
    if size < MIN_SEGMENT_SIZE {
        return Err(IpcError::Ipc("wrong shared memory size".into()));
    }

    let header = base as *mut SegmentHeader;
    let hdr = unsafe { &*header };
    if fourcc(&hdr.magic) != fourcc(&SEGMENT_MAGIC) {
        return Err(IpcError::Ipc("bad header in shared memory".into()));
    }
    if hdr.size != size {
        return Err(IpcError::Ipc("wrong shared memory size".into()));
    }
    if hdr.version != VERSION {
        return Err(IpcError::Ipc("IPC version mismatch".into()));
    }
    if hdr.master_queue_offset > size - QUEUE_HEADER_SIZE
        || hdr.slave_queue_offset > size - QUEUE_HEADER_SIZE
        || hdr.heap_offset > size - HEAP_HEADER_SIZE
    {
        return Err(IpcError::OutOfBounds);
    }

    let master_queue = unsafe { validate_queue(base, size, hdr.master_queue_offset)? };
    let slave_queue = unsafe { validate_queue(base, size, hdr.slave_queue_offset)? };

    let heap_ptr = unsafe { base.add(hdr.heap_offset as usize) } as *mut HeapHeader;
    let heap_hdr = unsafe { &*heap_ptr };
    if fourcc(&heap_hdr.magic) != fourcc(&HEAP_MAGIC) {
        return Err(IpcError::Ipc("bad heap header".into()));
    }
    if heap_hdr.size > size - hdr.heap_offset
        || heap_hdr.buffer_offset < HEAP_HEADER_SIZE
        || (heap_hdr.buffer_offset as u64) + NODE_SIZE as u64 > heap_hdr.size as u64
    {
        return Err(IpcError::OutOfBounds);
    }

    Ok(SegmentView {
        header,
        master_queue,
        slave_queue,
        heap: heap_ptr,
    })
}

unsafe fn validate_queue(
    base: *mut u8,
    segment_size: u32,
    offset: u32,
) -> Result<*mut QueueHeader, IpcError> {
    let queue = unsafe { base.add(offset as usize) } as *mut QueueHeader;
    let hdr = unsafe { &*queue };
    if fourcc(&hdr.magic) != fourcc(&QUEUE_MAGIC) {
        return Err(IpcError::Ipc("bad queue header".into()));
    }
    if hdr.size > segment_size - offset
        || hdr.buffer_offset < QUEUE_HEADER_SIZE
        || hdr.buffer_offset >= hdr.size
    {
        return Err(IpcError::OutOfBounds);
    }
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::tests::AlignedRegion;

    const SIZE: u32 = MIN_SEGMENT_SIZE + 64 * 1024;

    #[test]
    fn init_then_attach() {
        let mut region = AlignedRegion::new(SIZE as usize);
        let base = region.as_mut_ptr();

        unsafe {
            init_segment(base, SIZE);
            let view = attach_segment(base, SIZE).expect("attach failed");
            assert_eq!((*view.header).size, SIZE);
            assert_eq!((*view.master_queue).size, QUEUE_SIZE);
            assert_eq!((*view.slave_queue).size, QUEUE_SIZE);
            assert_eq!((*view.heap).size, SIZE - MASTER_QUEUE_OFFSET - 2 * QUEUE_SIZE);
            assert_eq!((*view.heap).buffer_usage, 0);
        }
    }

    #[test]
    fn arena_is_sixteen_byte_aligned() {
        let heap_offset = MASTER_QUEUE_OFFSET + 2 * QUEUE_SIZE;
        assert_eq!((heap_offset + HEAP_HEADER_SIZE) % 16, 0);
    }

    #[test]
    fn attach_rejects_bad_magic() {
        let mut region = AlignedRegion::new(SIZE as usize);
        let base = region.as_mut_ptr();

        unsafe {
            init_segment(base, SIZE);
            (*(base as *mut SegmentHeader)).magic = *b"XXXX";
            assert!(attach_segment(base, SIZE).is_err());
        }
    }

    #[test]
    fn attach_rejects_version_mismatch() {
        let mut region = AlignedRegion::new(SIZE as usize);
        let base = region.as_mut_ptr();

        unsafe {
            init_segment(base, SIZE);
            (*(base as *mut SegmentHeader)).version = VERSION + 1;
            assert!(attach_segment(base, SIZE).is_err());
        }
    }

    #[test]
    fn attach_rejects_wrong_size() {
        let mut region = AlignedRegion::new(SIZE as usize);
        let base = region.as_mut_ptr();

        unsafe {
            init_segment(base, SIZE);
            assert!(attach_segment(base, SIZE - 4096).is_err());
        }
    }

    #[test]
    fn attach_rejects_out_of_bounds_offsets() {
        let mut region = AlignedRegion::new(SIZE as usize);
        let base = region.as_mut_ptr();

        unsafe {
            init_segment(base, SIZE);
            (*(base as *mut SegmentHeader)).heap_offset = SIZE - 4;
            assert!(attach_segment(base, SIZE).is_err());
        }
    }

    #[test]
    fn attach_rejects_corrupt_queue() {
        let mut region = AlignedRegion::new(SIZE as usize);
        let base = region.as_mut_ptr();

        unsafe {
            let view = init_segment(base, SIZE);
            (*view.slave_queue).magic = *b"zzzz";
            assert!(attach_segment(base, SIZE).is_err());
        }
    }
}
