//! One-directional framed byte queue over a ring buffer in the shared
//! segment.
//!
//! Exactly one process writes and exactly one process reads each queue; the
//! OS mutex named by the queue header serializes the two. A read drains
//! everything currently enqueued so the reader can release the mutex
//! immediately and parse frames out of its own scratch buffer; messages
//! carry their length in the command envelope, so no per-message locking is
//! needed.

use crate::error::IpcError;
use crate::layout::QueueHeader;

/// Accessor over a queue structure inside the shared segment. The caller is
/// responsible for holding the queue mutex around every operation.
pub struct Queue {
    header: *mut QueueHeader,
}

impl Queue {
    /// Wrap a queue header inside a mapped segment.
    ///
    /// # Safety
    ///
    /// `header` must point at a validated [`QueueHeader`] whose ring buffer
    /// lies entirely within the mapping, and must stay valid for the
    /// lifetime of the returned value.
    pub unsafe fn from_raw(header: *mut QueueHeader) -> Self {
        Self { header }
    }

    fn header(&self) -> &QueueHeader {
        unsafe { &*self.header }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut QueueHeader {
        unsafe { &mut *self.header }
    }

    fn buffer(&self) -> *mut u8 {
        unsafe { (self.header as *mut u8).add(self.header().buffer_offset as usize) }
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> u32 {
        let header = self.header();
        header.size - header.buffer_offset
    }

    /// Bytes currently enqueued.
    pub fn usage(&self) -> u32 {
        self.header().buffer_usage
    }

    /// OS event handle stored by the master, adopted by the slave.
    pub fn event_handle(&self) -> u32 {
        self.header().event_handle
    }

    /// OS mutex handle stored by the master, adopted by the slave.
    pub fn mutex_handle(&self) -> u32 {
        self.header().mutex_handle
    }

    pub fn set_event_handle(&self, handle: u32) {
        self.header_mut().event_handle = handle;
    }

    pub fn set_mutex_handle(&self, handle: u32) {
        self.header_mut().mutex_handle = handle;
    }

    /// Append `data` to the ring, wrapping at most once. Fails without
    /// touching the queue if the bytes do not fit.
    pub fn write(&self, data: &[u8]) -> Result<(), IpcError> {
        let capacity = self.capacity();
        let usage = self.usage();
        let size = data.len() as u32;

        if data.len() > (capacity - usage) as usize {
            return Err(IpcError::QueueOverflow {
                requested: size,
                available: capacity - usage,
            });
        }

        let base = self.buffer();
        let write_pos = self.header().write_pos;

        unsafe {
            if size <= capacity - write_pos {
                std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(write_pos as usize), data.len());
                self.header_mut().write_pos = write_pos + size;
            } else {
                let first = (capacity - write_pos) as usize;
                std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(write_pos as usize), first);
                std::ptr::copy_nonoverlapping(data[first..].as_ptr(), base, data.len() - first);
                self.header_mut().write_pos = size - first as u32;
            }
        }

        self.header_mut().buffer_usage = usage + size;
        Ok(())
    }

    /// Drain every enqueued byte into `out` (resized to fit) and reset the
    /// usage counter.
    pub fn read_all(&self, out: &mut Vec<u8>) {
        let capacity = self.capacity();
        let usage = self.usage();
        let read_pos = self.header().read_pos;

        out.resize(usage as usize, 0);
        if usage == 0 {
            return;
        }

        let base = self.buffer();
        unsafe {
            if usage <= capacity - read_pos {
                std::ptr::copy_nonoverlapping(base.add(read_pos as usize), out.as_mut_ptr(), usage as usize);
                self.header_mut().read_pos = read_pos + usage;
            } else {
                let first = (capacity - read_pos) as usize;
                std::ptr::copy_nonoverlapping(base.add(read_pos as usize), out.as_mut_ptr(), first);
                std::ptr::copy_nonoverlapping(base, out[first..].as_mut_ptr(), usage as usize - first);
                self.header_mut().read_pos = usage - first as u32;
            }
        }

        self.header_mut().buffer_usage = 0;
    }
}
