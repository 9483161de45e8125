//! Windows backend: a pagefile-backed file mapping, auto-reset events, a
//! named-object mutex, and a process handle watch. All objects are created
//! with inheritable security attributes so the spawned slave can adopt
//! their handle values straight out of the segment headers.

use std::ffi::c_void;
use std::io;

use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE, INVALID_HANDLE_VALUE,
    WAIT_ABANDONED, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_READ, FILE_MAP_WRITE,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};
use windows::Win32::System::Threading::{
    CreateEventW, CreateMutexW, GetCurrentProcess, OpenProcess, ReleaseMutex, SetEvent,
    WaitForMultipleObjects, WaitForSingleObject, INFINITE, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_SYNCHRONIZE, PROCESS_TERMINATE,
};
use windows::core::PCWSTR;

use super::{abandoned_mutex_error, Wake};

fn to_io(error: windows::core::Error) -> io::Error {
    io::Error::other(error)
}

fn inheritable() -> SECURITY_ATTRIBUTES {
    SECURITY_ATTRIBUTES {
        nLength: size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: true.into(),
    }
}

/// Owned handle that closes on drop.
struct Owned(HANDLE);

// SAFETY: HANDLE is a process-wide kernel object reference.
unsafe impl Send for Owned {}
unsafe impl Sync for Owned {}

impl Drop for Owned {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn handle_from_u32(value: u32) -> HANDLE {
    HANDLE(value as usize as *mut c_void)
}

fn handle_to_u32(handle: HANDLE) -> u32 {
    handle.0 as usize as u32
}

/// Duplicate a handle value we do not own so both sides of an in-process
/// pair, or an adopting slave, get an independent reference.
fn dup_handle(value: u32) -> io::Result<Owned> {
    let mut out = HANDLE::default();
    unsafe {
        DuplicateHandle(
            GetCurrentProcess(),
            handle_from_u32(value),
            GetCurrentProcess(),
            &mut out,
            0,
            false,
            DUPLICATE_SAME_ACCESS,
        )
        .map_err(to_io)?;
    }
    Ok(Owned(out))
}

/// The shared segment mapping.
pub struct Mapping {
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    handle: Owned,
}

// SAFETY: the mapping is plain shared memory; all access to the bytes
// behind the view is serialized by the OS mutexes layered on top.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Create an anonymous pagefile-backed segment of `len` bytes with an
    /// inheritable handle.
    pub fn create(len: u32) -> io::Result<Mapping> {
        unsafe {
            let sa = inheritable();
            let handle = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                Some(&sa),
                PAGE_READWRITE,
                0,
                len,
                PCWSTR::null(),
            )
            .map_err(to_io)?;
            Self::map(Owned(handle), len)
        }
    }

    /// Map the segment behind an inherited handle value.
    pub fn open(handle: u32, len: u32) -> io::Result<Mapping> {
        Self::map(dup_handle(handle)?, len)
    }

    fn map(handle: Owned, len: u32) -> io::Result<Mapping> {
        let view = unsafe {
            MapViewOfFile(handle.0, FILE_MAP_READ | FILE_MAP_WRITE, 0, 0, len as usize)
        };
        if view.Value.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Mapping { view, handle })
    }

    pub fn base(&self) -> *mut u8 {
        self.view.Value as *mut u8
    }

    /// Handle value to store in headers or pass to the slave.
    pub fn raw_handle(&self) -> u32 {
        handle_to_u32(self.handle.0)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
        }
    }
}

/// Auto-reset notification event: the writer signals after each queue
/// append, a single wait consumes the signal.
pub struct Signal {
    handle: Owned,
}

impl Signal {
    pub fn create() -> io::Result<Signal> {
        let sa = inheritable();
        let handle = unsafe { CreateEventW(Some(&sa), false, false, PCWSTR::null()) }
            .map_err(to_io)?;
        Ok(Signal { handle: Owned(handle) })
    }

    /// Adopt an inherited handle value.
    pub fn from_raw(handle: u32) -> io::Result<Signal> {
        Ok(Signal { handle: dup_handle(handle)? })
    }

    pub fn raw_handle(&self) -> u32 {
        handle_to_u32(self.handle.0)
    }

    pub fn set(&self) -> io::Result<()> {
        unsafe { SetEvent(self.handle.0) }.map_err(to_io)
    }
}

/// Cross-process mutex. A peer that dies while holding it leaves the OS
/// object abandoned, which the next waiter reports as an error.
pub struct ShMutex {
    handle: Owned,
}

impl ShMutex {
    pub fn create() -> io::Result<ShMutex> {
        let sa = inheritable();
        let handle = unsafe { CreateMutexW(Some(&sa), false, PCWSTR::null()) }.map_err(to_io)?;
        Ok(ShMutex { handle: Owned(handle) })
    }

    /// Adopt an inherited handle value.
    pub fn from_raw(handle: u32) -> io::Result<ShMutex> {
        Ok(ShMutex { handle: dup_handle(handle)? })
    }

    pub fn raw_handle(&self) -> u32 {
        handle_to_u32(self.handle.0)
    }

    pub fn lock(&self, _watch: &ProcessWatch) -> io::Result<MutexGuard<'_>> {
        match unsafe { WaitForSingleObject(self.handle.0, INFINITE) } {
            WAIT_OBJECT_0 => Ok(MutexGuard { mutex: self }),
            WAIT_ABANDONED => Err(abandoned_mutex_error()),
            WAIT_FAILED => Err(io::Error::last_os_error()),
            _ => Err(io::Error::other("unknown error while waiting on mutex")),
        }
    }

    fn unlock(&self) {
        unsafe {
            let _ = ReleaseMutex(self.handle.0);
        }
    }
}

/// Holds [`ShMutex`] locked; releases on drop.
pub struct MutexGuard<'a> {
    mutex: &'a ShMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A watch on another process, waitable and pollable for termination.
pub struct ProcessWatch {
    handle: Owned,
}

impl ProcessWatch {
    /// Open a watch on `pid` with synchronize and terminate rights.
    pub fn open(pid: u32) -> io::Result<ProcessWatch> {
        let handle = unsafe {
            OpenProcess(
                PROCESS_SYNCHRONIZE | PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_TERMINATE,
                false,
                pid,
            )
        }
        .map_err(to_io)?;
        Ok(ProcessWatch { handle: Owned(handle) })
    }

    /// Watch the current process; used by in-process test pairs, where the
    /// "remote" can never exit first.
    pub fn current() -> io::Result<ProcessWatch> {
        Self::open(std::process::id())
    }

    pub fn has_exited(&self) -> io::Result<bool> {
        // A zero-timeout wait on a process handle answers immediately:
        // WAIT_TIMEOUT means still running.
        match unsafe { WaitForSingleObject(self.handle.0, 0) } {
            WAIT_TIMEOUT => Ok(false),
            WAIT_OBJECT_0 => Ok(true),
            WAIT_FAILED => Err(io::Error::last_os_error()),
            _ => Err(io::Error::other("unknown error while polling process")),
        }
    }
}

/// Wait until the peer signals data available or terminates, whichever
/// comes first. The signal wins if both are ready.
pub fn wait_signal_or_exit(signal: &Signal, watch: &ProcessWatch) -> io::Result<Wake> {
    let handles = [signal.handle.0, watch.handle.0];
    let result = unsafe { WaitForMultipleObjects(&handles, false, INFINITE) };

    if result == WAIT_OBJECT_0 {
        Ok(Wake::Signal)
    } else if result.0 == WAIT_OBJECT_0.0 + 1 {
        Ok(Wake::RemoteExit)
    } else if result == WAIT_ABANDONED || result.0 == WAIT_ABANDONED.0 + 1 {
        Err(abandoned_mutex_error())
    } else if result == WAIT_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Err(io::Error::other("unknown error while waiting on event"))
    }
}
