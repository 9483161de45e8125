//! Unix backend: memfd-backed shared mapping, eventfd signals, an eventfd
//! binary semaphore standing in for the Windows named mutex, and a pidfd
//! watch on the peer process.
//!
//! File descriptors are created without `CLOEXEC` so the spawned slave
//! inherits them; the descriptor numbers are what travels through the
//! segment headers and the handshake command line.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::{abandoned_mutex_error, Wake};

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Duplicate a descriptor we do not own so both sides of an in-process
/// pair, or an adopting slave, get an independent reference.
fn dup_fd(fd: RawFd) -> io::Result<OwnedFd> {
    let new = check(unsafe { libc::fcntl(fd, libc::F_DUPFD, 0) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Block until any of `fds` is readable; returns per-fd readability.
fn poll_readable(fds: &[RawFd], timeout_ms: libc::c_int) -> io::Result<Vec<bool>> {
    let mut entries: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    loop {
        let ret = unsafe { libc::poll(entries.as_mut_ptr(), entries.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(entries
            .iter()
            .map(|e| e.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .collect());
    }
}

/// The shared segment mapping.
pub struct Mapping {
    base: *mut u8,
    len: usize,
    fd: OwnedFd,
}

// SAFETY: the mapping is plain shared memory; all access to the bytes
// behind `base` is serialized by the OS mutexes layered on top.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Create an anonymous shared memory segment of `len` bytes.
    pub fn create(len: u32) -> io::Result<Mapping> {
        let fd = check(unsafe {
            libc::memfd_create(c"avswire-segment".as_ptr(), 0)
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        check(unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) })?;
        Self::map(fd, len)
    }

    /// Map the segment behind an inherited descriptor number.
    pub fn open(handle: u32, len: u32) -> io::Result<Mapping> {
        let fd = dup_fd(handle as RawFd)?;
        Self::map(fd, len)
    }

    fn map(fd: OwnedFd, len: u32) -> io::Result<Mapping> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mapping {
            base: base as *mut u8,
            len: len as usize,
            fd,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Handle value to store in headers or pass to the slave.
    pub fn raw_handle(&self) -> u32 {
        self.fd.as_raw_fd() as u32
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Auto-reset notification: the writer signals after each queue append, a
/// single wait consumes the signal.
pub struct Signal {
    fd: OwnedFd,
}

impl Signal {
    pub fn create() -> io::Result<Signal> {
        let fd = check(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) })?;
        Ok(Signal {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adopt an inherited descriptor number.
    pub fn from_raw(handle: u32) -> io::Result<Signal> {
        let fd = dup_fd(handle as RawFd)?;
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Signal { fd })
    }

    pub fn raw_handle(&self) -> u32 {
        self.fd.as_raw_fd() as u32
    }

    pub fn set(&self) -> io::Result<()> {
        let one = 1u64.to_ne_bytes();
        let ret = unsafe {
            libc::write(self.fd.as_raw_fd(), one.as_ptr() as *const libc::c_void, 8)
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: the other side is already signaled.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    fn drain(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }
}

/// Cross-process mutex: an eventfd used as a binary semaphore. Locking
/// polls the peer's pidfd alongside the semaphore, so a peer that died
/// while holding the lock surfaces as an abandoned-mutex error instead of
/// a hang.
pub struct ShMutex {
    fd: OwnedFd,
}

impl ShMutex {
    pub fn create() -> io::Result<ShMutex> {
        let fd = check(unsafe { libc::eventfd(1, libc::EFD_NONBLOCK) })?;
        Ok(ShMutex {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adopt an inherited descriptor number.
    pub fn from_raw(handle: u32) -> io::Result<ShMutex> {
        let fd = dup_fd(handle as RawFd)?;
        set_nonblocking(fd.as_raw_fd())?;
        Ok(ShMutex { fd })
    }

    pub fn raw_handle(&self) -> u32 {
        self.fd.as_raw_fd() as u32
    }

    pub fn lock(&self, watch: &ProcessWatch) -> io::Result<MutexGuard<'_>> {
        loop {
            let mut buf = [0u8; 8];
            let ret = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8)
            };
            if ret == 8 {
                return Ok(MutexGuard { mutex: self });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }

            let ready = poll_readable(&[self.fd.as_raw_fd(), watch.fd.as_raw_fd()], -1)?;
            if !ready[0] && ready[1] {
                return Err(abandoned_mutex_error());
            }
        }
    }

    fn unlock(&self) {
        let one = 1u64.to_ne_bytes();
        unsafe {
            libc::write(self.fd.as_raw_fd(), one.as_ptr() as *const libc::c_void, 8);
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
    fd: OwnedFd,
}

impl ProcessWatch {
    /// Open a watch on `pid`.
    pub fn open(pid: u32) -> io::Result<ProcessWatch> {
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0u32) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ProcessWatch {
            fd: unsafe { OwnedFd::from_raw_fd(fd as RawFd) },
        })
    }

    /// Watch the current process; used by in-process test pairs, where the
    /// "remote" can never exit first.
    pub fn current() -> io::Result<ProcessWatch> {
        Self::open(std::process::id())
    }

    pub fn has_exited(&self) -> io::Result<bool> {
        let ready = poll_readable(&[self.fd.as_raw_fd()], 0)?;
        Ok(ready[0])
    }
}

/// Wait until the peer signals data available or terminates, whichever
/// comes first. The signal wins if both are ready.
pub fn wait_signal_or_exit(signal: &Signal, watch: &ProcessWatch) -> io::Result<Wake> {
    let ready = poll_readable(&[signal.fd.as_raw_fd(), watch.fd.as_raw_fd()], -1)?;
    if ready[0] {
        signal.drain();
        return Ok(Wake::Signal);
    }
    if ready[1] {
        return Ok(Wake::RemoteExit);
    }
    // poll returned without either fd ready; treat as spurious and report a
    // signal so the caller rechecks its state.
    Ok(Wake::Signal)
}
