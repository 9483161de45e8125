//! The transport client.
//!
//! The master side creates the shared segment, the OS primitives, and the
//! slave process; the slave side adopts all of them out of the segment
//! headers. Both sides then run the same machinery: a receive thread that
//! drains the inbound queue, parses command frames, and routes each one by
//! `response_id` - to the pending callback registered by `send_async`, or
//! to the default callback for everything unsolicited.
//!
//! A fatal error on the receive thread is captured and rethrown on the next
//! public call; individual command failures travel as `ERR` replies and
//! never tear the transport down.

use std::collections::HashMap;
use std::path::Path;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::command::{Command, CommandBody, CommandType, Envelope, INVALID_TRANSACTION};
use crate::error::IpcError;
use crate::heap::Heap;
use crate::layout;
use crate::queue::Queue;
use crate::sys::{self, Mapping, ProcessWatch, ShMutex, Signal, Wake};
use crate::video::{self, MAX_STRING_LEN};
use crate::{DEFAULT_SEGMENT_SIZE, NULL_OFFSET};

/// Callback for one expected reply. Invoked with `None` exactly once if the
/// transport dies or stops before the reply arrives.
pub type Callback = Box<dyn FnOnce(Option<Command>) + Send + 'static>;

/// Callback for unsolicited commands and the end-of-stream `None`.
pub type DefaultCallback = Arc<dyn Fn(Option<Command>) + Send + Sync + 'static>;

struct ClientState {
    callbacks: HashMap<u32, Callback>,
    default_cb: Option<DefaultCallback>,
}

/// One endpoint of the shared-memory transport.
///
/// Constructed into an [`Arc`] because the receive thread and any pending
/// callbacks hold their own references. All methods take `&self`.
pub struct IpcClient {
    mapping: Mapping,
    master: bool,

    master_queue: Queue,
    master_event: Signal,
    master_mutex: ShMutex,

    slave_queue: Queue,
    slave_event: Signal,
    slave_mutex: ShMutex,

    heap: Heap,
    heap_mutex: ShMutex,

    remote: ProcessWatch,
    child: Mutex<Option<Child>>,

    state: Mutex<ClientState>,
    transaction_id: AtomicU32,
    kill_flag: AtomicBool,

    recv_thread: Mutex<Option<JoinHandle<()>>>,
    recv_thread_id: Mutex<Option<ThreadId>>,
    recv_error: Mutex<Option<IpcError>>,
}

// SAFETY: the raw pointers inside Queue and Heap all point into `mapping`,
// which lives as long as the client; every mutation of the shared
// structures happens under the corresponding OS mutex.
unsafe impl Send for IpcClient {}
unsafe impl Sync for IpcClient {}

struct MasterParts {
    mapping: Mapping,
    master_queue: Queue,
    master_event: Signal,
    master_mutex: ShMutex,
    slave_queue: Queue,
    slave_event: Signal,
    slave_mutex: ShMutex,
    heap: Heap,
    heap_mutex: ShMutex,
}

fn create_master_parts(segment_size: u32) -> Result<MasterParts, IpcError> {
    tracing::debug!(segment_size, "allocate shared memory");
    let mapping = Mapping::create(segment_size)?;

    let view = unsafe { layout::init_segment(mapping.base(), segment_size) };
    let master_queue = unsafe { Queue::from_raw(view.master_queue) };
    let slave_queue = unsafe { Queue::from_raw(view.slave_queue) };
    let heap = unsafe { Heap::from_raw(view.heap) };

    tracing::debug!("initialize synchronization objects");
    let master_event = Signal::create()?;
    let master_mutex = ShMutex::create()?;
    let slave_event = Signal::create()?;
    let slave_mutex = ShMutex::create()?;
    let heap_mutex = ShMutex::create()?;

    master_queue.set_event_handle(master_event.raw_handle());
    master_queue.set_mutex_handle(master_mutex.raw_handle());
    slave_queue.set_event_handle(slave_event.raw_handle());
    slave_queue.set_mutex_handle(slave_mutex.raw_handle());
    heap.set_mutex_handle(heap_mutex.raw_handle());

    Ok(MasterParts {
        mapping,
        master_queue,
        master_event,
        master_mutex,
        slave_queue,
        slave_event,
        slave_mutex,
        heap,
        heap_mutex,
    })
}

impl IpcClient {
    fn from_master_parts(parts: MasterParts, remote: ProcessWatch, child: Option<Child>) -> Self {
        Self {
            mapping: parts.mapping,
            master: true,
            master_queue: parts.master_queue,
            master_event: parts.master_event,
            master_mutex: parts.master_mutex,
            slave_queue: parts.slave_queue,
            slave_event: parts.slave_event,
            slave_mutex: parts.slave_mutex,
            heap: parts.heap,
            heap_mutex: parts.heap_mutex,
            remote,
            child: Mutex::new(child),
            state: Mutex::new(ClientState {
                callbacks: HashMap::new(),
                default_cb: None,
            }),
            transaction_id: AtomicU32::new(0),
            kill_flag: AtomicBool::new(false),
            recv_thread: Mutex::new(None),
            recv_thread_id: Mutex::new(None),
            recv_error: Mutex::new(None),
        }
    }

    /// Create the shared segment and spawn the slave process.
    ///
    /// The slave is invoked as `"<path>" <master-pid> <segment-handle>
    /// <segment-size>`, all decimal, with handle inheritance enabled.
    pub fn master(slave_path: &Path) -> Result<Arc<IpcClient>, IpcError> {
        if slave_path.as_os_str().is_empty() {
            return Err(IpcError::Ipc("empty slave path".into()));
        }

        let parts = create_master_parts(DEFAULT_SEGMENT_SIZE)?;

        tracing::debug!(path = %slave_path.display(), "start slave process");
        let child = std::process::Command::new(slave_path)
            .arg(std::process::id().to_string())
            .arg(parts.mapping.raw_handle().to_string())
            .arg(DEFAULT_SEGMENT_SIZE.to_string())
            .spawn()
            .map_err(|err| IpcError::Ipc(format!("error starting slave process: {err}")))?;
        tracing::debug!(pid = child.id(), "slave process started");

        let remote = ProcessWatch::open(child.id())?;
        Ok(Arc::new(Self::from_master_parts(parts, remote, Some(child))))
    }

    /// Attach to the segment created by the master process. This is the
    /// slave half of the handshake; every header is validated before use.
    pub fn slave(
        parent_pid: u32,
        segment_handle: u32,
        segment_size: u32,
    ) -> Result<Arc<IpcClient>, IpcError> {
        tracing::debug!(parent_pid, segment_handle, segment_size, "open shared memory");
        let remote = ProcessWatch::open(parent_pid)?;
        let mapping = Mapping::open(segment_handle, segment_size)?;
        Self::attach(mapping, segment_size, remote)
    }

    /// Create a connected master/slave pair inside the current process, for
    /// tests. Both ends watch the current process, so neither ever observes
    /// a remote exit.
    pub fn pair(segment_size: u32) -> Result<(Arc<IpcClient>, Arc<IpcClient>), IpcError> {
        let parts = create_master_parts(segment_size)?;

        let slave_mapping = Mapping::open(parts.mapping.raw_handle(), segment_size)?;
        let slave = Self::attach(slave_mapping, segment_size, ProcessWatch::current()?)?;

        let master = Arc::new(Self::from_master_parts(parts, ProcessWatch::current()?, None));
        Ok((master, slave))
    }

    fn attach(
        mapping: Mapping,
        segment_size: u32,
        remote: ProcessWatch,
    ) -> Result<Arc<IpcClient>, IpcError> {
        let view = unsafe { layout::attach_segment(mapping.base(), segment_size)? };
        let master_queue = unsafe { Queue::from_raw(view.master_queue) };
        let slave_queue = unsafe { Queue::from_raw(view.slave_queue) };
        let heap = unsafe { Heap::from_raw(view.heap) };

        let master_event = Signal::from_raw(master_queue.event_handle())?;
        let master_mutex = ShMutex::from_raw(master_queue.mutex_handle())?;
        let slave_event = Signal::from_raw(slave_queue.event_handle())?;
        let slave_mutex = ShMutex::from_raw(slave_queue.mutex_handle())?;
        let heap_mutex = ShMutex::from_raw(heap.mutex_handle())?;

        Ok(Arc::new(Self {
            mapping,
            master: false,
            master_queue,
            master_event,
            master_mutex,
            slave_queue,
            slave_event,
            slave_mutex,
            heap,
            heap_mutex,
            remote,
            child: Mutex::new(None),
            state: Mutex::new(ClientState {
                callbacks: HashMap::new(),
                default_cb: None,
            }),
            transaction_id: AtomicU32::new(0),
            kill_flag: AtomicBool::new(false),
            recv_thread: Mutex::new(None),
            recv_thread_id: Mutex::new(None),
            recv_error: Mutex::new(None),
        }))
    }

    fn send_queue(&self) -> &Queue {
        if self.master { &self.master_queue } else { &self.slave_queue }
    }

    fn send_event(&self) -> &Signal {
        if self.master { &self.master_event } else { &self.slave_event }
    }

    fn send_mutex(&self) -> &ShMutex {
        if self.master { &self.master_mutex } else { &self.slave_mutex }
    }

    fn recv_queue(&self) -> &Queue {
        if self.master { &self.slave_queue } else { &self.master_queue }
    }

    fn recv_event(&self) -> &Signal {
        if self.master { &self.slave_event } else { &self.master_event }
    }

    fn recv_mutex(&self) -> &ShMutex {
        if self.master { &self.slave_mutex } else { &self.master_mutex }
    }

    /// Whether the peer process has terminated.
    pub fn remote_exited(&self) -> bool {
        self.remote.has_exited().unwrap_or(true)
    }

    /// Begin receiving commands. `default_cb` handles every command that no
    /// pending entry claims, and is invoked once with `None` when the
    /// receive loop ends.
    ///
    /// # Panics
    ///
    /// The client can only be started once.
    pub fn start<F>(self: &Arc<Self>, default_cb: F) -> Result<(), IpcError>
    where
        F: Fn(Option<Command>) + Send + Sync + 'static,
    {
        let mut thread_slot = self.recv_thread.lock().unwrap();
        assert!(thread_slot.is_none(), "IPC client already started");
        assert!(!self.kill_flag.load(Ordering::SeqCst));

        if self.remote.has_exited()? {
            return Err(IpcError::RemoteExit);
        }

        self.state.lock().unwrap().default_cb = Some(Arc::new(default_cb));

        tracing::debug!("start IPC receiver thread");
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("avswire-recv".into())
            .spawn(move || this.recv_thread_func())
            .map_err(IpcError::Os)?;
        *self.recv_thread_id.lock().unwrap() = Some(handle.thread().id());
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Stop receiving commands and fail all pending callbacks. Idempotent.
    /// If the receive thread previously died on an error, that error is
    /// rethrown here.
    pub fn stop(&self) -> Result<(), IpcError> {
        // Teardown proceeds even if a panic poisoned the slot.
        let handle = self
            .recv_thread
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        tracing::debug!("stop IPC receiver thread");
        self.kill_flag.store(true, Ordering::SeqCst);
        self.recv_event().set()?;

        handle
            .join()
            .map_err(|_| IpcError::Ipc("IPC receiver thread panicked".into()))?;

        {
            let mut state = self.state.lock().unwrap();
            state.callbacks.clear();
            state.default_cb = None;
        }

        if let Some(err) = self.recv_error.lock().unwrap().take() {
            tracing::debug!("rethrow error from receiver thread");
            return Err(err);
        }
        Ok(())
    }

    fn next_transaction_id(&self) -> u32 {
        loop {
            let id = self.transaction_id.fetch_add(1, Ordering::Relaxed);
            if id != INVALID_TRANSACTION {
                return id;
            }
        }
    }

    fn recv_thread_func(self: Arc<Self>) {
        if let Err(err) = self.recv_loop() {
            tracing::debug!(%err, "exit receiver thread after error");
            *self.recv_error.lock().unwrap() = Some(err);
        }

        // Fail every pending callback exactly once, then tell the default
        // callback the stream is over.
        let (callbacks, default_cb) = {
            let mut state = self.state.lock().unwrap();
            let callbacks: Vec<Callback> = state.callbacks.drain().map(|(_, cb)| cb).collect();
            (callbacks, state.default_cb.clone())
        };
        for callback in callbacks {
            callback(None);
        }
        if let Some(default_cb) = default_cb {
            default_cb(None);
        }

        self.kill_flag.store(true, Ordering::SeqCst);
    }

    fn recv_loop(&self) -> Result<(), IpcError> {
        let mut buf = Vec::new();

        loop {
            if self.kill_flag.load(Ordering::SeqCst) {
                tracing::debug!("exit receiver thread after kill flag");
                return Ok(());
            }

            match sys::wait_signal_or_exit(self.recv_event(), &self.remote)? {
                Wake::Signal => {}
                Wake::RemoteExit => return Err(IpcError::RemoteExit),
            }

            {
                let _guard = self.recv_mutex().lock(&self.remote)?;
                self.recv_queue().read_all(&mut buf);
            }

            let mut pos = 0;
            while pos < buf.len() {
                let envelope = Envelope::peek(&buf[pos..])?;
                let frame = &buf[pos..pos + envelope.size as usize];
                pos += envelope.size as usize;

                let Some(command) = Command::deserialize(frame)? else {
                    tracing::debug!(tag = envelope.type_tag, "skipping unknown command type");
                    continue;
                };
                tracing::trace!(
                    kind = ?command.command_type(),
                    response = command.response_id(),
                    transaction = command.transaction_id(),
                    "received command"
                );
                self.dispatch(command);
            }
        }
    }

    fn dispatch(&self, command: Command) {
        let callback = if command.response_id() != INVALID_TRANSACTION {
            self.state
                .lock()
                .unwrap()
                .callbacks
                .remove(&command.response_id())
        } else {
            None
        };

        if let Some(callback) = callback {
            tracing::trace!(
                transaction = command.response_id(),
                "invoke callback for original transaction"
            );
            callback(Some(command));
            return;
        }

        let default_cb = self.state.lock().unwrap().default_cb.clone();
        if let Some(default_cb) = default_cb {
            default_cb(Some(command));
        }
    }

    /// Send a command; `callback` (if any) receives the reply on the
    /// receive thread. After a successful enqueue the command's heap
    /// payload belongs to the peer; on failure it is released here.
    pub fn send_async(&self, mut command: Command, callback: Option<Callback>) -> Result<(), IpcError> {
        let mut callback = callback;
        let mut transaction_id = INVALID_TRANSACTION;
        if callback.is_some() {
            transaction_id = self.next_transaction_id();
            command.set_transaction_id(transaction_id);
        }

        {
            let mut state = self.state.lock().unwrap();

            if let Some(err) = self.recv_error.lock().unwrap().take() {
                drop(state);
                command.deallocate_heap_resources(self);
                return Err(err);
            }
            if self.kill_flag.load(Ordering::SeqCst) {
                drop(state);
                command.deallocate_heap_resources(self);
                if let Some(callback) = callback {
                    callback(None);
                }
                return Ok(());
            }

            if let Some(callback) = callback.take() {
                state.callbacks.insert(transaction_id, callback);
            }
        }

        let mut data = Vec::with_capacity(command.serialized_size());
        command.serialize(&mut data);

        tracing::trace!(kind = ?command.command_type(), transaction_id, "async send command");
        let committed = (|| -> Result<(), IpcError> {
            let _guard = self.send_mutex().lock(&self.remote)?;
            self.send_queue().write(&data)
        })();

        match committed {
            Ok(()) => {
                command.relinquish_heap_resources();
                self.send_event().set()?;
                Ok(())
            }
            Err(err) => {
                if transaction_id != INVALID_TRANSACTION {
                    self.state.lock().unwrap().callbacks.remove(&transaction_id);
                }
                command.deallocate_heap_resources(self);
                Err(err)
            }
        }
    }

    /// Send a command and wait for its reply.
    ///
    /// # Panics
    ///
    /// Must not be called from the receive thread: the caller would be
    /// waiting on a reply only that same thread can deliver.
    pub fn send_sync(&self, command: Command) -> Result<Command, IpcError> {
        {
            let recv_id = self.recv_thread_id.lock().unwrap();
            assert!(
                recv_id.is_some(),
                "send_sync before the client was started"
            );
            assert_ne!(
                *recv_id,
                Some(thread::current().id()),
                "send_sync may not be called from the receive thread"
            );
        }
        tracing::trace!(kind = ?command.command_type(), "sync send command");

        type ReplySlot = (Mutex<Option<Option<Command>>>, Condvar);
        let slot: Arc<ReplySlot> = Arc::new((Mutex::new(None), Condvar::new()));
        let slot_cb = Arc::clone(&slot);

        self.send_async(
            command,
            Some(Box::new(move |reply| {
                let (lock, cond) = &*slot_cb;
                *lock.lock().unwrap() = Some(reply);
                cond.notify_all();
            })),
        )?;

        let (lock, cond) = &*slot;
        let mut reply = lock.lock().unwrap();
        while reply.is_none() {
            reply = cond.wait(reply).unwrap();
        }

        match reply.take().unwrap() {
            Some(reply) => Ok(reply),
            None if self.remote_exited() => Err(IpcError::RemoteExit),
            None => Err(IpcError::Ipc("no response received for command".into())),
        }
    }

    /// Check that `reply` is of the `expected` kind. An `ERR` reply becomes
    /// [`IpcError::CommandFailed`]; any other mismatch releases the reply's
    /// heap payload and reports a protocol error.
    pub fn check_reply(&self, reply: Command, expected: CommandType) -> Result<Command, IpcError> {
        match reply.command_type() {
            actual if actual == expected => Ok(reply),
            CommandType::Err => Err(IpcError::CommandFailed),
            actual => {
                let mut reply = reply;
                reply.deallocate_heap_resources(self);
                Err(IpcError::Protocol { expected, actual })
            }
        }
    }

    /// Acknowledge the transaction `response_id`; no-op for the sentinel.
    pub fn send_ack(&self, response_id: u32) -> Result<(), IpcError> {
        if response_id == INVALID_TRANSACTION {
            return Ok(());
        }
        self.send_async(Command::reply_to(response_id, CommandBody::Ack), None)
    }

    /// Fail the transaction `response_id`; no-op for the sentinel.
    pub fn send_err(&self, response_id: u32) -> Result<(), IpcError> {
        if response_id == INVALID_TRANSACTION {
            return Ok(());
        }
        self.send_async(Command::reply_to(response_id, CommandBody::Err), None)
    }

    /// Reserve `size` bytes in the shared heap; returns the arena-relative
    /// offset of the payload.
    pub fn allocate(&self, size: u32) -> Result<u32, IpcError> {
        if size > i32::MAX as u32 {
            return Err(IpcError::Ipc("cannot allocate more than 2 GB".into()));
        }

        let _guard = self.heap_mutex.lock(&self.remote)?;
        self.heap.alloc(size).inspect_err(|err| {
            tracing::debug!(size, %err, "heap allocation failed");
        })
    }

    /// Release the heap block at `offset`; no-op for the null sentinel.
    pub fn deallocate(&self, offset: u32) -> Result<(), IpcError> {
        if offset == NULL_OFFSET {
            return Ok(());
        }
        let _guard = self.heap_mutex.lock(&self.remote)?;
        self.heap.free(offset)
    }

    /// Bytes currently allocated in the shared heap, node headers included.
    pub fn heap_usage(&self) -> u32 {
        self.heap.usage()
    }

    /// Size of the shared heap arena.
    pub fn heap_capacity(&self) -> u32 {
        self.heap.capacity()
    }

    fn check_heap_range(&self, offset: u32, len: usize) -> Result<(), IpcError> {
        if offset as u64 + len as u64 > self.heap.capacity() as u64 {
            return Err(IpcError::OutOfBounds);
        }
        Ok(())
    }

    /// Copy `data` into the heap block at `offset`. The caller must own the
    /// block.
    pub fn copy_to_heap(&self, offset: u32, data: &[u8]) -> Result<(), IpcError> {
        self.check_heap_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.heap.arena().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy `len` bytes out of the heap block at `offset`.
    pub fn copy_from_heap(&self, offset: u32, len: usize) -> Result<Vec<u8>, IpcError> {
        self.check_heap_range(offset, len)?;
        let mut data = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.heap.arena().add(offset as usize),
                data.as_mut_ptr(),
                len,
            );
        }
        Ok(data)
    }

    /// Serialize `s` into a fresh heap block and return its offset. The
    /// caller owns the block, typically handing it to a command.
    pub fn allocate_str(&self, s: &str) -> Result<u32, IpcError> {
        let mut data = vec![0u8; video::str_serialized_len(s)];
        video::put_str(&mut data, s);
        let offset = self.allocate(data.len() as u32)?;
        self.copy_to_heap(offset, &data)?;
        Ok(offset)
    }

    /// Read the string serialized at `offset` and release the block, even
    /// if the contents are corrupt.
    pub fn take_str(&self, offset: u32) -> Result<String, IpcError> {
        let result = self.read_heap_str(offset);
        self.deallocate(offset)?;
        result
    }

    fn read_heap_str(&self, offset: u32) -> Result<String, IpcError> {
        let header = self.copy_from_heap(offset, 4)?;
        let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
        if len > MAX_STRING_LEN {
            return Err(IpcError::BadFrame("string length out of bounds"));
        }
        let data = self.copy_from_heap(offset, 4 + len + 1)?;
        Ok(video::get_str(&data)?.0)
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(%err, "error stopping IPC client");
        }

        if let Some(mut child) = self.child.get_mut().unwrap().take() {
            tracing::debug!("terminate slave process");
            if child.try_wait().ok().flatten().is_none() {
                thread::sleep(Duration::from_millis(100));
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{FrameRequest, Value};
    use std::sync::mpsc;

    const TEST_SEGMENT: u32 = 1 << 20;

    /// Start `slave` with a responder that acknowledges every transacted
    /// command and surfaces eval scripts as int replies.
    fn start_echo_slave(slave: &Arc<IpcClient>) {
        let client = Arc::clone(slave);
        slave
            .start(move |command| {
                let Some(command) = command else { return };
                let transaction_id = command.transaction_id();
                match command.into_body() {
                    CommandBody::EvalScript(offset) => {
                        let script = client.take_str(offset).expect("script read failed");
                        let reply = Command::reply_to(
                            transaction_id,
                            CommandBody::SetScriptVar {
                                name: String::new(),
                                value: Value::Int(script.len() as i64),
                            },
                        );
                        client.send_async(reply, None).unwrap();
                    }
                    _ => {
                        let _ = client.send_ack(transaction_id);
                    }
                }
            })
            .unwrap();
    }

    #[test]
    fn send_sync_round_trips_an_ack() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();
        start_echo_slave(&slave);
        master.start(|_| {}).unwrap();

        let reply = master
            .send_sync(Command::new(CommandBody::LoadAvisynth(String::new())))
            .unwrap();
        let reply = master.check_reply(reply, CommandType::Ack).unwrap();
        assert_eq!(reply.command_type(), CommandType::Ack);

        master.stop().unwrap();
        slave.stop().unwrap();
        assert_eq!(master.heap_usage(), 0);
    }

    #[test]
    fn fire_and_forget_reaches_default_callback() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();

        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        slave
            .start(move |command| {
                if let Some(command) = command {
                    sender
                        .lock()
                        .unwrap()
                        .send((command.command_type(), command.transaction_id()))
                        .unwrap();
                }
            })
            .unwrap();
        master.start(|_| {}).unwrap();

        master
            .send_async(Command::new(CommandBody::NewScriptEnv), None)
            .unwrap();
        let (kind, transaction_id) = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("command never arrived");
        assert_eq!(kind, CommandType::NewScriptEnv);
        assert_eq!(transaction_id, INVALID_TRANSACTION);

        master.stop().unwrap();
        slave.stop().unwrap();
    }

    #[test]
    fn heap_payload_ownership_transfers_to_the_peer() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();
        start_echo_slave(&slave);
        master.start(|_| {}).unwrap();

        let script = "BlankClip()\r\n";
        let offset = master.allocate_str(script).unwrap();
        assert!(master.heap_usage() > 0);

        let reply = master
            .send_sync(Command::new(CommandBody::EvalScript(offset)))
            .unwrap();
        let reply = master.check_reply(reply, CommandType::SetScriptVar).unwrap();
        match reply.body() {
            CommandBody::SetScriptVar { value, .. } => {
                assert_eq!(*value, Value::Int(script.len() as i64));
            }
            other => panic!("unexpected reply body: {other:?}"),
        }

        // The slave consumed and released the script block.
        assert_eq!(master.heap_usage(), 0);

        master.stop().unwrap();
        slave.stop().unwrap();
    }

    #[test]
    fn stop_fails_pending_callbacks_exactly_once() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();
        // The slave swallows everything without replying.
        slave.start(|_| {}).unwrap();
        master.start(|_| {}).unwrap();

        let (sender, receiver) = mpsc::channel();
        master
            .send_async(
                Command::new(CommandBody::GetFrame(FrameRequest {
                    clip_id: 0,
                    frame_number: 0,
                })),
                Some(Box::new(move |reply| {
                    sender.send(reply.is_none()).unwrap();
                })),
            )
            .unwrap();

        master.stop().unwrap();
        assert!(receiver.recv_timeout(Duration::from_secs(5)).unwrap());
        // Exactly once: the channel holds nothing further.
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());

        // A second stop is a no-op.
        master.stop().unwrap();
        slave.stop().unwrap();
    }

    #[test]
    fn send_after_stop_fails_the_callback_synchronously() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();
        slave.start(|_| {}).unwrap();
        master.start(|_| {}).unwrap();
        master.stop().unwrap();

        let (sender, receiver) = mpsc::channel();
        master
            .send_async(
                Command::new(CommandBody::NewScriptEnv),
                Some(Box::new(move |reply| {
                    sender.send(reply.is_none()).unwrap();
                })),
            )
            .unwrap();
        assert!(receiver.try_recv().unwrap());

        slave.stop().unwrap();
    }

    #[test]
    fn queue_overflow_releases_heap_and_pending_entry() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();
        // Nobody drains the master queue: the slave is never started.
        master.start(|_| {}).unwrap();

        // Fill the ring with fire-and-forget commands.
        loop {
            match master.send_async(Command::new(CommandBody::NewScriptEnv), None) {
                Ok(()) => {}
                Err(IpcError::QueueOverflow { .. }) => break,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        let offset = master.allocate_str("script").unwrap();
        assert!(master.heap_usage() > 0);
        let result = master.send_async(
            Command::new(CommandBody::EvalScript(offset)),
            Some(Box::new(|_| panic!("callback must not run"))),
        );
        assert!(matches!(result, Err(IpcError::QueueOverflow { .. })));
        assert_eq!(master.heap_usage(), 0);

        master.stop().unwrap();
        drop(slave);
    }

    #[test]
    fn transaction_ids_skip_the_sentinel() {
        let (master, _slave) = IpcClient::pair(TEST_SEGMENT).unwrap();
        master
            .transaction_id
            .store(INVALID_TRANSACTION, Ordering::Relaxed);
        assert_eq!(master.next_transaction_id(), 0);
        assert_ne!(master.next_transaction_id(), INVALID_TRANSACTION);
    }

    #[test]
    #[should_panic(expected = "already started")]
    fn starting_twice_panics() {
        let (master, _slave) = IpcClient::pair(TEST_SEGMENT).unwrap();
        master.start(|_| {}).unwrap();
        let result = master.start(|_| {});
        drop(result);
    }

    #[test]
    fn strings_round_trip_through_the_heap() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();
        let offset = master.allocate_str("shared text").unwrap();
        // Either side can read a block it was handed.
        assert_eq!(slave.take_str(offset).unwrap(), "shared text");
        assert_eq!(master.heap_usage(), 0);
    }
}
