//! Reentrant send/wait helper.
//!
//! A frame request sent to the peer can trigger frame requests back in the
//! opposite direction before the reply arrives: the peer's script may
//! reference clips that live on this side. A plain [`IpcClient::send_sync`]
//! would deadlock - the calling thread is the only one that can serve those
//! inbound requests. The runloop models the wait as message passing
//! instead: the client's default callback feeds an internal work deque, and
//! [`Runloop::run`] services that deque while parked on the reply
//! condition.
//!
//! Every call is tagged with a monotone request counter. A reply whose
//! captured counter no longer matches the active call is a leftover from a
//! cancelled earlier call: its heap payload is released and the originator
//! gets an `ERR`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::client::{Callback, IpcClient};
use crate::command::{Command, CommandBody, CommandType};
use crate::error::IpcError;
use crate::video::{FrameRequest, VideoFrame};

struct RunState {
    work: VecDeque<Command>,
    /// `Some` once the reply callback fired; the inner `None` means the
    /// transport died before a reply arrived.
    response: Option<Option<Command>>,
}

struct Shared {
    state: Mutex<RunState>,
    cond: Condvar,
    active_request: AtomicU32,
    remote_exit: AtomicBool,
}

/// The reentrant run-loop of one participant.
pub struct Runloop {
    shared: Arc<Shared>,
}

impl Default for Runloop {
    fn default() -> Self {
        Self::new()
    }
}

impl Runloop {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RunState {
                    work: VecDeque::new(),
                    response: None,
                }),
                cond: Condvar::new(),
                active_request: AtomicU32::new(0),
                remote_exit: AtomicBool::new(false),
            }),
        }
    }

    /// The default callback to pass to [`IpcClient::start`]: enqueues
    /// inbound commands for [`Runloop::run`] instead of executing anything
    /// inline.
    pub fn handler(&self) -> impl Fn(Option<Command>) + Send + Sync + 'static {
        let shared = Arc::clone(&self.shared);
        move |command| {
            match command {
                Some(command) => {
                    shared.state.lock().unwrap().work.push_back(command);
                }
                None => {
                    // Store under the state lock so a concurrent wait
                    // cannot miss the flag between its check and its park.
                    let _state = shared.state.lock().unwrap();
                    shared.remote_exit.store(true, Ordering::SeqCst);
                }
            }
            shared.cond.notify_all();
        }
    }

    /// Send `command` and wait for its reply, servicing inbound frame
    /// requests through `servicer` in the meantime. Any other inbound
    /// command is answered with `ERR`, as is everything still queued from a
    /// previous call.
    ///
    /// On success the reply has been acknowledged (if it asked to be) and
    /// is returned unexamined; callers check its kind.
    pub fn run<F>(
        &self,
        client: &Arc<IpcClient>,
        mut command: Command,
        mut servicer: F,
    ) -> Result<Command, IpcError>
    where
        F: FnMut(&IpcClient, FrameRequest) -> Result<VideoFrame, IpcError>,
    {
        if self.shared.remote_exit.load(Ordering::SeqCst) {
            command.deallocate_heap_resources(client);
            return Err(IpcError::RemoteExit);
        }

        // Discard slave activity left over from a previous call.
        self.reject_pending_work(client)?;

        let request = self.shared.active_request.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.state.lock().unwrap().response = None;

        client.send_async(command, Some(self.reply_callback(client, request)))?;

        let mut state = self.shared.state.lock().unwrap();
        let response = loop {
            if self.shared.remote_exit.load(Ordering::SeqCst) {
                return Err(IpcError::RemoteExit);
            }
            if let Some(response) = state.response.take() {
                break response;
            }

            if !state.work.is_empty() {
                let batch: Vec<Command> = state.work.drain(..).collect();
                drop(state);
                for inbound in batch {
                    self.service(client, inbound, &mut servicer)?;
                }
                state = self.shared.state.lock().unwrap();
                continue;
            }

            state = self.shared.cond.wait(state).unwrap();
        };
        drop(state);

        // Anything that arrived between the reply and here is stale too.
        self.reject_pending_work(client)?;

        match response {
            Some(response) => {
                client.send_ack(response.transaction_id())?;
                Ok(response)
            }
            None if client.remote_exited() => Err(IpcError::RemoteExit),
            None => Err(IpcError::Ipc("no response received for command".into())),
        }
    }

    /// Reply callback for request number `request`. Responses to cancelled
    /// earlier requests release their heap payload and fail the peer's
    /// transaction.
    fn reply_callback(&self, client: &Arc<IpcClient>, request: u32) -> Callback {
        let shared = Arc::clone(&self.shared);
        let client = Arc::clone(client);
        Box::new(move |reply| {
            if shared.active_request.load(Ordering::SeqCst) == request {
                shared.state.lock().unwrap().response = Some(reply);
                shared.cond.notify_all();
            } else if let Some(mut reply) = reply {
                tracing::debug!(
                    kind = ?reply.command_type(),
                    "discarding response to cancelled request"
                );
                reply.deallocate_heap_resources(&client);
                if let Err(err) = client.send_err(reply.transaction_id()) {
                    tracing::warn!(%err, "failed to reject stale response");
                }
            }
        })
    }

    fn reject_pending_work(&self, client: &Arc<IpcClient>) -> Result<(), IpcError> {
        let batch: Vec<Command> = {
            let mut state = self.shared.state.lock().unwrap();
            state.work.drain(..).collect()
        };
        for mut command in batch {
            tracing::debug!(kind = ?command.command_type(), "rejecting stale inbound command");
            command.deallocate_heap_resources(client);
            client.send_err(command.transaction_id())?;
        }
        Ok(())
    }

    fn service<F>(
        &self,
        client: &Arc<IpcClient>,
        mut inbound: Command,
        servicer: &mut F,
    ) -> Result<(), IpcError>
    where
        F: FnMut(&IpcClient, FrameRequest) -> Result<VideoFrame, IpcError>,
    {
        if inbound.command_type() != CommandType::GetFrame {
            inbound.deallocate_heap_resources(client);
            return client.send_err(inbound.transaction_id());
        }

        let transaction_id = inbound.transaction_id();
        let CommandBody::GetFrame(request) = inbound.into_body() else {
            unreachable!();
        };

        match servicer(client, request) {
            Ok(frame) => {
                client.send_async(Command::reply_to(transaction_id, CommandBody::SetFrame(frame)), None)
            }
            Err(err) => {
                tracing::debug!(
                    clip = request.clip_id,
                    frame = request.frame_number,
                    %err,
                    "inbound frame request failed"
                );
                client.send_err(transaction_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IpcClient;
    use std::sync::mpsc;
    use std::time::Duration;

    const TEST_SEGMENT: u32 = 1 << 20;
    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Allocate a tiny frame on `client` filled with `fill`.
    fn make_frame(client: &IpcClient, request: FrameRequest, fill: u8) -> VideoFrame {
        let data = vec![fill; 256];
        let offset = client.allocate(data.len() as u32).unwrap();
        client.copy_to_heap(offset, &data).unwrap();
        VideoFrame {
            request,
            heap_offset: offset,
            stride: [64, 0, 0, 0],
            height: [4, 0, 0, 0],
        }
    }

    fn frame_servicer(
        serviced: mpsc::Sender<FrameRequest>,
    ) -> impl FnMut(&IpcClient, FrameRequest) -> Result<VideoFrame, IpcError> {
        move |client, request| {
            serviced.send(request).unwrap();
            Ok(make_frame(client, request, request.frame_number as u8))
        }
    }

    /// A slave worker thread that answers frame requests, optionally making
    /// a reentrant request back to the master first.
    fn spawn_slave_worker(
        slave: &Arc<IpcClient>,
        reentrant_clip: Option<u32>,
    ) -> std::thread::JoinHandle<()> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let sender = Mutex::new(sender);
        slave
            .start(move |command| {
                if let Some(command) = command {
                    let _ = sender.lock().unwrap().send(command);
                }
            })
            .unwrap();

        let client = Arc::clone(slave);
        std::thread::spawn(move || {
            while let Ok(command) = receiver.recv() {
                let transaction_id = command.transaction_id();
                let CommandBody::GetFrame(request) = command.into_body() else {
                    continue;
                };

                if let Some(clip_id) = reentrant_clip {
                    // Pull a frame from the master before answering, the
                    // way a script referencing a master-owned clip does.
                    let inner = client
                        .send_sync(Command::new(CommandBody::GetFrame(FrameRequest {
                            clip_id,
                            frame_number: request.frame_number,
                        })))
                        .unwrap();
                    let inner = client.check_reply(inner, CommandType::SetFrame).unwrap();
                    let CommandBody::SetFrame(frame) = inner.into_body() else {
                        unreachable!();
                    };
                    let pixels = client.copy_from_heap(frame.heap_offset, 256).unwrap();
                    assert!(pixels.iter().all(|&b| b == request.frame_number as u8));
                    client.deallocate(frame.heap_offset).unwrap();
                }

                let frame = make_frame(&client, request, 0xCD);
                let reply = Command::reply_to(transaction_id, CommandBody::SetFrame(frame));
                client.send_async(reply, None).unwrap();
            }
        })
    }

    #[test]
    fn run_round_trips_a_frame_request() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();
        let worker = spawn_slave_worker(&slave, None);

        let runloop = Runloop::new();
        master.start(runloop.handler()).unwrap();

        let request = FrameRequest { clip_id: 0, frame_number: 3 };
        let reply = runloop
            .run(&master, Command::new(CommandBody::GetFrame(request)), |_, _| {
                panic!("no reentrant request expected")
            })
            .unwrap();
        let reply = master.check_reply(reply, CommandType::SetFrame).unwrap();

        let CommandBody::SetFrame(frame) = reply.into_body() else {
            unreachable!();
        };
        assert_eq!(frame.request, request);
        master.deallocate(frame.heap_offset).unwrap();
        assert_eq!(master.heap_usage(), 0);

        master.stop().unwrap();
        slave.stop().unwrap();
        drop(worker);
    }

    #[test]
    fn inbound_requests_are_serviced_while_waiting() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();
        let worker = spawn_slave_worker(&slave, Some(7));

        let runloop = Runloop::new();
        master.start(runloop.handler()).unwrap();

        let (serviced_tx, serviced_rx) = mpsc::channel();
        let request = FrameRequest { clip_id: 0, frame_number: 5 };
        let reply = runloop
            .run(
                &master,
                Command::new(CommandBody::GetFrame(request)),
                frame_servicer(serviced_tx),
            )
            .unwrap();
        let reply = master.check_reply(reply, CommandType::SetFrame).unwrap();

        // The slave asked for clip 7 frame 5 mid-call and got it.
        let inner = serviced_rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(inner, FrameRequest { clip_id: 7, frame_number: 5 });

        let CommandBody::SetFrame(frame) = reply.into_body() else {
            unreachable!();
        };
        assert_eq!(frame.request, request);
        master.deallocate(frame.heap_offset).unwrap();
        assert_eq!(master.heap_usage(), 0);

        master.stop().unwrap();
        slave.stop().unwrap();
        drop(worker);
    }

    #[test]
    fn unrelated_inbound_commands_get_err() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();

        // The slave interjects an unrelated transacted command before
        // answering the frame request.
        let (inbox_tx, inbox_rx) = mpsc::channel::<Command>();
        let inbox_tx = Mutex::new(inbox_tx);
        slave
            .start(move |command| {
                if let Some(command) = command {
                    let _ = inbox_tx.lock().unwrap().send(command);
                }
            })
            .unwrap();

        let slave_worker = Arc::clone(&slave);
        let worker = std::thread::spawn(move || {
            let command = inbox_rx.recv().unwrap();
            let transaction_id = command.transaction_id();

            let interjection = slave_worker
                .send_sync(Command::new(CommandBody::NewScriptEnv))
                .unwrap();
            assert_eq!(interjection.command_type(), CommandType::Err);

            let frame = make_frame(&slave_worker, FrameRequest { clip_id: 0, frame_number: 0 }, 1);
            let reply = Command::reply_to(transaction_id, CommandBody::SetFrame(frame));
            slave_worker.send_async(reply, None).unwrap();
        });

        let runloop = Runloop::new();
        master.start(runloop.handler()).unwrap();

        let reply = runloop
            .run(
                &master,
                Command::new(CommandBody::GetFrame(FrameRequest { clip_id: 0, frame_number: 0 })),
                |_, _| panic!("frame servicer must not run"),
            )
            .unwrap();
        let reply = master.check_reply(reply, CommandType::SetFrame).unwrap();

        let CommandBody::SetFrame(frame) = reply.into_body() else {
            unreachable!();
        };
        master.deallocate(frame.heap_offset).unwrap();

        worker.join().unwrap();
        master.stop().unwrap();
        slave.stop().unwrap();
    }

    #[test]
    fn stale_work_is_rejected_by_the_next_call() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();

        let (inbox_tx, inbox_rx) = mpsc::channel::<Command>();
        let inbox_tx = Mutex::new(inbox_tx);
        slave
            .start(move |command| {
                if let Some(command) = command {
                    let _ = inbox_tx.lock().unwrap().send(command);
                }
            })
            .unwrap();

        let (stray_tx, stray_rx) = mpsc::channel::<CommandType>();
        let slave_worker = Arc::clone(&slave);
        let worker = std::thread::spawn(move || {
            // First frame request: answer it, then fire a stray request
            // that lands after the master's call completed.
            let command = inbox_rx.recv().unwrap();
            let frame = make_frame(&slave_worker, FrameRequest { clip_id: 0, frame_number: 0 }, 1);
            let reply = Command::reply_to(command.transaction_id(), CommandBody::SetFrame(frame));
            slave_worker.send_async(reply, None).unwrap();

            slave_worker
                .send_async(
                    Command::new(CommandBody::GetFrame(FrameRequest {
                        clip_id: 9,
                        frame_number: 9,
                    })),
                    Some(Box::new(move |reply| {
                        stray_tx.send(reply.expect("stray reply").command_type()).unwrap();
                    })),
                )
                .unwrap();

            // Second frame request from the next run() call.
            let command = inbox_rx.recv().unwrap();
            let frame = make_frame(&slave_worker, FrameRequest { clip_id: 0, frame_number: 1 }, 2);
            let reply = Command::reply_to(command.transaction_id(), CommandBody::SetFrame(frame));
            slave_worker.send_async(reply, None).unwrap();
        });

        let runloop = Runloop::new();
        master.start(runloop.handler()).unwrap();

        for frame_number in 0..2 {
            let reply = runloop
                .run(
                    &master,
                    Command::new(CommandBody::GetFrame(FrameRequest { clip_id: 0, frame_number })),
                    |_, _| panic!("frame servicer must not run"),
                )
                .unwrap();
            let reply = master.check_reply(reply, CommandType::SetFrame).unwrap();
            let CommandBody::SetFrame(frame) = reply.into_body() else {
                unreachable!();
            };
            master.deallocate(frame.heap_offset).unwrap();
        }

        // The stray request was answered with ERR, not serviced.
        assert_eq!(stray_rx.recv_timeout(TIMEOUT).unwrap(), CommandType::Err);

        worker.join().unwrap();
        master.stop().unwrap();
        slave.stop().unwrap();
        assert_eq!(master.heap_usage(), 0);
    }

    #[test]
    fn stale_responses_release_their_payload_and_fail_the_peer() {
        let (master, slave) = IpcClient::pair(TEST_SEGMENT).unwrap();

        // Slave: answer the frame request with a SET_FRAME that itself
        // expects an acknowledgment.
        let (inbox_tx, inbox_rx) = mpsc::channel::<Command>();
        let inbox_tx = Mutex::new(inbox_tx);
        slave
            .start(move |command| {
                if let Some(command) = command {
                    let _ = inbox_tx.lock().unwrap().send(command);
                }
            })
            .unwrap();

        let (verdict_tx, verdict_rx) = mpsc::channel::<CommandType>();
        let slave_worker = Arc::clone(&slave);
        let worker = std::thread::spawn(move || {
            let command = inbox_rx.recv().unwrap();
            let frame = make_frame(&slave_worker, FrameRequest { clip_id: 0, frame_number: 0 }, 9);
            let reply = Command::reply_to(command.transaction_id(), CommandBody::SetFrame(frame));
            slave_worker
                .send_async(
                    reply,
                    Some(Box::new(move |ack| {
                        verdict_tx.send(ack.expect("no verdict").command_type()).unwrap();
                    })),
                )
                .unwrap();
        });

        let runloop = Runloop::new();
        master.start(runloop.handler()).unwrap();

        // Register a reply callback for a request number that is already
        // cancelled by the time the response arrives.
        let request = runloop.shared.active_request.load(Ordering::SeqCst);
        let callback = runloop.reply_callback(&master, request);
        runloop.shared.active_request.fetch_add(1, Ordering::SeqCst);

        master
            .send_async(
                Command::new(CommandBody::GetFrame(FrameRequest { clip_id: 0, frame_number: 0 })),
                Some(callback),
            )
            .unwrap();

        // The stale SET_FRAME was deallocated on the master side and the
        // slave's transaction failed.
        assert_eq!(verdict_rx.recv_timeout(TIMEOUT).unwrap(), CommandType::Err);
        worker.join().unwrap();
        assert_eq!(master.heap_usage(), 0);

        master.stop().unwrap();
        slave.stop().unwrap();
    }
}
