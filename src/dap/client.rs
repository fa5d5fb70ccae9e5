//! DAP client
//!
//! Owns a TCP connection to a debug adapter and reconciles the response
//! stream with the event stream. Responses are correlated by `request_seq`
//! through two maps: pending slots for synchronous `request` callers and
//! deferred slots for `request_deferred`/`wait_for_response` pairs. Adapters
//! such as debugpy hold the `launch` response back until `configurationDone`,
//! so the deferred path must release the caller while the dispatcher keeps
//! draining the socket.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use super::codec::{encode_frame, FrameDecoder};
use super::error::DapError;
use super::protocol::{DapEvent, DapMessage, DapRequest, DapResponse};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Slot for a response requested via `request_deferred`.
enum DeferredSlot {
    Waiting,
    Ready(DapResponse),
}

/// State shared between the client handle and the receive loop.
struct Shared {
    pending: Mutex<HashMap<u64, tokio::sync::oneshot::Sender<DapResponse>>>,
    deferred: Mutex<HashMap<u64, DeferredSlot>>,
    events: Mutex<VecDeque<DapEvent>>,
    /// Woken on every event arrival, deferred resolution, and on close.
    wakeup: Notify,
    closed: AtomicBool,
}

impl Shared {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders rejects every synchronous caller.
        self.pending.lock().await.clear();
        self.wakeup.notify_waiters();
    }
}

/// Asynchronous DAP client over TCP.
pub struct DapClient {
    writer: Mutex<OwnedWriteHalf>,
    seq: AtomicU64,
    shared: Arc<Shared>,
    receive_task: JoinHandle<()>,
}

impl DapClient {
    /// Connect to an adapter, retrying until `deadline` elapses.
    ///
    /// Adapters often need a moment after spawn before they accept
    /// connections, so refusals inside the window are expected.
    pub async fn connect(host: &str, port: u16, deadline: Duration) -> Result<Self, DapError> {
        let addr = format!("{host}:{port}");
        let give_up = Instant::now() + deadline;
        let stream = loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() + CONNECT_RETRY_DELAY < give_up => {
                    tracing::trace!("connect to {addr} failed ({e}), retrying");
                    sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => return Err(DapError::Io(e)),
            }
        };
        stream.set_nodelay(true).ok();
        tracing::debug!("connected to debug adapter at {addr}");

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let receive_task = tokio::spawn(receive_loop(read_half, shared.clone()));

        Ok(Self {
            writer: Mutex::new(write_half),
            seq: AtomicU64::new(1),
            shared,
            receive_task,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    async fn send(&self, request: &DapRequest) -> Result<(), DapError> {
        if self.is_closed() {
            return Err(DapError::ConnectionClosed);
        }
        let frame = encode_frame(&DapMessage::Request(request.clone()))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        tracing::trace!("DAP -> {} (seq {})", request.command, request.seq);
        Ok(())
    }

    /// Send a request and wait for its response.
    ///
    /// On timeout the pending slot is removed; a response arriving later is
    /// dropped on the floor.
    pub async fn request(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
        wait: Duration,
    ) -> Result<DapResponse, DapError> {
        let seq = self.next_seq();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.shared.pending.lock().await.insert(seq, tx);

        if let Err(e) = self
            .send(&DapRequest {
                seq,
                command: command.to_string(),
                arguments,
            })
            .await
        {
            self.shared.pending.lock().await.remove(&seq);
            return Err(e);
        }

        let response = match timeout(wait, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(DapError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.lock().await.remove(&seq);
                return Err(DapError::Timeout {
                    command: command.to_string(),
                    timeout_ms: wait.as_millis() as u64,
                });
            }
        };
        check_success(command, response)
    }

    /// Send a request whose response will be claimed later via
    /// `wait_for_response`. Returns the sequence number immediately.
    pub async fn request_deferred(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<u64, DapError> {
        let seq = self.next_seq();
        self.shared
            .deferred
            .lock()
            .await
            .insert(seq, DeferredSlot::Waiting);

        if let Err(e) = self
            .send(&DapRequest {
                seq,
                command: command.to_string(),
                arguments,
            })
            .await
        {
            self.shared.deferred.lock().await.remove(&seq);
            return Err(e);
        }
        Ok(seq)
    }

    /// Wait for a deferred response. Unknown seqs are an error; on timeout
    /// the slot is dropped.
    pub async fn wait_for_response(
        &self,
        seq: u64,
        wait: Duration,
    ) -> Result<DapResponse, DapError> {
        let give_up = Instant::now() + wait;
        loop {
            // Register for wakeups before inspecting the slot so a
            // notification landing in between is not lost.
            let notified = self.shared.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut deferred = self.shared.deferred.lock().await;
                match deferred.get(&seq) {
                    None => return Err(DapError::UnknownSeq(seq)),
                    Some(DeferredSlot::Ready(_)) => {
                        let slot = deferred.remove(&seq);
                        let Some(DeferredSlot::Ready(response)) = slot else {
                            unreachable!()
                        };
                        let command = response.command.clone();
                        return check_success(&command, response);
                    }
                    Some(DeferredSlot::Waiting) => {
                        if self.is_closed() {
                            deferred.remove(&seq);
                            return Err(DapError::ConnectionClosed);
                        }
                    }
                }
            }
            let remaining = give_up.saturating_duration_since(Instant::now());
            if remaining.is_zero() || timeout(remaining, notified).await.is_err() {
                self.shared.deferred.lock().await.remove(&seq);
                return Err(DapError::Timeout {
                    command: format!("deferred seq {seq}"),
                    timeout_ms: wait.as_millis() as u64,
                });
            }
        }
    }

    /// Wait for a named event. A matching event already in the queue is
    /// removed and returned immediately; otherwise block until one arrives.
    /// Returns `None` on timeout or when the connection closes; callers
    /// interpret absence, not failure.
    pub async fn wait_for_event(&self, name: &str, wait: Duration) -> Option<DapEvent> {
        let give_up = Instant::now() + wait;
        loop {
            let notified = self.shared.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut events = self.shared.events.lock().await;
                if let Some(pos) = events.iter().position(|e| e.event == name) {
                    return events.remove(pos);
                }
            }
            if self.is_closed() {
                return None;
            }
            let remaining = give_up.saturating_duration_since(Instant::now());
            if remaining.is_zero() || timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Remove and return all queued events with the given name, without
    /// suspending.
    pub async fn drain_events(&self, name: &str) -> Vec<DapEvent> {
        let mut events = self.shared.events.lock().await;
        let mut matched = Vec::new();
        let mut kept = VecDeque::with_capacity(events.len());
        for event in events.drain(..) {
            if event.event == name {
                matched.push(event);
            } else {
                kept.push_back(event);
            }
        }
        *events = kept;
        matched
    }

    /// Send DAP `disconnect` best-effort, then close the connection and
    /// reject all outstanding slots.
    pub async fn disconnect(&self, terminate_debuggee: bool) {
        let args = serde_json::json!({ "terminateDebuggee": terminate_debuggee });
        if let Err(e) = self
            .request("disconnect", Some(args), DISCONNECT_TIMEOUT)
            .await
        {
            tracing::debug!("disconnect request failed: {e}");
        }
        self.shared.close().await;
        self.writer.lock().await.shutdown().await.ok();
        self.receive_task.abort();
    }
}

impl Drop for DapClient {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

/// Map an unsuccessful response to an error carrying the adapter's message.
fn check_success(command: &str, response: DapResponse) -> Result<DapResponse, DapError> {
    if response.success {
        Ok(response)
    } else {
        Err(DapError::RequestFailed {
            command: command.to_string(),
            message: response
                .message
                .unwrap_or_else(|| "no error message".to_string()),
        })
    }
}

/// Socket read loop: decode frames, resolve correlation slots, queue events.
async fn receive_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("adapter closed the connection");
                break;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                loop {
                    match decoder.next_message() {
                        Ok(Some(message)) => dispatch(&shared, message).await,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!("fatal protocol error: {e}");
                            shared.close().await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!("adapter socket read failed: {e}");
                break;
            }
        }
    }
    shared.close().await;
}

async fn dispatch(shared: &Shared, message: DapMessage) {
    match message {
        DapMessage::Response(response) => {
            let seq = response.request_seq;
            if let Some(tx) = shared.pending.lock().await.remove(&seq) {
                tx.send(response).ok();
                return;
            }
            let mut deferred = shared.deferred.lock().await;
            if let Some(slot) = deferred.get_mut(&seq) {
                *slot = DeferredSlot::Ready(response);
                shared.wakeup.notify_waiters();
            } else {
                tracing::warn!("response for unknown request seq {seq}");
            }
        }
        DapMessage::Event(event) => {
            tracing::trace!("DAP event: {}", event.event);
            shared.events.lock().await.push_back(event);
            shared.wakeup.notify_waiters();
        }
        DapMessage::Request(request) => {
            // Reverse requests (runInTerminal and friends) are not served.
            tracing::debug!("ignoring reverse request: {}", request.command);
        }
    }
}
