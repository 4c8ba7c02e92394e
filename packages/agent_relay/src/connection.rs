//! Client-side relay handle.
//!
//! A [`Connection`] owns a producer/consumer socket pair onto the
//! broker, a background relay task that demultiplexes the flat frame
//! stream, and the per-thread subscriber registry used for fan-out.
//!
//! The relay task is the only reader of the egress socket. For every
//! open tag it assembles a fresh [`Envelope`] and enqueues a clone to
//! each subscriber of that thread; content fragments append to the
//! envelope's shared content buffer, so every subscriber observes them
//! in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agent_wire::{ContentKind, Envelope, Frame, MAX_FRAME_SIZE, Role, StartTag, WireError, framing};

use crate::config::RelayConfig;
use crate::error::RelayError;

/// thread_id -> subscriber_id -> queue.
type Registry = HashMap<String, HashMap<String, SubscriberSlot>>;

struct SubscriberSlot {
    tx: mpsc::UnboundedSender<Envelope>,
    handle: Subscription,
}

/// Consumer handle for one (thread_id, subscriber_id) pair.
///
/// Clones share the same underlying queue; `subscribe` hands back a
/// clone of the existing handle when the pair is already registered.
#[derive(Clone, Debug)]
pub struct Subscription {
    thread_id: String,
    subscriber_id: String,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

impl Subscription {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Pull the next envelope with a bounded wait.
    ///
    /// `Ok(None)` is the connection-closed sentinel: the queue was torn
    /// down by `unsubscribe` or `stop` and has been drained. A miss
    /// within `timeout` is [`RelayError::Timeout`]; the end of a turn
    /// is signaled by an envelope with `is_done`, never by an error.
    pub async fn wait_for_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<Envelope>, RelayError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(message) => Ok(message),
            Err(_) => Err(RelayError::Timeout),
        }
    }
}

/// Client handle onto the broker's broadcast domain.
///
/// `start` connects both sockets and spawns the writer and relay
/// tasks; `stop` is idempotent, joins both tasks, releases the sockets
/// and clears the registry. A stopped connection cannot be restarted.
pub struct Connection {
    config: RelayConfig,
    registry: Arc<Mutex<Registry>>,
    publish_tx: Mutex<Option<mpsc::Sender<String>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
            publish_tx: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connect to the broker and spawn the background tasks.
    pub async fn start(&self) -> Result<(), RelayError> {
        let mut publish_guard = self.publish_tx.lock().await;
        if publish_guard.is_some() {
            return Err(RelayError::AlreadyRunning);
        }
        if self.cancel.is_cancelled() {
            return Err(RelayError::NotRunning);
        }

        let producer = TcpStream::connect(&self.config.ingress_addr).await?;
        let consumer = TcpStream::connect(&self.config.egress_addr).await?;
        debug!(
            ingress = %self.config.ingress_addr,
            egress = %self.config.egress_addr,
            "connection attached to broker"
        );

        let (tx, rx) = mpsc::channel::<String>(256);
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(run_writer(producer, rx, self.cancel.clone())));
        tasks.push(tokio::spawn(run_relay(
            consumer,
            self.registry.clone(),
            self.cancel.clone(),
        )));
        *publish_guard = Some(tx);
        Ok(())
    }

    /// Stop the relay, joining the background tasks.
    ///
    /// Idempotent and safe to call before `start` or repeatedly. The
    /// registry is cleared so blocked consumers observe the closed
    /// sentinel rather than waiting forever.
    pub async fn stop(&self) {
        self.cancel.cancel();
        *self.publish_tx.lock().await = None;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("relay task failed during shutdown: {}", e);
            }
        }
        self.registry.lock().await.clear();
    }

    /// Send one raw frame toward the broker.
    ///
    /// Fire-and-forget, at-most-once: the frame is handed to the writer
    /// task and no acknowledgement is awaited.
    pub async fn publish(&self, frame: impl Into<String>) -> Result<(), RelayError> {
        let frame = frame.into();
        if frame.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                len: frame.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }
        let guard = self.publish_tx.lock().await;
        let tx = guard.as_ref().ok_or(RelayError::NotRunning)?;
        tx.send(frame).await.map_err(|_| RelayError::NotRunning)
    }

    /// Emit the open tag for a new logical message.
    pub async fn publish_start(&self, tag: &StartTag) -> Result<(), RelayError> {
        self.publish(tag.encode()).await
    }

    /// Emit one content fragment for the currently open message.
    pub async fn publish_content(&self, chunk: &str) -> Result<(), RelayError> {
        self.publish(chunk).await
    }

    /// Emit the close tag for the currently open message.
    pub async fn publish_end(&self) -> Result<(), RelayError> {
        self.publish(agent_wire::END_TAG).await
    }

    /// Emit the end-of-turn marker: an empty envelope with `is_done`.
    pub async fn publish_turn_done(
        &self,
        thread_id: &str,
        agent_id: Option<&str>,
    ) -> Result<(), RelayError> {
        let mut tag = StartTag::new(thread_id);
        tag.agent_id = agent_id.map(str::to_string);
        tag.is_done = true;
        self.publish_start(&tag).await?;
        self.publish_end().await
    }

    /// Report a producer-side failure as an ordinary envelope so the
    /// consumer's rendering path handles it like any other message.
    pub async fn publish_error(&self, thread_id: &str, text: &str) -> Result<(), RelayError> {
        let mut tag = StartTag::new(thread_id);
        tag.role = Role::System;
        tag.kind = ContentKind::Error;
        tag.is_error = true;
        tag.is_done = true;
        self.publish_start(&tag).await?;
        self.publish_content(text).await?;
        self.publish_end().await
    }

    /// Register a subscriber queue for a conversation.
    ///
    /// Idempotent: a repeated (thread_id, subscriber_id) pair returns a
    /// handle onto the existing queue, contents intact.
    pub async fn subscribe(&self, thread_id: &str, subscriber_id: &str) -> Subscription {
        let mut registry = self.registry.lock().await;
        let bucket = registry.entry(thread_id.to_string()).or_default();
        if let Some(slot) = bucket.get(subscriber_id) {
            return slot.handle.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Subscription {
            thread_id: thread_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
            rx: Arc::new(Mutex::new(rx)),
        };
        bucket.insert(
            subscriber_id.to_string(),
            SubscriberSlot {
                tx,
                handle: handle.clone(),
            },
        );
        debug!(thread = %thread_id, subscriber = %subscriber_id, "subscribed");
        handle
    }

    /// Drop a subscriber queue. Returns whether it existed; the thread
    /// bucket is pruned once its last subscriber is gone.
    pub async fn unsubscribe(&self, thread_id: &str, subscriber_id: &str) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(bucket) = registry.get_mut(thread_id) else {
            return false;
        };
        let removed = bucket.remove(subscriber_id).is_some();
        if bucket.is_empty() {
            registry.remove(thread_id);
        }
        if removed {
            debug!(thread = %thread_id, subscriber = %subscriber_id, "unsubscribed");
        }
        removed
    }
}

/// Drain the publish queue onto the producer socket.
async fn run_writer(
    mut stream: TcpStream,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = framing::write_frame(&mut stream, &frame).await {
                    warn!("failed to write frame to broker: {}", e);
                    break;
                }
            }
        }
    }
    debug!("publish writer stopped");
}

/// Currently open messages on this connection, innermost last.
///
/// Nested opens are legal on the wire but no known producer emits
/// them; observed depth beyond one is logged as suspect.
#[derive(Default)]
struct OpenContext {
    stack: Vec<Envelope>,
}

impl OpenContext {
    fn push(&mut self, envelope: Envelope) {
        self.stack.push(envelope);
        if self.stack.len() > 1 {
            warn!(
                depth = self.stack.len(),
                "nested open messages on one connection"
            );
        }
    }

    fn top(&self) -> Option<&Envelope> {
        self.stack.last()
    }

    fn pop(&mut self) -> Option<Envelope> {
        self.stack.pop()
    }
}

/// Drain the egress socket, demultiplexing frames to subscriber queues.
async fn run_relay(mut stream: TcpStream, registry: Arc<Mutex<Registry>>, cancel: CancellationToken) {
    let mut open = OpenContext::default();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framing::read_frame(&mut stream) => match frame {
                Ok(Some(text)) => handle_frame(&text, &mut open, &registry).await,
                Ok(None) => {
                    debug!("broker closed the egress stream");
                    break;
                }
                Err(e) => {
                    warn!("egress transport failed: {}", e);
                    break;
                }
            }
        }
    }

    // Close out anything still open so readers do not block forever,
    // then drop the queues so consumers observe the closed sentinel.
    while let Some(envelope) = open.pop() {
        envelope.content.close().await;
    }
    registry.lock().await.clear();
    debug!("relay stopped");
}

/// Classify one frame and route it. Protocol violations are logged and
/// dropped here; nothing a producer sends can end the relay loop.
async fn handle_frame(text: &str, open: &mut OpenContext, registry: &Arc<Mutex<Registry>>) {
    match Frame::classify(text) {
        Ok(Frame::Start(tag)) => {
            let envelope = Envelope::from_tag(tag);
            // Push before computing the fan-out target: subscribers of
            // the just-opened thread receive the new envelope.
            open.push(envelope.clone());
            deliver(registry, &envelope).await;
        }
        Ok(Frame::Content(chunk)) => match open.top() {
            Some(envelope) => {
                if let Err(e) = envelope.content.append(chunk).await {
                    warn!(message = %envelope.message_id, "dropping fragment: {}", e);
                }
            }
            None => {
                warn!(frame = %preview(text), "content frame with no open message, dropping");
            }
        },
        Ok(Frame::End) => match open.pop() {
            Some(envelope) => envelope.content.close().await,
            None => warn!("close tag with no open message, dropping"),
        },
        Err(e) => warn!(frame = %preview(text), "malformed frame, dropping: {}", e),
    }
}

/// Enqueue an envelope to every subscriber of its thread, pruning
/// queues whose consumers are gone.
async fn deliver(registry: &Arc<Mutex<Registry>>, envelope: &Envelope) {
    let mut registry = registry.lock().await;
    let Some(bucket) = registry.get_mut(&envelope.thread_id) else {
        return;
    };
    bucket.retain(|subscriber_id, slot| {
        if slot.tx.send(envelope.clone()).is_err() {
            debug!(subscriber = %subscriber_id, "dropping dead subscriber queue");
            false
        } else {
            true
        }
    });
    if bucket.is_empty() {
        registry.remove(&envelope.thread_id);
    }
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}
