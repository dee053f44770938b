//! Fragmented MP4 fan-out
//!
//! One producer process feeds any number of subscribers. The producer's
//! stdout is split into boxes, the initialization boxes are kept for late
//! joiners, and every box is queued to every subscriber in parse order.
//!
//! ```text
//!   Stopped ──start()──▶ Starting ──first byte──▶ Running
//!      ▲                    │                        │
//!      └──── stop() / end of stream / read or parse error
//! ```
//!
//! Each subscriber owns a bounded queue. A subscriber whose queue is full
//! or closed is dropped from the set; the others are unaffected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::mp4::{BoxError, BoxParser, MediaBox};
use super::producer::{ProducerCommand, drain_stderr};
use crate::config::MediaConfig;

/// How long an exited producer gets to be reaped before it is killed
const REAP_GRACE: Duration = Duration::from_secs(2);

pub type SubscriberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub subscribers: usize,
    pub init_segment_bytes: usize,
    pub producer_pid: Option<u32>,
    pub producers_spawned: u64,
}

#[derive(Debug)]
pub enum EngineError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
    MissingPipe(&'static str),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Spawn { program, source } => {
                write!(f, "Failed to spawn producer '{}': {}", program, source)
            }
            EngineError::MissingPipe(name) => write!(f, "Producer {} was not captured", name),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Spawn { source, .. } => Some(source),
            EngineError::MissingPipe(_) => None,
        }
    }
}

/// Why a consumption loop returned
#[derive(Debug)]
pub enum StreamEnd {
    Eof,
    ReadError(std::io::Error),
    Malformed(BoxError),
    /// The engine was stopped or restarted while this loop was reading
    Superseded,
}

/// Receiving side of one subscriber
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next payload. `None` once the broadcaster has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Default)]
struct Fanout {
    subscribers: HashMap<SubscriberId, mpsc::Sender<Bytes>>,
    init_segment: Vec<u8>,
    /// Set once a non-initialization box has been seen
    init_sealed: bool,
}

impl Fanout {
    fn reset_init(&mut self) {
        self.init_segment.clear();
        self.init_sealed = false;
    }
}

#[derive(Debug, Clone, Copy)]
struct Lifecycle {
    state: EngineState,
    /// Bumped by every start and stop; readers of older generations go quiet
    generation: u64,
    pid: Option<u32>,
}

#[derive(Default)]
struct ProducerSlot {
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

impl ProducerSlot {
    fn abort_tasks(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(stderr) = self.stderr.take() {
            stderr.abort();
        }
    }
}

struct Inner {
    config: MediaConfig,
    command: ProducerCommand,
    fanout: Mutex<Fanout>,
    lifecycle: Mutex<Lifecycle>,
    producer: tokio::sync::Mutex<ProducerSlot>,
    next_subscriber: AtomicU64,
    producers_spawned: AtomicU64,
}

/// Cheaply cloneable handle to the broadcast engine
#[derive(Clone)]
pub struct MediaBroadcaster {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MediaBroadcaster {
    pub fn new(config: MediaConfig) -> Self {
        let command = ProducerCommand::from_config(&config);
        Self::with_command(config, command)
    }

    pub fn with_command(config: MediaConfig, command: ProducerCommand) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                command,
                fanout: Mutex::new(Fanout::default()),
                lifecycle: Mutex::new(Lifecycle {
                    state: EngineState::Stopped,
                    generation: 0,
                    pid: None,
                }),
                producer: tokio::sync::Mutex::new(ProducerSlot::default()),
                next_subscriber: AtomicU64::new(1),
                producers_spawned: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        lock(&self.inner.lifecycle).state
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.fanout).subscribers.len()
    }

    /// Copy of the initialization segment captured so far.
    pub fn init_segment(&self) -> Option<Bytes> {
        let fanout = lock(&self.inner.fanout);
        (!fanout.init_segment.is_empty()).then(|| Bytes::copy_from_slice(&fanout.init_segment))
    }

    pub fn status(&self) -> EngineStatus {
        let (state, producer_pid) = {
            let lifecycle = lock(&self.inner.lifecycle);
            (lifecycle.state, lifecycle.pid)
        };
        let (subscribers, init_segment_bytes) = {
            let fanout = lock(&self.inner.fanout);
            (fanout.subscribers.len(), fanout.init_segment.len())
        };
        EngineStatus {
            state,
            subscribers,
            init_segment_bytes,
            producer_pid,
            producers_spawned: self.inner.producers_spawned.load(Ordering::Relaxed),
        }
    }

    /// Launch the producer unless one is already starting or running.
    ///
    /// Returns as soon as the process is spawned; output is consumed by a
    /// background task.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut slot = self.inner.producer.lock().await;
        if self.state() != EngineState::Stopped {
            return Ok(());
        }

        // A producer that ended on its own may not have been reaped yet
        slot.abort_tasks();
        if let Some(child) = slot.child.take() {
            reap(child).await;
        }

        let command = &self.inner.command;
        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(EngineError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(EngineError::MissingPipe("stderr"))?;
        let pid = child.id();

        lock(&self.inner.fanout).reset_init();
        let generation = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.generation += 1;
            lifecycle.state = EngineState::Starting;
            lifecycle.pid = pid;
            lifecycle.generation
        };

        let inner = self.inner.clone();
        slot.reader = Some(tokio::spawn(async move {
            let end = inner.consume(generation, stdout).await;
            inner.finish(generation, end).await;
        }));
        slot.stderr = Some(tokio::spawn(drain_stderr(stderr, pid)));
        slot.child = Some(child);
        self.inner.producers_spawned.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            pid = ?pid,
            program = %command.program,
            generation,
            "Producer started"
        );
        Ok(())
    }

    /// Stop the producer and wait for it to exit. Buffered, unparsed bytes
    /// are discarded and the initialization segment is cleared.
    pub async fn stop(&self) {
        let mut slot = self.inner.producer.lock().await;
        let was = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.generation += 1;
            lifecycle.pid = None;
            std::mem::replace(&mut lifecycle.state, EngineState::Stopped)
        };

        slot.abort_tasks();
        if let Some(mut child) = slot.child.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill producer");
            }
        }
        lock(&self.inner.fanout).reset_init();

        if was != EngineState::Stopped {
            tracing::info!("Producer stopped");
        }
    }

    /// Start the producer if needed and add a subscriber. The new subscriber
    /// receives the initialization segment (if any) before any live box.
    pub async fn attach(&self) -> Result<Subscription, EngineError> {
        self.start().await?;
        Ok(self.subscribe())
    }

    /// Add a subscriber without touching the producer.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_queue.max(1));

        let mut fanout = lock(&self.inner.fanout);
        if !fanout.init_segment.is_empty() {
            let init = Bytes::copy_from_slice(&fanout.init_segment);
            // Fresh queue with capacity >= 1 cannot be full
            let _ = tx.try_send(init);
            tracing::info!(
                subscriber = id,
                bytes = fanout.init_segment.len(),
                "Queued init segment for new subscriber"
            );
        }
        fanout.subscribers.insert(id, tx);
        tracing::info!(
            subscriber = id,
            subscribers = fanout.subscribers.len(),
            "Subscriber attached"
        );

        Subscription { id, rx }
    }

    /// Remove a subscriber. No-op if it is already gone.
    pub fn detach(&self, id: SubscriberId) {
        let mut fanout = lock(&self.inner.fanout);
        if fanout.subscribers.remove(&id).is_some() {
            tracing::info!(
                subscriber = id,
                subscribers = fanout.subscribers.len(),
                "Subscriber detached"
            );
        }
    }

    /// Parse `reader` to completion, broadcasting every box.
    ///
    /// This is the loop the producer's reader task runs; it can also be
    /// driven from any other byte source.
    pub async fn pump<R>(&self, reader: R) -> StreamEnd
    where
        R: AsyncRead + Unpin,
    {
        let generation = lock(&self.inner.lifecycle).generation;
        self.inner.consume(generation, reader).await
    }

    /// Broadcast one box to every current subscriber.
    pub fn publish(&self, media_box: &MediaBox) {
        self.inner.publish(media_box);
    }
}

impl Inner {
    async fn consume<R>(&self, generation: u64, mut reader: R) -> StreamEnd
    where
        R: AsyncRead + Unpin,
    {
        let mut parser = BoxParser::new(self.config.max_box_size);
        let mut chunk = vec![0u8; self.config.read_chunk_size.max(1)];
        let mut first_read = true;

        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => return StreamEnd::Eof,
                Ok(n) => n,
                Err(e) => return StreamEnd::ReadError(e),
            };

            if first_read {
                first_read = false;
                self.mark_running(generation);
            }

            parser.push(&chunk[..n]);
            loop {
                match parser.next_box() {
                    Ok(Some(media_box)) => {
                        // Held across the publish so a concurrent stop either
                        // clears this box or sees it rejected
                        let lifecycle = lock(&self.lifecycle);
                        if lifecycle.generation != generation {
                            return StreamEnd::Superseded;
                        }
                        self.publish(&media_box);
                    }
                    Ok(None) => break,
                    Err(e) => return StreamEnd::Malformed(e),
                }
            }
        }
    }

    fn mark_running(&self, generation: u64) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.generation == generation && lifecycle.state == EngineState::Starting {
            lifecycle.state = EngineState::Running;
            tracing::info!(generation, "Producer output flowing");
        }
    }

    fn publish(&self, media_box: &MediaBox) {
        let mut fanout = lock(&self.fanout);

        if media_box.box_type.is_init() {
            if fanout.init_sealed {
                tracing::warn!(
                    box_type = %media_box.box_type,
                    bytes = media_box.len(),
                    "Initialization box after media data, not added to init segment"
                );
            } else {
                fanout.init_segment.extend_from_slice(&media_box.data);
                tracing::info!(
                    box_type = %media_box.box_type,
                    bytes = media_box.len(),
                    init_bytes = fanout.init_segment.len(),
                    "Captured initialization box"
                );
            }
        } else {
            fanout.init_sealed = true;
        }

        fanout.subscribers.retain(|id, tx| match tx.try_send(media_box.data.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "Subscriber queue full, dropping subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = id, "Subscriber gone");
                false
            }
        });
    }

    /// Called by the reader task when its stream ends.
    async fn finish(&self, generation: u64, end: StreamEnd) {
        match &end {
            StreamEnd::Eof => tracing::warn!(generation, "Producer output closed"),
            StreamEnd::ReadError(e) => {
                tracing::error!(generation, error = %e, "Producer read failed")
            }
            StreamEnd::Malformed(e) => {
                tracing::error!(generation, error = %e, "Malformed producer output, stopping")
            }
            StreamEnd::Superseded => tracing::debug!(generation, "Producer reader superseded"),
        }

        let mut slot = self.producer.lock().await;
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.generation != generation {
                // A newer producer owns the slot
                return;
            }
            lifecycle.state = EngineState::Stopped;
            lifecycle.pid = None;
        }

        if let Some(stderr) = slot.stderr.take() {
            stderr.abort();
        }
        // This task is the reader; dropping its own handle just detaches it
        slot.reader.take();
        if let Some(child) = slot.child.take() {
            reap(child).await;
        }
    }
}

/// Wait briefly for an exiting producer, then kill it.
async fn reap(mut child: Child) {
    match tokio::time::timeout(REAP_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(status = %status, "Producer exited"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for producer"),
        Err(_) => {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill producer");
            } else {
                tracing::info!("Producer killed after closing its output");
            }
        }
    }
}
