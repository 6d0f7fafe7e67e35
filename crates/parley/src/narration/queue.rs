//! Ordered narration playback.
//!
//! Generation starts as soon as an entry is enqueued and runs independently for every
//! entry. Playback is strictly FIFO: a single worker waits for the head entry to
//! resolve, reveals its text, plays its audio, pauses briefly, then moves on. Entries
//! behind a slow head keep generating in the meantime.
//!
//! ```text
//!   enqueue(e1) ─┐    generate e1 ──────────────┐
//!   enqueue(e2) ─┼─▶  generate e2 ──┐           │
//!   enqueue(e3) ─┘    generate e3 ─────┐        │
//!                                   ▼  ▼        ▼
//!   worker:  [wait e1] ──────────────────── reveal+play e1 ─ reveal+play e2 ─ ...
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::generator::AudioClip;

/// Pause between consecutive items.
pub const DEFAULT_INTER_ITEM_DELAY: Duration = Duration::from_millis(500);

/// Produces the audio for one entry.
pub type GenerateFuture = BoxFuture<'static, anyhow::Result<AudioClip>>;

/// Plays audio. At most one `play` runs at a time per queue.
#[async_trait]
pub trait Player: Send + Sync {
    /// Play `clip` to the end, or return early once `cancel` fires.
    async fn play(&self, clip: &AudioClip, cancel: CancellationToken) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Ready,
    Failed,
}

/// Read-only view of a queued entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub id: String,
    pub text: String,
    pub state: EntryState,
}

/// An entry whose turn has come. Sent before its audio starts playing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revealed {
    pub id: String,
    pub text: String,
    /// False when generation failed and the entry is shown without audio.
    pub narrated: bool,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub inter_item_delay: Duration,
    /// Concurrent generations; 0 means unbounded.
    pub max_parallel: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            inter_item_delay: DEFAULT_INTER_ITEM_DELAY,
            max_parallel: 4,
        }
    }
}

struct Entry {
    id: String,
    text: String,
    state: EntryState,
    /// Present iff `state` is `Ready`.
    audio: Option<AudioClip>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    entries: VecDeque<Entry>,
    /// Every id ever enqueued, kept across `stop`.
    seen: HashSet<String>,
    current: Option<String>,
    /// Bumped by `stop`; work started under an older epoch is discarded.
    epoch: u64,
    stop: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
    player: Arc<dyn Player>,
    reveal: mpsc::UnboundedSender<Revealed>,
    limiter: Option<Arc<Semaphore>>,
    delay: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, epoch: u64, id: &str, outcome: anyhow::Result<AudioClip>) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id) else {
            return;
        };

        match outcome {
            Ok(clip) => {
                entry.state = EntryState::Ready;
                entry.audio = Some(clip);
            }
            Err(e) => {
                warn!("narration generation failed for {}: {:#}", id, e);
                entry.state = EntryState::Failed;
            }
        }
        entry.task = None;
        drop(inner);
        self.wake.notify_one();
    }
}

/// FIFO narration queue with parallel generation and serialized playback.
pub struct NarrationQueue {
    shared: Arc<Shared>,
}

impl NarrationQueue {
    /// Create a queue. Revealed entries arrive on the returned receiver in enqueue order.
    pub fn new(
        player: Arc<dyn Player>,
        options: QueueOptions,
    ) -> (Self, mpsc::UnboundedReceiver<Revealed>) {
        let (reveal, revealed) = mpsc::unbounded_channel();
        let limiter = (options.max_parallel > 0)
            .then(|| Arc::new(Semaphore::new(options.max_parallel)));
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                seen: HashSet::new(),
                current: None,
                epoch: 0,
                stop: CancellationToken::new(),
                worker: None,
            }),
            wake: Notify::new(),
            player,
            reveal,
            limiter,
            delay: options.inter_item_delay,
        });
        (Self { shared }, revealed)
    }

    /// Queue `id` and start generating its audio.
    ///
    /// Returns false, doing nothing, if `id` was enqueued before, even if that entry
    /// was since played or cleared by [`stop`](Self::stop).
    pub fn enqueue(
        &self,
        id: impl Into<String>,
        text: impl Into<String>,
        generate: GenerateFuture,
    ) -> bool {
        let id = id.into();
        let mut inner = self.shared.lock();
        if !inner.seen.insert(id.clone()) {
            debug!("narration entry {} already queued", id);
            return false;
        }

        let epoch = inner.epoch;
        let shared = Arc::clone(&self.shared);
        let entry_id = id.clone();
        let task = tokio::spawn(async move {
            let _permit = match &shared.limiter {
                Some(limiter) => Arc::clone(limiter).acquire_owned().await.ok(),
                None => None,
            };
            let outcome = generate.await;
            shared.resolve(epoch, &entry_id, outcome);
        });

        inner.entries.push_back(Entry {
            id,
            text: text.into(),
            state: EntryState::Pending,
            audio: None,
            task: Some(task),
        });

        if inner.worker.is_none() {
            let stop = inner.stop.clone();
            let worker = run_worker(Arc::clone(&self.shared), epoch, stop);
            inner.worker = Some(tokio::spawn(worker));
        }
        true
    }

    /// Halt playback and drop every queued entry. Returns the entries that were
    /// still waiting, head first; none of them will be revealed.
    pub fn stop(&self) -> Vec<EntrySnapshot> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        inner.epoch += 1;

        let dropped: Vec<EntrySnapshot> = inner
            .entries
            .drain(..)
            .map(|entry| {
                if let Some(task) = entry.task {
                    task.abort();
                }
                EntrySnapshot {
                    id: entry.id,
                    text: entry.text,
                    state: entry.state,
                }
            })
            .collect();
        inner.current = None;
        inner.stop.cancel();
        inner.stop = CancellationToken::new();
        if let Some(worker) = inner.worker.take() {
            worker.abort();
        }

        info!(
            "narration queue stopped ({} queued entries dropped)",
            dropped.len()
        );
        dropped
    }

    /// Entries waiting for their turn, head first. Excludes the one playing.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.shared
            .lock()
            .entries
            .iter()
            .map(|e| EntrySnapshot {
                id: e.id.clone(),
                text: e.text.clone(),
                state: e.state,
            })
            .collect()
    }

    /// Id of the entry currently being played.
    pub fn current(&self) -> Option<String> {
        self.shared.lock().current.clone()
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.shared.lock();
        inner.entries.is_empty() && inner.current.is_none()
    }
}

impl Drop for NarrationQueue {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

async fn run_worker(shared: Arc<Shared>, epoch: u64, stop: CancellationToken) {
    loop {
        let next = {
            let mut inner = shared.lock();
            if inner.epoch != epoch {
                return;
            }
            match inner.entries.front().map(|e| e.state) {
                None => {
                    inner.worker = None;
                    return;
                }
                Some(EntryState::Pending) => None,
                Some(EntryState::Ready | EntryState::Failed) => {
                    let entry = inner.entries.pop_front();
                    inner.current = entry.as_ref().map(|e| e.id.clone());
                    entry
                }
            }
        };

        let Some(entry) = next else {
            tokio::select! {
                _ = shared.wake.notified() => continue,
                _ = stop.cancelled() => return,
            }
        };

        let revealed = Revealed {
            id: entry.id.clone(),
            text: entry.text,
            narrated: entry.audio.is_some(),
        };
        if shared.reveal.send(revealed).is_err() {
            debug!("reveal receiver dropped");
        }

        if let Some(clip) = entry.audio {
            debug!("playing narration {}", entry.id);
            tokio::select! {
                result = shared.player.play(&clip, stop.child_token()) => {
                    if let Err(e) = result {
                        warn!("narration playback failed for {}: {:#}", entry.id, e);
                    }
                }
                _ = stop.cancelled() => return,
            }
        }

        {
            let mut inner = shared.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.current = None;
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.delay) => {}
            _ = stop.cancelled() => return,
        }
    }
}
