//! Live-query handles and operation fan-out.
//!
//! A live query owns one [`OperationBroadcast`]. Each call to
//! [`LiveQuery::subscribe`] returns an independent [`OperationStream`] that
//! first replays the retained history (per [`ReplayPolicy`]) and then follows
//! new operations. Closing the live query aborts its feed task and ends every
//! stream.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Result, SyncError};
use crate::obs::emit_live_query_closed;
use crate::operation::Operation;

/// How much history late subscribers see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Every operation since the live query started
    #[default]
    All,
    /// The most recent `n` operations
    Latest(usize),
    /// Nothing; only operations published after subscribing
    None,
}

/// Lifecycle of a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveQueryState {
    Initializing,
    Streaming,
    Closed,
    Errored,
}

impl LiveQueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LiveQueryState::Closed | LiveQueryState::Errored)
    }
}

type Item = Result<Operation>;

struct BroadcastState {
    policy: ReplayPolicy,
    history: VecDeque<Item>,
    subscribers: Vec<mpsc::UnboundedSender<Item>>,
    closed: bool,
}

/// Fan-out of one live query's operations to any number of streams.
pub struct OperationBroadcast {
    state: Mutex<BroadcastState>,
}

impl OperationBroadcast {
    pub fn new(policy: ReplayPolicy) -> Self {
        Self {
            state: Mutex::new(BroadcastState {
                policy,
                history: VecDeque::new(),
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// New stream: retained history first, then live items.
    pub fn subscribe(&self) -> OperationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        for item in &state.history {
            let _ = tx.send(item.clone());
        }
        if !state.closed {
            state.subscribers.push(tx);
        }
        OperationStream { rx }
    }

    pub fn publish(&self, item: Item) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        match state.policy {
            ReplayPolicy::All => state.history.push_back(item.clone()),
            ReplayPolicy::Latest(0) | ReplayPolicy::None => {}
            ReplayPolicy::Latest(n) => {
                if state.history.len() == n {
                    state.history.pop_front();
                }
                state.history.push_back(item.clone());
            }
        }
        // Dropped streams fall out here.
        state.subscribers.retain(|tx| tx.send(item.clone()).is_ok());
    }

    /// Change what later subscribers see, trimming the retained history to
    /// fit the new policy.
    pub fn set_replay(&self, policy: ReplayPolicy) {
        let mut state = self.state.lock().unwrap();
        let keep = match policy {
            ReplayPolicy::All => state.history.len(),
            ReplayPolicy::Latest(n) => n,
            ReplayPolicy::None => 0,
        };
        let excess = state.history.len().saturating_sub(keep);
        state.history.drain(..excess);
        state.policy = policy;
    }

    /// End every stream. Later subscribers still get the retained history.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }
}

/// A consumer's view of a live query's operations.
///
/// Yields `Err` once if the live query fails, then ends.
pub struct OperationStream {
    rx: mpsc::UnboundedReceiver<Item>,
}

impl Stream for OperationStream {
    type Item = Result<Operation>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// State shared by a live query's handles and its feed task.
pub(crate) struct LiveShared {
    model: String,
    pub(crate) broadcast: OperationBroadcast,
    state: watch::Sender<LiveQueryState>,
    error: Mutex<Option<SyncError>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveShared {
    pub(crate) fn new(model: String, policy: ReplayPolicy) -> Arc<Self> {
        let (state, _) = watch::channel(LiveQueryState::Initializing);
        Arc::new(Self {
            model,
            broadcast: OperationBroadcast::new(policy),
            state,
            error: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub(crate) fn attach(&self, task: JoinHandle<()>) {
        *self.task.lock().unwrap() = Some(task);
    }

    pub(crate) fn mark_streaming(&self) {
        self.state.send_if_modified(|state| {
            if *state == LiveQueryState::Initializing {
                *state = LiveQueryState::Streaming;
                true
            } else {
                false
            }
        });
    }

    /// Deliver `error` to every stream and stop.
    pub(crate) fn fail(&self, error: SyncError) {
        self.broadcast.publish(Err(error.clone()));
        *self.error.lock().unwrap() = Some(error);
        self.settle(LiveQueryState::Errored, "error");
    }

    /// Move to a terminal state and end the streams. No-op if already terminal.
    pub(crate) fn settle(&self, terminal: LiveQueryState, reason: &str) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = terminal;
                true
            }
        });
        self.broadcast.close();
        if changed {
            emit_live_query_closed(&self.model, reason);
        }
    }

    /// Abort the feed task, then settle as closed.
    pub(crate) fn shutdown(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.settle(LiveQueryState::Closed, "closed");
    }
}

/// A live query that has become ready.
///
/// Dropping it closes the live query.
pub struct LiveQuery {
    shared: Arc<LiveShared>,
}

impl LiveQuery {
    pub fn model(&self) -> &str {
        &self.shared.model
    }

    pub fn subscribe(&self) -> OperationStream {
        self.shared.broadcast.subscribe()
    }

    /// Change the replay policy for subscribers from now on.
    pub fn set_replay(&self, policy: ReplayPolicy) {
        self.shared.broadcast.set_replay(policy);
    }

    pub fn state(&self) -> LiveQueryState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<LiveQueryState> {
        self.shared.state.subscribe()
    }

    /// The error that ended the live query, if any.
    pub fn error(&self) -> Option<SyncError> {
        self.shared.error.lock().unwrap().clone()
    }

    /// Stop consuming the feed and end every stream.
    pub fn close(self) {
        self.shared.shutdown();
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Cancels a pending live query from elsewhere.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<LiveShared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.shutdown();
    }
}

/// A live query waiting for its ready marker.
///
/// Dropping it without awaiting [`PendingLiveQuery::ready`] closes the live
/// query.
pub struct PendingLiveQuery {
    shared: Option<Arc<LiveShared>>,
}

impl PendingLiveQuery {
    pub(crate) fn new(shared: Arc<LiveShared>) -> Self {
        Self {
            shared: Some(shared),
        }
    }

    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.shared.as_ref().map(|shared| CancelHandle {
            shared: Arc::clone(shared),
        })
    }

    /// Operations published so far, including the initial snapshot.
    pub fn subscribe(&self) -> Option<OperationStream> {
        self.shared.as_ref().map(|shared| shared.broadcast.subscribe())
    }

    pub fn cancel(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.shutdown();
        }
    }

    /// Resolve once the feed reports ready.
    ///
    /// Fails with `SyncError::Cancelled` if cancelled first, or with the feed
    /// error if the feed fails first.
    pub async fn ready(mut self) -> Result<LiveQuery> {
        let shared = self.shared.take().ok_or(SyncError::Cancelled)?;
        let mut rx = shared.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                LiveQueryState::Streaming => return Ok(LiveQuery { shared }),
                LiveQueryState::Closed => return Err(SyncError::Cancelled),
                LiveQueryState::Errored => {
                    let error = shared.error.lock().unwrap().clone();
                    return Err(error.unwrap_or(SyncError::Closed));
                }
                LiveQueryState::Initializing => {}
            }
            if rx.changed().await.is_err() {
                return Err(SyncError::Closed);
            }
        }
    }
}

impl Drop for PendingLiveQuery {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.shutdown();
        }
    }
}
