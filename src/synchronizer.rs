//! Serves many concurrent callers against one shared (in, out) port pair.
//!
//! `push` writes a request through the out port and returns a token; `pull`
//! hands over a callback that reads the reply from the in port. A single
//! worker runs those callbacks strictly in push order, so each caller reads
//! the reply that belongs to its own request.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use dashmap::DashMap;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::port::{Port, PortError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token {}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("synchronizer closed")]
    Closed,

    #[error("unknown {0}")]
    UnknownToken(Token),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("the worker can only be spawned inside a tokio runtime")]
    NoRuntime,
}

type Consume = Box<dyn FnOnce(&Arc<Port>) + Send>;

struct State {
    next: u64,
    queue: Option<Sender<Token>>,
}

pub struct Synchronizer {
    input: Arc<Port>,
    output: Arc<Port>,
    // held by `push` only, `produce` may block on a full queue while holding it
    state: Mutex<State>,
    closed: AtomicBool,
    queue: Receiver<Token>,
    // caller side of each rendezvous, taken by `pull`
    callers: DashMap<Token, Sender<Consume>>,
    // worker side, taken once the token reaches the head of the queue
    handoffs: DashMap<Token, Receiver<Consume>>,
}

impl Synchronizer {
    pub fn new(input: Arc<Port>, output: Arc<Port>) -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(Self {
            input,
            output,
            state: Mutex::new(State {
                next: 0,
                queue: Some(tx),
            }),
            closed: AtomicBool::new(false),
            queue: rx,
            callers: DashMap::new(),
            handoffs: DashMap::new(),
        })
    }

    /// Runs `produce` against the out port and enqueues a token for the reply.
    pub fn push<F>(&self, produce: F) -> Result<Token, SyncError>
    where
        F: FnOnce(&Arc<Port>) -> Result<(), PortError>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = state.queue.clone() else {
            return Err(SyncError::Closed);
        };
        state.next += 1;
        let token = Token(state.next);
        produce(&self.output)?;

        let (tx, rx) = bounded(1);
        self.callers.insert(token, tx);
        self.handoffs.insert(token, rx);
        queue.send(token).map_err(|_| SyncError::Closed)?;
        debug!(%token, "pushed");
        Ok(token)
    }

    /// Blocks until the worker has run `consume` against the in port for `token`.
    ///
    /// Never touches the push lock, so pullers keep the worker fed while a
    /// pusher waits on a full queue.
    pub fn pull<R, F>(&self, token: Token, consume: F) -> Result<R, SyncError>
    where
        R: Send + 'static,
        F: FnOnce(&Arc<Port>) -> R + Send + 'static,
    {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        let Some((_, caller)) = self.callers.remove(&token) else {
            return Err(if self.is_closed() {
                SyncError::Closed
            } else {
                SyncError::UnknownToken(token)
            });
        };

        let (done_tx, done_rx) = bounded(1);
        let callback: Consume = Box::new(move |port| {
            let _ = done_tx.send(consume(port));
        });
        caller.send(callback).map_err(|_| SyncError::Closed)?;
        done_rx.recv().map_err(|_| SyncError::Closed)
    }

    /// Services tokens in order until the synchronizer is closed.
    pub fn worker(&self) {
        while let Ok(token) = self.queue.recv() {
            let Some((_, handoff)) = self.handoffs.remove(&token) else {
                continue;
            };
            match handoff.recv() {
                Ok(consume) => {
                    consume(&self.input);
                    debug!(%token, "served");
                }
                Err(_) => warn!(%token, "token dropped without a pull"),
            }
        }
        debug!("synchronizer worker finished");
    }

    pub fn spawn_worker(self: &Arc<Self>) -> Result<JoinHandle<()>, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let me = self.clone();
        Ok(runtime.spawn_blocking(move || me.worker()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting pushes. Tokens that were never pulled are dropped so
    /// the worker can drain the queue and exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.callers.clear();
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .take();
        // a push that held the lock may have registered one more caller
        self.callers.clear();
    }
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("in", &self.input.to_string())
            .field("out", &self.output.to_string())
            .field("pending", &self.handoffs.len())
            .finish()
    }
}
