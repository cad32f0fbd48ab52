use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};

use crate::value::Value;

use super::PortError;

/// Bounded blocking FIFO attached to a leaf port.
///
/// Closing drops the only sender of `closed_rx`, which wakes every blocked
/// `push`/`pull` with `PortError::Closed`.
pub(crate) struct Buffer {
    tx: Sender<Value>,
    rx: Receiver<Value>,
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
}

impl Buffer {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        let (closed_tx, closed_rx) = bounded(0);
        Self {
            tx,
            rx,
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.closed_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) fn close(&self) {
        self.closed_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub(crate) fn push(&self, value: Value) -> Result<(), PortError> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        select! {
            send(self.tx, value) -> res => res.map_err(|_| PortError::Closed),
            recv(self.closed_rx) -> _ => Err(PortError::Closed),
        }
    }

    pub(crate) fn pull(&self) -> Result<Value, PortError> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        select! {
            recv(self.rx) -> res => res.map_err(|_| PortError::Closed),
            recv(self.closed_rx) -> _ => Err(PortError::Closed),
        }
    }

    pub(crate) fn try_pull(&self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }
}
