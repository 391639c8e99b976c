use crate::error::{Result, StorageError};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Bounded per-stream frame queue
///
/// Producers never block: a full (or closed) queue counts an overflow and
/// returns [`StorageError::Busy`]. The writer takes and resets the counter at
/// each period boundary.
#[derive(Debug, Clone)]
pub struct StreamQueue {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    overflows: Arc<AtomicU32>,
    capacity: usize,
}

impl StreamQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        StreamQueue {
            tx,
            rx,
            overflows: Arc::new(AtomicU32::new(0)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn try_send(&self, frame: Vec<u8>) -> Result<()> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.overflows.fetch_add(1, Ordering::Relaxed);
                Err(StorageError::Busy)
            }
        }
    }

    pub fn receiver(&self) -> &Receiver<Vec<u8>> {
        &self.rx
    }

    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Overflows since the last call.
    pub fn take_overflows(&self) -> u32 {
        self.overflows.swap(0, Ordering::Relaxed)
    }

    pub fn overflows(&self) -> u32 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Drop everything queued; returns the number of frames discarded.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}
