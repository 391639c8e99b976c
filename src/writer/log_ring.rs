//! Best-effort log buffer
//!
//! Holds log bytes while the log file is unavailable. It is not circular:
//! once full, new bytes are dropped and counted.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default capacity in bytes
pub const LOG_RING_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct LogRing {
    buf: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        LogRing {
            buf: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append as many bytes as fit; returns how many were accepted.
    pub fn push(&self, bytes: &[u8]) -> usize {
        let mut buf = self.buf.lock();
        let room = self.capacity - buf.len();
        let n = room.min(bytes.len());
        buf.extend(&bytes[..n]);
        if n < bytes.len() {
            self.dropped
                .fetch_add((bytes.len() - n) as u64, Ordering::Relaxed);
        }
        n
    }

    /// Put bytes back at the front after a failed write.
    ///
    /// Bytes that no longer fit are dropped from the end of `bytes`.
    pub fn push_front(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock();
        let room = self.capacity - buf.len();
        let n = room.min(bytes.len());
        for &b in bytes[..n].iter().rev() {
            buf.push_front(b);
        }
        if n < bytes.len() {
            self.dropped
                .fetch_add((bytes.len() - n) as u64, Ordering::Relaxed);
        }
    }

    /// Take everything buffered.
    pub fn drain(&self) -> Vec<u8> {
        self.buf.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes lost to a full buffer since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(LOG_RING_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_when_full() {
        let ring = LogRing::new(8);
        assert_eq!(ring.push(b"hello"), 5);
        assert_eq!(ring.push(b"world"), 3);
        assert_eq!(ring.dropped(), 2);
        assert_eq!(ring.drain(), b"hellowor");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_push_front_restores_order() {
        let ring = LogRing::new(16);
        ring.push(b"new");
        ring.push_front(b"old ");
        assert_eq!(ring.drain(), b"old new");
    }

    #[test]
    fn test_default_capacity() {
        let ring = LogRing::default();
        assert_eq!(ring.capacity(), LOG_RING_BYTES);
        assert_eq!(ring.push(&[0u8; 5000]), LOG_RING_BYTES);
        assert_eq!(ring.dropped(), 5000 - LOG_RING_BYTES as u64);
    }
}
