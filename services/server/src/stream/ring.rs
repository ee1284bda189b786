//! Per-reader bounded delivery queue.
//!
//! The queue is non-blocking on the writer side: a push against a full queue
//! fails the *reader*, not the writer. The reader's drain observes the
//! overflow on its next pull and tears itself down; the writer carries on
//! serving everyone else.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Terminal outcomes a drain can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The writer pushed against a full queue; the reader is being evicted.
    Overflowed,
    /// Every writer handle is gone (stream closed).
    Closed,
}

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingError::Overflowed => write!(f, "delivery queue overflowed"),
            RingError::Closed => write!(f, "delivery queue closed"),
        }
    }
}

impl std::error::Error for RingError {}

/// Writer half. Cloned into every (media, format) registry slot the reader
/// subscribes to, so per-reader ordering equals write order.
#[derive(Clone, Debug)]
pub struct RingSender<T> {
    tx: mpsc::Sender<T>,
    overflow: CancellationToken,
}

/// Reader half, owned by the drain task.
pub struct RingReceiver<T> {
    rx: mpsc::Receiver<T>,
    overflow: CancellationToken,
}

/// Create a bounded queue. `capacity` must be a power of two (validated at
/// configuration time; debug-asserted here).
pub fn ring<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
    debug_assert!(capacity.is_power_of_two());
    let (tx, rx) = mpsc::channel(capacity);
    let overflow = CancellationToken::new();
    (
        RingSender {
            tx,
            overflow: overflow.clone(),
        },
        RingReceiver { rx, overflow },
    )
}

impl<T> RingSender<T> {
    /// Non-blocking push. A full queue marks the reader overflowed and the
    /// push reports the eviction to the caller.
    pub fn push(&self, value: T) -> Result<(), RingError> {
        if self.overflow.is_cancelled() {
            return Err(RingError::Overflowed);
        }
        match self.tx.try_send(value) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow.cancel();
                Err(RingError::Overflowed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RingError::Closed),
        }
    }
}

impl<T> RingReceiver<T> {
    /// Pull the next item, or the terminal signal.
    ///
    /// Overflow wins over buffered items: once the writer has declared the
    /// reader too slow, draining the backlog would only widen the gap.
    pub async fn pull(&mut self) -> Result<T, RingError> {
        tokio::select! {
            biased;
            _ = self.overflow.cancelled() => Err(RingError::Overflowed),
            item = self.rx.recv() => item.ok_or(RingError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order() {
        let (tx, mut rx) = ring::<u32>(4);
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        tx.push(3).unwrap();
        assert_eq!(rx.pull().await.unwrap(), 1);
        assert_eq!(rx.pull().await.unwrap(), 2);
        assert_eq!(rx.pull().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn overflow_fails_reader_not_writer() {
        let (tx, mut rx) = ring::<u32>(2);
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        assert_eq!(tx.push(3), Err(RingError::Overflowed));
        // the backlog is not drained after overflow
        assert_eq!(rx.pull().await, Err(RingError::Overflowed));
        // subsequent pushes keep reporting the eviction
        assert_eq!(tx.push(4), Err(RingError::Overflowed));
    }

    #[tokio::test]
    async fn close_wakes_drain() {
        let (tx, mut rx) = ring::<u32>(2);
        drop(tx);
        assert_eq!(rx.pull().await, Err(RingError::Closed));
    }
}
