//! Stream fan-out: one writer, many readers.
//!
//! A `Stream` is created when a path's source becomes ready and destroyed
//! when it stops. Readers register a delivery callback per (media, format);
//! every registered reader owns a single bounded queue drained by its own
//! task, so per-(media,format) delivery order equals write order. A reader
//! that cannot keep up is evicted; the writer and the other readers are
//! unaffected.

pub mod ring;

use lg_media::{Description, Unit};
use ring::{RingError, RingReceiver, RingSender, ring};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// One queued delivery: which (media, format) slot the unit belongs to.
#[derive(Clone, Debug)]
struct Delivery {
    media: usize,
    format: usize,
    unit: Unit,
}

/// Errors surfaced to the code registering or driving a reader.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("media {0} does not exist in the stream description")]
    NoSuchMedia(usize),
    #[error("format {1} does not exist in media {0}")]
    NoSuchFormat(usize, usize),
}

/// Why a reader drain stopped.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("reader is too slow, discarding it")]
    Overflowed,
    #[error("stream closed")]
    StreamClosed,
    #[error("delivery failed: {0}")]
    Delivery(Box<dyn std::error::Error + Send + Sync>),
}

type OnUnit = Box<dyn FnMut(Unit) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

/// In-memory distribution object bound to one source while it is ready.
#[derive(Debug)]
pub struct Stream {
    desc: Description,
    write_queue_size: usize,
    closed: CancellationToken,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    // [media][format] -> per-reader queue handles
    slots: Mutex<Vec<Vec<HashMap<Uuid, RingSender<Delivery>>>>>,
}

impl Stream {
    pub fn new(desc: Description, write_queue_size: usize) -> Arc<Self> {
        let slots = desc
            .medias
            .iter()
            .map(|m| m.formats.iter().map(|_| HashMap::new()).collect())
            .collect();
        Arc::new(Stream {
            desc,
            write_queue_size,
            closed: CancellationToken::new(),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            slots: Mutex::new(slots),
        })
    }

    pub fn description(&self) -> &Description {
        &self.desc
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Create an unregistered reader. Callbacks are attached with
    /// [`StreamReader::on_unit`] before the drain is started.
    pub fn reader(self: &Arc<Self>) -> StreamReader {
        let (tx, rx) = ring(self.write_queue_size);
        StreamReader {
            id: Uuid::new_v4(),
            stream: self.clone(),
            tx,
            rx,
            callbacks: HashMap::new(),
        }
    }

    /// Deliver one unit to every reader registered for (media, format).
    ///
    /// Units written after close are discarded. A reader whose queue is full
    /// is deregistered from every slot; its drain observes the overflow.
    pub fn write_unit(&self, media: usize, format: usize, unit: Unit) {
        if self.closed.is_cancelled() {
            return;
        }
        let len = unit.len() as u64;
        self.bytes_received.fetch_add(len, Ordering::Relaxed);

        let mut evicted: Vec<Uuid> = Vec::new();
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let Some(readers) = slots.get(media).and_then(|m| m.get(format)) else {
                return;
            };
            for (id, sender) in readers {
                match sender.push(Delivery {
                    media,
                    format,
                    unit: unit.clone(),
                }) {
                    Ok(()) => {
                        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
                    }
                    Err(RingError::Overflowed) => evicted.push(*id),
                    Err(RingError::Closed) => {}
                }
            }
            for id in &evicted {
                for media_slots in slots.iter_mut() {
                    for readers in media_slots.iter_mut() {
                        readers.remove(id);
                    }
                }
            }
        }
        for id in evicted {
            debug!(reader = %id, "reader queue full, evicted");
        }
    }

    /// Destroy the stream: wake every drain with a terminal signal and
    /// discard subsequent writes.
    pub fn close(&self) {
        self.closed.cancel();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for media_slots in slots.iter_mut() {
            for readers in media_slots.iter_mut() {
                readers.clear();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn register(
        &self,
        id: Uuid,
        media: usize,
        format: usize,
        sender: RingSender<Delivery>,
    ) -> Result<(), StreamError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let media_slots = slots.get_mut(media).ok_or(StreamError::NoSuchMedia(media))?;
        let readers = media_slots
            .get_mut(format)
            .ok_or(StreamError::NoSuchFormat(media, format))?;
        readers.insert(id, sender);
        Ok(())
    }

    fn deregister(&self, id: Uuid) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for media_slots in slots.iter_mut() {
            for readers in media_slots.iter_mut() {
                readers.remove(&id);
            }
        }
    }
}

/// A registered consumer of a stream.
pub struct StreamReader {
    id: Uuid,
    stream: Arc<Stream>,
    tx: RingSender<Delivery>,
    rx: RingReceiver<Delivery>,
    callbacks: HashMap<(usize, usize), OnUnit>,
}

impl StreamReader {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register a delivery callback for (media, format). The reader starts
    /// receiving units for the slot immediately.
    pub fn on_unit(
        &mut self,
        media: usize,
        format: usize,
        callback: OnUnit,
    ) -> Result<(), StreamError> {
        self.stream.register(self.id, media, format, self.tx.clone())?;
        self.callbacks.insert((media, format), callback);
        Ok(())
    }

    /// Subscribe to every (media, format) slot with one callback.
    pub fn on_any_unit<F>(&mut self, callback: F) -> Result<(), StreamError>
    where
        F: Fn(usize, usize, Unit) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Clone
            + Send
            + 'static,
    {
        let medias = self.stream.description().medias.clone();
        for (mi, media) in medias.iter().enumerate() {
            for fi in 0..media.formats.len() {
                let cb = callback.clone();
                self.on_unit(mi, fi, Box::new(move |unit| cb(mi, fi, unit)))?;
            }
        }
        Ok(())
    }

    /// Drain deliveries in order until the owner cancels, the stream closes,
    /// the reader overflows, or a callback fails. Deregisters itself on exit.
    pub async fn run(mut self, token: CancellationToken) -> Result<(), ReaderError> {
        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                pulled = self.rx.pull() => match pulled {
                    Ok(delivery) => {
                        if let Some(cb) = self.callbacks.get_mut(&(delivery.media, delivery.format)) {
                            if let Err(e) = cb(delivery.unit) {
                                break Err(ReaderError::Delivery(e));
                            }
                        }
                    }
                    Err(RingError::Overflowed) => break Err(ReaderError::Overflowed),
                    Err(RingError::Closed) => break Err(ReaderError::StreamClosed),
                },
            }
        };
        self.stream.deregister(self.id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lg_media::Description;
    use std::sync::mpsc as std_mpsc;

    fn collecting_reader(
        stream: &Arc<Stream>,
    ) -> (StreamReader, std_mpsc::Receiver<(usize, usize, Vec<u8>)>) {
        let (tx, rx) = std_mpsc::channel();
        let mut reader = stream.reader();
        reader
            .on_any_unit(move |m, f, unit| {
                tx.send((m, f, unit.payload.to_vec())).ok();
                Ok(())
            })
            .unwrap();
        (reader, rx)
    }

    #[tokio::test]
    async fn fanout_preserves_order_per_slot() {
        let stream = Stream::new(Description::video_and_audio(), 64);
        let (reader, rx) = collecting_reader(&stream);
        let token = CancellationToken::new();
        let drain = tokio::spawn(reader.run(token.clone()));

        for i in 0u8..10 {
            stream.write_unit(0, 0, Unit::new(vec![i]));
        }
        stream.close();
        let outcome = drain.await.unwrap();
        assert!(matches!(outcome, Err(ReaderError::StreamClosed)));

        let received: Vec<u8> = rx.try_iter().map(|(_, _, p)| p[0]).collect();
        assert_eq!(received, (0u8..10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn slow_reader_is_evicted_others_survive() {
        let stream = Stream::new(Description::single_video(), 4);

        // the slow reader never drains
        let mut slow = stream.reader();
        slow.on_unit(0, 0, Box::new(|_| Ok(()))).unwrap();

        let (fast, fast_rx) = collecting_reader(&stream);
        let token = CancellationToken::new();
        let fast_drain = tokio::spawn(fast.run(token.clone()));

        for i in 0u8..32 {
            stream.write_unit(0, 0, Unit::new(vec![i]));
            tokio::task::yield_now().await;
        }

        // the slow reader's drain observes the overflow terminally
        let slow_token = CancellationToken::new();
        let outcome = slow.run(slow_token).await;
        assert!(matches!(outcome, Err(ReaderError::Overflowed)));

        stream.close();
        let _ = fast_drain.await.unwrap();
        assert!(fast_rx.try_iter().count() > 4, "fast reader kept receiving");
    }

    #[tokio::test]
    async fn writes_after_close_are_discarded() {
        let stream = Stream::new(Description::single_video(), 8);
        stream.close();
        stream.write_unit(0, 0, Unit::new(vec![1, 2, 3]));
        assert_eq!(stream.bytes_received(), 0);
    }

    #[tokio::test]
    async fn delivery_error_stops_only_that_reader() {
        let stream = Stream::new(Description::single_video(), 8);

        let mut failing = stream.reader();
        failing
            .on_unit(0, 0, Box::new(|_| Err("boom".into())))
            .unwrap();
        let (ok_reader, ok_rx) = collecting_reader(&stream);

        let token = CancellationToken::new();
        let failing_drain = tokio::spawn(failing.run(token.clone()));
        let ok_drain = tokio::spawn(ok_reader.run(token.clone()));

        stream.write_unit(0, 0, Unit::new(vec![7]));
        let outcome = failing_drain.await.unwrap();
        assert!(matches!(outcome, Err(ReaderError::Delivery(_))));

        stream.write_unit(0, 0, Unit::new(vec![8]));
        stream.close();
        let _ = ok_drain.await.unwrap();
        assert_eq!(ok_rx.try_iter().count(), 2);
    }

    #[tokio::test]
    async fn byte_counters_track_writes_and_deliveries() {
        let stream = Stream::new(Description::single_video(), 8);
        let (reader, _rx) = collecting_reader(&stream);
        let token = CancellationToken::new();
        let drain = tokio::spawn(reader.run(token.clone()));

        stream.write_unit(0, 0, Unit::new(vec![0u8; 100]));
        assert_eq!(stream.bytes_received(), 100);
        assert_eq!(stream.bytes_sent(), 100);

        stream.close();
        let _ = drain.await;
    }
}
