//! Channel delivery from producer threads to a session
//!
//! Producers (one per traced thread, or one per input stream) push batches
//! through cloned [`EventSender`]s. A dedicated collector thread drains the
//! channel and applies each batch to the shared [`CoverageSession`].
//!
//! ```text
//! producer ──┐
//! producer ──┼──► crossbeam channel ──► collector thread ──► session.record_*()
//! producer ──┘
//! ```
//!
//! Delivery is any-order; the session's insert tolerates that. The collector
//! thread exits once every sender has been dropped.

use crate::error::{CoverageError, Result};
use crate::host;
use crate::resolver::BlockEvent;
use crate::session::CoverageSession;
use crossbeam::channel::{self, Receiver, Sender};
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Events per batch sent by [`EventSender::feed_lines`]
pub const LINE_BATCH: usize = 1024;

/// One batch handed from a producer to the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Decoded `(start, end)` events
    Blocks(Vec<BlockEvent>),
    /// Binary little-endian `(start, end)` pairs
    RawPairs(Vec<u8>),
    /// Concatenated 8-byte block records
    Encoded(Vec<u8>),
    /// An event the producer could not interpret
    Malformed,
}

/// Producer handle; clone one per producer
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<Delivery>,
}

impl EventSender {
    /// Send a batch, blocking only when a bounded channel is full
    ///
    /// Returns `false` if the collector is gone.
    pub fn send(&self, delivery: Delivery) -> bool {
        self.tx.send(delivery).is_ok()
    }

    pub fn send_blocks(&self, events: Vec<BlockEvent>) -> bool {
        self.send(Delivery::Blocks(events))
    }

    /// Parse a text event stream and deliver it in batches
    ///
    /// Lines that are not UTF-8 or do not parse are delivered as
    /// [`Delivery::Malformed`]. Only a read failure on the stream is an error.
    pub fn feed_lines<R: BufRead>(&self, reader: R) -> std::io::Result<FeedOutcome> {
        let mut batch = Vec::with_capacity(LINE_BATCH);

        for (number, line) in reader.split(b'\n').enumerate() {
            let line = line?;
            let parsed = std::str::from_utf8(&line)
                .map_err(|e| CoverageError::Format(e.to_string()))
                .and_then(host::parse_event_line);
            match parsed {
                Ok(Some(event)) => batch.push(event),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(line = number + 1, "Skipping event: {}", e);
                    if !self.send(Delivery::Malformed) {
                        return Ok(FeedOutcome::Disconnected);
                    }
                }
            }
            if batch.len() >= LINE_BATCH && !self.send_blocks(std::mem::take(&mut batch)) {
                return Ok(FeedOutcome::Disconnected);
            }
        }

        if !batch.is_empty() && !self.send_blocks(batch) {
            return Ok(FeedOutcome::Disconnected);
        }
        Ok(FeedOutcome::Completed)
    }
}

/// How a producer's input stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Every line was read and delivered
    Completed,
    /// The collector went away before the stream was exhausted
    Disconnected,
}

/// Collector statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub batches: u64,
}

/// Background thread applying delivered batches to a session
pub struct Collector {
    session: Arc<CoverageSession>,
    tx: Option<Sender<Delivery>>,
    handle: Option<JoinHandle<()>>,
    batches: Arc<AtomicU64>,
}

impl Collector {
    /// Start the collector thread
    ///
    /// With `capacity`, the channel is bounded and producers block when it
    /// is full; otherwise it is unbounded.
    pub fn spawn(session: Arc<CoverageSession>, capacity: Option<usize>) -> Self {
        let (tx, rx) = match capacity {
            Some(capacity) => channel::bounded(capacity),
            None => channel::unbounded(),
        };
        let batches = Arc::new(AtomicU64::new(0));

        let worker_session = Arc::clone(&session);
        let worker_batches = Arc::clone(&batches);
        let handle = thread::spawn(move || {
            Self::worker(rx, &worker_session, &worker_batches);
        });

        Self {
            session,
            tx: Some(tx),
            handle: Some(handle),
            batches,
        }
    }

    fn worker(rx: Receiver<Delivery>, session: &CoverageSession, batches: &AtomicU64) {
        for delivery in rx.iter() {
            match delivery {
                Delivery::Blocks(events) => {
                    session.record_events(&events);
                }
                Delivery::RawPairs(payload) => {
                    session.record_raw_pairs(&payload);
                }
                Delivery::Encoded(payload) => {
                    session.record_encoded(&payload);
                }
                Delivery::Malformed => session.note_malformed(),
            }
            batches.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!("All producers disconnected, collector exiting");
    }

    /// A new producer handle
    pub fn sender(&self) -> Option<EventSender> {
        self.tx.as_ref().map(|tx| EventSender { tx: tx.clone() })
    }

    pub fn session(&self) -> &Arc<CoverageSession> {
        &self.session
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            batches: self.batches.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and wait for every batch to be applied
    ///
    /// Blocks until all outstanding [`EventSender`]s are dropped.
    pub fn shutdown(mut self) -> Result<Arc<CoverageSession>> {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| CoverageError::CollectorPanicked)?;
        }
        tracing::debug!(batches = self.stats().batches, "Collector shut down");
        Ok(Arc::clone(&self.session))
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Collector thread panicked, pending batches were lost");
            }
        }
    }
}
