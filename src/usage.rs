//! Fire-and-forget usage tracking
//!
//! Usage recording must never slow down or fail a suggestion, so records
//! travel over a bounded channel to a dedicated writer thread that owns
//! the insert. When the queue is full the record is dropped and counted;
//! the caller always gets an immediate answer.
//!
//! # Architecture
//!
//! ```text
//! track() ──try_send──→ [bounded queue] ──→ writer thread ──→ PatternStore
//!    │                                            │
//!    └── returns immediately                      └── flush/shutdown signals
//! ```

use crate::model::UsageRecord;
use crate::store::PatternStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default bound on the in-flight record queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// One-shot completion signal for flush acknowledgements
struct CompletionSignal {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionSignal {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.condvar.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock().unwrap();
        while !*done {
            let (guard, result) = self.condvar.wait_timeout(done, timeout).unwrap();
            done = guard;
            if result.timed_out() {
                return *done;
            }
        }
        true
    }
}

enum TrackerMessage {
    Record(UsageRecord),
    /// Ack once every message queued before this one is written
    Flush(Arc<CompletionSignal>),
    Shutdown,
}

/// Background usage writer
///
/// Owns a writer thread for its lifetime; `Drop` drains the queue and
/// joins the thread so process exit never loses queued records.
pub struct UsageTracker {
    sender: Option<SyncSender<TrackerMessage>>,
    handle: Option<JoinHandle<()>>,
    recorded: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl UsageTracker {
    /// Spawn the writer thread against the given store
    pub fn new(store: Arc<PatternStore>, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<TrackerMessage>(queue_capacity.max(1));
        let recorded = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        let thread_recorded = Arc::clone(&recorded);
        let thread_dropped = Arc::clone(&dropped);
        let handle = std::thread::Builder::new()
            .name("usage-tracker".to_string())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        TrackerMessage::Record(record) => {
                            match store.record_usage(&record) {
                                Ok(()) => {
                                    thread_recorded.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    thread_dropped.fetch_add(1, Ordering::Relaxed);
                                    tracing::warn!(
                                        "Failed to record usage for {}: {}",
                                        record.pattern_id,
                                        e
                                    );
                                }
                            }
                        }
                        TrackerMessage::Flush(signal) => signal.notify(),
                        TrackerMessage::Shutdown => break,
                    }
                }
                tracing::debug!("Usage tracker thread exiting");
            })
            .ok();

        if handle.is_none() {
            tracing::error!("Failed to spawn usage tracker thread; usage will not be recorded");
        }

        Self {
            sender: Some(sender),
            handle,
            recorded,
            dropped,
        }
    }

    /// Queue a usage record; returns false if it was dropped
    ///
    /// Never blocks. A full queue or dead writer drops the record and
    /// bumps the drop counter.
    pub fn track(&self, record: UsageRecord) -> bool {
        let Some(sender) = &self.sender else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match sender.try_send(TrackerMessage::Record(record)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Usage queue full; dropping record");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Block until every previously queued record is written
    ///
    /// Returns false on timeout or when the writer thread is gone.
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        let signal = Arc::new(CompletionSignal::new());
        if sender.send(TrackerMessage::Flush(Arc::clone(&signal))).is_err() {
            return false;
        }
        signal.wait_timeout(timeout)
    }

    /// Records successfully written so far
    pub fn recorded_count(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Records dropped (full queue, dead thread, or write failure)
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for UsageTracker {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            // Queued records drain before Shutdown arrives (FIFO channel)
            let _ = sender.send(TrackerMessage::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
