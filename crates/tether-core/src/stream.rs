//! Multiplexed asynchronous stream.
//!
//! A [`MultiplexedStream`] is one append-only log shared by any number of
//! independent [`Reader`]s, each bound to a stream name. Writers append
//! records tagged with a name; every reader walks the same log from the point
//! it was opened and yields only the records for its own name.
//!
//! The log is a singly linked list of immutable nodes. Readers hold a cursor
//! (a reference to the last node they consumed), never a copy of the log, so
//! nodes behind the slowest reader are reclaimed as soon as it moves on.
//!
//! Blocked readers park their wakers in one shared wait-set. An append swaps
//! the set out under the lock and wakes everyone: O(1) append plus one wake
//! per blocked reader. A reader that finds no successor node re-checks under
//! the same lock before parking, so no append can slip between the check and
//! the registration.
//!
//! Each reader also carries a backpressure counter: records written for its
//! name minus records it has consumed.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Sleep;

/// A reader stopped before its stream ended.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StreamError {
    /// No record for the reader's name arrived within its timeout.
    #[error("no record arrived within {0:?}")]
    Timeout(Duration),
}

// ─────────────────────────────────────────────────────────────────────────────
// Log nodes
// ─────────────────────────────────────────────────────────────────────────────

enum Record<T> {
    /// Placeholder the log starts from.
    Head,
    Data { name: String, value: T },
    /// Terminal record for one name.
    Close { name: String },
    /// Terminal record for every name.
    End,
}

struct Node<T> {
    record: Record<T>,
    next: OnceLock<Arc<Node<T>>>,
}

impl<T> Node<T> {
    fn new(record: Record<T>) -> Arc<Self> {
        Arc::new(Self {
            record,
            next: OnceLock::new(),
        })
    }
}

impl<T> Drop for Node<T> {
    // Unlink iteratively so dropping a long unread chain cannot overflow the stack.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut owned) => next = owned.next.take(),
                Err(_) => break,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

struct ReaderStat {
    name: String,
    backpressure: usize,
}

struct State<T> {
    tail: Arc<Node<T>>,
    waiters: Vec<Waker>,
    ended: bool,
    readers: HashMap<u64, ReaderStat>,
    next_reader_id: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn append(&self, record: Record<T>, counted_for: Option<&str>) {
        let waiters = {
            let mut state = self.state.lock();
            if state.ended {
                return;
            }
            let node = Node::new(record);
            let _ = state.tail.next.set(Arc::clone(&node));
            state.tail = node;
            if let Some(name) = counted_for {
                for stat in state.readers.values_mut() {
                    if stat.name == name {
                        stat.backpressure += 1;
                    }
                }
            }
            std::mem::take(&mut state.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MultiplexedStream
// ─────────────────────────────────────────────────────────────────────────────

/// Append-only log with independent named readers.
///
/// Cloning yields another handle to the same log.
pub struct MultiplexedStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MultiplexedStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for MultiplexedStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MultiplexedStream<T> {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    tail: Node::new(Record::Head),
                    waiters: Vec::new(),
                    ended: false,
                    readers: HashMap::new(),
                    next_reader_id: 0,
                }),
            }),
        }
    }

    /// Append a record for `name` and wake every blocked reader.
    ///
    /// Writes after [`close_all`](Self::close_all) are dropped.
    pub fn write(&self, name: &str, value: T) {
        self.shared.append(
            Record::Data {
                name: name.to_string(),
                value,
            },
            Some(name),
        );
    }

    /// End every reader of `name`. Readers opened later start fresh.
    pub fn close(&self, name: &str) {
        self.shared.append(
            Record::Close {
                name: name.to_string(),
            },
            None,
        );
    }

    /// End the whole stream: every reader, present and future, completes.
    pub fn close_all(&self) {
        let waiters = {
            let mut state = self.shared.state.lock();
            if state.ended {
                return;
            }
            let node = Node::new(Record::End);
            let _ = state.tail.next.set(Arc::clone(&node));
            state.tail = node;
            state.ended = true;
            std::mem::take(&mut state.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }

    /// Whether [`close_all`](Self::close_all) has been called.
    pub fn is_ended(&self) -> bool {
        self.shared.state.lock().ended
    }

    /// Open a reader for `name`, positioned at the current end of the log.
    pub fn reader(&self, name: &str) -> Reader<T> {
        self.open(name, None)
    }

    /// Open a reader that fails with [`StreamError::Timeout`] when no record
    /// for `name` arrives within `timeout`.
    pub fn reader_with_timeout(&self, name: &str, timeout: Duration) -> Reader<T> {
        self.open(name, Some(timeout))
    }

    fn open(&self, name: &str, timeout: Option<Duration>) -> Reader<T> {
        let mut state = self.shared.state.lock();
        let id = state.next_reader_id;
        state.next_reader_id += 1;
        let done = state.ended;
        if !done {
            let _ = state.readers.insert(
                id,
                ReaderStat {
                    name: name.to_string(),
                    backpressure: 0,
                },
            );
        }
        Reader {
            shared: Arc::clone(&self.shared),
            id,
            name: name.to_string(),
            cursor: Arc::clone(&state.tail),
            timeout,
            sleep: None,
            done,
        }
    }

    /// Unconsumed records across all readers of `name`.
    pub fn backpressure(&self, name: &str) -> usize {
        self.shared
            .state
            .lock()
            .readers
            .values()
            .filter(|stat| stat.name == name)
            .map(|stat| stat.backpressure)
            .sum()
    }

    /// Unconsumed records across every reader.
    pub fn total_backpressure(&self) -> usize {
        self.shared
            .state
            .lock()
            .readers
            .values()
            .map(|stat| stat.backpressure)
            .sum()
    }

    /// Number of live readers of `name`.
    pub fn reader_count(&self, name: &str) -> usize {
        self.shared
            .state
            .lock()
            .readers
            .values()
            .filter(|stat| stat.name == name)
            .count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

/// One consumer of a [`MultiplexedStream`], bound to a single name.
///
/// Yields `Ok(value)` per record, at most one `Err(StreamError::Timeout)`,
/// then `None` once the name or the whole stream is closed. Dropping the
/// reader cancels it.
pub struct Reader<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    name: String,
    cursor: Arc<Node<T>>,
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
    done: bool,
}

impl<T: Clone> Reader<T> {
    /// Await the next record.
    pub async fn next_record(&mut self) -> Option<Result<T, StreamError>> {
        self.next().await
    }
}

impl<T> Reader<T> {
    /// Name this reader is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unconsumed records for this reader.
    pub fn backpressure(&self) -> usize {
        self.shared
            .state
            .lock()
            .readers
            .get(&self.id)
            .map_or(0, |stat| stat.backpressure)
    }

    /// Whether the reader has finished.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.sleep = None;
            let _ = self.shared.state.lock().readers.remove(&self.id);
        }
    }

    fn consumed(&self) {
        if let Some(stat) = self.shared.state.lock().readers.get_mut(&self.id) {
            stat.backpressure = stat.backpressure.saturating_sub(1);
        }
    }

    /// Successor of the cursor, or `None` after parking the waker.
    fn advance(&self, cx: &Context<'_>) -> Option<Arc<Node<T>>> {
        if let Some(next) = self.cursor.next.get() {
            return Some(Arc::clone(next));
        }
        let mut state = self.shared.state.lock();
        if let Some(next) = self.cursor.next.get() {
            return Some(Arc::clone(next));
        }
        if !state.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            state.waiters.push(cx.waker().clone());
        }
        None
    }
}

impl<T: Clone> Stream for Reader<T> {
    type Item = Result<T, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            let Some(next) = this.advance(cx) else {
                if let Some(timeout) = this.timeout {
                    let sleep = this
                        .sleep
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                    if sleep.as_mut().poll(cx).is_ready() {
                        this.finish();
                        return Poll::Ready(Some(Err(StreamError::Timeout(timeout))));
                    }
                }
                return Poll::Pending;
            };
            this.cursor = next;
            match &this.cursor.record {
                Record::Data { name, value } if *name == this.name => {
                    let value = value.clone();
                    this.consumed();
                    this.sleep = None;
                    return Poll::Ready(Some(Ok(value)));
                }
                Record::Close { name } if *name == this.name => {
                    this.finish();
                    return Poll::Ready(None);
                }
                Record::End => {
                    this.finish();
                    return Poll::Ready(None);
                }
                _ => {}
            }
        }
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        self.finish();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
