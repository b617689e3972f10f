//! Bounded, time-ordered event log with polling reads and push subscriptions.
//!
//! Publishing never blocks: the ring drops its oldest entry when full and a
//! lagging subscriber skips what it missed.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, warn};

use forge_common::page::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use forge_common::{Event, EventKind, EventPage};

pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

#[derive(Debug, Clone)]
pub struct Feed {
    inner: Arc<Mutex<Ring>>,
    tx: broadcast::Sender<Event>,
}

#[derive(Debug)]
struct Ring {
    events: VecDeque<Event>,
    capacity: usize,
    next_seq: u64,
}

impl Feed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Mutex::new(Ring {
                events: VecDeque::with_capacity(capacity),
                capacity,
                next_seq: 1,
            })),
            tx,
        }
    }

    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, kind: EventKind) -> Event {
        let mut ring = self.ring();
        let event = Event {
            seq: ring.next_seq,
            at_ms: Utc::now().timestamp_millis().max(0) as u64,
            kind,
        };
        ring.next_seq += 1;

        if ring.events.len() == ring.capacity {
            ring.events.pop_front();
        }
        ring.events.push_back(event.clone());

        debug!(seq = event.seq, kind = event.kind.name(), "event published");
        // Sent under the ring lock so subscribers see the same order as pollers.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Events with `seq > since`, oldest first.
    pub fn since(&self, since: u64, limit: Option<usize>) -> EventPage {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let ring = self.ring();
        EventPage {
            events: ring
                .events
                .iter()
                .filter(|e| e.seq > since)
                .take(limit)
                .cloned()
                .collect(),
            oldest_seq: ring.events.front().map(|e| e.seq),
            next_seq: ring.next_seq,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Retained events after `since`, followed by live ones, without gaps or repeats.
    pub fn stream(&self, since: Option<u64>) -> EventStream {
        let (backlog, rx) = {
            let ring = self.ring();
            let rx = self.tx.subscribe();
            let backlog: Vec<Event> = match since {
                Some(since) => ring
                    .events
                    .iter()
                    .filter(|e| e.seq > since)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            (backlog, rx)
        };

        let after = backlog.last().map(|e| e.seq).or(since).unwrap_or(0);
        let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
            Ok(ev) if ev.seq > after => Some(ev),
            Ok(_) => None,
            Err(err) => {
                warn!(error=%err, "event subscriber lagged, events skipped");
                None
            }
        });

        Box::pin(tokio_stream::iter(backlog).chain(live))
    }

    pub fn len(&self) -> usize {
        self.ring().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
