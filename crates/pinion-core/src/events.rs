//! In-process publish/subscribe for lifecycle events.
//!
//! Every subscriber owns a bounded queue. Publishing never blocks: when a
//! subscriber's queue is full the event is dropped for that subscriber and a
//! [`EventKind::Gap`] is delivered ahead of the next event that fits.

use crate::lifecycle::OperationKind;
use crate::operation::Outcome;
use pinion_runtime::OutputStream;
use pinion_schema::{OperationId, PackageId};
use pinion_store::LifecyclePhase;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Events kept per package for subscribers that connect late.
pub const REPLAY_WINDOW: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Progress {
        percent: u8,
        determinate: bool,
    },
    LogLine {
        stream: OutputStream,
        line: String,
    },
    StateChanged {
        from: LifecyclePhase,
        to: LifecyclePhase,
        version: u64,
    },
    TunnelChanged {
        url: Option<String>,
    },
    OperationFinished {
        kind: OperationKind,
        outcome: Outcome,
    },
    /// `dropped` events were discarded because the subscriber fell behind.
    Gap {
        dropped: u64,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Progress { .. } => "progress",
            EventKind::LogLine { .. } => "log_line",
            EventKind::StateChanged { .. } => "state_changed",
            EventKind::TunnelChanged { .. } => "tunnel_changed",
            EventKind::OperationFinished { .. } => "operation_finished",
            EventKind::Gap { .. } => "gap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub package_id: PackageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    /// Per-package sequence number. A `Gap` shares the seq of the event it
    /// precedes.
    pub seq: u64,
    pub timestamp: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

struct Subscriber {
    filter: Option<PackageId>,
    tx: mpsc::Sender<Event>,
    dropped: u64,
}

impl Subscriber {
    fn wants(&self, package: &PackageId) -> bool {
        self.filter.as_ref().map_or(true, |f| f == package)
    }

    /// Returns false once the receiving side is gone.
    fn deliver(&mut self, event: &Event) -> bool {
        if self.dropped > 0 {
            // The gap marker and the event must both fit, or neither is sent.
            if self.tx.capacity() < 2 {
                if self.tx.is_closed() {
                    return false;
                }
                self.dropped += 1;
                return true;
            }
            let gap = Event {
                package_id: event.package_id.clone(),
                operation_id: None,
                seq: event.seq,
                timestamp: event.timestamp.clone(),
                kind: EventKind::Gap {
                    dropped: self.dropped,
                },
            };
            if let Err(TrySendError::Closed(_)) = self.tx.try_send(gap) {
                return false;
            }
            self.dropped = 0;
        }
        match self.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Subscriber>,
    seqs: HashMap<PackageId, u64>,
    history: HashMap<PackageId, VecDeque<Event>>,
}

pub struct EventBus {
    state: Mutex<BusState>,
    capacity: usize,
    replay: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self::with_replay(capacity, REPLAY_WINDOW)
    }

    pub fn with_replay(capacity: usize, replay: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            capacity: capacity.max(2),
            replay,
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp and fan out an event. Returns the published event.
    pub fn publish(
        &self,
        package: &PackageId,
        operation: Option<&OperationId>,
        kind: EventKind,
    ) -> Event {
        let mut state = self.state();
        let seq = {
            let counter = state.seqs.entry(package.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let event = Event {
            package_id: package.clone(),
            operation_id: operation.cloned(),
            seq,
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind,
        };

        if self.replay > 0 {
            let history = state.history.entry(package.clone()).or_default();
            if history.len() == self.replay {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let before = state.subscribers.len();
        state
            .subscribers
            .retain_mut(|sub| !sub.wants(package) || sub.deliver(&event));
        let pruned = before - state.subscribers.len();
        if pruned > 0 {
            debug!("pruned {pruned} disconnected event subscriber(s)");
        }
        event
    }

    /// Register a subscriber, optionally limited to one package.
    ///
    /// The replay window is captured under the same lock that registers the
    /// queue, so no event is both replayed and delivered live, and none falls
    /// between the two.
    pub fn subscribe(&self, filter: Option<PackageId>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut state = self.state();
        let mut replay: Vec<Event> = match &filter {
            Some(id) => state
                .history
                .get(id)
                .map(|h| h.iter().cloned().collect())
                .unwrap_or_default(),
            None => state.history.values().flatten().cloned().collect(),
        };
        if filter.is_none() {
            replay.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        }
        state.subscribers.push(Subscriber {
            filter,
            tx,
            dropped: 0,
        });
        Subscription { replay, rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    /// The last sequence number handed out for a package.
    pub fn last_seq(&self, package: &str) -> u64 {
        self.state().seqs.get(package).copied().unwrap_or(0)
    }
}

/// A live view of the bus. Dropping it unsubscribes on the next publish.
pub struct Subscription {
    replay: Vec<Event>,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Events published before the subscription was made, oldest first.
    /// Empty after the first call.
    pub fn take_replay(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.replay)
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
