//! Volume governor: per-source registry and state machine.
//!
//! The governor owns one slot per attached source: its [`ChunkBuffer`] and a
//! ledger tracking the source's [`GovernorState`]. Slots are created by
//! [`VolumeGovernor::attach`] and removed by [`VolumeGovernor::detach`]; there
//! is no ambient per-instance state anywhere else.
//!
//! ```text
//!            pending ≥ high             transport failures ≥ threshold
//!   Normal ───────────────► Backpressure ─────────────────► Degraded
//!     ▲  ◄─────────────────      │                              │
//!     │     pending ≤ low        └──────────────────────────────┤
//!     └─────────────────────── successful drain ◄───────────────┘
//!
//!   any ──► Lost  (reader exhausted retries, or the instance terminated)
//! ```
//!
//! Only `Lost` makes [`VolumeGovernor::liveness`] unhealthy. Backpressure and
//! Degraded are volume conditions, and volume never reaches the supervisor.

use crate::buffer::{BufferState, ChunkBuffer, FillObserver};
use crate::config::{ForwarderConfig, PipelineConfig};
use crate::liveness::{Lifecycle, LivenessSignal, LostReason};
use crate::types::SourceId;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{broadcast, Notify};

const HISTORY_LEN: usize = 64;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernorState {
    Normal,
    Backpressure,
    Degraded,
    Lost,
}

impl std::fmt::Display for GovernorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GovernorState::Normal => write!(f, "normal"),
            GovernorState::Backpressure => write!(f, "backpressure"),
            GovernorState::Degraded => write!(f, "degraded"),
            GovernorState::Lost => write!(f, "lost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub source_id: SourceId,
    pub from: GovernorState,
    pub to: GovernorState,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// One line of [`VolumeGovernor::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: SourceId,
    pub state: GovernorState,
    pub buffer: BufferState,
}

// ---------------------------------------------------------------------------
// Per-source ledger
// ---------------------------------------------------------------------------

struct Tracker {
    state: GovernorState,
    backpressured: bool,
    degraded: bool,
    lost: Option<LostReason>,
    consecutive_failures: u32,
    history: VecDeque<StateTransition>,
}

impl Tracker {
    fn target(&self) -> GovernorState {
        if self.lost.is_some() {
            GovernorState::Lost
        } else if self.degraded {
            GovernorState::Degraded
        } else if self.backpressured {
            GovernorState::Backpressure
        } else {
            GovernorState::Normal
        }
    }
}

struct SourceLedger {
    source_id: SourceId,
    degraded_threshold: u32,
    tracker: Mutex<Tracker>,
    events: broadcast::Sender<StateTransition>,
    data_ready: Arc<Notify>,
}

impl SourceLedger {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> Lifecycle {
        match self.tracker().lost {
            Some(reason) => Lifecycle::Lost(reason),
            None => Lifecycle::Attached,
        }
    }

    fn update(&self, apply: impl FnOnce(&mut Tracker)) -> GovernorState {
        let mut tracker = self.tracker();
        apply(&mut tracker);
        self.settle(&mut tracker);
        tracker.state
    }

    /// Move `state` to whatever the flags say, recording each hop.
    fn settle(&self, tracker: &mut Tracker) {
        if tracker.state == GovernorState::Lost {
            return;
        }
        let target = tracker.target();
        if target == tracker.state {
            return;
        }
        // Leaving Degraded always passes through Normal.
        if tracker.state == GovernorState::Degraded && target == GovernorState::Backpressure {
            self.record(tracker, GovernorState::Normal);
        }
        self.record(tracker, target);
    }

    fn record(&self, tracker: &mut Tracker, to: GovernorState) {
        let transition = StateTransition {
            source_id: self.source_id.clone(),
            from: tracker.state,
            to,
            at: chrono::Utc::now(),
        };
        match to {
            GovernorState::Lost | GovernorState::Degraded => tracing::warn!(
                source_id = %self.source_id,
                from = %transition.from,
                to = %to,
                "governor: state changed"
            ),
            _ => tracing::info!(
                source_id = %self.source_id,
                from = %transition.from,
                to = %to,
                "governor: state changed"
            ),
        }
        tracker.state = to;
        if tracker.history.len() == HISTORY_LEN {
            tracker.history.pop_front();
        }
        tracker.history.push_back(transition.clone());
        // No subscribers is fine.
        let _ = self.events.send(transition);
    }
}

impl FillObserver for SourceLedger {
    fn on_backpressure(&self, engaged: bool, _state: &BufferState) {
        self.update(|t| t.backpressured = engaged);
    }

    fn on_data(&self) {
        self.data_ready.notify_one();
    }
}

struct SourceSlot {
    buffer: Arc<ChunkBuffer>,
    ledger: Arc<SourceLedger>,
}

// ---------------------------------------------------------------------------
// VolumeGovernor
// ---------------------------------------------------------------------------

pub struct VolumeGovernor {
    pipeline: PipelineConfig,
    degraded_threshold: u32,
    slots: RwLock<HashMap<SourceId, SourceSlot>>,
    events: broadcast::Sender<StateTransition>,
    data_ready: Arc<Notify>,
}

impl VolumeGovernor {
    pub fn new(pipeline: PipelineConfig, forwarder: &ForwarderConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pipeline,
            degraded_threshold: forwarder.degraded_threshold.max(1),
            slots: RwLock::new(HashMap::new()),
            events,
            data_ready: Arc::new(Notify::new()),
        }
    }

    /// Register `source_id` and return its buffer. Attaching a source that is
    /// already registered returns the existing buffer, unless that source is
    /// Lost, in which case it starts over with a fresh slot.
    pub fn attach(&self, source_id: SourceId) -> Arc<ChunkBuffer> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(&source_id) {
            if slot.ledger.tracker().state != GovernorState::Lost {
                return slot.buffer.clone();
            }
        }

        let ledger = Arc::new(SourceLedger {
            source_id: source_id.clone(),
            degraded_threshold: self.degraded_threshold,
            tracker: Mutex::new(Tracker {
                state: GovernorState::Normal,
                backpressured: false,
                degraded: false,
                lost: None,
                consecutive_failures: 0,
                history: VecDeque::new(),
            }),
            events: self.events.clone(),
            data_ready: self.data_ready.clone(),
        });
        let buffer = Arc::new(ChunkBuffer::new(
            source_id.clone(),
            self.pipeline.clone(),
            ledger.clone(),
        ));
        tracing::info!(source_id = %source_id, "governor: source attached");
        slots.insert(
            source_id,
            SourceSlot {
                buffer: buffer.clone(),
                ledger,
            },
        );
        buffer
    }

    /// Drop the slot for `source_id`, discarding anything still buffered.
    pub fn detach(&self, source_id: &SourceId) -> Option<BufferState> {
        let slot = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id)?;
        let state = slot.buffer.state();
        tracing::info!(
            source_id = %source_id,
            discarded_bytes = state.pending_bytes,
            dropped_count = state.dropped_count,
            "governor: source detached"
        );
        Some(state)
    }

    pub fn buffer(&self, source_id: &SourceId) -> Option<Arc<ChunkBuffer>> {
        self.with_slot(source_id, |slot| slot.buffer.clone())
    }

    /// Registered sources in a stable order.
    pub fn sources(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn current_state(&self, source_id: &SourceId) -> Option<GovernorState> {
        self.with_slot(source_id, |slot| slot.ledger.tracker().state)
    }

    pub fn liveness(&self, source_id: &SourceId) -> Option<LivenessSignal> {
        self.with_slot(source_id, |slot| {
            LivenessSignal::from_lifecycle(source_id.clone(), slot.ledger.lifecycle())
        })
    }

    /// Transitions recorded for `source_id`, oldest first (bounded history).
    pub fn transitions(&self, source_id: &SourceId) -> Vec<StateTransition> {
        self.with_slot(source_id, |slot| {
            slot.ledger.tracker().history.iter().cloned().collect()
        })
        .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }

    /// Signalled whenever any buffer receives new frames.
    pub fn data_ready(&self) -> &Notify {
        &self.data_ready
    }

    /// A batch for `source_id` reached the aggregator.
    pub fn report_drain_success(&self, source_id: &SourceId) -> Option<GovernorState> {
        self.with_slot(source_id, |slot| {
            slot.ledger.update(|t| {
                t.consecutive_failures = 0;
                t.degraded = false;
            })
        })
    }

    /// A batch for `source_id` exhausted its send retries.
    pub fn report_transport_failure(&self, source_id: &SourceId) -> Option<GovernorState> {
        self.with_slot(source_id, |slot| {
            let threshold = slot.ledger.degraded_threshold;
            slot.ledger.update(|t| {
                t.consecutive_failures = t.consecutive_failures.saturating_add(1);
                if t.consecutive_failures >= threshold {
                    t.degraded = true;
                }
            })
        })
    }

    /// The source will produce no more output. Terminal until re-attached.
    pub fn mark_lost(&self, source_id: &SourceId, reason: LostReason) -> Option<GovernorState> {
        self.with_slot(source_id, |slot| {
            slot.ledger.update(|t| {
                if t.lost.is_none() {
                    t.lost = Some(reason);
                }
            })
        })
    }

    pub fn snapshot(&self) -> Vec<SourceReport> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut reports: Vec<SourceReport> = slots
            .iter()
            .map(|(id, slot)| {
                // The buffer lock is taken before the tracker lock elsewhere,
                // so never hold both here.
                let state = slot.ledger.tracker().state;
                let buffer = slot.buffer.state();
                SourceReport {
                    source_id: id.clone(),
                    state,
                    buffer,
                }
            })
            .collect();
        reports.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        reports
    }

    fn with_slot<T>(&self, source_id: &SourceId, f: impl FnOnce(&SourceSlot) -> T) -> Option<T> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(source_id).map(f)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
