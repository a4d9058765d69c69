//! Liveness signals consumed by the supervisor.
//!
//! A [`LivenessSignal`] can only be built from a [`Lifecycle`] or a
//! [`ProbeOutcome`]. Neither carries buffer fill or forwarding health, so a
//! signal derived from log volume cannot exist: Backpressure and Degraded
//! sources map to [`Lifecycle::Attached`] and report healthy.

use crate::types::SourceId;
use serde::Serialize;

/// Why a source stopped producing output for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LostReason {
    /// The reader ran out of retries re-attaching or reading.
    StreamLost,
    /// The instance closed its output (process exit).
    InstanceTerminated,
}

/// The only governor-side facts that liveness may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Attached,
    Lost(LostReason),
}

/// Result of an independent health probe against the instance itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessReason {
    StreamLost,
    InstanceTerminated,
    ProbeFailed,
}

impl From<LostReason> for LivenessReason {
    fn from(reason: LostReason) -> Self {
        match reason {
            LostReason::StreamLost => LivenessReason::StreamLost,
            LostReason::InstanceTerminated => LivenessReason::InstanceTerminated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivenessSignal {
    source_id: SourceId,
    healthy: bool,
    reason: Option<LivenessReason>,
}

impl LivenessSignal {
    pub fn from_lifecycle(source_id: SourceId, lifecycle: Lifecycle) -> Self {
        match lifecycle {
            Lifecycle::Attached => Self {
                source_id,
                healthy: true,
                reason: None,
            },
            Lifecycle::Lost(reason) => Self {
                source_id,
                healthy: false,
                reason: Some(reason.into()),
            },
        }
    }

    pub fn from_probe(source_id: SourceId, outcome: ProbeOutcome) -> Self {
        match outcome {
            ProbeOutcome::Passed => Self {
                source_id,
                healthy: true,
                reason: None,
            },
            ProbeOutcome::Failed => Self {
                source_id,
                healthy: false,
                reason: Some(LivenessReason::ProbeFailed),
            },
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    pub fn reason(&self) -> Option<LivenessReason> {
        self.reason
    }
}
