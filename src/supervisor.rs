//! Instance supervision.
//!
//! The supervisor owns one child process, feeds its output into the
//! [`Pipeline`], and probes it on an interval. Restart decisions are made by
//! [`decide`] from [`LivenessSignal`]s only, so a source that is merely
//! backpressured or degraded can never get its instance restarted.

use crate::pipeline::Pipeline;
use spewguard_core::config::SupervisorConfig;
use spewguard_core::liveness::ProbeOutcome;
use spewguard_core::{LivenessReason, LivenessSignal, SourceId};
use spewguard_feeds::ChildAttacher;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no command to supervise")]
    EmptyCommand,
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Restart(LivenessReason),
    /// Unhealthy, but the restart budget is spent.
    GiveUp(LivenessReason),
}

/// Restart iff some signal is unhealthy, bounded by `max_restarts`.
pub fn decide(signals: &[LivenessSignal], restarts: u32, max_restarts: u32) -> Decision {
    let Some(reason) = signals
        .iter()
        .find(|s| !s.healthy())
        .and_then(LivenessSignal::reason)
    else {
        return Decision::Keep;
    };
    if restarts < max_restarts {
        Decision::Restart(reason)
    } else {
        Decision::GiveUp(reason)
    }
}

pub struct Supervisor {
    pipeline: Arc<Pipeline>,
    source_id: SourceId,
    command: Vec<String>,
    config: SupervisorConfig,
    child: Option<Child>,
    instance_id: String,
    restarts: u32,
}

impl Supervisor {
    pub fn new(
        pipeline: Arc<Pipeline>,
        source_id: SourceId,
        command: Vec<String>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            pipeline,
            source_id,
            command,
            config,
            child: None,
            instance_id: String::new(),
            restarts: 0,
        }
    }

    /// Stable for the lifetime of one instance; changes only on restart.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(SupervisorError::EmptyCommand)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: program.clone(),
                source,
            })?;

        self.pipeline
            .attach_source(self.source_id.clone(), ChildAttacher::take_from(&mut child))
            .await;
        self.instance_id = Uuid::new_v4().to_string();
        tracing::info!(
            source_id = %self.source_id,
            instance_id = %self.instance_id,
            pid = child.id(),
            "supervisor: instance started"
        );
        self.child = Some(child);
        Ok(())
    }

    /// Independent health probe: is the process still running?
    pub fn probe(&mut self) -> ProbeOutcome {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => ProbeOutcome::Passed,
            _ => ProbeOutcome::Failed,
        }
    }

    /// Probe once, combine with the governor's liveness view, and act.
    pub async fn tick(&mut self) -> Result<Decision, SupervisorError> {
        let mut signals = vec![LivenessSignal::from_probe(
            self.source_id.clone(),
            self.probe(),
        )];
        signals.extend(self.pipeline.governor().liveness(&self.source_id));

        let decision = decide(&signals, self.restarts, self.config.max_restarts);
        match decision {
            Decision::Keep => {}
            Decision::Restart(reason) => {
                tracing::warn!(
                    source_id = %self.source_id,
                    instance_id = %self.instance_id,
                    ?reason,
                    "supervisor: instance unhealthy, restarting"
                );
                self.restart().await?;
            }
            Decision::GiveUp(reason) => {
                tracing::error!(
                    source_id = %self.source_id,
                    restarts = self.restarts,
                    ?reason,
                    "supervisor: restart budget exhausted"
                );
            }
        }
        Ok(decision)
    }

    async fn restart(&mut self) -> Result<(), SupervisorError> {
        self.kill().await;
        self.pipeline.detach_source(&self.source_id).await;
        self.restarts += 1;
        self.start().await
    }

    /// Probe on `probe_interval` until cancelled or the restart budget runs out.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        let mut interval = tokio::time::interval(self.config.probe_interval());
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Decision::GiveUp(_) = self.tick().await? {
                        break;
                    }
                }
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Kill the instance and flush whatever it already wrote.
    pub async fn stop(&mut self) {
        self.kill().await;
        self.pipeline.detach_source(&self.source_id).await;
    }

    async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(source_id = %self.source_id, error = %e, "supervisor: kill failed");
            }
        }
    }
}
