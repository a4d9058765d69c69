//! Wires readers, the governor and the forwarder together.
//!
//! ```text
//! Attach ──► StreamReader task ──► ChunkBuffer ─┐
//! Attach ──► StreamReader task ──► ChunkBuffer ─┼──► Forwarder task ──► Aggregator
//!                                  (per source) ┘     (one, shared)
//! ```
//!
//! Readers and the forwarder never talk to each other directly; every handoff
//! goes through a buffer owned by the [`VolumeGovernor`].

use spewguard_core::buffer::BufferState;
use spewguard_core::reader::ReaderExit;
use spewguard_core::{
    Aggregator, Attach, ChunkBuffer, Config, Forwarder, SourceId, StreamReader, VolumeGovernor,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct ReaderTask {
    cancel: CancellationToken,
    handle: JoinHandle<ReaderExit>,
}

pub struct Pipeline {
    config: Config,
    governor: Arc<VolumeGovernor>,
    readers: Mutex<HashMap<SourceId, ReaderTask>>,
    cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

impl Pipeline {
    /// Build the governor and spawn the forwarder. Must be called inside a
    /// tokio runtime.
    pub fn start(config: Config, aggregator: Arc<dyn Aggregator>) -> Self {
        let governor = Arc::new(VolumeGovernor::new(
            config.pipeline.clone(),
            &config.forwarder,
        ));
        let cancel = CancellationToken::new();
        let forwarder = Forwarder::new(governor.clone(), aggregator, config.forwarder.clone());
        let forwarder = {
            let cancel = cancel.child_token();
            tokio::spawn(async move { forwarder.run(cancel).await })
        };

        tracing::info!(
            capacity_bytes = config.pipeline.capacity_bytes,
            drop_policy = ?config.pipeline.drop_policy,
            "pipeline: started"
        );
        Self {
            config,
            governor,
            readers: Mutex::new(HashMap::new()),
            cancel,
            forwarder,
        }
    }

    pub fn governor(&self) -> &Arc<VolumeGovernor> {
        &self.governor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register `source_id` and spawn its reader. Attaching an id that
    /// already has a reader cancels the old one and waits for it to finish
    /// before the new one starts, so a source never has two appenders.
    pub async fn attach_source<A>(&self, source_id: SourceId, attacher: A) -> Arc<ChunkBuffer>
    where
        A: Attach + 'static,
    {
        let previous = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&source_id);
        if let Some(previous) = previous {
            previous.cancel.cancel();
            let exit = previous.handle.await;
            tracing::debug!(source_id = %source_id, ?exit, "pipeline: previous reader stopped");
        }

        let buffer = self.governor.attach(source_id.clone());
        let reader = StreamReader::new(attacher, self.config.reader.clone());
        let cancel = self.cancel.child_token();
        let handle = {
            let (id, buffer, governor, cancel) = (
                source_id.clone(),
                buffer.clone(),
                self.governor.clone(),
                cancel.clone(),
            );
            tokio::spawn(async move { reader.run(id, buffer, governor, cancel).await })
        };

        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source_id.clone(), ReaderTask { cancel, handle });
        tracing::info!(source_id = %source_id, "pipeline: source attached");
        buffer
    }

    /// Stop reading `source_id`, give the forwarder up to
    /// `forwarder.detach_grace` to flush what is buffered, then remove it.
    pub async fn detach_source(&self, source_id: &SourceId) -> Option<BufferState> {
        let task = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id);
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }

        if let Some(buffer) = self.governor.buffer(source_id) {
            let grace = self.config.forwarder.detach_grace();
            if !buffer.wait_until_empty(grace).await {
                tracing::warn!(
                    source_id = %source_id,
                    pending_bytes = buffer.pending_bytes(),
                    ?grace,
                    "pipeline: detach grace elapsed with output still buffered"
                );
            }
        }
        self.governor.detach(source_id)
    }

    /// Wait for the reader of `source_id` to finish on its own (EOF or lost).
    pub async fn join_reader(&self, source_id: &SourceId) -> Option<ReaderExit> {
        let task = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id)?;
        task.handle.await.ok()
    }

    /// Detach every source (draining each within the grace period) and stop
    /// the forwarder.
    pub async fn shutdown(self) {
        let sources = self.governor.sources();
        for source_id in &sources {
            self.detach_source(source_id).await;
        }
        self.cancel.cancel();
        let _ = self.forwarder.await;
        tracing::info!(sources = sources.len(), "pipeline: shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spewguard_core::{GovernorState, InstanceOutput, MemoryAggregator, StreamKind};
    use std::io;
    use tokio::io::AsyncWriteExt;

    struct Once(Mutex<Option<InstanceOutput>>);

    impl Attach for Once {
        fn attach(&self, _: &SourceId) -> io::Result<InstanceOutput> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| io::ErrorKind::NotConnected.into())
        }
    }

    #[tokio::test]
    async fn forwards_output_until_eof() {
        let memory = Arc::new(MemoryAggregator::new());
        let pipeline = Pipeline::start(Config::defaults(), memory.clone());
        let (mut w, r) = tokio::io::duplex(64);
        let id = SourceId::new("app1");
        pipeline
            .attach_source(id.clone(), Once(Mutex::new(Some(InstanceOutput::stdout_only(r)))))
            .await;

        w.write_all(b"hello\n").await.unwrap();
        drop(w);
        assert_eq!(pipeline.join_reader(&id).await, Some(ReaderExit::Eof));

        let state = pipeline.detach_source(&id).await.unwrap();
        assert_eq!(state.pending_bytes, 0);
        let delivered = memory.delivered_for(&id);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].stream, StreamKind::Stdout);
        assert_eq!(&delivered[0].payload[..], b"hello\n");
        assert!(pipeline.governor().buffer(&id).is_none());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn detach_unknown_source_is_none() {
        let pipeline = Pipeline::start(Config::defaults(), Arc::new(MemoryAggregator::new()));
        assert!(pipeline.detach_source(&SourceId::new("ghost")).await.is_none());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn reattach_stops_previous_reader_first() {
        let memory = Arc::new(MemoryAggregator::new());
        let pipeline = Pipeline::start(Config::defaults(), memory.clone());
        let id = SourceId::new("app1");

        let (mut old_w, r) = tokio::io::duplex(64);
        let first = pipeline
            .attach_source(id.clone(), Once(Mutex::new(Some(InstanceOutput::stdout_only(r)))))
            .await;
        let (mut new_w, r) = tokio::io::duplex(64);
        let second = pipeline
            .attach_source(id.clone(), Once(Mutex::new(Some(InstanceOutput::stdout_only(r)))))
            .await;

        // The old reader has exited and released its pipe.
        assert!(old_w.write_all(b"stale\n").await.is_err());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            pipeline.governor().current_state(&id),
            Some(GovernorState::Normal)
        );

        new_w.write_all(b"fresh\n").await.unwrap();
        drop(new_w);
        assert_eq!(pipeline.join_reader(&id).await, Some(ReaderExit::Eof));
        pipeline.detach_source(&id).await;
        let payloads: Vec<_> = memory
            .delivered_for(&id)
            .iter()
            .map(|d| d.payload.clone())
            .collect();
        assert_eq!(payloads, vec![bytes::Bytes::from_static(b"fresh\n")]);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn reattach_after_lost_starts_fresh() {
        let pipeline = Pipeline::start(Config::defaults(), Arc::new(MemoryAggregator::new()));
        let id = SourceId::new("app1");
        let (w, r) = tokio::io::duplex(64);
        drop(w);
        pipeline
            .attach_source(id.clone(), Once(Mutex::new(Some(InstanceOutput::stdout_only(r)))))
            .await;
        pipeline.join_reader(&id).await;
        assert_eq!(
            pipeline.governor().current_state(&id),
            Some(GovernorState::Lost)
        );

        let (_w, r) = tokio::io::duplex(64);
        pipeline
            .attach_source(id.clone(), Once(Mutex::new(Some(InstanceOutput::stdout_only(r)))))
            .await;
        assert_eq!(
            pipeline.governor().current_state(&id),
            Some(GovernorState::Normal)
        );
        pipeline.shutdown().await;
    }
}
