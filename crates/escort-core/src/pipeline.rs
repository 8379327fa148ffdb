//! Per-sample processing
//!
//! Every accepted sample goes through the same three steps, in order:
//! durable last-location write, broadcast, anomaly evaluation. The sampler
//! and [`crate::WalkService::report_location`] both feed this pipeline.

use crate::error::EscortError;
use crate::monitor::{AnomalyMonitor, Evaluation};
use escort_broadcast::{Topic, Transport};
use escort_model::{LiveLocation, WalkId, WalkPayload};
use escort_store::{LocationWrite, WalkStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one sample
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Stored, published and evaluated
    Recorded(Evaluation),
    /// Older than the stored last location; dropped before publish
    Stale,
}

impl SampleOutcome {
    /// Whether the sample was stored
    #[inline]
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded(_))
    }
}

/// Write, publish, evaluate
#[derive(Debug)]
pub struct LocationPipeline {
    store: Arc<dyn WalkStore>,
    transport: Arc<dyn Transport>,
    monitor: Arc<AnomalyMonitor>,
}

impl LocationPipeline {
    /// Create the pipeline
    #[must_use]
    pub fn new(
        store: Arc<dyn WalkStore>,
        transport: Arc<dyn Transport>,
        monitor: Arc<AnomalyMonitor>,
    ) -> Self {
        Self {
            store,
            transport,
            monitor,
        }
    }

    /// Process one sample for `walk_id`
    ///
    /// A publish failure is logged and does not stop evaluation.
    ///
    /// # Errors
    /// - `Validation` for a malformed sample
    /// - `InvalidState` if the walk is not `active` or `alert`
    /// - whatever the monitor's alert append returns
    pub async fn process(
        &self,
        walk_id: WalkId,
        sample: LiveLocation,
    ) -> Result<SampleOutcome, EscortError> {
        sample.validate()?;

        let walk = match self.store.update_last_location(walk_id, sample.clone()).await? {
            LocationWrite::Applied(walk) => walk,
            LocationWrite::Stale { current } => {
                debug!(
                    %walk_id,
                    sample_ts = %sample.timestamp,
                    stored_ts = %current.timestamp,
                    "stale sample dropped"
                );
                return Ok(SampleOutcome::Stale);
            }
        };

        let topic = Topic::for_walk(walk_id);
        if let Err(e) = self
            .transport
            .publish(&topic, WalkPayload::Location(sample.clone()))
            .await
        {
            warn!(%walk_id, error = %e, "location not published");
        }

        let evaluation = self.monitor.evaluate(&walk, &sample).await?;
        Ok(SampleOutcome::Recorded(evaluation))
    }
}
