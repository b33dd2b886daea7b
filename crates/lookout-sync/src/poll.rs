//! One polling pass over a feed: fetch, extract, compare, normalize, deliver, persist.

use std::sync::Arc;

use chrono::Local;
use lookout_adapters::{extract, normalize, ExtractError, NormalizeError};
use lookout_core::{NormalizedRecord, SourceDescriptor};
use lookout_storage::{BodyFetcher, ChangeStore, FetchError, Novelty, StorageError};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::delivery::{DeliveryError, DeliverySink, PATCH_NOTES_CHANNEL};

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// First observation for the source; stored without announcing.
    FirstSeen,
    Unchanged,
    Delivered(NormalizedRecord),
}

pub struct PollWorker {
    fetcher: Arc<dyn BodyFetcher>,
    store: Arc<ChangeStore>,
    sink: Arc<dyn DeliverySink>,
    api_base: String,
    announce_first_seen: bool,
}

impl PollWorker {
    pub fn new(
        fetcher: Arc<dyn BodyFetcher>,
        store: Arc<ChangeStore>,
        sink: Arc<dyn DeliverySink>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            store,
            sink,
            api_base: api_base.into(),
            announce_first_seen: false,
        }
    }

    pub fn announce_first_seen(mut self, announce: bool) -> Self {
        self.announce_first_seen = announce;
        self
    }

    pub fn store(&self) -> &ChangeStore {
        &self.store
    }

    /// A delivery failure leaves the stored item untouched so the next tick retries.
    pub async fn poll(&self, descriptor: &SourceDescriptor) -> Result<PollOutcome, PollError> {
        let url = descriptor.resolve_endpoint(&self.api_base);
        let body = self.fetcher.get_bytes(&descriptor.name, &url).await?;
        let item = extract(&body, descriptor.shape)?;

        let key = descriptor.state_file.as_path();
        let _guard = self.store.lock(key).await;
        match self.store.check(key, &item).await {
            Novelty::Unchanged => return Ok(PollOutcome::Unchanged),
            Novelty::FirstSeen if !self.announce_first_seen => {
                self.store.persist(key, &item).await?;
                info!(state_file = %key.display(), "initialized last-seen record");
                return Ok(PollOutcome::FirstSeen);
            }
            Novelty::FirstSeen | Novelty::Changed => {}
        }

        let record = normalize(item.clone(), descriptor, Local::now().date_naive())?;
        self.sink.deliver_record(PATCH_NOTES_CHANNEL, &record).await?;

        if let Err(err) = self.store.persist(key, &item).await {
            warn!(error = %err, "update delivered but not persisted");
        }
        Ok(PollOutcome::Delivered(record))
    }

    /// Like [`PollWorker::poll`], with failures logged instead of returned.
    pub async fn run(&self, descriptor: &SourceDescriptor) -> Option<NormalizedRecord> {
        let span = info_span!("poll", source = %descriptor.name);
        async {
            match self.poll(descriptor).await {
                Ok(PollOutcome::Delivered(record)) => {
                    info!(title = %record.title, "new update delivered");
                    Some(record)
                }
                Ok(outcome) => {
                    debug!(?outcome, "no new update");
                    None
                }
                Err(err) => {
                    warn!(error = %err, "poll failed");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Polls every descriptor in order. Returns how many updates were delivered.
    pub async fn run_all(&self, descriptors: &[SourceDescriptor]) -> usize {
        info!(sources = descriptors.len(), "polling feeds");
        let mut delivered = 0usize;
        for descriptor in descriptors {
            if self.run(descriptor).await.is_some() {
                delivered += 1;
            }
        }
        delivered
    }
}
