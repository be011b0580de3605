use chrono::{DateTime, Utc};
use ingest_core::store::HarvestedRecordStore;
use model::record::HarvestedRecord;
use model::task::HarvestMode;
use std::sync::Arc;
use tracing::warn;

/// Everything the engine needs to decide one record's fate.
#[derive(Debug, Clone)]
pub struct CategorizationParameters {
    pub harvest_mode: HarvestMode,
    pub dataset_id: String,
    pub record_id: String,
    /// Content hash reported by the harvester, when it computes one.
    pub record_fingerprint: Option<String>,
    /// The source repository's last-modified stamp for the record.
    pub record_date_stamp: DateTime<Utc>,
    /// Start of the harvest this record arrived in.
    pub current_harvest_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    EligibleForProcessing,
    AlreadyProcessed,
}

#[derive(Debug, Clone)]
pub struct CategorizationResult {
    pub category: Category,
    pub record_id: String,
}

impl CategorizationResult {
    pub fn should_be_processed(&self) -> bool {
        self.category == Category::EligibleForProcessing
    }

    pub fn should_be_dropped(&self) -> bool {
        self.category == Category::AlreadyProcessed
    }
}

/// Decides, per record, whether an incremental harvest needs to process it
/// again. Full harvests process everything; the engine still keeps the
/// harvest history current so a later incremental run has a baseline.
pub struct CategorizationEngine {
    harvested_records: Arc<dyn HarvestedRecordStore>,
}

impl CategorizationEngine {
    pub fn new(harvested_records: Arc<dyn HarvestedRecordStore>) -> Self {
        Self { harvested_records }
    }

    pub async fn categorize(&self, params: &CategorizationParameters) -> CategorizationResult {
        let category = match self.categorize_inner(params).await {
            Ok(category) => category,
            // A record wrongly processed twice is recoverable; a record
            // wrongly skipped is lost until the next full harvest.
            Err(err) => {
                warn!(
                    dataset_id = %params.dataset_id,
                    record_id = %params.record_id,
                    error = %err,
                    "harvest history unavailable, treating record as eligible"
                );
                Category::EligibleForProcessing
            }
        };
        CategorizationResult {
            category,
            record_id: params.record_id.clone(),
        }
    }

    async fn categorize_inner(
        &self,
        params: &CategorizationParameters,
    ) -> Result<Category, ingest_core::error::StoreError> {
        let previous = self
            .harvested_records
            .find(&params.dataset_id, &params.record_id)
            .await?;

        let category = match (&params.harvest_mode, &previous) {
            (HarvestMode::Full, _) => Category::EligibleForProcessing,
            (HarvestMode::Incremental, None) => Category::EligibleForProcessing,
            (HarvestMode::Incremental, Some(prev)) => {
                let fingerprint_changed = match (&params.record_fingerprint, &prev.latest_harvest_fingerprint) {
                    (Some(new), Some(old)) => new != old,
                    // Without a fingerprint on either side we cannot prove
                    // the record is unchanged.
                    _ => true,
                };
                if fingerprint_changed || params.record_date_stamp > prev.latest_harvest_date {
                    Category::EligibleForProcessing
                } else {
                    Category::AlreadyProcessed
                }
            }
        };

        let updated = HarvestedRecord {
            dataset_id: params.dataset_id.clone(),
            record_local_id: params.record_id.clone(),
            latest_harvest_date: params.current_harvest_date,
            latest_harvest_fingerprint: params.record_fingerprint.clone(),
            // Indexing progress belongs to a different pipeline leg and must
            // survive re-harvests.
            indexing_date: previous.as_ref().and_then(|p| p.indexing_date),
        };
        self.harvested_records.upsert(&updated).await?;

        Ok(category)
    }
}
