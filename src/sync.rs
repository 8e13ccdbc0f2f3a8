//! Reconciliation between the USPTO API and the local store.
//!
//! A sync is abort-on-required, tolerate-on-optional: the core application
//! fetch must succeed or nothing is written, while each of the six
//! supplemental fetches fails independently without blocking the others
//! or the final consolidated write.

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{Database, DbError, PatentPatch};
use crate::uspto::{
    calculate_expiration_date, validate_app_number, ApplicationMetadata, EventFact,
    PatentDataSource, UsptoError,
};

/// Settings key for the pause between records in a batch sync.
pub const DELAY_SETTING: &str = "sync_delay_seconds";
/// Settings key recording when the last batch sync finished.
pub const LAST_SYNC_SETTING: &str = "last_sync_time";

const DEFAULT_DELAY_SECS: f64 = 1.0;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("application {0} is not tracked")]
    UnknownRecord(String),
    #[error("application {0} is already tracked")]
    AlreadyTracked(String),
    #[error("a sync is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Remote(#[from] UsptoError),
    #[error(transparent)]
    Store(#[from] DbError),
}

/// Result of syncing one application.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub metadata: ApplicationMetadata,
    /// Events not previously stored for this application.
    pub new_events: Vec<EventFact>,
    pub total_events: usize,
}

/// One failed record within a batch sync.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub app_number: String,
    pub error: String,
}

/// A newly stored event, tagged with its application.
#[derive(Debug, Clone)]
pub struct NewEventNotice {
    pub app_number: String,
    pub event: EventFact,
}

/// Result of syncing every tracked application.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// True unless every record failed. A batch where most records came
    /// through is still useful, so one bad application number or a
    /// transient per-record failure does not mark the whole run failed.
    pub success: bool,
    pub updated: usize,
    pub new_events: Vec<NewEventNotice>,
    pub errors: Vec<SyncFailure>,
}

/// The engine holds the store and a remote client, and guarantees at most
/// one sync in flight: a second caller gets `AlreadyRunning` instead of
/// interleaving writes with the scheduled loop.
pub struct SyncEngine<C: PatentDataSource> {
    db: Database,
    client: C,
    gate: tokio::sync::Mutex<()>,
}

impl<C: PatentDataSource> SyncEngine<C> {
    pub fn new(db: Database, client: C) -> Self {
        Self {
            db,
            client,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Sync one tracked application. Fails fast if a sync is already
    /// running or the application is not tracked.
    pub async fn sync_record(&self, identifier: &str) -> Result<SyncOutcome, SyncError> {
        let _guard = self.gate.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        let app = validate_app_number(identifier)?;
        let patent = self
            .db
            .get_patent(&app)?
            .ok_or_else(|| SyncError::UnknownRecord(app.clone()))?;
        self.sync_one(patent.id, &app).await
    }

    /// Start tracking a new application and run its first sync. The row
    /// is removed again if the required fetch fails, so a typo never
    /// leaves an empty shell behind.
    pub async fn track_new(&self, identifier: &str) -> Result<(i64, SyncOutcome), SyncError> {
        let _guard = self.gate.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        let app = validate_app_number(identifier)?;
        let id = self
            .db
            .add_patent(&app)?
            .ok_or_else(|| SyncError::AlreadyTracked(app.clone()))?;

        match self.sync_one(id, &app).await {
            Ok(outcome) => Ok((id, outcome)),
            Err(e) => {
                if let Err(remove_err) = self.db.remove_patent(id) {
                    warn!(app_number = %app, error = %remove_err, "could not undo failed add");
                }
                Err(e)
            }
        }
    }

    /// Sync every tracked application sequentially, pausing between
    /// records to stay within remote rate limits.
    pub async fn sync_all(&self) -> Result<BatchOutcome, SyncError> {
        let _guard = self.gate.try_lock().map_err(|_| SyncError::AlreadyRunning)?;

        let patents = self.db.list_patents()?;
        let total = patents.len();
        let delay = self.inter_record_delay()?;

        let mut outcome = BatchOutcome {
            success: true,
            updated: 0,
            new_events: Vec::new(),
            errors: Vec::new(),
        };

        for (i, patent) in patents.iter().enumerate() {
            if i > 0 && delay > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
            }
            match self.sync_one(patent.id, &patent.app_number).await {
                Ok(one) => {
                    outcome.updated += 1;
                    outcome
                        .new_events
                        .extend(one.new_events.into_iter().map(|event| NewEventNotice {
                            app_number: patent.app_number.clone(),
                            event,
                        }));
                }
                Err(e) => {
                    warn!(app_number = %patent.app_number, error = %e, "sync failed");
                    outcome.errors.push(SyncFailure {
                        app_number: patent.app_number.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        outcome.success = outcome.errors.is_empty() || outcome.errors.len() < total;
        if let Err(e) = self
            .db
            .set_setting(LAST_SYNC_SETTING, &Utc::now().to_rfc3339())
        {
            warn!(error = %e, "could not record last sync time");
        }
        info!(
            total,
            updated = outcome.updated,
            new_events = outcome.new_events.len(),
            errors = outcome.errors.len(),
            "batch sync finished"
        );
        Ok(outcome)
    }

    fn inter_record_delay(&self) -> Result<f64, SyncError> {
        Ok(self
            .db
            .get_setting(DELAY_SETTING)?
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0)
            .unwrap_or(DEFAULT_DELAY_SECS))
    }

    /// The sync proper: required fetch, six tolerated optional fetches,
    /// one consolidated record write, snapshot replacement, event ingest.
    async fn sync_one(&self, patent_id: i64, app: &str) -> Result<SyncOutcome, SyncError> {
        let data = self.client.fetch_application(app).await?;
        let mut patch = metadata_patch(&data.metadata);

        match self.client.fetch_adjustment(app).await {
            Ok(adjustment) => {
                let adjustment = adjustment.unwrap_or_default();
                patch.pta_total_days = Some(adjustment.total_days);
                patch.pta_a_delay = Some(adjustment.a_delay);
                patch.pta_b_delay = Some(adjustment.b_delay);
                patch.pta_c_delay = Some(adjustment.c_delay);
                patch.pta_applicant_delay = Some(adjustment.applicant_delay);
                patch.pta_overlap_delay = Some(adjustment.overlap_delay);
                patch.pta_non_overlap_delay = Some(adjustment.non_overlap_delay);
                patch.pta_history = Some(adjustment.history_json);
                if let Some(expiration) =
                    calculate_expiration_date(&data.metadata.filing_date, adjustment.total_days)
                {
                    patch.expiration_date = Some(expiration);
                }
            }
            Err(e) => warn!(app_number = %app, error = %e, "adjustment fetch failed"),
        }

        match self.client.fetch_attorney(app).await {
            Ok(attorneys) => {
                patch.attorney_json =
                    Some(serde_json::to_string(&attorneys).unwrap_or_else(|_| "[]".to_string()));
            }
            Err(e) => warn!(app_number = %app, error = %e, "attorney fetch failed"),
        }

        match self.client.fetch_foreign_priority(app).await {
            Ok(claims) => {
                patch.foreign_priority_json =
                    Some(serde_json::to_string(&claims).unwrap_or_else(|_| "[]".to_string()));
            }
            Err(e) => warn!(app_number = %app, error = %e, "foreign priority fetch failed"),
        }

        patch.last_synced = Some(Utc::now().to_rfc3339());
        self.db.update_patent(patent_id, &patch)?;

        match self.client.fetch_continuity(app).await {
            Ok(continuity) => self.db.replace_continuity(patent_id, &continuity)?,
            Err(e) => warn!(app_number = %app, error = %e, "continuity fetch failed"),
        }
        match self.client.fetch_documents(app).await {
            Ok(documents) => self.db.upsert_documents(patent_id, &documents)?,
            Err(e) => warn!(app_number = %app, error = %e, "documents fetch failed"),
        }
        match self.client.fetch_assignment(app).await {
            Ok(assignments) => self.db.replace_assignments(patent_id, &assignments)?,
            Err(e) => warn!(app_number = %app, error = %e, "assignment fetch failed"),
        }

        let total_events = data.events.len();
        let mut new_events = Vec::new();
        for event in &data.events {
            if self
                .db
                .add_event(patent_id, &event.code, &event.description, &event.date)?
            {
                new_events.push(event.clone());
            }
        }

        info!(
            app_number = %app,
            new_events = new_events.len(),
            total_events,
            "synced application"
        );

        Ok(SyncOutcome {
            metadata: data.metadata,
            new_events,
            total_events,
        })
    }
}

fn metadata_patch(m: &ApplicationMetadata) -> PatentPatch {
    let mut patch = PatentPatch::default();
    patch.title = Some(m.title.clone());
    patch.applicant = Some(m.applicant.clone());
    patch.inventor = Some(m.inventor.clone());
    patch.filing_date = Some(m.filing_date.clone());
    patch.current_status = Some(m.current_status.clone());
    patch.status_date = Some(m.status_date.clone());
    patch.status_code = m.status_code;
    patch.examiner = Some(m.examiner.clone());
    patch.art_unit = Some(m.art_unit.clone());
    patch.customer_number = Some(m.customer_number.clone());
    patch.patent_number = Some(m.patent_number.clone());
    patch.grant_date = Some(m.grant_date.clone());
    patch.publication_number = Some(m.publication_number.clone());
    patch.publication_date = Some(m.publication_date.clone());
    patch.publication_date_bag = Some(m.publication_date_bag.clone());
    patch.publication_sequence_number_bag = Some(m.publication_sequence_number_bag.clone());
    patch.publication_category_bag = Some(m.publication_category_bag.clone());
    patch.pct_publication_number = Some(m.pct_publication_number.clone());
    patch.pct_publication_date = Some(m.pct_publication_date.clone());
    patch.international_registration_number =
        Some(m.international_registration_number.clone());
    patch.international_registration_publication_date =
        Some(m.international_registration_publication_date.clone());
    patch.national_stage_indicator = Some(m.national_stage_indicator);
    patch.application_type_code = Some(m.application_type_code.clone());
    patch.application_type_label = Some(m.application_type_label.clone());
    patch.application_type_category = Some(m.application_type_category.clone());
    patch.uspc_class = Some(m.uspc_class.clone());
    patch.uspc_subclass = Some(m.uspc_subclass.clone());
    patch.uspc_symbol = Some(m.uspc_symbol.clone());
    patch.cpc_classification_bag = Some(m.cpc_classification_bag.clone());
    patch.docket_number = Some(m.docket_number.clone());
    patch.confirmation_number = Some(m.confirmation_number.clone());
    patch.effective_filing_date = Some(m.effective_filing_date.clone());
    patch.first_inventor_to_file = Some(m.first_inventor_to_file.clone());
    patch.entity_status = Some(m.entity_status.clone());
    patch.small_entity_indicator = Some(m.small_entity_indicator);
    patch.applicant_bag = Some(m.applicant_bag.clone());
    patch.inventor_bag = Some(m.inventor_bag.clone());
    patch
}
