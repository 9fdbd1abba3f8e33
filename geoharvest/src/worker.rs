use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};

use geoharvest_core::hierarchy::{self, AdminHierarchy, HierarchyService};
use geoharvest_core::parse::{parse_country_file, ImportProgress, ParseOptions, ParsedCountry};
use geoharvest_core::{storage, CurateError, GeonameRecord};
use geoharvest_fetch::{FetchCoordinator, FetchError, FetchOutcome, FetchTarget};

use crate::settings::Settings;

/// Ingestion stages of one country, reported to the manager as the
/// worker moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CheckingForUpdate,
    LoadingCurated,
    Fetching,
    Extracting,
    Parsing,
    BuildingHierarchy,
    Enriching,
    Persisting,
}

/// Why a country's refresh failed. A failure never leaves its worker;
/// the manager only aggregates it for reporting.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerFailure {
    #[error("retries exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
    #[error("unusable archive: {0}")]
    Archive(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("curated file unusable: {0}")]
    Curated(String),
    #[error("filesystem: {0}")]
    Filesystem(String),
}

impl From<FetchError> for WorkerFailure {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::RetryExhausted { attempts, .. } => WorkerFailure::RetryExhausted { attempts },
            FetchError::Archive { .. } => WorkerFailure::Archive(error.to_string()),
            FetchError::Io(e) => WorkerFailure::Filesystem(e.to_string()),
            FetchError::Client(e) => WorkerFailure::Fetch(e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Phase { country: String, phase: Phase },
    ImportProgress { country: String, percent: u8 },
    ImportComplete { country: String },
    /// Curated records are in memory; the worker holds them as serving
    /// state until terminate.
    Ready { country: String, records: usize },
    Failed { country: String, failure: WorkerFailure },
}

pub struct CountryWorker {
    country: String,
    settings: Arc<Settings>,
    coordinator: Arc<FetchCoordinator>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    shutdown: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
}

impl CountryWorker {
    pub fn new(
        country: String,
        settings: Arc<Settings>,
        coordinator: Arc<FetchCoordinator>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        shutdown: watch::Receiver<bool>,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            country,
            settings,
            coordinator,
            events,
            shutdown,
            permits,
        }
    }

    /// Drive the country to ready or failed, then hold the curated
    /// records until the manager says terminate.
    pub async fn run(self) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut shutdown = self.shutdown.clone();

        let ingest = self.ingest(cancelled.clone());
        tokio::pin!(ingest);

        let outcome = tokio::select! {
            outcome = &mut ingest => outcome,
            _ = shutdown.changed() => {
                // let an in-flight parse observe the flag and unwind
                cancelled.store(true, Ordering::Relaxed);
                tracing::debug!(country = %self.country, "terminated mid-ingest");
                return;
            }
        };

        let _serving = match outcome {
            Ok(records) => {
                self.emit(WorkerEvent::ImportComplete {
                    country: self.country.clone(),
                });
                self.emit(WorkerEvent::Ready {
                    country: self.country.clone(),
                    records: records.len(),
                });
                Some(records)
            }
            Err(failure) => {
                tracing::error!(country = %self.country, %failure, "country refresh failed");
                self.emit(WorkerEvent::Failed {
                    country: self.country.clone(),
                    failure,
                });
                None
            }
        };

        let _ = shutdown.changed().await;
        tracing::debug!(country = %self.country, "stopped");
    }

    async fn ingest(&self, cancelled: Arc<AtomicBool>) -> Result<Vec<GeonameRecord>, WorkerFailure> {
        // spawn batching: only so many countries ingest at once
        let _permit = self.permits.clone().acquire_owned().await;

        self.phase(Phase::CheckingForUpdate);
        if !self.coordinator.is_stale(&self.country) {
            return self.load_curated();
        }

        self.phase(Phase::Fetching);
        let outcomes = self
            .coordinator
            .fetch_targets(vec![FetchTarget::new(self.country.clone(), ".zip")], true)
            .await?;

        match outcomes.into_iter().next() {
            Some(FetchOutcome::Fresh {
                target,
                etag,
                temp_path,
            }) => {
                self.phase(Phase::Extracting);
                geoharvest_fetch::stage_fresh(
                    &self.settings.target_dir,
                    &target,
                    etag.as_deref(),
                    temp_path,
                )?;
            }
            // not modified; the curated file on disk is still current
            _ => return self.load_curated(),
        }

        self.curate(cancelled).await
    }

    fn load_curated(&self) -> Result<Vec<GeonameRecord>, WorkerFailure> {
        self.phase(Phase::LoadingCurated);
        let path = storage::curated_path(&self.country_dir(), &self.country);
        storage::load_from(&path).map_err(|e| WorkerFailure::Curated(e.to_string()))
    }

    async fn curate(&self, cancelled: Arc<AtomicBool>) -> Result<Vec<GeonameRecord>, WorkerFailure> {
        self.phase(Phase::Parsing);
        let txt_path = self.country_dir().join(format!("{}.txt", self.country));
        let file_size = std::fs::metadata(&txt_path)
            .map_err(|e| WorkerFailure::Parse(format!("{}: {e}", txt_path.display())))?
            .len();

        let options = ParseOptions {
            country_code: self.country.clone(),
            min_population: self.settings.min_population,
            progress_fraction: self.settings.progress_fraction,
        };
        let events = self.events.clone();
        let country = self.country.clone();
        let path = txt_path.clone();
        let parsed = tokio::task::spawn_blocking(move || -> Result<ParsedCountry, CurateError> {
            let file = std::fs::File::open(&path)?;
            parse_country_file(
                std::io::BufReader::new(file),
                file_size,
                &options,
                |pulse| {
                    if let ImportProgress::Percent(percent) = pulse {
                        let _ = events.send(WorkerEvent::ImportProgress {
                            country: country.clone(),
                            percent,
                        });
                    }
                },
                &cancelled,
            )
        })
        .await
        .map_err(|e| WorkerFailure::Parse(format!("parse task: {e}")))?
        .map_err(|e| WorkerFailure::Parse(e.to_string()))?;

        self.phase(Phase::BuildingHierarchy);
        let service = HierarchyService::spawn(AdminHierarchy::from_admins(&parsed.admins));

        self.phase(Phase::Enriching);
        let enriched = hierarchy::enrich(&service, parsed.populated).await;
        // the per-country hierarchy dies with its last handle
        drop(service);

        self.phase(Phase::Persisting);
        storage::dump_to(&self.country_dir(), &self.country, &enriched)
            .map_err(|e| WorkerFailure::Filesystem(e.to_string()))?;

        // the raw text is transient; failing to remove it is not fatal
        if let Err(e) = std::fs::remove_file(&txt_path) {
            tracing::warn!(country = %self.country, "could not remove raw country file: {e}");
        }

        Ok(enriched)
    }

    fn country_dir(&self) -> PathBuf {
        self.settings.target_dir.join(&self.country)
    }

    fn phase(&self, phase: Phase) {
        self.emit(WorkerEvent::Phase {
            country: self.country.clone(),
            phase,
        });
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }
}
