#![doc = include_str!("../README.md")]

use std::path::PathBuf;
use std::time::Duration;

mod fetcher;
mod stage;

pub use fetcher::{FetchOutcome, FetchTarget, Fetcher, TransportKind};
pub use stage::stage_fresh;

pub const DEFAULT_BASE_URL: &str = "https://download.geonames.org/export/dump/";
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(86_400);
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Stem of the master country index, fetched unconditionally at startup.
pub const MASTER_INDEX: &str = "countryInfo";

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub base_url: String,
    pub target_dir: PathBuf,
    /// Optional HTTP proxy as `(host, port)`.
    pub proxy: Option<(String, u16)>,
    pub http_timeout: Duration,
    pub stale_after: Duration,
    pub retry_wait: Duration,
    pub retry_limit: u32,
}

impl FetchSettings {
    pub fn new(base_url: impl Into<String>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            target_dir: target_dir.into(),
            proxy: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
            retry_wait: DEFAULT_RETRY_WAIT,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive {archive} is unusable: {source}")]
    Archive {
        archive: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("fetch of {} still failing after {attempts} attempts", describe_targets(.remaining))]
    RetryExhausted {
        attempts: u32,
        remaining: Vec<FetchTarget>,
    },
}

fn describe_targets(targets: &[FetchTarget]) -> String {
    targets
        .iter()
        .map(FetchTarget::file_name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result of a conditional refresh that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// The on-disk copy is still valid (fresh marker, or the server said
    /// not modified).
    Current,
    /// A new body was fetched and staged.
    Refreshed,
}

/// Fans fetches out concurrently, drives the bounded retry protocol and
/// decides staleness from the validator marker's age.
pub struct FetchCoordinator {
    settings: FetchSettings,
    fetcher: Fetcher,
}

impl FetchCoordinator {
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        std::fs::create_dir_all(&settings.target_dir)?;
        let fetcher = Fetcher::new(
            settings.base_url.clone(),
            settings.proxy.clone(),
            settings.http_timeout,
            settings.target_dir.clone(),
        )?;
        Ok(Self { settings, fetcher })
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// A validator marker is stale when its mtime is older than
    /// `stale_after`. An absent marker counts as infinitely old.
    pub fn is_stale(&self, stem: &str) -> bool {
        match std::fs::metadata(self.marker_path(stem)).and_then(|m| m.modified()) {
            Ok(modified) => match modified.elapsed() {
                Ok(age) => age > self.settings.stale_after,
                // marker from the future; treat as fresh
                Err(_) => false,
            },
            Err(_) => true,
        }
    }

    fn marker_path(&self, stem: &str) -> PathBuf {
        self.settings.target_dir.join(stem).join("etag")
    }

    fn prior_etag(&self, stem: &str) -> Option<String> {
        std::fs::read_to_string(self.marker_path(stem)).ok()
    }

    /// Fan out one fetch task per target and retry the failed subset until
    /// it drains or the attempt limit is reached.
    ///
    /// The wait sits between attempts rather than before the first one:
    /// first-attempt latency is the common case, the wait only rate-limits
    /// the upstream after a failure.
    pub async fn fetch_targets(
        &self,
        targets: Vec<FetchTarget>,
        conditional: bool,
    ) -> Result<Vec<FetchOutcome>, FetchError> {
        let mut pending = targets;
        let mut successes = Vec::with_capacity(pending.len());
        let mut attempt = 1u32;

        loop {
            let attempts = pending.drain(..).map(|target| {
                let prior = if conditional {
                    self.prior_etag(&target.stem)
                } else {
                    None
                };
                let fetcher = &self.fetcher;
                async move { fetcher.fetch(target, prior.as_deref()).await }
            });
            let outcomes = futures::future::join_all(attempts).await;

            let mut retry = Vec::new();
            for outcome in outcomes {
                match outcome {
                    done @ (FetchOutcome::Fresh { .. } | FetchOutcome::Unchanged { .. }) => {
                        successes.push(done)
                    }
                    FetchOutcome::HttpError {
                        target,
                        status,
                        description,
                    } => {
                        tracing::warn!(
                            file = %target.file_name(),
                            %status,
                            %description,
                            attempt,
                            "fetch failed"
                        );
                        retry.push(target);
                    }
                    FetchOutcome::TransportError { target, kind } => {
                        tracing::warn!(file = %target.file_name(), ?kind, attempt, "fetch failed");
                        retry.push(target);
                    }
                }
            }

            if retry.is_empty() {
                return Ok(successes);
            }
            if attempt >= self.settings.retry_limit {
                return Err(FetchError::RetryExhausted {
                    attempts: attempt,
                    remaining: retry,
                });
            }
            tokio::time::sleep(self.settings.retry_wait).await;
            attempt += 1;
            pending = retry;
        }
    }

    /// Refresh one file when its validator is stale; fresh bodies are
    /// staged (archives unpacked) into the target directory.
    pub async fn refresh_if_stale(
        &self,
        stem: &str,
        extension: &str,
    ) -> Result<Refresh, FetchError> {
        if !self.is_stale(stem) {
            return Ok(Refresh::Current);
        }
        let outcomes = self
            .fetch_targets(vec![FetchTarget::new(stem, extension)], true)
            .await?;

        let mut refresh = Refresh::Current;
        for outcome in outcomes {
            if let FetchOutcome::Fresh {
                target,
                etag,
                temp_path,
            } = outcome
            {
                stage::stage_fresh(&self.settings.target_dir, &target, etag.as_deref(), temp_path)?;
                refresh = Refresh::Refreshed;
            }
        }
        Ok(refresh)
    }

    /// Fetch the master country index through the same pipeline,
    /// unconditionally, and return the staged path.
    pub async fn load_master_index(&self) -> Result<PathBuf, FetchError> {
        let outcomes = self
            .fetch_targets(vec![FetchTarget::new(MASTER_INDEX, ".txt")], false)
            .await?;
        for outcome in outcomes {
            if let FetchOutcome::Fresh {
                target,
                etag,
                temp_path,
            } = outcome
            {
                stage::stage_fresh(&self.settings.target_dir, &target, etag.as_deref(), temp_path)?;
            }
        }
        Ok(self.master_index_path())
    }

    pub fn master_index_path(&self) -> PathBuf {
        self.settings
            .target_dir
            .join(MASTER_INDEX)
            .join(format!("{MASTER_INDEX}.txt"))
    }

    pub fn country_dir(&self, stem: &str) -> PathBuf {
        self.settings.target_dir.join(stem)
    }
}
