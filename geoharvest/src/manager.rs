use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;

use geoharvest_core::records::{parse_country_index, CountryInfo};
use geoharvest_fetch::{FetchCoordinator, FetchError};

use crate::settings::Settings;
use crate::worker::{CountryWorker, WorkerEvent, WorkerFailure};

/// Grace period for workers to acknowledge terminate.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Control messages accepted by the manager.
#[derive(Debug)]
pub enum Command {
    Terminate { reply: oneshot::Sender<Goodbye> },
}

/// Shutdown acknowledgment: how many workers stopped within the grace
/// period and how many were left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Goodbye {
    pub stopped: usize,
    pub stragglers: usize,
}

/// Failures that take the whole manager down. Per-country failures are
/// not among them; those stay inside their worker.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("master index: {0}")]
    MasterIndex(#[from] FetchError),
    #[error("master index unreadable: {0}")]
    MasterIndexUnreadable(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
enum CountryState {
    Ready { records: usize },
    Failed(WorkerFailure),
}

/// Bootstrap the master index, dispatch one worker per country and pump
/// progress until told to terminate.
pub async fn run(
    settings: Arc<Settings>,
    mut commands: mpsc::Receiver<Command>,
) -> Result<(), ManagerError> {
    let coordinator = Arc::new(FetchCoordinator::new(settings.fetch_settings())?);

    let index_path = coordinator.load_master_index().await?;
    let index = std::fs::read_to_string(&index_path)?;
    let countries = select_countries(parse_country_index(&index), settings.countries.as_deref());
    tracing::info!(count = countries.len(), "dispatching country workers");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let permits = Arc::new(Semaphore::new(settings.spawn_batch_size.max(1)));

    let mut workers: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(countries.len());
    for info in &countries {
        let worker = CountryWorker::new(
            info.code.clone(),
            settings.clone(),
            coordinator.clone(),
            events_tx.clone(),
            shutdown_rx.clone(),
            permits.clone(),
        );
        workers.push((info.code.clone(), tokio::spawn(worker.run())));
    }
    drop(events_tx);

    let mut outcomes: HashMap<String, CountryState> = HashMap::new();
    let mut summarized = workers.is_empty();
    let mut events_open = true;

    loop {
        tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    forward(&event);
                    match event {
                        WorkerEvent::Ready { country, records } => {
                            outcomes.insert(country, CountryState::Ready { records });
                        }
                        WorkerEvent::Failed { country, failure } => {
                            outcomes.insert(country, CountryState::Failed(failure));
                        }
                        _ => {}
                    }
                    if !summarized && outcomes.len() == workers.len() {
                        summarized = true;
                        summarize(&outcomes);
                    }
                }
                None => events_open = false,
            },
            command = commands.recv() => {
                // a dropped command channel is treated like terminate,
                // there is just nobody left to answer
                let reply = match command {
                    Some(Command::Terminate { reply }) => Some(reply),
                    None => None,
                };
                let goodbye = shutdown_workers(shutdown_tx, workers).await;
                if let Some(reply) = reply {
                    let _ = reply.send(goodbye);
                }
                return Ok(());
            }
        }
    }
}

/// The progress sink: every worker message is forwarded as a log line.
fn forward(event: &WorkerEvent) {
    match event {
        WorkerEvent::Phase { country, phase } => {
            tracing::info!(%country, ?phase, "starting")
        }
        WorkerEvent::ImportProgress { country, percent } => {
            tracing::debug!(%country, percent, "file import")
        }
        WorkerEvent::ImportComplete { country } => {
            tracing::info!(%country, "file import complete")
        }
        WorkerEvent::Ready { country, records } => {
            tracing::info!(%country, records, "ready")
        }
        WorkerEvent::Failed { country, failure } => {
            tracing::warn!(%country, %failure, "failed")
        }
    }
}

fn summarize(outcomes: &HashMap<String, CountryState>) {
    let mut ready = 0usize;
    let mut failed = 0usize;
    for (country, state) in outcomes {
        match state {
            CountryState::Ready { records } => {
                ready += 1;
                tracing::info!(%country, records, "country ready");
            }
            CountryState::Failed(failure) => {
                failed += 1;
                tracing::warn!(%country, %failure, "country failed");
            }
        }
    }
    tracing::info!(ready, failed, "startup complete");
}

fn select_countries(index: Vec<CountryInfo>, allow: Option<&[String]>) -> Vec<CountryInfo> {
    match allow {
        None => index,
        Some(allow) => {
            let allow: Vec<String> = allow.iter().map(|code| code.to_uppercase()).collect();
            index
                .into_iter()
                .filter(|info| allow.contains(&info.code.to_uppercase()))
                .collect()
        }
    }
}

async fn shutdown_workers(
    shutdown: watch::Sender<bool>,
    workers: Vec<(String, JoinHandle<()>)>,
) -> Goodbye {
    tracing::info!(workers = workers.len(), "broadcasting terminate");
    let _ = shutdown.send(true);

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    let mut stopped = 0usize;
    let mut stragglers = 0usize;
    for (country, handle) in workers {
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(())) => stopped += 1,
            Ok(Err(e)) => {
                tracing::warn!(%country, "worker ended abnormally: {e}");
                stopped += 1;
            }
            Err(_) => {
                tracing::warn!(%country, "worker did not acknowledge terminate in time");
                stragglers += 1;
            }
        }
    }
    Goodbye {
        stopped,
        stragglers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(code: &str) -> CountryInfo {
        CountryInfo {
            code: code.into(),
            name: code.into(),
            continent: "EU".into(),
        }
    }

    #[test]
    fn allow_list_filters_case_insensitively() {
        let index = vec![info("GB"), info("FR"), info("LI")];
        let allow = vec!["li".to_string(), "GB".to_string()];
        let selected = select_countries(index, Some(&allow));
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].code, "GB");
        assert_eq!(selected[1].code, "LI");
    }

    #[test]
    fn no_allow_list_keeps_everything() {
        let index = vec![info("GB"), info("FR")];
        assert_eq!(select_countries(index, None).len(), 2);
    }
}
