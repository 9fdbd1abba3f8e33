use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::manager::{self, Command, Goodbye};
use crate::settings::Settings;

const MAX_RESTARTS: u32 = 1;
const RESTART_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("country manager restart budget exceeded (1 restart within 5s)")]
    RestartBudgetExceeded,
    #[error("supervisor is no longer running")]
    Stopped,
    #[error("shutdown protocol violated: {0}")]
    ShutdownProtocol(String),
}

enum SupervisorCommand {
    Shutdown { reply: oneshot::Sender<Goodbye> },
}

pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
    join: JoinHandle<Result<(), SupervisorError>>,
}

impl SupervisorHandle {
    /// Ask the manager for an orderly stop through the supervisor, then
    /// let the supervisor kill it.
    pub async fn shutdown(self) -> Result<Goodbye, SupervisorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SupervisorCommand::Shutdown { reply })
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        let goodbye = response.await.map_err(|_| SupervisorError::Stopped)?;
        let _ = self.join.await;
        Ok(goodbye)
    }

    /// Wait for the supervisor itself to give up.
    pub async fn wait(&mut self) -> Result<(), SupervisorError> {
        match (&mut self.join).await {
            Ok(result) => result,
            Err(e) => Err(SupervisorError::ShutdownProtocol(format!(
                "supervisor task: {e}"
            ))),
        }
    }
}

/// Start the root supervisor: one permanent child (the country manager),
/// restarted on crash at most once per five-second window. Exceeding the
/// budget takes the whole subsystem down.
pub fn spawn(settings: Arc<Settings>) -> SupervisorHandle {
    let (commands, commands_rx) = mpsc::channel(1);
    let join = tokio::spawn(run(settings, commands_rx));
    SupervisorHandle { commands, join }
}

async fn run(
    settings: Arc<Settings>,
    mut commands: mpsc::Receiver<SupervisorCommand>,
) -> Result<(), SupervisorError> {
    let mut restarts: Vec<Instant> = Vec::new();

    loop {
        let (manager_tx, manager_rx) = mpsc::channel(1);
        let mut child = tokio::spawn(manager::run(settings.clone(), manager_rx));

        tokio::select! {
            exit = &mut child => {
                match exit {
                    Ok(Ok(())) => {
                        // the manager only returns cleanly after a
                        // terminate we never sent
                        return Err(SupervisorError::ShutdownProtocol(
                            "country manager stopped without terminate".into(),
                        ));
                    }
                    Ok(Err(e)) => tracing::error!("country manager crashed: {e}"),
                    Err(e) => tracing::error!("country manager panicked: {e}"),
                }
                let now = Instant::now();
                restarts.retain(|at| now.duration_since(*at) < RESTART_PERIOD);
                if restarts.len() as u32 >= MAX_RESTARTS {
                    tracing::error!("country manager restart budget exceeded, giving up");
                    return Err(SupervisorError::RestartBudgetExceeded);
                }
                restarts.push(now);
                tracing::info!("restarting country manager");
            }
            command = commands.recv() => {
                let SupervisorCommand::Shutdown { reply } = match command {
                    Some(command) => command,
                    None => {
                        // caller vanished; brutal kill and leave
                        child.abort();
                        return Ok(());
                    }
                };
                let goodbye = orderly_stop(manager_tx, child).await?;
                let _ = reply.send(goodbye);
                return Ok(());
            }
        }
    }
}

/// Orderly per-country shutdown is the manager's job; the supervisor only
/// relays the terminate, collects the goodbye and then kills the child
/// without a graceful period.
async fn orderly_stop(
    manager: mpsc::Sender<Command>,
    child: JoinHandle<Result<(), manager::ManagerError>>,
) -> Result<Goodbye, SupervisorError> {
    let (reply, response) = oneshot::channel();
    if manager.send(Command::Terminate { reply }).await.is_err() {
        child.abort();
        return Err(SupervisorError::ShutdownProtocol(
            "country manager mailbox closed before terminate".into(),
        ));
    }
    match response.await {
        Ok(goodbye) => {
            child.abort();
            Ok(goodbye)
        }
        Err(_) => {
            child.abort();
            Err(SupervisorError::ShutdownProtocol(
                "country manager dropped the terminate reply".into(),
            ))
        }
    }
}
