use swarmcast_core::{StationStatus, TopicKey};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::controller::StationController;
use crate::error::StationError;

type Reply<T> = oneshot::Sender<T>;

/// Requests from the presentation layer to the station task
#[derive(Debug)]
enum Command {
    Create {
        key: TopicKey,
        reply: Reply<Result<(), StationError>>,
    },
    Join {
        key: TopicKey,
        reply: Reply<Result<(), StationError>>,
    },
    Leave {
        reply: Reply<()>,
    },
    ApplySource {
        device: Option<String>,
        reply: Reply<Result<(), StationError>>,
    },
    Status {
        reply: Reply<StationStatus>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cloneable front end to a running station task
#[derive(Clone)]
pub struct StationHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl StationHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, StationError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| StationError::Stopped)?;
        response.await.map_err(|_| StationError::Stopped)
    }

    pub async fn create_station(&self, key: TopicKey) -> Result<(), StationError> {
        self.request(|reply| Command::Create { key, reply }).await?
    }

    pub async fn join_station(&self, key: TopicKey) -> Result<(), StationError> {
        self.request(|reply| Command::Join { key, reply }).await?
    }

    pub async fn leave_station(&self) -> Result<(), StationError> {
        self.request(|reply| Command::Leave { reply }).await
    }

    pub async fn apply_audio_source(&self, device: Option<String>) -> Result<(), StationError> {
        self.request(|reply| Command::ApplySource { device, reply })
            .await?
    }

    pub async fn status(&self) -> Result<StationStatus, StationError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Leave the station and stop the task
    pub async fn shutdown(&self) -> Result<(), StationError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Run `controller` on its own task
pub fn spawn_station(controller: StationController) -> (StationHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(controller, commands_rx));
    (
        StationHandle {
            commands: commands_tx,
        },
        task,
    )
}

async fn run(mut controller: StationController, mut commands: mpsc::UnboundedReceiver<Command>) {
    info!("Station task started");
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("All station handles dropped");
                    controller.leave_station().await;
                    break;
                };
                match command {
                    Command::Create { key, reply } => {
                        let _ = reply.send(controller.create_station(key).await);
                    }
                    Command::Join { key, reply } => {
                        let _ = reply.send(controller.join_station(key).await);
                    }
                    Command::Leave { reply } => {
                        controller.leave_station().await;
                        let _ = reply.send(());
                    }
                    Command::ApplySource { device, reply } => {
                        let _ = reply.send(controller.apply_audio_source(device).await);
                    }
                    Command::Status { reply } => {
                        let _ = reply.send(controller.status());
                    }
                    Command::Shutdown { reply } => {
                        controller.leave_station().await;
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            Some(event) = controller.next_event() => {
                controller.handle_event(event).await;
            }
        }
    }
    info!("Station task stopped");
}
