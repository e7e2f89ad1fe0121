//! Worker supervision: one engine process plus its bridge connection.
//!
//! A [`WorkerSupervisor`] is a handle to a dedicated control task (the
//! actor) that exclusively owns one [`OfficeProcess`] and one
//! [`Connection`]. Every lifecycle operation is a command serialized
//! through the actor's queue, so a timeout-triggered restart can never
//! interleave with a normal stop on the same worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::bridge::{Connection, WorkerAddress};
use crate::config::PoolConfig;
use crate::error::{ConnectError, PoolError, ProcessError};
use crate::process::{OfficeProcess, RetrySchedule};

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
}

enum Command {
    Start(oneshot::Sender<Result<(), PoolError>>),
    Stop(oneshot::Sender<Result<(), PoolError>>),
    Restart(oneshot::Sender<Result<(), PoolError>>),
    RestartDueToTimeout,
    RestartDueToLostConnection,
}

/// Handle to one worker's control task.
pub struct WorkerSupervisor {
    command_tx: mpsc::Sender<Command>,
    connection: Arc<Connection>,
    state_rx: watch::Receiver<SupervisorState>,
}

impl WorkerSupervisor {
    /// Creates the supervisor and spawns its control task. The worker
    /// process is not launched until [`start`](Self::start).
    pub fn new(address: WorkerAddress, config: &PoolConfig) -> Self {
        let connection = Arc::new(Connection::new(address.clone()));
        let process = OfficeProcess::new(
            address.clone(),
            config.engine_binary.clone(),
            &config.working_dir,
            config.kill_existing_process,
        );
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(SupervisorState::Stopped);

        let actor = SupervisorActor {
            address,
            process,
            connection: Arc::clone(&connection),
            state_tx,
            retry_interval: config.process_retry_interval,
            retry_timeout: config.process_retry_timeout,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            command_tx,
            connection,
            state_rx,
        }
    }

    /// The bridge connection owned by this supervisor.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Whether the bridge connection is established.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Launches the process and waits until the bridge is connected.
    pub async fn start(&self) -> Result<(), PoolError> {
        self.call(Command::Start).await
    }

    /// Stops the process (graceful, escalating) and tears down the
    /// bridge and profile directory.
    pub async fn stop(&self) -> Result<(), PoolError> {
        self.call(Command::Stop).await
    }

    /// Stop followed by start; used for max-tasks restarts.
    pub async fn restart(&self) -> Result<(), PoolError> {
        self.call(Command::Restart).await
    }

    /// Force-terminates a possibly hung worker without waiting. The
    /// resulting disconnection drives the entry's recovery path.
    pub fn restart_due_to_timeout(&self) {
        self.send_async(Command::RestartDueToTimeout);
    }

    /// Reaps a crashed worker and starts a fresh one, without waiting.
    /// Recovery failures are logged, never surfaced.
    pub fn restart_due_to_lost_connection(&self) {
        self.send_async(Command::RestartDueToLostConnection);
    }

    async fn call(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), PoolError>>) -> Command,
    ) -> Result<(), PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| PoolError::Stopped)?;
        reply_rx.await.map_err(|_| PoolError::Stopped)?
    }

    fn send_async(&self, command: Command) {
        if self.command_tx.try_send(command).is_err() {
            warn!("Supervisor command queue unavailable; dropping restart request");
        }
    }
}

/// The control task state: exclusive owner of process and connection.
struct SupervisorActor {
    address: WorkerAddress,
    process: OfficeProcess,
    connection: Arc<Connection>,
    state_tx: watch::Sender<SupervisorState>,
    retry_interval: Duration,
    retry_timeout: Duration,
}

impl SupervisorActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<Command>) {
        while let Some(command) = command_rx.recv().await {
            match command {
                Command::Start(reply) => {
                    let _ = reply.send(self.do_start().await);
                }
                Command::Stop(reply) => {
                    let _ = reply.send(self.do_stop().await);
                }
                Command::Restart(reply) => {
                    self.set_state(SupervisorState::Restarting);
                    let result = match self.do_stop().await {
                        Ok(()) => self.do_start().await,
                        Err(err) => Err(err),
                    };
                    let _ = reply.send(result);
                }
                Command::RestartDueToTimeout => {
                    self.set_state(SupervisorState::Restarting);
                    warn!(
                        address = %self.address,
                        "Force-terminating hung worker after task timeout"
                    );
                    if let Err(err) = self
                        .process
                        .terminate(self.retry_interval, self.retry_timeout)
                        .await
                    {
                        error!(
                            address = %self.address,
                            error = %err,
                            "Could not terminate hung worker"
                        );
                    }
                    // The disconnection this causes triggers the
                    // entry's lost-connection recovery.
                }
                Command::RestartDueToLostConnection => {
                    self.do_recover().await;
                }
            }
        }

        // All handles dropped: best-effort teardown.
        self.connection.disconnect().await;
        if self.process.is_running() {
            let _ = self
                .process
                .terminate(self.retry_interval, self.retry_timeout)
                .await;
        }
        self.process.delete_profile_dir();
    }

    fn set_state(&self, state: SupervisorState) {
        let _ = self.state_tx.send(state);
    }

    fn startup_error(
        &self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> PoolError {
        PoolError::Startup {
            address: self.address.to_string(),
            source: Box::new(source),
        }
    }

    /// Launches the process and retries the bridge connect until it
    /// succeeds or the retry budget elapses.
    async fn do_start(&mut self) -> Result<(), PoolError> {
        self.set_state(SupervisorState::Starting);

        if let Err(err) = self.process.start().await {
            self.set_state(SupervisorState::Stopped);
            return Err(self.startup_error(err));
        }

        match self.connect_with_retry().await {
            Ok(()) => {
                self.set_state(SupervisorState::Running);
                info!(address = %self.address, "Worker started and connected");
                Ok(())
            }
            Err(err) => {
                warn!(
                    address = %self.address,
                    error = %err,
                    "Could not establish connection; rolling back process start"
                );
                if let Err(term_err) = self
                    .process
                    .terminate(self.retry_interval, self.retry_timeout)
                    .await
                {
                    error!(
                        address = %self.address,
                        error = %term_err,
                        "Could not terminate worker after failed startup"
                    );
                }
                self.process.delete_profile_dir();
                self.set_state(SupervisorState::Stopped);
                Err(self.startup_error(err))
            }
        }
    }

    /// Retries `connect` at the configured interval while the worker
    /// refuses the dial, aborting early if the process died.
    async fn connect_with_retry(&mut self) -> Result<(), ConnectError> {
        let schedule = RetrySchedule::new(self.retry_interval, self.retry_timeout);
        loop {
            match self.connection.connect().await {
                Ok(()) => return Ok(()),
                Err(err @ ConnectError::ConnectFailed { .. }) => {
                    if !self.process.is_running() {
                        warn!(
                            address = %self.address,
                            "Engine process exited before accepting a connection"
                        );
                        return Err(err);
                    }
                    if schedule.expired() {
                        return Err(err);
                    }
                    schedule.wait().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Graceful stop: ask the engine to exit over the bridge, tear the
    /// bridge down, ensure the process exited (escalating to a kill),
    /// and delete the profile directory.
    async fn do_stop(&mut self) -> Result<(), PoolError> {
        self.set_state(SupervisorState::Stopping);

        if self.connection.is_connected() {
            if let Err(err) = self.connection.request_shutdown().await {
                debug!(
                    address = %self.address,
                    error = %err,
                    "Graceful engine shutdown request failed"
                );
            }
        }
        self.connection.disconnect().await;

        let result = self.ensure_exited().await;
        self.process.delete_profile_dir();
        self.set_state(SupervisorState::Stopped);
        result.map_err(PoolError::from)
    }

    /// Polls for process exit; escalates to termination on timeout.
    async fn ensure_exited(&mut self) -> Result<(), ProcessError> {
        if !self.process.is_started() {
            return Ok(());
        }
        match self
            .process
            .exit_code(self.retry_interval, self.retry_timeout)
            .await
        {
            Ok(code) => {
                info!(address = %self.address, code, "Engine process exited");
                Ok(())
            }
            Err(ProcessError::RetryTimeout { .. }) => {
                debug!(address = %self.address, "Process still alive; terminating");
                let code = self
                    .process
                    .terminate(self.retry_interval, self.retry_timeout)
                    .await?;
                info!(address = %self.address, code, "Engine process terminated");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Lost-connection recovery: reap whatever is left of the old
    /// process, then start fresh.
    async fn do_recover(&mut self) {
        self.set_state(SupervisorState::Restarting);

        if let Err(err) = self.ensure_exited().await {
            error!(
                address = %self.address,
                error = %err,
                "Could not reap worker process after lost connection"
            );
        }
        self.process.delete_profile_dir();

        if let Err(err) = self.do_start().await {
            error!(
                address = %self.address,
                error = %err,
                "Could not restart worker after lost connection"
            );
        }
    }
}
