use crate::config::ServiceConfig;
use crate::env::service_environment;
use crate::error::SupervisorError;
use crate::locator::BinaryLocator;
use crate::proxy::ProxyTarget;
use crate::readiness::{cancelled, PollOutcome, ReadinessPhase, ReadinessPoller};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Runtime record of the supervised process.
///
/// `ready` is only ever true while `running` is true; every path that clears
/// `running` clears `ready` under the same write lock.
struct SupervisedProcess {
    running: bool,
    ready: bool,
    phase: ReadinessPhase,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    /// Cancels the process and its background tasks for the current run
    cancel: Option<watch::Sender<bool>>,
    /// Incremented on every start so tasks from an earlier run cannot touch a later one
    generation: u64,
}

impl SupervisedProcess {
    fn new() -> Self {
        Self {
            running: false,
            ready: false,
            phase: ReadinessPhase::Stopped,
            pid: None,
            started_at: None,
            cancel: None,
            generation: 0,
        }
    }

    fn clear(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        self.running = false;
        self.ready = false;
        self.phase = ReadinessPhase::Stopped;
        self.pid = None;
    }
}

/// Which pipe an output line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Status snapshot of a supervised service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub phase: ReadinessPhase,
    pub running: bool,
    pub ready: bool,
    pub pid: Option<u32>,
    pub port: u16,
    pub started_at: Option<DateTime<Utc>>,
}

/// Supervises a single service subprocess.
///
/// Like the registry, a supervisor lives behind an `Arc`: [`new`](ServiceSupervisor::new)
/// returns `Arc<Self>` and [`start`](ServiceSupervisor::start) clones it into
/// the background tasks it spawns.
///
/// ```ignore
/// let supervisor = ServiceSupervisor::new(config);
/// supervisor.start()?;
/// // later, once the health endpoint answers
/// assert!(supervisor.is_running());
/// supervisor.stop();
/// ```
pub struct ServiceSupervisor {
    /// Replaced as a whole by `reconfigure`, never mutated in place
    config: RwLock<Arc<ServiceConfig>>,
    state: RwLock<SupervisedProcess>,
}

impl ServiceSupervisor {
    pub fn new(config: ServiceConfig) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            state: RwLock::new(SupervisedProcess::new()),
        })
    }

    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    /// Current configuration
    pub fn config(&self) -> Arc<ServiceConfig> {
        Arc::clone(&self.config.read())
    }

    /// Proxy target for the currently configured port
    pub fn target(&self) -> ProxyTarget {
        ProxyTarget::from_config(&self.config())
    }

    /// Spawn the service process.
    ///
    /// Returns once the process is spawned; readiness is established in the
    /// background. Fails if the service is already running, the binary cannot
    /// be found, or the OS refuses to spawn it.
    pub fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let config = self.config();
        if self.state.read().running {
            return Err(SupervisorError::AlreadyRunning(config.name.clone()));
        }

        // Searched without holding the state lock so readers are not blocked on disk access
        let binary = BinaryLocator::new(&config.search_dirs)
            .locate(&config.binary)
            .map_err(|e| SupervisorError::BinaryNotFound {
                name: e.name,
                searched: e.searched,
            })?;
        let environment = service_environment(&config);

        // Lock order: state, then config (see `reconfigure`)
        let mut state = self.state.write();
        if state.running {
            return Err(SupervisorError::AlreadyRunning(config.name.clone()));
        }
        if !Arc::ptr_eq(&config, &*self.config.read()) {
            // Reconfigured while the binary was being located
            drop(state);
            return self.start();
        }

        info!(service = %config.name, binary = %binary.display(), port = config.port, "Starting service");

        let mut cmd = Command::new(&binary);
        cmd.args(&config.args);
        cmd.env_clear();
        cmd.envs(environment.passthrough);
        for var in environment.vars {
            if let Some((key, value)) = var.split_once('=') {
                cmd.env(key, value);
            }
        }
        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            path: binary.clone(),
            source,
        })?;
        let pid = child.id();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        state.generation += 1;
        let generation = state.generation;
        state.running = true;
        state.ready = false;
        state.phase = ReadinessPhase::Polling;
        state.pid = pid;
        state.started_at = Some(Utc::now());
        state.cancel = Some(cancel_tx);
        drop(state);

        info!(service = %config.name, pid, "Service process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_output(
                config.name.clone(),
                OutputStream::Stdout,
                stdout,
                cancel_rx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(
                config.name.clone(),
                OutputStream::Stderr,
                stderr,
                cancel_rx.clone(),
            ));
        }

        tokio::spawn(Arc::clone(self).watch_process(child, generation, cancel_rx.clone()));

        let poller = ReadinessPoller::new(&config);
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = poller.run(cancel_rx).await;
            supervisor.finish_polling(generation, outcome);
        });

        Ok(())
    }

    /// Stop the service.
    ///
    /// Signals cancellation and clears the running and ready flags without
    /// waiting for the process to exit. Does nothing if not running.
    pub fn stop(&self) {
        let mut state = self.state.write();
        if !state.running {
            debug!(service = %self.config.read().name, "Stop requested but service is not running");
            return;
        }
        let pid = state.pid;
        state.clear();
        drop(state);

        info!(service = %self.config.read().name, pid, "Service stopped");
    }

    /// True when the process is running and has passed its readiness check
    pub fn is_running(&self) -> bool {
        let state = self.state.read();
        state.running && state.ready
    }

    pub fn status(&self) -> ServiceStatus {
        let config = self.config();
        let state = self.state.read();
        ServiceStatus {
            name: config.name.clone(),
            phase: state.phase,
            running: state.running,
            ready: state.ready,
            pid: state.pid,
            port: config.port,
            started_at: state.started_at,
        }
    }

    /// Replace the configuration. Only allowed while the service is stopped;
    /// the next `start` and every subsequent proxied request use the new values.
    pub fn reconfigure(&self, config: ServiceConfig) -> Result<(), SupervisorError> {
        let state = self.state.write();
        if state.running {
            return Err(SupervisorError::AlreadyRunning(self.config.read().name.clone()));
        }
        info!(service = %config.name, port = config.port, "Service reconfigured");
        *self.config.write() = Arc::new(config);
        drop(state);
        Ok(())
    }

    fn finish_polling(&self, generation: u64, outcome: PollOutcome) {
        let mut state = self.state.write();
        if state.generation != generation || !state.running {
            return;
        }
        match outcome {
            PollOutcome::Ready { .. } => {
                state.ready = true;
                state.phase = ReadinessPhase::Ready;
            }
            PollOutcome::Exhausted { .. } => {
                state.phase = ReadinessPhase::Exhausted;
            }
            PollOutcome::Cancelled => {}
        }
    }

    /// Own the child until it exits or the run is cancelled
    async fn watch_process(
        self: Arc<Self>,
        mut child: Child,
        generation: u64,
        mut cancel: watch::Receiver<bool>,
    ) {
        let name = self.name();

        tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => warn!(service = %name, ?status, "Service process exited"),
                    Err(e) => error!(service = %name, error = %e, "Failed waiting for service process"),
                }
                let mut state = self.state.write();
                if state.generation == generation && state.running {
                    state.clear();
                }
            }
            _ = cancelled(&mut cancel) => {
                if let Err(e) = child.start_kill() {
                    debug!(service = %name, error = %e, "Process already gone when cancelled");
                }
                match child.wait().await {
                    Ok(status) => info!(service = %name, ?status, "Service process terminated"),
                    Err(e) => warn!(service = %name, error = %e, "Error waiting for service to exit"),
                }
            }
        }
    }
}

/// Forward each line of a process pipe to the log until EOF or cancellation.
///
/// Returns the number of lines relayed.
pub async fn relay_output<R>(
    service: String,
    stream: OutputStream,
    reader: R,
    mut cancel: watch::Receiver<bool>,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut count = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    count += 1;
                    info!(target: "tandemgate::service_output", service = %service, stream = stream.as_str(), "{}", line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(service = %service, stream = stream.as_str(), error = %e, "Output relay read error");
                    break;
                }
            },
            _ = cancelled(&mut cancel) => break,
        }
    }

    count
}

/// All supervised services, keyed by mount name
pub struct ServiceRegistry {
    supervisors: BTreeMap<String, Arc<ServiceSupervisor>>,
}

impl ServiceRegistry {
    pub fn new(configs: Vec<ServiceConfig>) -> Arc<Self> {
        let supervisors = configs
            .into_iter()
            .map(|config| (config.name.clone(), ServiceSupervisor::new(config)))
            .collect();
        Arc::new(Self { supervisors })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceSupervisor>> {
        self.supervisors.get(name)
    }

    pub fn supervisors(&self) -> impl Iterator<Item = (&String, &Arc<ServiceSupervisor>)> {
        self.supervisors.iter()
    }

    /// Start every service; one service failing does not prevent the others
    pub fn start_all(&self) -> Vec<(String, Result<(), SupervisorError>)> {
        self.supervisors
            .iter()
            .map(|(name, supervisor)| (name.clone(), supervisor.start()))
            .collect()
    }

    pub fn stop_all(&self) {
        for supervisor in self.supervisors.values() {
            supervisor.stop();
        }
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.supervisors.values().map(|s| s.status()).collect()
    }
}
