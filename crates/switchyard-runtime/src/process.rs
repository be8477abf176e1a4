//! Process/OS layer seam.
//!
//! The runtime never touches OS APIs directly; it drives a [`ProcessControl`]
//! so tests and dry runs can substitute [`SimulatedProcessControl`].

use crate::instance::ResourceUsage;
use crate::stdio::StdioChannel;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{SwitchyardError, SwitchyardResult};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Everything needed to launch one agent process.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Program to execute; required by real process control.
    pub program: Option<String>,
    /// Program arguments.
    pub args: Vec<String>,
    /// Environment variables, layered over the parent's.
    pub environment: HashMap<String, String>,
    /// Working directory.
    pub working_dir: PathBuf,
}

/// Observed state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process exists; `responsive` is false while suspended or stuck.
    Alive {
        /// Whether the process is scheduling normally.
        responsive: bool,
    },
    /// Process terminated.
    Exited {
        /// Exit code when the platform reports one.
        code: Option<i32>,
    },
    /// No process with this id is known.
    Missing,
}

impl ProcessState {
    /// Whether the process still exists.
    pub fn is_alive(self) -> bool {
        matches!(self, ProcessState::Alive { .. })
    }
}

/// Platform-neutral process control.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Launch a process and return its id.
    async fn spawn(&self, spec: &LaunchSpec) -> SwitchyardResult<u32>;

    /// Ask the process to shut down cooperatively.
    async fn signal_shutdown(&self, pid: u32) -> SwitchyardResult<()>;

    /// Terminate the process forcefully.
    async fn kill(&self, pid: u32) -> SwitchyardResult<()>;

    /// Suspend every thread of the process.
    async fn suspend(&self, pid: u32) -> SwitchyardResult<()>;

    /// Resume a suspended process.
    async fn resume(&self, pid: u32) -> SwitchyardResult<()>;

    /// Current state of the process.
    async fn state(&self, pid: u32) -> ProcessState;

    /// Sample CPU and memory usage.
    async fn usage(&self, pid: u32) -> SwitchyardResult<ResourceUsage>;

    /// Wait up to `timeout` for the process to exit; true if it did.
    async fn wait_exit(&self, pid: u32, timeout: Duration) -> bool;

    /// Forget any handles kept for an exited process.
    async fn release(&self, pid: u32);
}

const EXIT_POLL: Duration = Duration::from_millis(50);

/// Real process control backed by `tokio::process` and `sysinfo`.
///
/// Children are spawned with piped stdio; each gets a [`StdioChannel`] that
/// endpoints can use to talk to the agent.
pub struct LocalProcessControl {
    children: Mutex<HashMap<u32, Child>>,
    channels: Mutex<HashMap<u32, Arc<StdioChannel>>>,
    suspended: Mutex<HashSet<u32>>,
    system: Mutex<System>,
}

impl LocalProcessControl {
    /// Create a controller with no children.
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            suspended: Mutex::new(HashSet::new()),
            system: Mutex::new(System::new()),
        }
    }

    /// Request channel of a spawned child.
    pub fn channel(&self, pid: u32) -> Option<Arc<StdioChannel>> {
        self.channels.lock().get(&pid).cloned()
    }

    /// Refresh one process in the shared `System` and run `f` on it.
    fn with_process<T>(&self, pid: u32, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        system.process(pid).map(f)
    }

    fn send_signal(&self, pid: u32, signal: Signal) -> SwitchyardResult<()> {
        match self.with_process(pid, |p| p.kill_with(signal)) {
            Some(Some(true)) => Ok(()),
            Some(Some(false)) => Err(SwitchyardError::Process(format!(
                "failed to deliver {:?} to process {}",
                signal, pid
            ))),
            Some(None) => Err(SwitchyardError::Process(format!(
                "signal {:?} is not supported on this platform",
                signal
            ))),
            None => Err(SwitchyardError::Process(format!("process {} not found", pid))),
        }
    }
}

impl Default for LocalProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for LocalProcessControl {
    async fn spawn(&self, spec: &LaunchSpec) -> SwitchyardResult<u32> {
        let program = spec
            .program
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| SwitchyardError::Process("agent declares no entrypoint".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(&spec.args)
            .envs(&spec.environment)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SwitchyardError::Process(format!("failed to spawn '{}': {}", program, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SwitchyardError::Process(format!("'{}' exited during spawn", program)))?;

        if let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) {
            self.channels
                .lock()
                .insert(pid, Arc::new(StdioChannel::attach(stdin, stdout)));
        }
        self.children.lock().insert(pid, child);

        info!(pid, program = %program, "agent process spawned");
        Ok(pid)
    }

    async fn signal_shutdown(&self, pid: u32) -> SwitchyardResult<()> {
        match self.send_signal(pid, Signal::Term) {
            Ok(()) => Ok(()),
            // No SIGTERM equivalent: closing stdin is the cooperative signal.
            Err(e) => {
                debug!(pid, error = %e, "falling back to closing stdin");
                if let Some(child) = self.children.lock().get_mut(&pid) {
                    drop(child.stdin.take());
                }
                self.channels.lock().remove(&pid);
                Ok(())
            }
        }
    }

    async fn kill(&self, pid: u32) -> SwitchyardResult<()> {
        let killed = self
            .children
            .lock()
            .get_mut(&pid)
            .map(|child| child.start_kill());
        match killed {
            Some(result) => result
                .map_err(|e| SwitchyardError::Process(format!("failed to kill {}: {}", pid, e))),
            None => self.send_signal(pid, Signal::Kill),
        }
    }

    async fn suspend(&self, pid: u32) -> SwitchyardResult<()> {
        self.send_signal(pid, Signal::Stop)?;
        self.suspended.lock().insert(pid);
        Ok(())
    }

    async fn resume(&self, pid: u32) -> SwitchyardResult<()> {
        self.send_signal(pid, Signal::Continue)?;
        self.suspended.lock().remove(&pid);
        Ok(())
    }

    async fn state(&self, pid: u32) -> ProcessState {
        let exited = {
            let mut children = self.children.lock();
            match children.get_mut(&pid) {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => Some(ProcessState::Exited {
                        code: status.code(),
                    }),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(pid, error = %e, "try_wait failed");
                        None
                    }
                },
                None => None,
            }
        };
        if let Some(state) = exited {
            return state;
        }

        let suspended = self.suspended.lock().contains(&pid);
        match self.with_process(pid, |p| p.status()) {
            Some(ProcessStatus::Zombie) | Some(ProcessStatus::Dead) => {
                ProcessState::Exited { code: None }
            }
            Some(ProcessStatus::Stop) | Some(ProcessStatus::UninterruptibleDiskSleep) => {
                ProcessState::Alive { responsive: false }
            }
            Some(_) => ProcessState::Alive {
                responsive: !suspended,
            },
            None => ProcessState::Missing,
        }
    }

    async fn usage(&self, pid: u32) -> SwitchyardResult<ResourceUsage> {
        self.with_process(pid, |p| ResourceUsage {
            cpu_percent: f64::from(p.cpu_usage()),
            memory_bytes: p.memory(),
            sampled_at: Some(Utc::now()),
        })
        .ok_or_else(|| SwitchyardError::Process(format!("process {} not found", pid)))
    }

    async fn wait_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.state(pid).await.is_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    async fn release(&self, pid: u32) {
        self.children.lock().remove(&pid);
        self.channels.lock().remove(&pid);
        self.suspended.lock().remove(&pid);
    }
}

#[derive(Debug, Clone)]
struct SimulatedProcess {
    exit_code: Option<Option<i32>>,
    suspended: bool,
    responsive: bool,
    usage: ResourceUsage,
}

/// Deterministic in-memory process control.
///
/// Spawns always succeed unless [`fail_next_spawn`](Self::fail_next_spawn)
/// is armed; processes live until stopped, killed or
/// [`force_exit`](Self::force_exit)ed.
#[derive(Debug)]
pub struct SimulatedProcessControl {
    processes: Mutex<HashMap<u32, SimulatedProcess>>,
    next_pid: AtomicU32,
    spawn_failure: Mutex<Option<String>>,
    ignore_shutdown: Mutex<bool>,
    state_delay: Mutex<Duration>,
}

impl SimulatedProcessControl {
    /// Create an empty simulator.
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(40_000),
            spawn_failure: Mutex::new(None),
            ignore_shutdown: Mutex::new(false),
            state_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Make the next `spawn` fail with `message`.
    pub fn fail_next_spawn(&self, message: impl Into<String>) {
        *self.spawn_failure.lock() = Some(message.into());
    }

    /// Make processes ignore cooperative shutdown so stops fall back to kill.
    pub fn set_ignore_shutdown(&self, ignore: bool) {
        *self.ignore_shutdown.lock() = ignore;
    }

    /// Delay every `state` query, reading the process only after the delay.
    pub fn set_state_delay(&self, delay: Duration) {
        *self.state_delay.lock() = delay;
    }

    /// Terminate a process behind the runtime's back.
    pub fn force_exit(&self, pid: u32, code: Option<i32>) {
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            p.exit_code = Some(code);
        }
    }

    /// Mark a live process as hung (or recovered).
    pub fn set_responsive(&self, pid: u32, responsive: bool) {
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            p.responsive = responsive;
        }
    }

    /// Set the usage reported for a process.
    pub fn set_usage(&self, pid: u32, cpu_percent: f64, memory_bytes: u64) {
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            p.usage.cpu_percent = cpu_percent;
            p.usage.memory_bytes = memory_bytes;
        }
    }

    /// Number of processes still alive.
    pub fn alive_count(&self) -> usize {
        self.processes
            .lock()
            .values()
            .filter(|p| p.exit_code.is_none())
            .count()
    }

    fn with_live<T>(
        &self,
        pid: u32,
        f: impl FnOnce(&mut SimulatedProcess) -> T,
    ) -> SwitchyardResult<T> {
        match self.processes.lock().get_mut(&pid) {
            Some(p) if p.exit_code.is_none() => Ok(f(p)),
            Some(_) => Err(SwitchyardError::Process(format!("process {} has exited", pid))),
            None => Err(SwitchyardError::Process(format!("process {} not found", pid))),
        }
    }
}

impl Default for SimulatedProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for SimulatedProcessControl {
    async fn spawn(&self, _spec: &LaunchSpec) -> SwitchyardResult<u32> {
        if let Some(message) = self.spawn_failure.lock().take() {
            return Err(SwitchyardError::Process(message));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().insert(
            pid,
            SimulatedProcess {
                exit_code: None,
                suspended: false,
                responsive: true,
                usage: ResourceUsage::default(),
            },
        );
        Ok(pid)
    }

    async fn signal_shutdown(&self, pid: u32) -> SwitchyardResult<()> {
        let ignore = *self.ignore_shutdown.lock();
        self.with_live(pid, |p| {
            if !ignore && !p.suspended {
                p.exit_code = Some(Some(0));
            }
        })
    }

    async fn kill(&self, pid: u32) -> SwitchyardResult<()> {
        self.with_live(pid, |p| p.exit_code = Some(None))
    }

    async fn suspend(&self, pid: u32) -> SwitchyardResult<()> {
        self.with_live(pid, |p| p.suspended = true)
    }

    async fn resume(&self, pid: u32) -> SwitchyardResult<()> {
        self.with_live(pid, |p| p.suspended = false)
    }

    async fn state(&self, pid: u32) -> ProcessState {
        let delay = *self.state_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.processes.lock().get(&pid) {
            Some(p) => match p.exit_code {
                Some(code) => ProcessState::Exited { code },
                None => ProcessState::Alive {
                    responsive: p.responsive && !p.suspended,
                },
            },
            None => ProcessState::Missing,
        }
    }

    async fn usage(&self, pid: u32) -> SwitchyardResult<ResourceUsage> {
        self.with_live(pid, |p| ResourceUsage {
            sampled_at: Some(Utc::now()),
            ..p.usage.clone()
        })
    }

    async fn wait_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.state(pid).await.is_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn release(&self, pid: u32) {
        self.processes.lock().remove(&pid);
    }
}
