//! Spawning child processes and the worker loop that runs inside them.
//!
//! A child is the current executable (or a configured program) started
//! again with a role in its environment and one end of a socket pair
//! inherited as a raw descriptor. [`bootstrap`] recognises the role at the
//! top of `main` and never returns in a child.

use std::env;
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::{self, Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, error, info, trace, warn};

use crate::config::LaunchConfig;
use crate::connection::Connection;
use crate::errors::{HyperError, Result};
use crate::manager;
use crate::pool::panic_message;
use crate::protocol::{Ready, Task, TaskOutcome, WorkerMessage, WorkerOptions};
use crate::queue::ConnectionQueue;
use crate::reduction::{Callable, Registry, Value};

pub(crate) const ENV_ROLE: &str = "HYPERPOOL_ROLE";
pub(crate) const ENV_FD: &str = "HYPERPOOL_FD";

const EXIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Worker,
    Manager,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Worker => "worker",
            Role::Manager => "manager",
        }
    }

    fn parse(s: &str) -> Result<Role> {
        match s {
            "worker" => Ok(Role::Worker),
            "manager" => Ok(Role::Manager),
            other => Err(HyperError::Config(format!("unknown process role '{}'", other))),
        }
    }
}

/// Entry point for spawned children. Call it first thing in `main` of any
/// binary that starts a process pool or a manager, with a registry built
/// the same way as the parent's. Returns immediately in the parent.
pub fn bootstrap(registry: &Registry) {
    let role = match env::var(ENV_ROLE) {
        Ok(role) => role,
        Err(_) => return,
    };
    env::remove_var(ENV_ROLE);
    let code = match child_main(&role, registry) {
        Ok(()) => 0,
        Err(e) => {
            error!(%role, error = %e, "child process failed");
            1
        }
    };
    process::exit(code);
}

fn child_main(role: &str, registry: &Registry) -> Result<()> {
    let role = Role::parse(role)?;
    let fd: RawFd = env::var(ENV_FD)
        .map_err(|_| HyperError::Config(format!("{} is not set", ENV_FD)))?
        .parse()
        .map_err(|_| HyperError::Config(format!("{} is not a descriptor", ENV_FD)))?;
    env::remove_var(ENV_FD);
    // Grandchildren spawned by task code must not inherit the channel.
    set_cloexec(fd, true)?;
    let mut conn = unsafe { Connection::from_raw_fd(fd) };
    conn.send_message(&Ready { pid: process::id() })?;
    debug!(role = role.as_str(), pid = process::id(), "child ready");
    match role {
        Role::Worker => worker_main(registry, conn),
        Role::Manager => manager::serve(registry, conn),
    }
}

fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Start a child in `role` and wait for its `Ready` frame.
pub(crate) fn spawn_child(
    role: Role,
    launch: &LaunchConfig,
    timeout: Option<Duration>,
) -> Result<(Child, Connection, u32)> {
    let (parent_end, child_end) = Connection::pair()?;
    let fd = child_end.as_raw_fd();
    let program = launch.program()?;
    let mut command = Command::new(&program);
    command
        .args(&launch.args)
        .env(ENV_ROLE, role.as_str())
        .env(ENV_FD, fd.to_string());
    unsafe {
        command.pre_exec(move || set_cloexec(fd, false));
    }
    let mut child = command
        .spawn()
        .map_err(|e| HyperError::Spawn(format!("{}: {}", program.display(), e)))?;
    drop(child_end);

    let mut conn = parent_end;
    let failure = match conn.recv_message_timeout::<Ready>(timeout) {
        Ok(Some(ready)) => {
            trace!(role = role.as_str(), pid = ready.pid, "child handshake done");
            return Ok((child, conn, ready.pid));
        }
        Ok(None) => "child exited before the handshake".to_string(),
        Err(HyperError::Timeout) => "no handshake within the connection timeout".to_string(),
        Err(e) => format!("handshake failed: {}", e),
    };
    reap(&mut child, true);
    Err(HyperError::Spawn(failure))
}

fn reap(child: &mut Child, kill: bool) {
    if kill {
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// Why a dispatched task produced no outcome.
#[derive(Debug)]
pub(crate) enum RunError {
    Crashed(String),
    TimedOut,
}

/// Parent-side handle on one worker process.
pub(crate) struct WorkerProcess {
    child: Option<Child>,
    queue: ConnectionQueue<WorkerMessage>,
    pid: u32,
}

impl WorkerProcess {
    pub(crate) fn spawn(
        launch: &LaunchConfig,
        options: WorkerOptions,
        timeout: Option<Duration>,
    ) -> Result<WorkerProcess> {
        let (child, conn, pid) = spawn_child(Role::Worker, launch, timeout)?;
        let mut worker = WorkerProcess {
            child: Some(child),
            queue: ConnectionQueue::new(conn)?,
            pid,
        };
        let started = worker
            .queue
            .put(&WorkerMessage::Start(options))
            .and_then(|_| worker.queue.get_timeout(timeout));
        match started {
            Ok(Some(WorkerMessage::Started)) => Ok(worker),
            Ok(Some(WorkerMessage::InitFailed(reason))) => {
                worker.kill();
                Err(HyperError::Spawn(format!("initializer failed: {}", reason)))
            }
            Ok(other) => {
                worker.kill();
                Err(HyperError::Spawn(format!("unexpected start reply {:?}", other)))
            }
            Err(e) => {
                worker.kill();
                Err(HyperError::Spawn(format!("worker did not start: {}", e)))
            }
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Send one encoded task frame and wait for its outcome.
    pub(crate) fn run<H>(
        &mut self,
        frame: &[u8],
        task: crate::pool::TaskId,
        task_timeout: Option<Duration>,
        heartbeat_timeout: Duration,
        mut on_heartbeat: H,
    ) -> std::result::Result<TaskOutcome, RunError>
    where
        H: FnMut(),
    {
        if let Err(e) = self.queue.put_encoded(frame) {
            return Err(RunError::Crashed(format!("dispatch failed: {}", e)));
        }
        let deadline = task_timeout.map(|t| Instant::now() + t);
        let mut last_seen = Instant::now();
        loop {
            let now = Instant::now();
            let mut wait = heartbeat_timeout.saturating_sub(now - last_seen);
            if let Some(d) = deadline {
                wait = wait.min(d.saturating_duration_since(now));
            }
            match self.queue.get_timeout(Some(wait.max(Duration::from_millis(1)))) {
                Ok(Some(WorkerMessage::Outcome(outcome))) if outcome.task_id == task => {
                    return Ok(outcome)
                }
                Ok(Some(WorkerMessage::Outcome(outcome))) => {
                    return Err(RunError::Crashed(format!(
                        "outcome for task {} while running task {}",
                        outcome.task_id, task
                    )))
                }
                Ok(Some(WorkerMessage::Heartbeat)) => {
                    last_seen = Instant::now();
                    on_heartbeat();
                }
                Ok(Some(other)) => {
                    return Err(RunError::Crashed(format!("unexpected message {:?}", other)))
                }
                Ok(None) => return Err(RunError::Crashed("connection closed".into())),
                Err(HyperError::Timeout) => {
                    let now = Instant::now();
                    if deadline.map_or(false, |d| now >= d) {
                        return Err(RunError::TimedOut);
                    }
                    if now - last_seen >= heartbeat_timeout {
                        return Err(RunError::Crashed("missed heartbeats".into()));
                    }
                }
                Err(e) => return Err(RunError::Crashed(e.to_string())),
            }
        }
    }

    /// Ask the worker to exit, killing it if it is still around after
    /// `grace`.
    pub(crate) fn shutdown(mut self, grace: Duration) {
        let _ = self.queue.put(&WorkerMessage::Shutdown);
        let _ = self.queue.close();
        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + grace;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(pid = self.pid, %status, "worker exited");
                        return;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                    _ => {
                        warn!(pid = self.pid, "worker ignored shutdown, killing it");
                        reap(&mut child, true);
                        return;
                    }
                }
            }
        }
    }

    pub(crate) fn kill(&mut self) {
        self.queue.shutdown();
        if let Some(mut child) = self.child.take() {
            reap(&mut child, true);
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Run a registered callable in this process, capturing panics.
pub(crate) fn call(
    registry: &Registry,
    callable: &Callable,
    args: Vec<Value>,
) -> std::result::Result<Value, String> {
    let f = registry
        .function(callable.name())
        .ok_or_else(|| format!("function '{}' is not registered", callable.name()))?;
    let args = match callable {
        Callable::Function { .. } => args,
        Callable::Closure { captured, .. } => {
            let mut all = captured.clone();
            all.extend(args);
            all
        }
    };
    match panic::catch_unwind(AssertUnwindSafe(|| f(args))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn execute(registry: &Registry, task: Task) -> TaskOutcome {
    let outcome = call(registry, &task.callable, task.args).and_then(|value| {
        registry
            .check_transferable(&value)
            .map(|_| value)
            .map_err(|e| format!("result {}", e))
    });
    TaskOutcome {
        task_id: task.id,
        outcome,
        completed_at: SystemTime::now(),
    }
}

fn worker_main(registry: &Registry, conn: Connection) -> Result<()> {
    let queue = Arc::new(ConnectionQueue::<WorkerMessage>::new(conn)?);
    let options = match queue.get()? {
        Some(WorkerMessage::Start(options)) => options,
        Some(other) => {
            return Err(HyperError::Protocol(format!(
                "expected start message, got {:?}",
                other
            )))
        }
        None => return Ok(()),
    };
    if let Some(init) = &options.initializer {
        if let Err(reason) = call(registry, init, Vec::new()) {
            queue.put(&WorkerMessage::InitFailed(reason))?;
            return Ok(());
        }
    }
    queue.put(&WorkerMessage::Started)?;

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, stop.clone())?;
    }
    let interval = Duration::from_millis(options.heartbeat_interval_ms.max(1));
    let busy = Arc::new(AtomicBool::new(false));
    let (stop_beats, heartbeat) = spawn_heartbeat(queue.clone(), busy.clone(), interval)?;
    info!(slot = options.slot, pid = process::id(), "worker started");

    let served = serve(registry, &queue, &busy, &stop, interval);
    drop(stop_beats);
    let _ = heartbeat.join();
    let tasks = served?;
    info!(slot = options.slot, tasks, "worker exiting");
    Ok(())
}

fn serve(
    registry: &Registry,
    queue: &ConnectionQueue<WorkerMessage>,
    busy: &AtomicBool,
    stop: &AtomicBool,
    poll: Duration,
) -> Result<u64> {
    let mut tasks = 0u64;
    while !stop.load(Ordering::Relaxed) {
        let message = match queue.get_timeout(Some(poll)) {
            Ok(message) => message,
            Err(HyperError::Timeout) => continue,
            Err(e) => return Err(e),
        };
        match message {
            None | Some(WorkerMessage::Shutdown) => break,
            Some(WorkerMessage::Task(task)) => {
                trace!(task = %task.id, callable = task.callable.name(), "task received");
                busy.store(true, Ordering::SeqCst);
                let outcome = execute(registry, task);
                busy.store(false, Ordering::SeqCst);
                queue.put(&WorkerMessage::Outcome(outcome))?;
                tasks += 1;
            }
            Some(other) => warn!(?other, "ignoring unexpected message"),
        }
    }
    Ok(tasks)
}

/// Beats only while a task runs. Dropping the returned sender stops it.
fn spawn_heartbeat(
    queue: Arc<ConnectionQueue<WorkerMessage>>,
    busy: Arc<AtomicBool>,
    interval: Duration,
) -> Result<(Sender<()>, JoinHandle<()>)> {
    let (tx, rx) = bounded::<()>(0);
    let handle = thread::Builder::new()
        .name("hyperpool-heartbeat".into())
        .spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if busy.load(Ordering::SeqCst)
                        && queue.put(&WorkerMessage::Heartbeat).is_err()
                    {
                        return;
                    }
                }
                _ => return,
            }
        })?;
    Ok((tx, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let mut r = Registry::new();
        r.register_fn("add", |args| {
            let total: i64 = args.iter().filter_map(Value::as_int).sum();
            Ok(Value::Int(total))
        });
        r.register_fn("fail", |_| anyhow::bail!("bad input"));
        r.register_fn("explode", |_| panic!("exploded"));
        r.register_fn("leak", |_| Ok(Value::Local(crate::reduction::LocalObject::new(1u8))));
        r
    }

    fn task(callable: Callable, args: Vec<Value>) -> Task {
        Task {
            id: crate::pool::TaskId(1),
            callable,
            args,
            submitted_at: SystemTime::now(),
        }
    }

    #[test]
    fn closures_prepend_captured_values() {
        let r = registry();
        let out = execute(
            &r,
            task(Callable::closure("add", vec![Value::Int(40)]), vec![Value::Int(2)]),
        );
        assert_eq!(out.outcome, Ok(Value::Int(42)));
        assert!(out.success());
    }

    #[test]
    fn errors_and_panics_become_failed_outcomes() {
        let r = registry();
        let failed = execute(&r, task("fail".into(), vec![]));
        assert_eq!(failed.outcome, Err("bad input".to_string()));
        let panicked = execute(&r, task("explode".into(), vec![]));
        assert_eq!(panicked.outcome, Err("exploded".to_string()));
        let missing = execute(&r, task("nope".into(), vec![]));
        assert!(missing.outcome.unwrap_err().contains("not registered"));
    }

    #[test]
    fn untransferable_results_are_reported() {
        let r = registry();
        let out = execute(&r, task("leak".into(), vec![]));
        assert!(out.outcome.unwrap_err().contains("process-local"));
    }

    #[test]
    fn roles_round_trip_through_the_environment_form() {
        for role in [Role::Worker, Role::Manager] {
            assert_eq!(Role::parse(role.as_str()).unwrap(), role);
        }
        assert!(Role::parse("janitor").is_err());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let launch = LaunchConfig {
            program: Some("/nonexistent/hyperpool-worker".into()),
            args: vec![],
        };
        let err = spawn_child(Role::Worker, &launch, Some(Duration::from_millis(200))).unwrap_err();
        assert!(matches!(err, HyperError::Spawn(_)));
    }

    #[test]
    fn child_without_handshake_times_out() {
        let launch = LaunchConfig {
            program: Some("/bin/sleep".into()),
            args: vec!["5".into()],
        };
        let started = Instant::now();
        let err = spawn_child(Role::Worker, &launch, Some(Duration::from_millis(100))).unwrap_err();
        assert!(matches!(err, HyperError::Spawn(msg) if msg.contains("timeout")));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
