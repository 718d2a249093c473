//! Start/stop wrapper for long-running worker loops.
//!
//! A [`Task`] owns one named worker thread. The loop receives a [`StopSignal`] and must
//! return once it fires; nothing is ever killed. A panic escaping the loop is fatal: the
//! crash is logged as a [`CrashReport`] and the process exits with status 101.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

/// Frames kept in a crash report backtrace.
const MAX_TRACE_FRAMES: usize = 24;
const CRASH_EXIT_CODE: i32 = 101;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task '{0}' is already running")]
    AlreadyRunning(String),
    #[error("task '{0}' has no loop function")]
    NoLoop(String),
    #[error("task '{0}' is not initialized")]
    NotInitialized(String),
    #[error("task '{0}' is not running")]
    NotRunning(String),
}

/// Cooperative stop signal handed to a task loop.
pub struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    /// Channel to include in a `select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Non-blocking check.
    pub fn is_set(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Sleep up to `timeout`; returns `true` if stop was requested meanwhile.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

/// What a crashed task leaves behind.
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub task: String,
    pub message: String,
    pub backtrace: String,
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task '{}' panicked: {}", self.task, self.message)?;
        if !self.backtrace.is_empty() {
            write!(f, "\n{}", self.backtrace)?;
        }
        Ok(())
    }
}

type LoopFn = Arc<dyn Fn(&StopSignal) + Send + Sync>;
type CrashHandler = Arc<dyn Fn(&CrashReport) + Send + Sync>;

pub struct Task {
    name: String,
    running: Arc<AtomicBool>,
    crash_handler: CrashHandler,
    inner: Mutex<TaskInner>,
}

#[derive(Default)]
struct TaskInner {
    initialized: bool,
    loop_fn: Option<LoopFn>,
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Default for Task {
    /// An uninitialized task; `start` always fails with `NotInitialized`.
    fn default() -> Self {
        Self {
            name: String::new(),
            running: Arc::new(AtomicBool::new(false)),
            crash_handler: Arc::new(exit_on_crash),
            inner: Mutex::new(TaskInner::default()),
        }
    }
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        let task = Self {
            name: name.into(),
            ..Self::default()
        };
        task.inner.lock().initialized = true;
        task
    }

    /// Replace the fatal crash policy (tests use this to observe crashes).
    pub fn with_crash_handler(mut self, handler: impl Fn(&CrashReport) + Send + Sync + 'static) -> Self {
        self.crash_handler = Arc::new(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the loop run by `start`.
    pub fn set_loop(&self, f: impl Fn(&StopSignal) + Send + Sync + 'static) {
        self.inner.lock().loop_fn = Some(Arc::new(f));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> Result<(), TaskError> {
        let mut inner = self.inner.lock();
        if self.is_running() {
            return Err(TaskError::AlreadyRunning(self.name.clone()));
        }
        let Some(loop_fn) = inner.loop_fn.clone() else {
            return Err(TaskError::NoLoop(self.name.clone()));
        };
        if !inner.initialized {
            return Err(TaskError::NotInitialized(self.name.clone()));
        }
        // A previous run that ended on its own left a handle behind.
        if let Some(old) = inner.join.take() {
            let _ = old.join();
        }

        install_backtrace_hook();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let signal = StopSignal { rx: stop_rx };
        let running = self.running.clone();
        let crash_handler = self.crash_handler.clone();
        let name = self.name.clone();

        running.store(true, Ordering::Release);
        let spawned = thread::Builder::new().name(self.name.clone()).spawn(move || {
            tracing::debug!(task = %name, "task started");
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| loop_fn(&signal)));
            running.store(false, Ordering::Release);
            match outcome {
                Ok(()) => tracing::debug!(task = %name, "task stopped"),
                Err(payload) => {
                    let report = CrashReport {
                        task: name,
                        message: panic_message(payload.as_ref()),
                        backtrace: take_backtrace(),
                    };
                    crash_handler(&report);
                }
            }
        });
        match spawned {
            Ok(join) => {
                inner.stop_tx = Some(stop_tx);
                inner.join = Some(join);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                tracing::error!(task = %self.name, "spawn task thread: {e}");
                Err(TaskError::NotInitialized(self.name.clone()))
            }
        }
    }

    /// Signal the loop to stop and wait for it, unless called from the loop itself.
    pub fn stop(&self) -> Result<(), TaskError> {
        let join = {
            let mut inner = self.inner.lock();
            if !self.is_running() {
                return Err(TaskError::NotRunning(self.name.clone()));
            }
            tracing::trace!(task = %self.name, "stopping task");
            if let Some(tx) = inner.stop_tx.as_ref() {
                let _ = tx.try_send(());
            }
            match inner.join.as_ref() {
                Some(j) if j.thread().id() == thread::current().id() => None,
                _ => inner.join.take(),
            }
        };
        if let Some(join) = join {
            let _ = join.join();
        }
        Ok(())
    }
}

fn exit_on_crash(report: &CrashReport) {
    tracing::error!("{report}");
    std::process::exit(CRASH_EXIT_CODE);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Capture the panicking thread's backtrace before unwinding discards it.
fn install_backtrace_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_backtrace() -> String {
    LAST_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .map(|trace| trim_backtrace(&trace, MAX_TRACE_FRAMES))
        .unwrap_or_default()
}

/// Keep the first `max_frames` frames of a formatted backtrace.
fn trim_backtrace(trace: &str, max_frames: usize) -> String {
    let mut frames = 0;
    let mut out = Vec::new();
    for line in trace.lines() {
        let is_frame = line
            .trim_start()
            .split_once(':')
            .is_some_and(|(idx, _)| !idx.is_empty() && idx.chars().all(|c| c.is_ascii_digit()));
        if is_frame {
            frames += 1;
            if frames > max_frames {
                break;
            }
        }
        out.push(line);
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_requires_loop_and_initialization() {
        let task = Task::new("worker");
        assert_eq!(task.start(), Err(TaskError::NoLoop("worker".into())));

        let task = Task::default();
        task.set_loop(|_| {});
        assert_eq!(task.start(), Err(TaskError::NotInitialized(String::new())));
    }

    #[test]
    fn stop_before_start_is_an_error() {
        let task = Task::new("idle");
        assert_eq!(task.stop(), Err(TaskError::NotRunning("idle".into())));
    }

    #[test]
    fn loop_observes_stop_and_task_can_restart() {
        let task = Task::new("ticker");
        task.set_loop(|stop| while !stop.wait(Duration::from_millis(5)) {});

        task.start().unwrap();
        assert!(task.is_running());
        assert_eq!(task.start(), Err(TaskError::AlreadyRunning("ticker".into())));
        task.stop().unwrap();
        assert!(!task.is_running());

        task.start().unwrap();
        task.stop().unwrap();
        assert!(!task.is_running());
    }

    #[test]
    fn loop_can_stop_its_own_task() {
        let task = Arc::new(Task::new("self-stop"));
        let handle = Arc::downgrade(&task);
        let (tx, rx) = crossbeam_channel::bounded(1);
        task.set_loop(move |stop| {
            if let Some(t) = handle.upgrade() {
                let _ = tx.send(t.stop());
            }
            stop.wait(Duration::from_secs(1));
        });
        task.start().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(()));
        task.stop().ok();
    }

    #[test]
    fn panic_is_reported_to_crash_handler() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let task = Task::new("doomed").with_crash_handler(move |report| {
            let _ = tx.send(report.clone());
        });
        task.set_loop(|_| panic!("boom"));
        task.start().unwrap();

        let report = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(report.task, "doomed");
        assert_eq!(report.message, "boom");
        assert!(report.to_string().starts_with("task 'doomed' panicked: boom"));
    }

    #[test]
    fn trim_backtrace_keeps_leading_frames() {
        let trace = "   0: a\n             at a.rs:1\n   1: b\n   2: c\n   3: d";
        assert_eq!(trim_backtrace(trace, 2), "   0: a\n             at a.rs:1\n   1: b");
        assert_eq!(trim_backtrace(trace, 10), trace);
    }
}
