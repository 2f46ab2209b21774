//! Generic "run / sleep / exit" task supervisor.
//!
//! One [`Worker`] drives one proxy listener's event loop on a dedicated
//! Tokio task. A controller (the supervisor, or a proxy's own `start`/
//! `stop`) writes `command`; the worker reads it and advances `state` to
//! match. This is a trivial state cell with best-effort convergence, not a
//! message queue — the thread-plus-two-fields shape of the original daemon
//! translates to a task plus two atomics here.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Polled with a 5ms yield while waiting for the worker to converge on a
/// requested state, per the original's `worker_instruct` loop.
const CONVERGE_YIELD: Duration = Duration::from_millis(5);
/// The original's convergence bound has a sign error (`timeout <
/// time(NULL)` is checked before any time has passed, so it never fires);
/// this is the bound as clearly intended, not as literally written.
const CONVERGE_BOUND: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Init = 0,
    Sleep = 1,
    Run = 2,
    Exit = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Init,
            1 => WorkerState::Sleep,
            2 => WorkerState::Run,
            _ => WorkerState::Exit,
        }
    }
}

/// One dedicated task per proxy listener. `run` is the listener's event
/// loop; it is invoked again each time the worker is commanded back into
/// `Run` after a `Sleep`, and is expected to return promptly once its own
/// stop signal fires.
pub struct Worker {
    name: String,
    command: Arc<AtomicU8>,
    state: Arc<AtomicU8>,
    notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let command = Arc::new(AtomicU8::new(WorkerState::Sleep as u8));
        let state = Arc::new(AtomicU8::new(WorkerState::Init as u8));
        let notify = Arc::new(Notify::new());

        let task_command = command.clone();
        let task_state = state.clone();
        let task_notify = notify.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            task_state.store(WorkerState::Sleep as u8, Ordering::SeqCst);
            loop {
                match WorkerState::from_u8(task_command.load(Ordering::SeqCst)) {
                    WorkerState::Run => {
                        task_state.store(WorkerState::Run as u8, Ordering::SeqCst);
                        tracing::debug!(worker = %task_name, "running");
                        run().await;
                        // `run` returned because it was told to stop, or
                        // because the listener died outright; either way
                        // loop back around and let `command` say what's
                        // next instead of assuming EXIT.
                    }
                    WorkerState::Exit => {
                        task_state.store(WorkerState::Exit as u8, Ordering::SeqCst);
                        tracing::debug!(worker = %task_name, "exiting");
                        return;
                    }
                    WorkerState::Sleep | WorkerState::Init => {
                        task_state.store(WorkerState::Sleep as u8, Ordering::SeqCst);
                        task_notify.notified().await;
                    }
                }
            }
        });

        Worker {
            name,
            command,
            state,
            notify,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Set `command` and wake the worker. Does not wait for convergence.
    pub fn instruct(&self, cmd: WorkerState) {
        self.command.store(cmd as u8, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Set `command`, wake the worker, and spin with 5ms yields until
    /// `state` matches or 5 seconds have elapsed. Best-effort: a slow or
    /// wedged `run` future just means the caller proceeds anyway.
    pub async fn instruct_and_wait(&self, cmd: WorkerState) {
        self.instruct(cmd);
        let deadline = Instant::now() + CONVERGE_BOUND;
        while self.state() != cmd {
            if Instant::now() >= deadline {
                tracing::warn!(worker = %self.name, ?cmd, "worker did not converge within 5s");
                return;
            }
            tokio::time::sleep(CONVERGE_YIELD).await;
        }
    }

    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
