//! Cooperative executor.
//!
//! Polls `Future<Output = ()>` tasks from a waker-fed ready queue. A task is
//! removed from the task map while it is being polled, so the map lock is
//! never held across `poll`, and a task may spawn others freely. A wakeup
//! that arrives during the poll re-queues the id; the task is polled again
//! once it has been put back.
//!
//! The executor is single-CPU and tasks are not required to be `Send`. It
//! also records the user threads handed to it through
//! [`Scheduler::start_thread`], which is how hosted tests observe forks.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::task::Wake;
use alloc::vec::Vec;
use core::future::Future;
use core::sync::atomic::{AtomicU64, Ordering};
use core::task::{Context, Waker};

use meson_core::sync::{SpinLock, oneshot};

use super::{KernelTask, Scheduler};
use crate::proc::Thread;

/// Unique identifier of a task within its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

type ReadyQueue = Arc<SpinLock<VecDeque<TaskId>>>;

/// Waker that pushes its task back onto the ready queue.
struct TaskWaker {
    id: TaskId,
    ready: ReadyQueue,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.lock().push_back(self.id);
    }
}

/// Handle to the result of a task spawned with
/// [`Executor::spawn_with_handle`].
pub struct JoinHandle<T> {
    rx: oneshot::Receiver<T>,
    value: Option<T>,
}

impl<T> JoinHandle<T> {
    /// Returns `true` once the task has produced its value.
    pub fn is_finished(&mut self) -> bool {
        if self.value.is_none() {
            self.value = self.rx.try_recv();
        }
        self.value.is_some()
    }

    /// Takes the value if the task has finished.
    pub fn try_take(&mut self) -> Option<T> {
        self.value.take().or_else(|| self.rx.try_recv())
    }
}

/// The cooperative task executor.
pub struct Executor {
    tasks: SpinLock<BTreeMap<TaskId, KernelTask>>,
    ready: ReadyQueue,
    next_id: AtomicU64,
    started: SpinLock<Vec<Arc<Thread>>>,
}

impl Executor {
    /// Creates an executor with no tasks.
    pub fn new() -> Self {
        Self {
            tasks: SpinLock::named("executor_tasks", BTreeMap::new()),
            ready: Arc::new(SpinLock::named("executor_ready", VecDeque::new())),
            next_id: AtomicU64::new(0),
            started: SpinLock::named("executor_started", Vec::new()),
        }
    }

    /// Spawns a task and queues it for its first poll.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> TaskId {
        self.spawn_boxed(Box::pin(future))
    }

    fn spawn_boxed(&self, future: KernelTask) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tasks.lock().insert(id, future);
        self.ready.lock().push_back(id);
        id
    }

    /// Spawns a task whose output can be collected through the handle.
    pub fn spawn_with_handle<T: 'static>(
        &self,
        future: impl Future<Output = T> + 'static,
    ) -> JoinHandle<T> {
        let (tx, rx) = oneshot::oneshot();
        self.spawn(async move {
            // The handle may already be gone; the value is then dropped.
            let _ = tx.send(future.await);
        });
        JoinHandle { rx, value: None }
    }

    /// Polls ready tasks until none is ready. Returns the number of polls.
    pub fn run_until_stalled(&self) -> usize {
        let mut polls = 0;
        loop {
            let Some(id) = self.ready.lock().pop_front() else {
                return polls;
            };
            // A stale id: the task finished, or is queued twice.
            let Some(mut future) = self.tasks.lock().remove(&id) else {
                continue;
            };
            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                ready: self.ready.clone(),
            }));
            let mut cx = Context::from_waker(&waker);
            polls += 1;
            if future.as_mut().poll(&mut cx).is_pending() {
                self.tasks.lock().insert(id, future);
            }
        }
    }

    /// Number of tasks that have not completed.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Removes and returns the threads started since the last call.
    pub fn take_started(&self) -> Vec<Arc<Thread>> {
        core::mem::take(&mut *self.started.lock())
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for Executor {
    fn spawn(&self, task: KernelTask) {
        self.spawn_boxed(task);
    }

    fn start_thread(&self, thread: Arc<Thread>) {
        self.started.lock().push(thread);
    }
}
