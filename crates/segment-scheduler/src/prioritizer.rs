// Task Prioritizer: runs asynchronous tasks according to a numeric priority, lower
// numbers first, interrupting low priority work when high priority work arrives.
//
// A task is either waiting (not allowed to run yet) or pending (running). Interrupted
// tasks go back to waiting and restart from scratch once nothing blocks them anymore.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PrioritySteps;
use crate::error::DownloadError;

/// Distance to the playhead, in seconds, from which each priority number applies.
pub const SEGMENT_PRIORITIES_STEPS: [f64; 6] = [2.0, 4.0, 8.0, 12.0, 18.0, 25.0];

/// Maps the distance between a segment and the playhead to a priority number: the index
/// of the first step strictly greater than `distance`, or `steps.len()` past the last.
pub fn segment_priority(distance: f64, steps: &[f64]) -> u32 {
    steps
        .iter()
        .position(|step| distance < *step)
        .unwrap_or(steps.len()) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Outcome of a prioritized task which did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    #[error("task cancelled")]
    Cancelled,
    #[error("task failed: {0}")]
    Failed(E),
}

impl From<TaskError<DownloadError>> for DownloadError {
    fn from(err: TaskError<DownloadError>) -> Self {
        match err {
            TaskError::Cancelled => DownloadError::Cancelled,
            TaskError::Failed(err) => err,
        }
    }
}

/// Lifecycle hooks of a prioritized task. Called outside of any internal lock, so
/// implementations may call back into the prioritizer.
pub trait TaskObserver: Send + Sync {
    /// The current incarnation is being interrupted by a more urgent task. No more work
    /// from it will be observed; the task restarts later from scratch.
    fn before_interrupted(&self) {}

    /// The task succeeded and is about to be removed from the prioritizer.
    fn before_ended(&self) {}
}

impl TaskObserver for () {}

#[derive(Debug, Clone)]
enum Phase {
    Waiting,
    Running {
        generation: u64,
        token: CancellationToken,
    },
    Removed,
}

struct TaskEntry {
    priority: u32,
    phase: watch::Sender<Phase>,
    observer: Arc<dyn TaskObserver>,
    /// Cancelled by the caller to abort the task altogether.
    token: CancellationToken,
    /// Cancelled to stop the current incarnation only.
    run_token: Option<CancellationToken>,
    generation: u64,
}

type Interrupted = Vec<(TaskId, Arc<dyn TaskObserver>)>;

#[derive(Default)]
struct QueueState {
    next_id: u64,
    entries: HashMap<TaskId, TaskEntry>,
    /// Tasks not allowed to run yet, in insertion order.
    waiting: Vec<TaskId>,
    /// Running tasks.
    pending: Vec<TaskId>,
}

impl QueueState {
    fn priority(&self, id: TaskId) -> Option<u32> {
        self.entries.get(&id).map(|entry| entry.priority)
    }

    fn min_pending(&self) -> Option<u32> {
        self.pending.iter().filter_map(|id| self.priority(*id)).min()
    }

    fn min_waiting(&self) -> Option<u32> {
        self.waiting.iter().filter_map(|id| self.priority(*id)).min()
    }

    /// A task may start if no pending task is strictly more urgent.
    fn can_start(&self, priority: u32) -> bool {
        self.min_pending().is_none_or(|min| priority <= min)
    }

    fn is_running_high_priority(&self, steps: PrioritySteps) -> bool {
        self.min_pending().is_some_and(|min| steps.is_high(min))
    }

    fn start(&mut self, id: TaskId) {
        self.waiting.retain(|waiting| *waiting != id);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.generation += 1;
        let run_token = entry.token.child_token();
        entry.run_token = Some(run_token.clone());
        entry.phase.send_replace(Phase::Running {
            generation: entry.generation,
            token: run_token,
        });
        debug!(task = %id, priority = entry.priority, generation = entry.generation, "Starting task");
        self.pending.push(id);
    }

    /// Starts a task then, if it is high priority, interrupts every low priority one.
    fn start_and_interrupt(&mut self, id: TaskId, steps: PrioritySteps, out: &mut Interrupted) {
        self.start(id);
        if self.priority(id).is_some_and(|priority| steps.is_high(priority)) {
            self.interrupt_cancellable(steps, out);
        }
    }

    fn interrupt(&mut self, id: TaskId, out: &mut Interrupted) {
        self.pending.retain(|pending| *pending != id);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        // Phase first, so a woken driver never sees a stale running phase.
        entry.phase.send_replace(Phase::Waiting);
        if let Some(run_token) = entry.run_token.take() {
            run_token.cancel();
        }
        out.push((id, Arc::clone(&entry.observer)));
        self.waiting.push(id);
    }

    fn first_cancellable(&self, steps: PrioritySteps) -> Option<TaskId> {
        self.pending
            .iter()
            .copied()
            .find(|id| self.priority(*id).is_some_and(|priority| steps.is_low(priority)))
    }

    fn interrupt_cancellable(&mut self, steps: PrioritySteps, out: &mut Interrupted) {
        // Rescan after each interruption: the pending list has changed.
        while let Some(id) = self.first_cancellable(steps) {
            self.interrupt(id, out);
        }
    }

    fn next_startable(&self, min_waiting: u32) -> Option<TaskId> {
        let threshold = self
            .min_pending()
            .map_or(min_waiting, |min| min.min(min_waiting));
        self.waiting
            .iter()
            .copied()
            .find(|id| self.priority(*id).is_some_and(|priority| priority <= threshold))
    }

    /// Starts every waiting task sharing the most urgent waiting priority, as long as
    /// no pending task is more urgent.
    fn loop_through_waiting(&mut self, steps: PrioritySteps, out: &mut Interrupted) {
        let Some(min_waiting) = self.min_waiting() else {
            return;
        };
        if self.min_pending().is_some_and(|min| min < min_waiting) {
            return;
        }
        while let Some(id) = self.next_startable(min_waiting) {
            self.start_and_interrupt(id, steps, out);
        }
    }

    fn remove(&mut self, id: TaskId) -> Option<TaskEntry> {
        let entry = self.entries.remove(&id)?;
        self.waiting.retain(|waiting| *waiting != id);
        self.pending.retain(|pending| *pending != id);
        entry.phase.send_replace(Phase::Removed);
        if let Some(run_token) = &entry.run_token {
            run_token.cancel();
        }
        Some(entry)
    }
}

/// Schedules asynchronous tasks by priority number. Cheap to clone; clones share the
/// same queues.
#[derive(Clone)]
pub struct TaskPrioritizer {
    state: Arc<Mutex<QueueState>>,
    steps: PrioritySteps,
}

impl TaskPrioritizer {
    pub fn new(steps: PrioritySteps) -> Result<Self, DownloadError> {
        steps.validate()?;
        Ok(Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            steps,
        })
    }

    pub fn steps(&self) -> PrioritySteps {
        self.steps
    }

    /// Registers a task and returns its id with a future driving it to completion.
    ///
    /// The start decision is taken right away: the task starts if no pending task has a
    /// strictly lower priority number, otherwise it waits. `task` is invoked once per
    /// incarnation with a token cancelled on interruption; an interrupted task is
    /// invoked again from scratch when restarted.
    ///
    /// The future must be polled for the task to make progress. Dropping it, cancelling
    /// `token` or calling [`TaskPrioritizer::cancel`] removes the task.
    pub fn create<T, E, F, Fut>(
        &self,
        mut task: F,
        priority: u32,
        observer: Arc<dyn TaskObserver>,
        token: CancellationToken,
    ) -> (TaskId, BoxFuture<'static, Result<T, TaskError<E>>>)
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (phase_tx, mut phase_rx) = watch::channel(Phase::Waiting);
        let mut interrupted = Vec::new();

        let id = {
            let mut state = self.state.lock();
            let id = TaskId(state.next_id);
            state.next_id += 1;

            if token.is_cancelled() {
                return (id, futures::future::ready(Err(TaskError::Cancelled)).boxed());
            }

            state.entries.insert(
                id,
                TaskEntry {
                    priority,
                    phase: phase_tx,
                    observer,
                    token: token.clone(),
                    run_token: None,
                    generation: 0,
                },
            );

            if state.can_start(priority) {
                state.start_and_interrupt(id, self.steps, &mut interrupted);
            } else {
                debug!(task = %id, priority, "Task waiting for more urgent tasks to finish");
                state.waiting.push(id);
            }
            id
        };
        self.notify_interrupted(interrupted);

        let prioritizer = self.clone();
        // Owned by the driver, so dropping it unpolled still removes the task.
        let guard = RemoveOnDrop {
            prioritizer: prioritizer.clone(),
            id,
            armed: true,
        };
        let driver = async move {
            let mut guard = guard;
            let mut last_generation = 0;

            loop {
                let (generation, run_token) = loop {
                    let phase = phase_rx.borrow_and_update().clone();
                    match phase {
                        Phase::Removed => return Err(TaskError::Cancelled),
                        Phase::Running {
                            generation,
                            token: run_token,
                        } if generation != last_generation => break (generation, run_token),
                        _ => {}
                    }
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(TaskError::Cancelled),
                        changed = phase_rx.changed() => {
                            if changed.is_err() {
                                return Err(TaskError::Cancelled);
                            }
                        }
                    }
                };
                last_generation = generation;

                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(TaskError::Cancelled),
                    _ = run_token.cancelled() => None,
                    result = task(run_token.clone()) => Some(result),
                };

                match outcome {
                    None => {
                        debug!(task = %id, generation, "Task incarnation stopped");
                    }
                    Some(result) => {
                        guard.armed = false;
                        prioritizer.complete(id, result.is_ok());
                        return result.map_err(TaskError::Failed);
                    }
                }
            }
        };

        (id, driver.boxed())
    }

    /// Changes the priority of a task. Unknown ids and unchanged priorities are
    /// ignored.
    pub fn update_priority(&self, id: TaskId, priority: u32) {
        let steps = self.steps;
        let mut interrupted = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            if entry.priority == priority {
                return;
            }
            let previous = entry.priority;
            entry.priority = priority;
            debug!(task = %id, previous, priority, "Updating task priority");

            if state.waiting.contains(&id) {
                if state.can_start(priority) {
                    state.start_and_interrupt(id, steps, &mut interrupted);
                }
            } else {
                let others_high = state
                    .pending
                    .iter()
                    .filter(|pending| **pending != id)
                    .filter_map(|pending| state.priority(*pending))
                    .any(|other| steps.is_high(other));

                if steps.is_low(priority) && others_high {
                    state.interrupt(id, &mut interrupted);
                } else if steps.is_high(priority) {
                    state.interrupt_cancellable(steps, &mut interrupted);
                }
                state.loop_through_waiting(steps, &mut interrupted);
            }
        }
        self.notify_interrupted(interrupted);
    }

    /// Removes a task, stopping it if it runs, and lets waiting tasks start in its
    /// place. Returns immediately; the task's future resolves with
    /// [`TaskError::Cancelled`].
    pub fn cancel(&self, id: TaskId) {
        let mut interrupted = Vec::new();
        {
            let mut state = self.state.lock();
            let was_pending = state.pending.contains(&id);
            if state.remove(id).is_none() {
                return;
            }
            debug!(task = %id, "Task removed");
            if was_pending {
                state.loop_through_waiting(self.steps, &mut interrupted);
            }
        }
        self.notify_interrupted(interrupted);
    }

    pub fn priority(&self, id: TaskId) -> Option<u32> {
        self.state.lock().priority(id)
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.state.lock().pending.contains(&id)
    }

    pub fn is_waiting(&self, id: TaskId) -> bool {
        self.state.lock().waiting.contains(&id)
    }

    pub fn is_running_high_priority(&self) -> bool {
        self.state.lock().is_running_high_priority(self.steps)
    }

    fn complete(&self, id: TaskId, succeeded: bool) {
        let observer = {
            let state = self.state.lock();
            match state.entries.get(&id) {
                Some(entry) => Arc::clone(&entry.observer),
                None => return,
            }
        };
        if succeeded {
            observer.before_ended();
        }

        let mut interrupted = Vec::new();
        {
            let mut state = self.state.lock();
            if state.remove(id).is_some() {
                state.loop_through_waiting(self.steps, &mut interrupted);
            }
        }
        self.notify_interrupted(interrupted);
    }

    fn notify_interrupted(&self, interrupted: Interrupted) {
        for (id, observer) in interrupted {
            info!(task = %id, "Interrupting low priority task");
            observer.before_interrupted();
        }
    }
}

struct RemoveOnDrop {
    prioritizer: TaskPrioritizer,
    id: TaskId,
    armed: bool,
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.prioritizer.cancel(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: u32,
        log: Log,
    }

    impl TaskObserver for Recorder {
        fn before_interrupted(&self) {
            self.log.lock().push(format!("interrupted {}", self.name));
        }

        fn before_ended(&self) {
            self.log.lock().push(format!("ended {}", self.name));
        }
    }

    fn prioritizer(high: u32, low: u32) -> TaskPrioritizer {
        TaskPrioritizer::new(PrioritySteps::new(high, low).unwrap()).unwrap()
    }

    fn sleeping_task(
        prioritizer: &TaskPrioritizer,
        priority: u32,
        log: &Log,
    ) -> (TaskId, BoxFuture<'static, Result<u32, TaskError<DownloadError>>>) {
        let task_log = Arc::clone(log);
        prioritizer.create(
            move |_| {
                let log = Arc::clone(&task_log);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    log.lock().push(format!("data {priority}"));
                    Ok(priority)
                }
            },
            priority,
            Arc::new(Recorder {
                name: priority,
                log: Arc::clone(log),
            }),
            CancellationToken::new(),
        )
    }

    #[test]
    fn rejects_inverted_steps() {
        let steps = PrioritySteps { high: 3, low: 3 };
        assert!(TaskPrioritizer::new(steps).is_err());
    }

    #[test]
    fn segment_priority_follows_distance_steps() {
        assert_eq!(segment_priority(0.0, &SEGMENT_PRIORITIES_STEPS), 0);
        assert_eq!(segment_priority(1.9, &SEGMENT_PRIORITIES_STEPS), 0);
        assert_eq!(segment_priority(2.0, &SEGMENT_PRIORITIES_STEPS), 1);
        assert_eq!(segment_priority(10.0, &SEGMENT_PRIORITIES_STEPS), 3);
        assert_eq!(segment_priority(25.0, &SEGMENT_PRIORITIES_STEPS), 6);
        assert_eq!(segment_priority(120.0, &SEGMENT_PRIORITIES_STEPS), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn less_urgent_task_waits_for_running_one() {
        let prio = prioritizer(5, 20);
        let log = Log::default();

        let (first, first_fut) = sleeping_task(&prio, 1, &log);
        let (second, second_fut) = sleeping_task(&prio, 2, &log);
        assert!(prio.is_pending(first));
        assert!(prio.is_waiting(second));

        let (a, b) = tokio::join!(first_fut, second_fut);
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
        assert_eq!(*log.lock(), ["data 1", "ended 1", "data 2", "ended 2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priorities_run_concurrently() {
        let prio = prioritizer(5, 20);
        let log = Log::default();

        let (first, _first_fut) = sleeping_task(&prio, 7, &log);
        let (second, _second_fut) = sleeping_task(&prio, 7, &log);
        assert!(prio.is_pending(first));
        assert!(prio.is_pending(second));
    }

    #[tokio::test(start_paused = true)]
    async fn updating_to_same_priority_is_a_no_op() {
        let prio = prioritizer(5, 20);
        let log = Log::default();

        let (low, _low_fut) = sleeping_task(&prio, 25, &log);
        prio.update_priority(low, 25);
        assert!(prio.is_pending(low));
        assert!(log.lock().is_empty());

        // Unknown ids are ignored too.
        prio.update_priority(TaskId(999), 0);
        assert!(prio.is_pending(low));
    }

    #[tokio::test(start_paused = true)]
    async fn raising_a_pending_task_to_high_interrupts_low_ones() {
        let prio = prioritizer(5, 20);
        let log = Log::default();

        let (low, _low_fut) = sleeping_task(&prio, 25, &log);
        let (other, _other_fut) = sleeping_task(&prio, 10, &log);
        assert!(prio.is_pending(low));
        assert!(prio.is_pending(other));

        prio.update_priority(other, 0);
        assert!(prio.is_waiting(low));
        assert_eq!(*log.lock(), ["interrupted 25"]);
    }

    #[tokio::test(start_paused = true)]
    async fn promoting_a_waiting_task_starts_it() {
        let prio = prioritizer(5, 20);
        let log = Log::default();

        let (running, _running_fut) = sleeping_task(&prio, 10, &log);
        let (waiting, _waiting_fut) = sleeping_task(&prio, 12, &log);
        assert!(prio.is_waiting(waiting));

        prio.update_priority(waiting, 10);
        assert!(prio.is_pending(running));
        assert!(prio.is_pending(waiting));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_running_task_starts_waiting_ones() {
        let prio = prioritizer(5, 20);
        let log = Log::default();

        let (running, running_fut) = sleeping_task(&prio, 1, &log);
        let (waiting, waiting_fut) = sleeping_task(&prio, 8, &log);
        assert!(prio.is_waiting(waiting));

        prio.cancel(running);
        assert!(prio.is_pending(waiting));
        assert!(matches!(running_fut.await, Err(TaskError::Cancelled)));
        assert_eq!(waiting_fut.await.unwrap(), 8);
        assert_eq!(*log.lock(), ["data 8", "ended 8"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_future_removes_the_task() {
        let prio = prioritizer(5, 20);
        let log = Log::default();

        let (running, running_fut) = sleeping_task(&prio, 1, &log);
        let (waiting, _waiting_fut) = sleeping_task(&prio, 8, &log);
        drop(running_fut);

        assert_eq!(prio.priority(running), None);
        assert!(prio.is_pending(waiting));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_does_not_emit_ended() {
        let prio = prioritizer(5, 20);
        let log = Log::default();

        let (_, fut) = prio.create(
            |_| async { Err::<(), _>(DownloadError::parse("broken")) },
            3,
            Arc::new(Recorder {
                name: 3,
                log: Arc::clone(&log),
            }),
            CancellationToken::new(),
        );

        let err = fut.await.unwrap_err();
        assert!(matches!(err, TaskError::Failed(DownloadError::Parse { .. })));
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_resolves_without_running() {
        let prio = prioritizer(5, 20);
        let token = CancellationToken::new();
        token.cancel();

        let (id, fut) = prio.create(
            |_| async { Ok::<_, DownloadError>(()) },
            1,
            Arc::new(()),
            token,
        );
        assert!(matches!(fut.await, Err(TaskError::Cancelled)));
        assert_eq!(prio.priority(id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn created_task_stays_registered_while_running() {
        let prio = prioritizer(5, 20);
        let log = Log::default();

        let (id, fut) = sleeping_task(&prio, 4, &log);
        let handle = tokio::spawn(fut);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(prio.is_pending(id));
        assert_eq!(prio.priority(id), Some(4));
        assert!(log.lock().is_empty());

        assert_eq!(handle.await.unwrap().unwrap(), 4);
        assert_eq!(prio.priority(id), None);
        assert_eq!(*log.lock(), ["data 4", "ended 4"]);
    }
}
