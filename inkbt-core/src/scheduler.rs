/*!
 * Cooperative Task Queue
 * Delayed and next-tick tasks for a single-threaded host loop
 */

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Work the controller knows how to run when its deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Drain the isolated readers and dispatch bindings.
    BindingPoll,
    /// End a discovery window and report what was found.
    ScanStop,
    /// Re-issue power-on after a resume.
    ResumePowerOn,
    /// Check whether the adapter came back after a resume.
    ResumeWait { attempt: u32 },
    /// Look again for input nodes that appeared after a connect.
    AwaitInputNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// Tasks ordered by deadline, ties broken by insertion order.
///
/// The queue does not read the clock itself: the host loop feeds it the
/// current instant through [`TaskQueue::advance`].
#[derive(Debug)]
pub struct TaskQueue {
    now: Instant,
    next_id: u64,
    pending: BTreeMap<(Instant, u64), Task>,
}

impl TaskQueue {
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            next_id: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn schedule_in(&mut self, delay: Duration, task: Task) -> TaskHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert((self.now + delay, id), task);
        TaskHandle(id)
    }

    pub fn next_tick(&mut self, task: Task) -> TaskHandle {
        self.schedule_in(Duration::ZERO, task)
    }

    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        let before = self.pending.len();
        self.pending.retain(|(_, id), _| *id != handle.0);
        self.pending.len() != before
    }

    /// Drops every pending task matching `pred`, returning how many went.
    pub fn cancel_where(&mut self, pred: impl Fn(&Task) -> bool) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, task| !pred(task));
        before - self.pending.len()
    }

    pub fn is_scheduled(&self, handle: TaskHandle) -> bool {
        self.pending.keys().any(|(_, id)| *id == handle.0)
    }

    pub fn contains(&self, task: Task) -> bool {
        self.pending.values().any(|t| *t == task)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.keys().next().map(|(due, _)| *due)
    }

    /// Moves the queue clock forward. Never goes backwards.
    pub fn advance(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Removes every task due at the current instant, earliest first.
    ///
    /// Tasks scheduled while the batch runs wait for the next call.
    pub fn take_due(&mut self) -> Vec<(TaskHandle, Task)> {
        let later = self.pending.split_off(&(self.now, u64::MAX));
        let due = std::mem::replace(&mut self.pending, later);
        due.into_iter()
            .map(|((_, id), task)| (TaskHandle(id), task))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
