use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Which deadline a flush timer was armed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerClass {
    Routine,
    Priority,
}

/// Handle to an armed flush timer. Dropping it does not cancel the timer.
#[derive(Debug)]
pub struct FlushTimer {
    handle: AbortHandle,
    deadline: Instant,
    class: TimerClass,
}

impl FlushTimer {
    pub fn class(&self) -> TimerClass {
        self.class
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// Arms per-key flush timers on the runtime the pipeline was started on.
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    runtime: Handle,
    routine_delay: Duration,
    priority_delay: Duration,
}

impl FlushScheduler {
    pub fn new(runtime: Handle, routine_delay: Duration, priority_delay: Duration) -> Self {
        Self {
            runtime,
            routine_delay,
            priority_delay,
        }
    }

    pub fn delay_for(&self, class: TimerClass) -> Duration {
        match class {
            TimerClass::Routine => self.routine_delay,
            TimerClass::Priority => self.priority_delay,
        }
    }

    /// Whether a timer of `class` armed now would fire before `existing`.
    pub fn would_tighten(&self, existing: &FlushTimer, class: TimerClass) -> bool {
        Instant::now() + self.delay_for(class) < existing.deadline
    }

    /// Spawn a timer that runs `on_fire` once its delay elapses.
    ///
    /// `on_fire` must tolerate the batch having already been sealed by
    /// another path; cancellation only guarantees the callback will not
    /// start after `cancel` returns if the sleep has not completed.
    pub fn arm<F>(&self, class: TimerClass, on_fire: F) -> FlushTimer
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = self.delay_for(class);
        let deadline = Instant::now() + delay;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire();
        });

        FlushTimer {
            handle: task.abort_handle(),
            deadline,
            class,
        }
    }
}
