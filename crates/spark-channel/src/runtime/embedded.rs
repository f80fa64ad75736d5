use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CoreError, Result, codes};
use crate::future::Promise;

use super::{EventExecutor, ScheduledTask, Task};

struct PendingTimer {
    deadline: Duration,
    seq: u64,
    handle: ScheduledTask,
    task: Task,
}

#[derive(Default)]
struct EmbeddedState {
    tasks: VecDeque<Task>,
    timers: Vec<PendingTimer>,
    clock: Duration,
    next_seq: u64,
    shutting_down: bool,
}

/// 由调用线程驱动的事件循环，适合确定性测试与嵌入式场景。
///
/// # 契约说明（What）
/// - `in_event_loop` 恒为 `true`：调用方线程即视为循环线程；
/// - `execute` 只入队，任务在 [`run_pending_tasks`](Self::run_pending_tasks) 中按提交顺序执行；
/// - 定时任务基于虚拟时钟，调用 [`advance_time`](Self::advance_time) 推进后才会到期。
pub struct EmbeddedEventLoop {
    state: Mutex<EmbeddedState>,
    terminated: Promise<()>,
}

impl EmbeddedEventLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EmbeddedState::default()),
            terminated: Promise::new(),
        })
    }

    /// 执行所有已入队与已到期的任务，包括执行过程中新提交的任务；返回执行数量。
    pub fn run_pending_tasks(&self) -> usize {
        let mut ran = 0;
        loop {
            self.promote_due_timers();
            let next = self.state.lock().tasks.pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// 推进虚拟时钟；到期任务需再调用 `run_pending_tasks` 执行。
    pub fn advance_time(&self, by: Duration) {
        self.state.lock().clock += by;
    }

    /// 当前虚拟时间。
    pub fn now(&self) -> Duration {
        self.state.lock().clock
    }

    pub fn pending_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// 最近一个未取消定时任务距当前虚拟时间的间隔。
    pub fn next_scheduled_delay(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .timers
            .iter()
            .filter(|timer| !timer.handle.is_cancelled())
            .map(|timer| timer.deadline.saturating_sub(state.clock))
            .min()
    }

    fn promote_due_timers(&self) {
        let mut state = self.state.lock();
        let clock = state.clock;
        let mut due: Vec<PendingTimer> = Vec::new();
        let mut idx = 0;
        while idx < state.timers.len() {
            if state.timers[idx].deadline <= clock {
                due.push(state.timers.swap_remove(idx));
            } else {
                idx += 1;
            }
        }
        due.sort_by_key(|timer| (timer.deadline, timer.seq));
        for timer in due {
            if !timer.handle.is_cancelled() {
                state.tasks.push_back(timer.task);
            }
        }
    }

    fn rejected() -> CoreError {
        CoreError::new(codes::RUNTIME_SHUTDOWN, "嵌入式事件循环已关闭")
    }
}

impl EventExecutor for EmbeddedEventLoop {
    fn in_event_loop(&self) -> bool {
        true
    }

    fn execute(&self, task: Task) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(Self::rejected());
        }
        state.tasks.push_back(task);
        Ok(())
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledTask> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(Self::rejected());
        }
        let handle = ScheduledTask::new();
        let seq = state.next_seq;
        state.next_seq += 1;
        let deadline = state.clock + delay;
        state.timers.push(PendingTimer {
            deadline,
            seq,
            handle: handle.clone(),
            task,
        });
        Ok(handle)
    }

    fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    fn shutdown_gracefully(&self) -> Promise<()> {
        self.state.lock().shutting_down = true;
        self.run_pending_tasks();
        self.terminated.try_success(());
        self.terminated.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn timers_follow_virtual_clock() {
        let event_loop = EmbeddedEventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&hits);
        event_loop
            .schedule(
                Duration::from_secs(3),
                Box::new(move || {
                    probe.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("循环未关闭");
        assert_eq!(event_loop.run_pending_tasks(), 0);
        assert_eq!(event_loop.next_scheduled_delay(), Some(Duration::from_secs(3)));
        event_loop.advance_time(Duration::from_secs(3));
        assert_eq!(event_loop.run_pending_tasks(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_submissions_run_in_same_pass() {
        let event_loop = EmbeddedEventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let outer_loop = Arc::clone(&event_loop);
        let outer_order = Arc::clone(&order);
        event_loop
            .execute(Box::new(move || {
                outer_order.lock().push("outer");
                let inner_order = Arc::clone(&outer_order);
                outer_loop
                    .execute(Box::new(move || inner_order.lock().push("inner")))
                    .expect("循环未关闭");
            }))
            .expect("循环未关闭");
        assert_eq!(event_loop.run_pending_tasks(), 2);
        assert_eq!(*order.lock(), vec!["outer", "inner"]);
    }
}
