use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{CoreError, Result, codes};
use crate::future::Promise;
use crate::observability::TARGET_RUNTIME;

use super::{EventExecutor, ScheduledTask, Task};

struct Timer {
    deadline: Instant,
    seq: u64,
    handle: ScheduledTask,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // BinaryHeap 是大顶堆，反转后堆顶是最早到期的定时器。
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct LoopState {
    tasks: VecDeque<Task>,
    timers: BinaryHeap<Timer>,
    next_seq: u64,
    shutting_down: bool,
}

struct Shared {
    state: Mutex<LoopState>,
    wakeup: Condvar,
    terminated: Promise<()>,
}

/// 独占一个工作线程的事件循环。
///
/// # 执行说明（How）
/// - 工作线程每轮取走整批就绪任务，批内与批间都保持提交顺序；
/// - 到期的定时器在每轮开始时转入任务队列；
/// - 优雅关闭后拒绝外部线程的新提交，但工作线程自身在收尾期间提交的任务仍会执行，
///   直到队列排空才退出并完成终止 Promise；
/// - 单个任务 panic 只记录错误日志，不会终止循环。
pub struct SingleThreadEventLoop {
    name: String,
    shared: Arc<Shared>,
    thread_id: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SingleThreadEventLoop {
    /// 启动名为 `name` 的事件循环线程。
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(LoopState::default()),
            wakeup: Condvar::new(),
            terminated: Promise::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(worker_shared))
            .map_err(|err| CoreError::new(codes::RUNTIME_SHUTDOWN, "无法启动事件循环线程").with_cause(err))?;
        Ok(Arc::new(Self {
            name,
            shared,
            thread_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 终止 Promise，工作线程退出后完成。
    pub fn termination(&self) -> Promise<()> {
        self.shared.terminated.clone()
    }

    fn rejected(&self) -> CoreError {
        CoreError::new(
            codes::RUNTIME_SHUTDOWN,
            format!("事件循环 {} 已关闭，拒绝新任务", self.name),
        )
    }
}

impl EventExecutor for SingleThreadEventLoop {
    fn in_event_loop(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn execute(&self, task: Task) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.shutting_down && !self.in_event_loop() {
            return Err(self.rejected());
        }
        state.tasks.push_back(task);
        drop(state);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledTask> {
        let handle = ScheduledTask::new();
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return Err(self.rejected());
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.timers.push(Timer {
            deadline: Instant::now() + delay,
            seq,
            handle: handle.clone(),
            task,
        });
        drop(state);
        self.shared.wakeup.notify_one();
        Ok(handle)
    }

    fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    fn shutdown_gracefully(&self) -> Promise<()> {
        self.shared.state.lock().shutting_down = true;
        self.shared.wakeup.notify_all();
        self.shared.terminated.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for SingleThreadEventLoop {
    fn drop(&mut self) {
        self.shutdown_gracefully();
        if self.in_event_loop() {
            return;
        }
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            tracing::error!(target: TARGET_RUNTIME, name = %self.name, "事件循环线程异常退出");
        }
    }
}

fn run(shared: Arc<Shared>) {
    while let Some(batch) = next_batch(&shared) {
        for task in batch {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!(target: TARGET_RUNTIME, "事件循环任务 panic，继续处理后续任务");
            }
        }
    }
    shared.terminated.try_success(());
}

fn next_batch(shared: &Shared) -> Option<VecDeque<Task>> {
    let mut state = shared.state.lock();
    loop {
        let now = Instant::now();
        while state
            .timers
            .peek()
            .is_some_and(|timer| timer.deadline <= now)
        {
            if let Some(timer) = state.timers.pop()
                && !timer.handle.is_cancelled()
            {
                state.tasks.push_back(timer.task);
            }
        }
        if !state.tasks.is_empty() {
            return Some(std::mem::take(&mut state.tasks));
        }
        if state.shutting_down {
            return None;
        }
        match state.timers.peek().map(|timer| timer.deadline) {
            Some(deadline) => {
                shared.wakeup.wait_until(&mut state, deadline);
            }
            None => shared.wakeup.wait(&mut state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::mpsc;

    #[test]
    fn tasks_run_in_submission_order_on_worker() {
        let event_loop = SingleThreadEventLoop::new("order").expect("线程可启动");
        let (tx, rx) = mpsc::channel();
        for idx in 0..16 {
            let tx = tx.clone();
            let probe = Arc::clone(&event_loop);
            event_loop
                .execute(Box::new(move || {
                    tx.send((idx, probe.in_event_loop())).expect("接收端存活");
                }))
                .expect("循环未关闭");
        }
        let seen: Vec<_> = rx.iter().take(16).collect();
        assert!(seen.iter().all(|(_, in_loop)| *in_loop));
        assert_eq!(
            seen.iter().map(|(idx, _)| *idx).collect::<Vec<_>>(),
            (0..16).collect::<Vec<_>>()
        );
        assert!(!event_loop.in_event_loop());
    }

    #[test]
    fn scheduled_task_fires_and_cancel_suppresses() {
        let event_loop = SingleThreadEventLoop::new("timer").expect("线程可启动");
        let (tx, rx) = mpsc::channel();
        let tx_cancelled = tx.clone();
        let cancelled = event_loop
            .schedule(
                Duration::from_millis(500),
                Box::new(move || tx_cancelled.send("cancelled").expect("接收端存活")),
            )
            .expect("循环未关闭");
        assert!(cancelled.cancel());
        event_loop
            .schedule(
                Duration::from_millis(10),
                Box::new(move || tx.send("fired").expect("接收端存活")),
            )
            .expect("循环未关闭");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("fired"));
        assert!(rx.try_recv().is_err(), "已取消的定时任务不应执行");
    }

    #[test]
    fn shutdown_drains_queue_and_rejects_new_work() {
        let event_loop = SingleThreadEventLoop::new("drain").expect("线程可启动");
        let (tx, rx) = mpsc::channel();
        event_loop
            .execute(Box::new(move || tx.send(1).expect("接收端存活")))
            .expect("循环未关闭");
        let terminated = event_loop.shutdown_gracefully();
        block_on(terminated).expect("终止 Promise 应成功");
        assert_eq!(rx.try_recv(), Ok(1));
        let err = event_loop.execute(Box::new(|| {})).expect_err("关闭后应拒绝任务");
        assert_eq!(err.code(), codes::RUNTIME_SHUTDOWN);
    }

    #[test]
    fn panicking_task_does_not_stop_loop() {
        let event_loop = SingleThreadEventLoop::new("panic").expect("线程可启动");
        let (tx, rx) = mpsc::channel();
        event_loop
            .execute(Box::new(|| panic!("boom")))
            .expect("循环未关闭");
        event_loop
            .execute(Box::new(move || tx.send(()).expect("接收端存活")))
            .expect("循环未关闭");
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
