//! # TimeoutScheduler：单线程截止时间调度器
//!
//! ## 行为契约（What）
//! - 所有超时记录共享一个专用调度线程与一个按截止时间排序的小顶堆，不为每个调用创建线程；
//! - [`TimeoutScheduler::schedule`] 同步返回 [`TimeoutHandle`]，句柄在计时开始前即已可用；
//! - 取消若在派发前被观测到，则回调一定不会执行；取消与触发的竞态由调用方（注册表的原子
//!   摘除）兜底，调度器只保证“至多触发一次”。
//!
//! ## 实现要点（How）
//! - 记录状态 `PENDING → {CANCELLED, FIRED}` 通过一次 CAS 决定归属；
//! - 已取消记录惰性出堆，当其数量超过堆的一半时整体清理；
//! - 回调在锁外执行，并以 `catch_unwind` 隔离，防止用户回调的 panic 终止调度线程。

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::{RpcError, RpcResult};

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// 已取消记录少于该值时不触发整体清理。
const PURGE_FLOOR: usize = 64;

type FireFn = Box<dyn FnOnce() + Send + 'static>;

/// 单个调度记录的取消句柄。
///
/// 句柄可以被克隆；任一克隆调用 [`cancel`](Self::cancel) 均生效。
#[derive(Clone, Debug)]
pub struct TimeoutHandle {
    state: Arc<AtomicU8>,
    cancelled: Arc<AtomicUsize>,
}

impl TimeoutHandle {
    /// 取消尚未派发的记录。返回 `true` 表示本次调用完成了取消。
    pub fn cancel(&self) -> bool {
        // 先计数再抢占状态：调度线程看到 CANCELLED 时计数一定已经包含这条记录。
        self.cancelled.fetch_add(1, Ordering::AcqRel);
        let won = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !won {
            release_tally(&self.cancelled, 1);
        }
        won
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// 回调是否已经被派发。
    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    fn detached() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(CANCELLED)),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 不进入堆、永不触发的记录，用于无法表示为时间点的延迟。
    fn never() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct TimerRecord {
    deadline: Instant,
    sequence: u64,
    state: Arc<AtomicU8>,
    on_fire: FireFn,
}

impl TimerRecord {
    fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }
}

impl PartialEq for TimerRecord {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerRecord {}

impl PartialOrd for TimerRecord {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerRecord {
    // `BinaryHeap` 是大顶堆，反转比较得到最早截止时间在堆顶。
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<TimerRecord>,
    next_sequence: u64,
    shutdown: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
    cancelled: Arc<AtomicUsize>,
}

/// 单线程、按截止时间排序的超时调度器。
pub struct TimeoutScheduler {
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutScheduler {
    /// 启动调度线程。
    pub fn start() -> RpcResult<Self> {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState::default()),
            wakeup: Condvar::new(),
            cancelled: Arc::new(AtomicUsize::new(0)),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("spark-rpc-timer".into())
            .spawn(move || run(worker_shared))
            .map_err(|err| RpcError::Runtime {
                detail: format!("failed to spawn timeout scheduler thread: {err}"),
            })?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// 在 `delay` 之后执行 `on_fire`，除非先被取消。
    ///
    /// 调度器已关闭时返回一个处于取消态的句柄，回调永远不会执行。
    /// `delay` 大到无法表示为时间点时同样不会执行，句柄仍可取消。
    pub fn schedule<F>(&self, delay: Duration, on_fire: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            tracing::debug!("timeout scheduler is shut down; record dropped");
            return TimeoutHandle::detached();
        }
        let Some(deadline) = Instant::now().checked_add(delay) else {
            tracing::debug!(?delay, "delay exceeds the clock range; record never fires");
            return TimeoutHandle::never();
        };
        let record_state = Arc::new(AtomicU8::new(PENDING));
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let becomes_head = state
            .heap
            .peek()
            .is_none_or(|head| deadline < head.deadline);
        state.heap.push(TimerRecord {
            deadline,
            sequence,
            state: Arc::clone(&record_state),
            on_fire: Box::new(on_fire),
        });
        drop(state);
        if becomes_head {
            self.shared.wakeup.notify_one();
        }
        TimeoutHandle {
            state: record_state,
            cancelled: Arc::clone(&self.shared.cancelled),
        }
    }

    /// 仍在等待触发（未取消）的记录数量。
    pub fn pending(&self) -> usize {
        let total = self.shared.state.lock().heap.len();
        total.saturating_sub(self.shared.cancelled.load(Ordering::Relaxed))
    }

    /// 停止调度线程并丢弃未触发的记录；可重复调用。
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.heap.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.lock().take()
            && worker.thread().id() != thread::current().id()
            && worker.join().is_err()
        {
            tracing::error!("timeout scheduler thread terminated abnormally");
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TimeoutScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

fn run(shared: Arc<SchedulerShared>) {
    let mut due: Vec<TimerRecord> = Vec::new();
    loop {
        {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                let now = Instant::now();
                while state.heap.peek().is_some_and(|head| head.deadline <= now) {
                    if let Some(record) = state.heap.pop() {
                        due.push(record);
                    }
                }
                if !due.is_empty() {
                    break;
                }
                purge_cancelled(&mut state, &shared.cancelled);
                match state.heap.peek().map(|head| head.deadline) {
                    Some(deadline) => {
                        shared.wakeup.wait_until(&mut state, deadline);
                    }
                    None => shared.wakeup.wait(&mut state),
                }
            }
        }

        for record in due.drain(..) {
            let claimed = record
                .state
                .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if !claimed {
                release_tally(&shared.cancelled, 1);
                continue;
            }
            if catch_unwind(AssertUnwindSafe(record.on_fire)).is_err() {
                tracing::error!("timeout callback panicked; scheduler keeps running");
            }
        }
    }
}

fn purge_cancelled(state: &mut SchedulerState, cancelled: &AtomicUsize) {
    let stale = cancelled.load(Ordering::Acquire);
    if stale < PURGE_FLOOR || stale.saturating_mul(2) < state.heap.len() {
        return;
    }
    let before = state.heap.len();
    state.heap.retain(TimerRecord::is_pending);
    release_tally(cancelled, before - state.heap.len());
}

/// 从取消计数中扣除 `n`，不低于零。
fn release_tally(cancelled: &AtomicUsize, n: usize) {
    let _ = cancelled.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
        Some(count.saturating_sub(n))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_in_deadline_order() {
        let scheduler = TimeoutScheduler::start().expect("scheduler");
        let (tx, rx) = mpsc::channel();
        for (label, delay) in [("late", 60), ("early", 10), ("middle", 30)] {
            let tx = tx.clone();
            scheduler.schedule(Duration::from_millis(delay), move || {
                let _ = tx.send(label);
            });
        }
        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("fired"))
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn cancelled_record_never_fires() {
        let scheduler = TimeoutScheduler::start().expect("scheduler");
        let (tx, rx) = mpsc::channel::<()>();
        let handle = scheduler.schedule(Duration::from_millis(20), move || {
            let _ = tx.send(());
        });
        assert!(handle.cancel());
        assert!(!handle.cancel(), "second cancel is a no-op");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(handle.is_cancelled());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn cancel_after_fire_reports_false() {
        let scheduler = TimeoutScheduler::start().expect("scheduler");
        let (tx, rx) = mpsc::channel();
        let handle = scheduler.schedule(Duration::ZERO, move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(1)).expect("fired");
        assert!(handle.has_fired());
        assert!(!handle.cancel());
    }

    #[test]
    fn earlier_record_preempts_sleeping_worker() {
        let scheduler = TimeoutScheduler::start().expect("scheduler");
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(Duration::from_secs(30), || {});
        let started = Instant::now();
        scheduler.schedule(Duration::from_millis(10), move || {
            let _ = tx.send(Instant::now());
        });
        let fired_at = rx.recv_timeout(Duration::from_secs(2)).expect("fired");
        assert!(fired_at.duration_since(started) < Duration::from_secs(1));
    }

    #[test]
    fn panicking_callback_does_not_stop_the_worker() {
        let scheduler = TimeoutScheduler::start().expect("scheduler");
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(Duration::ZERO, || panic!("boom"));
        scheduler.schedule(Duration::from_millis(5), move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(1))
            .expect("worker survives panicking callback");
    }

    #[test]
    fn schedule_after_shutdown_is_inert() {
        let scheduler = TimeoutScheduler::start().expect("scheduler");
        scheduler.shutdown();
        scheduler.shutdown();
        let handle = scheduler.schedule(Duration::ZERO, || panic!("must not run"));
        assert!(handle.is_cancelled());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn mass_cancellation_is_purged() {
        let scheduler = TimeoutScheduler::start().expect("scheduler");
        let handles: Vec<_> = (0..256)
            .map(|_| scheduler.schedule(Duration::from_secs(60), || {}))
            .collect();
        for handle in &handles {
            handle.cancel();
        }
        // 追加一条近期记录唤醒调度线程，使其执行清理。
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(Duration::from_millis(5), move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(1)).expect("fired");
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn unrepresentable_delay_never_fires() {
        let scheduler = TimeoutScheduler::start().expect("scheduler");
        let handle = scheduler.schedule(Duration::MAX, || panic!("must not run"));
        assert!(!handle.has_fired());
        assert!(handle.cancel());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn cancel_racing_fire_leaves_tally_balanced() {
        let scheduler = Arc::new(TimeoutScheduler::start().expect("scheduler"));
        let handles: Vec<_> = (0..2_000)
            .map(|_| scheduler.schedule(Duration::ZERO, || {}))
            .collect();
        let cancellers: Vec<_> = handles
            .chunks(500)
            .map(|chunk| {
                let chunk = chunk.to_vec();
                thread::spawn(move || chunk.iter().filter(|h| h.cancel()).count())
            })
            .collect();
        for canceller in cancellers {
            canceller.join().expect("canceller");
        }

        let (tx, rx) = mpsc::channel();
        scheduler.schedule(Duration::from_millis(5), move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(2))
            .expect("worker still fires after the race");
        assert_eq!(scheduler.shared.cancelled.load(Ordering::Acquire), 0);
    }

    #[test]
    fn purge_tolerates_inflated_tally() {
        let cancelled = AtomicUsize::new(usize::MAX);
        let mut state = SchedulerState::default();
        state.heap.push(TimerRecord {
            deadline: Instant::now(),
            sequence: 0,
            state: Arc::new(AtomicU8::new(CANCELLED)),
            on_fire: Box::new(|| {}),
        });
        purge_cancelled(&mut state, &cancelled);
        assert!(state.heap.is_empty());
        assert_eq!(cancelled.load(Ordering::Acquire), usize::MAX - 1);
        release_tally(&cancelled, usize::MAX);
        assert_eq!(cancelled.load(Ordering::Acquire), 0);
    }
}
