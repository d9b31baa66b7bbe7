//! 按接口划分的就绪闸门。
//!
//! 闸门只有“关闭 → 打开”一次迁移：接口第一次获得可达地址时打开，此后永不阻塞。
//! 阻塞线程通过条件变量等待，异步任务通过 [`GateOpened`] 注册 `Waker`。
//! 每个 [`GateOpened`] 占用一个带键的槽位，丢弃时归还，闸门始终不开也不会堆积 `Waker`。

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Waiters {
    next_key: u64,
    wakers: HashMap<u64, Waker>,
}

#[derive(Default)]
pub struct ReadinessGate {
    open: AtomicBool,
    waiters: Mutex<Waiters>,
    opened: Condvar,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// 打开闸门并唤醒全部等待方；返回本次是否为首次打开。
    pub fn open(&self) -> bool {
        let wakers = {
            let mut waiters = self.waiters.lock();
            if self.open.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut waiters.wakers)
        };
        self.opened.notify_all();
        wakers.into_values().for_each(Waker::wake);
        true
    }

    pub fn wait(&self) {
        if self.is_open() {
            return;
        }
        let mut guard = self.waiters.lock();
        while !self.is_open() {
            self.opened.wait(&mut guard);
        }
    }

    /// 最多等待 `max_wait`，返回闸门是否已打开。
    ///
    /// `max_wait` 大到无法表示为时间点时按无限等待处理。
    pub fn wait_for(&self, max_wait: Duration) -> bool {
        if self.is_open() {
            return true;
        }
        let Some(until) = Instant::now().checked_add(max_wait) else {
            self.wait();
            return true;
        };
        let mut guard = self.waiters.lock();
        while !self.is_open() {
            if self.opened.wait_until(&mut guard, until).timed_out() {
                return self.is_open();
            }
        }
        true
    }

    /// 异步等待闸门打开；丢弃返回的 Future 不影响闸门。
    pub fn opened(self: &Arc<Self>) -> GateOpened {
        GateOpened {
            gate: Arc::clone(self),
            key: None,
        }
    }
}

impl fmt::Debug for ReadinessGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessGate")
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Debug)]
pub struct GateOpened {
    gate: Arc<ReadinessGate>,
    key: Option<u64>,
}

impl Future for GateOpened {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.gate.is_open() {
            this.key = None;
            return Poll::Ready(());
        }
        let mut waiters = this.gate.waiters.lock();
        // 持锁复查，避免与 `open` 交错时丢失唤醒。
        if this.gate.is_open() {
            this.key = None;
            return Poll::Ready(());
        }
        match this.key.and_then(|key| waiters.wakers.get_mut(&key)) {
            Some(waker) => {
                if !waker.will_wake(cx.waker()) {
                    waker.clone_from(cx.waker());
                }
            }
            None => {
                let key = waiters.next_key;
                waiters.next_key += 1;
                waiters.wakers.insert(key, cx.waker().clone());
                this.key = Some(key);
            }
        }
        Poll::Pending
    }
}

impl Drop for GateOpened {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.gate.waiters.lock().wakers.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::atomic::AtomicUsize, thread};

    #[test]
    fn open_is_reported_once() {
        let gate = ReadinessGate::new();
        assert!(!gate.is_open());
        assert!(gate.open());
        assert!(!gate.open());
        assert!(gate.wait_for(Duration::ZERO));
    }

    #[test]
    fn bounded_wait_times_out_on_closed_gate() {
        let gate = ReadinessGate::new();
        let started = Instant::now();
        assert!(!gate.wait_for(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn releases_blocked_threads_and_tasks() {
        let gate = Arc::new(ReadinessGate::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.wait())
            })
            .collect();
        let task = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || futures::executor::block_on(gate.opened()))
        };
        thread::sleep(Duration::from_millis(20));
        gate.open();
        for handle in threads {
            handle.join().expect("blocked waiter released");
        }
        task.join().expect("async waiter released");
    }

    #[test]
    fn abandoned_async_waiters_release_their_slots() {
        let gate = Arc::new(ReadinessGate::new());
        let wakers: Vec<_> = (0..100)
            .map(|_| Arc::new(CountingWaker::default()))
            .collect();
        let mut pending: Vec<_> = wakers
            .iter()
            .map(|counter| {
                let mut opened = gate.opened();
                let waker = Waker::from(Arc::clone(counter));
                let mut cx = Context::from_waker(&waker);
                assert!(Pin::new(&mut opened).poll(&mut cx).is_pending());
                // 重复轮询只更新已有槽位。
                assert!(Pin::new(&mut opened).poll(&mut cx).is_pending());
                opened
            })
            .collect();
        assert_eq!(gate.waiters.lock().wakers.len(), 100);

        let survivor = pending.pop().expect("one waiter kept");
        drop(pending);
        assert_eq!(gate.waiters.lock().wakers.len(), 1);

        gate.open();
        assert!(gate.waiters.lock().wakers.is_empty());
        assert_eq!(wakers[99].woken.load(Ordering::SeqCst), 1);
        assert!(wakers[..99].iter().all(|w| w.woken.load(Ordering::SeqCst) == 0));
        drop(survivor);
    }

    #[test]
    fn unbounded_wait_for_is_released_by_open() {
        let gate = Arc::new(ReadinessGate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_for(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        gate.open();
        assert!(waiter.join().expect("waiter released"));
    }

    #[derive(Default)]
    struct CountingWaker {
        woken: AtomicUsize,
    }

    impl std::task::Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.woken.fetch_add(1, Ordering::SeqCst);
        }
    }
}
