//! 双优先级互斥锁
//!
//! 单持有者；lock_high 与 lock_low 两个入口。两类调用者同时等待时高优先级先获得锁，
//! 避免大量 Inspect 的低优先级快照把 Advance 提交与 Close 饿死。释放统一由 Guard 的 Drop 完成。

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Arbiter {
    held: bool,
    high_waiting: usize,
}

/// 高优先级优先的异步互斥锁
#[derive(Debug)]
pub struct PriorityMutex<T> {
    arbiter: Mutex<Arbiter>,
    high: Notify,
    low: Notify,
    data: tokio::sync::Mutex<T>,
}

/// 持锁期间对数据的独占访问；Drop 时释放
pub struct PriorityGuard<'a, T> {
    mutex: &'a PriorityMutex<T>,
    data: Option<tokio::sync::MutexGuard<'a, T>>,
}

/// 已登记的高优先级等待者；取消（Future 被丢弃）时自动注销
struct HighWaiter<'a, T> {
    mutex: &'a PriorityMutex<T>,
    registered: bool,
}

impl<T> Drop for HighWaiter<'_, T> {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        let mut arbiter = self.mutex.arbiter();
        arbiter.high_waiting -= 1;
        if arbiter.high_waiting == 0 && !arbiter.held {
            self.mutex.low.notify_one();
        }
    }
}

impl<T> PriorityMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            arbiter: Mutex::new(Arbiter::default()),
            high: Notify::new(),
            low: Notify::new(),
            data: tokio::sync::Mutex::new(value),
        }
    }

    fn arbiter(&self) -> MutexGuard<'_, Arbiter> {
        self.arbiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 高优先级获取：锁空闲即可获得
    pub async fn lock_high(&self) -> PriorityGuard<'_, T> {
        let mut waiter = HighWaiter {
            mutex: self,
            registered: false,
        };
        loop {
            let notified = self.high.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut arbiter = self.arbiter();
                if !arbiter.held {
                    arbiter.held = true;
                    if waiter.registered {
                        arbiter.high_waiting -= 1;
                        waiter.registered = false;
                    }
                    break;
                }
                if !waiter.registered {
                    arbiter.high_waiting += 1;
                    waiter.registered = true;
                }
            }
            notified.await;
        }
        self.guard().await
    }

    /// 低优先级获取：锁空闲且没有高优先级等待者时才获得
    pub async fn lock_low(&self) -> PriorityGuard<'_, T> {
        loop {
            let notified = self.low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut arbiter = self.arbiter();
                if !arbiter.held && arbiter.high_waiting == 0 {
                    arbiter.held = true;
                    break;
                }
            }
            notified.await;
        }
        self.guard().await
    }

    async fn guard(&self) -> PriorityGuard<'_, T> {
        // 仲裁已保证唯一持有者，此处不会等待
        let data = self.data.lock().await;
        PriorityGuard {
            mutex: self,
            data: Some(data),
        }
    }

    fn release(&self) {
        let mut arbiter = self.arbiter();
        arbiter.held = false;
        if arbiter.high_waiting > 0 {
            self.high.notify_one();
        } else {
            self.low.notify_one();
        }
    }
}

impl<T> Deref for PriorityGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.data {
            Some(data) => &**data,
            None => unreachable!("guard accessed after release"),
        }
    }
}

impl<T> DerefMut for PriorityGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.data {
            Some(data) => &mut **data,
            None => unreachable!("guard accessed after release"),
        }
    }
}

impl<T> Drop for PriorityGuard<'_, T> {
    fn drop(&mut self) {
        self.data.take();
        self.mutex.release();
    }
}
