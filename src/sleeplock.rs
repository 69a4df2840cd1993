//! 睡眠锁模块
//! 提供阻塞式同步原语，适用于可能长时间持有的锁（如等待磁盘 I/O 的
//! 缓冲块）。锁被占用时，等待者让出执行而不是忙等。
//!
//! 在真实内核中，等待者通过进程管理器在等待通道上睡眠、由释放者唤醒；
//! 宿主环境以每把锁自带的等待通道（互斥量加条件变量）充当同一角色。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use std::sync::{Condvar, Mutex};

use crate::spinlock::{SpinLock, SpinLockGuard};

/// 睡眠锁，阻塞式互斥。
///
/// 内部用一把自旋锁保护 `locked` 标志；拿不到锁的执行流在等待通道上
/// 睡眠，持有者释放时统一唤醒，醒来后重新竞争。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护 `locked` 的读改写；
/// - `locked`: 锁是否被占用；
/// - `name`: 锁的标识名，用于调试；
/// - `chan`: 等待通道；
/// - `data`: 被保护的数据。
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    name: &'static str,
    chan: WaitChannel,
    data: UnsafeCell<T>,
}

// `locked` 只在持有内部自旋锁时访问。
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建睡眠锁。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            name,
            chan: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁，可能阻塞当前执行流。
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁；
    /// 2. 若 `locked` 已置位，在等待通道上睡眠（睡前原子地放开自旋锁），
    ///    醒来后重新获取自旋锁并复查，直到拿到为止；
    /// 3. 置位 `locked`，放开自旋锁，返回守卫。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            guard = {
                self.chan.sleep(guard);
                self.lock.lock()
            };
        }

        self.locked.set(true);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 锁的标识名。
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 释放锁并唤醒等待者，由守卫的 `Drop` 调用。
    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.set(false);
        self.chan.wakeup();
        drop(guard);
    }
}

/// 等待通道：宿主环境中代替进程 sleep/wakeup 的原语。
///
/// `sleep` 在放开调用者传入的自旋锁之前先拿住通道互斥量，`wakeup`
/// 在通知之前也拿同一互斥量，因此释放者不可能在等待者挂起之前完成
/// 通知，唤醒不会丢失。虚假唤醒由调用者的复查循环兜住。
struct WaitChannel {
    mutex: Mutex<()>,
    cond: Condvar,
}

impl WaitChannel {
    const fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// 原子地放开 `spin` 并在通道上睡眠。
    fn sleep(&self, spin: SpinLockGuard<'_, ()>) {
        let held = self.mutex.lock().unwrap();
        drop(spin);
        let _unused = self.cond.wait(held).unwrap();
    }

    /// 唤醒在通道上睡眠的所有执行流。
    fn wakeup(&self) {
        let _held = self.mutex.lock().unwrap();
        self.cond.notify_all();
    }
}

/// 睡眠锁守卫，存在即代表锁被持有。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    /// 守卫离开作用域时释放锁并唤醒等待者。
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn blocking_mutual_exclusion() {
        let l = SleepLock::new(0usize, "sleep_counter");
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let mut g = l.lock();
                        let v = *g;
                        thread::yield_now();
                        *g = v + 1;
                    }
                });
            }
        });
        assert_eq!(*l.lock(), 400);
    }

    #[test]
    fn waiter_wakes_after_release() {
        let l = SleepLock::new((), "handoff");
        let g = l.lock();
        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let _g = l.lock();
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!waiter.is_finished());
            drop(g);
        });
        assert_eq!(l.name(), "handoff");
    }
}
