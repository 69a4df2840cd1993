//! 自旋锁模块
//! 自旋锁把被保护的数据包裹在自身内部，获取锁即获得数据的访问权。

use core::cell::{Cell, UnsafeCell};
use core::hint;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, Ordering};

use crate::cpu::{self, pop_off, push_off};

/// 非睡眠互斥锁，用于保护跨 hart 共享的数据。
///
/// 获取失败时忙等，期间保持关抢占，因此临界区必须短小且不可睡眠。
/// 锁记录当前持有者的执行流编号，用于调试以及重入检测：
/// 同一执行流重复获取同一把锁会立即 panic，而不是死锁。
///
/// # 字段说明
/// - `lock`: 原子布尔，`true` 表示已被持有；
/// - `name`: 锁名，用于调试输出；
/// - `owner`: 持有者的执行流编号（-1 表示无人持有）；
/// - `data`: 被保护的数据，经 `UnsafeCell` 实现内部可变。
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    owner: Cell<isize>,
    data: UnsafeCell<T>,
}

// 锁本身负责互斥，跨线程共享只要求被保护数据可发送。
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建自旋锁。
    ///
    /// # 参数
    /// - `data`: 被保护的数据；
    /// - `name`: 锁的标识名。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            owner: Cell::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取锁并返回守卫。
    ///
    /// # 功能说明
    /// 忙等直到拿到锁。守卫实现 `Deref`/`DerefMut`，可直接访问内部数据；
    /// 守卫离开作用域时自动释放锁并恢复抢占计数。
    ///
    /// # 流程解释
    /// 1. `push_off()` 关抢占；
    /// 2. 重入检查，若当前执行流已持有该锁则 panic；
    /// 3. CAS 忙等获取；
    /// 4. 内存屏障，保证临界区读写不会被重排到获取之前；
    /// 5. 记录持有者编号。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前执行流是否持有该锁。
    /// 必须在关抢占的窗口内调用。
    fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed) && self.owner.get() == cpu::token() as isize
    }

    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.owner.set(cpu::token() as isize);
    }

    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.owner.set(-1);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫，存在即代表锁被持有。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 守卫离开作用域时释放锁，并通过 `pop_off` 恢复抢占计数。
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn smoke() {
        let m = SpinLock::new(0usize, "smoke");
        *m.lock() += 1;
        *m.lock() += 1;
        assert_eq!(*m.lock(), 2);
    }

    #[test]
    fn mutual_exclusion() {
        let m = SpinLock::new(0usize, "counter");
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        *m.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*m.lock(), 40_000);
    }

    #[test]
    #[should_panic(expected = "spinlock reent acquire")]
    fn reacquire_panics() {
        let m = SpinLock::new((), "reent");
        let _held = m.lock();
        let _second = m.lock();
    }
}
