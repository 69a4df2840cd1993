//! 处理器状态管理
//!
//! 在真实内核中，每个 hart 通过 `tp` 寄存器得知自己的编号，并以关中断
//! 的方式保证读取期间不被迁移。宿主环境以操作系统线程模拟 hart：
//! 线程通过 [`register_hart`] 绑定一个 hart 编号（未绑定的线程视为
//! 引导 hart 0），[`push_off`]/[`pop_off`] 以每线程的嵌套计数模拟
//! 关/开抢占。

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::NCPU;

std::thread_local! {
    static HART_ID: Cell<usize> = const { Cell::new(0) };
    static NOFF: Cell<usize> = const { Cell::new(0) };
    static TOKEN: Cell<usize> = const { Cell::new(usize::MAX) };
}

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(0);

/// 将当前线程绑定为编号 `id` 的 hart。
///
/// # 功能说明
/// 之后在该线程上调用 [`cpu_id`] 将返回 `id`，每核资源
/// （如页分配器的空闲链表）据此选择本地池。
///
/// # 可能的错误
/// - `id` 不小于 [`NCPU`] 时 panic。
pub fn register_hart(id: usize) {
    if id >= NCPU {
        panic!("register_hart: hart {} out of range", id);
    }
    HART_ID.with(|h| h.set(id));
}

/// 返回当前线程所绑定的 hart 编号。
///
/// 必须在关抢占（[`push_off`] 之后、[`pop_off`] 之前）的窗口内调用，
/// 以保证调用方拿到的绑定关系在使用期间稳定。
#[inline]
pub unsafe fn cpu_id() -> usize {
    HART_ID.with(|h| h.get())
}

/// 返回当前执行流的全局唯一编号。
///
/// 自旋锁用它判定持有者。真实内核中这一角色由 CPU 编号承担；
/// 宿主环境中多个线程可能绑定同一 hart 编号，因此持有者判定
/// 需要每线程唯一的编号。
pub fn token() -> usize {
    TOKEN.with(|t| {
        if t.get() == usize::MAX {
            t.set(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        }
        t.get()
    })
}

/// 关抢占，可嵌套。
#[inline]
pub fn push_off() {
    NOFF.with(|n| n.set(n.get() + 1));
}

/// 开抢占，与 [`push_off`] 配对。
///
/// # 可能的错误
/// - 与 `push_off` 不配对（计数为 0 时调用）则 panic。
#[inline]
pub fn pop_off() {
    NOFF.with(|n| {
        if n.get() == 0 {
            panic!("pop_off");
        }
        n.set(n.get() - 1);
    });
}
