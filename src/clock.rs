//! 单调节拍计数器
//!
//! 内核运行于真实硬件时，该计数器由定时器中断推进；
//! 在宿主环境中由运行方（如测试）调用 [`tick`] 推进。
//! 读取不需要加锁，只保证单调不减。

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// 推进一个节拍，相当于一次定时器中断。
#[inline]
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// 读取当前节拍数。
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}
