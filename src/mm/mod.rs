//! 内存管理模块

pub mod kalloc;

pub use kalloc::{Kmem, KMEM};

use crate::consts::PGSIZE;

/// 地址向上对齐到页边界。
#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}
