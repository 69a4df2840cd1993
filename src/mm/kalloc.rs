//! 物理页分配器
//!
//! 以整页（[`PGSIZE`] 字节）为单位管理空闲物理内存，供内核各子系统
//! 使用。空闲页本身充当链表节点：页首一个字保存后继指针，不需要
//! 额外的元数据。
//!
//! 每个 hart 有自己的空闲链表和自旋锁，常规分配与释放只碰本地链表，
//! 一次锁获取加一次指针更新。本地链表耗尽时按编号升序探查其余
//! hart 的链表，一次偷取一页；全局耗尽时返回 `None`，由调用者决定
//! 如何恢复。

use array_macro::array;

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::{NCPU, PGSIZE};
use crate::cpu::{self, pop_off, push_off};
use crate::spinlock::SpinLock;

use super::pg_round_up;

pub static KMEM: Kmem = Kmem::new();

/// 物理页分配器。
///
/// `pools` 中每个元素对应一个 hart 的空闲链表；`start`、`stop`
/// 记录托管的物理地址区间 `[start, stop)`，在 [`Kmem::kinit`]
/// 时写入一次，之后只读，用于校验释放操作的合法性。
pub struct Kmem {
    pools: [SpinLock<FreeList>; NCPU],
    start: AtomicUsize,
    stop: AtomicUsize,
}

/// 单个 hart 的空闲链表头。
struct FreeList {
    head: *mut Run,
}

// 链表节点指向的内存归分配器独占管理。
unsafe impl Send for FreeList {}

/// 空闲页的链表视图：页首一个字即后继指针。
struct Run {
    next: *mut Run,
}

impl Kmem {
    const fn new() -> Self {
        Self {
            pools: array![_ => SpinLock::new(FreeList { head: ptr::null_mut() }, "kmem"); NCPU],
            start: AtomicUsize::new(0),
            stop: AtomicUsize::new(0),
        }
    }

    /// 初始化分配器，应在引导 hart 上调用一次。
    ///
    /// # 功能说明
    /// 记录托管区间 `[start, stop)`，并把其中每一页逐次经
    /// [`Kmem::kfree`] 放入调用者（引导 hart）的空闲链表；
    /// 其余 hart 的链表从空开始，页的所有权此后经偷取惰性扩散。
    ///
    /// # 参数
    /// - `start`: 托管区间起始地址（含，向上取页对齐后开始放页）；
    /// - `stop`: 托管区间结束地址（不含）。
    ///
    /// # 安全性
    /// - 调用者必须保证 `[start, stop)` 是一段本分配器独占、
    ///   可读写的内存，且此后不再被其他用途触碰；
    /// - 必须在任何 `kalloc`/`kfree` 之前调用，且只调用一次。
    pub unsafe fn kinit(&self, start: usize, stop: usize) {
        self.start.store(start, Ordering::Relaxed);
        self.stop.store(stop, Ordering::Relaxed);
        self.freerange(start, stop);
        log::info!(
            "kmem: managing physical memory [{:#x}, {:#x})",
            start,
            stop
        );
    }

    /// 把 `[pa_start, pa_end)` 中的每一页释放进调用者的空闲链表。
    unsafe fn freerange(&self, pa_start: usize, pa_end: usize) {
        let mut pa = pg_round_up(pa_start);
        while pa + PGSIZE <= pa_end {
            self.kfree(NonNull::new_unchecked(pa as *mut u8));
            pa += PGSIZE;
        }
    }

    /// 分配一个物理页。
    ///
    /// # 功能说明
    /// 先从当前 hart 的空闲链表摘取链头；本地为空时放开本地锁，
    /// 按编号升序逐个探查其余 hart 的链表，一次只持有一把远端锁，
    /// 偷取一页即止。返回的页已用非零字节填充，暴露对旧内容的
    /// 悬垂引用。
    ///
    /// # 返回值
    /// - `Some(页首指针)`：分配成功，页对齐；
    /// - `None`：所有 hart 的链表都已耗尽。
    pub fn kalloc(&self) -> Option<NonNull<u8>> {
        push_off();
        let cpu_id = unsafe { cpu::cpu_id() };
        pop_off();

        let mut pool = self.pools[cpu_id].lock();
        let r = pool.head;
        if !r.is_null() {
            pool.head = unsafe { (*r).next };
            drop(pool);
            unsafe { ptr::write_bytes(r as *mut u8, 5, PGSIZE) }; // fill with junk
            return NonNull::new(r as *mut u8);
        }
        drop(pool);

        // 本地耗尽，从其它 hart 偷取
        for i in 0..NCPU {
            if i == cpu_id {
                continue;
            }
            let mut pool = self.pools[i].lock();
            let r = pool.head;
            if !r.is_null() {
                pool.head = unsafe { (*r).next };
                drop(pool);
                log::trace!("kmem: hart {} steals a page from hart {}", cpu_id, i);
                unsafe { ptr::write_bytes(r as *mut u8, 5, PGSIZE) }; // fill with junk
                return NonNull::new(r as *mut u8);
            }
        }

        None
    }

    /// 释放一个物理页到调用者的空闲链表。
    ///
    /// # 功能说明
    /// 页内容先以非零字节覆写，再以页首一个字链入当前 hart 的
    /// 空闲链表。覆写使释放后仍被引用的指针尽早暴露。
    ///
    /// # 参数
    /// - `pa`: 页首指针，通常来自先前的 [`Kmem::kalloc`]
    ///   （初始化时的 `freerange` 是唯一例外）。
    ///
    /// # 可能的错误
    /// - `pa` 未按页对齐，或不在托管区间内，panic（`"kfree"`）。
    ///
    /// # 安全性
    /// - 调用者必须保证该页此后不再被使用，且不会重复释放；
    ///   重复释放一个合法页会破坏链表结构。
    pub unsafe fn kfree(&self, pa: NonNull<u8>) {
        let addr = pa.as_ptr() as usize;
        if addr % PGSIZE != 0
            || addr < self.start.load(Ordering::Relaxed)
            || addr >= self.stop.load(Ordering::Relaxed)
        {
            panic!("kfree");
        }

        // 填充垃圾字节，暴露悬垂引用
        ptr::write_bytes(pa.as_ptr(), 1, PGSIZE);

        push_off();
        let cpu_id = cpu::cpu_id();
        pop_off();

        let r = pa.as_ptr() as *mut Run;
        let mut pool = self.pools[cpu_id].lock();
        (*r).next = pool.head;
        pool.head = r;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, Layout};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::thread;

    use crate::cpu::register_hart;

    /// 申请一块页对齐的宿主内存充当物理内存，返回 `[start, stop)`。
    /// 内存有意泄漏：分配器此后独占它。
    fn arena(pages: usize) -> (usize, usize) {
        let layout = Layout::from_size_align(pages * PGSIZE, PGSIZE).unwrap();
        let start = unsafe { alloc(layout) } as usize;
        assert_ne!(start, 0);
        (start, start + pages * PGSIZE)
    }

    #[test]
    fn alloc_until_exhaustion_then_reuse() {
        let (start, stop) = arena(4);
        let km = Kmem::new();
        unsafe { km.kinit(start, stop) };

        let mut frames = Vec::new();
        while let Some(p) = km.kalloc() {
            let addr = p.as_ptr() as usize;
            assert_eq!(addr % PGSIZE, 0);
            assert!(addr >= start && addr < stop);
            // 分配出的页应整页填充 5
            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), PGSIZE) };
            assert!(bytes.iter().all(|&b| b == 5));
            frames.push(p);
        }
        assert_eq!(frames.len(), 4);

        let p = frames.pop().unwrap();
        unsafe { km.kfree(p) };
        // 释放后的页除链表字外应整页填充 1
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), PGSIZE) };
        assert!(bytes[core::mem::size_of::<*mut u8>()..].iter().all(|&b| b == 1));

        assert_eq!(km.kalloc(), Some(p));
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn kfree_rejects_misaligned_pointer() {
        let (start, stop) = arena(1);
        let km = Kmem::new();
        unsafe { km.kinit(start, stop) };
        unsafe { km.kfree(NonNull::new((start + 123) as *mut u8).unwrap()) };
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn kfree_rejects_out_of_range_pointer() {
        let (start, stop) = arena(1);
        let km = Kmem::new();
        unsafe { km.kinit(start, stop) };
        unsafe { km.kfree(NonNull::new(stop as *mut u8).unwrap()) };
    }

    #[test]
    fn empty_hart_steals_from_seeded_hart() {
        let (start, stop) = arena(2);
        let km = Kmem::new();
        register_hart(0);
        unsafe { km.kinit(start, stop) }; // 两页都进入 hart 0 的链表

        let freed = thread::scope(|s| {
            let h = s.spawn(|| {
                register_hart(1);
                // hart 1 链表为空，两次分配都从 hart 0 偷取
                let a = km.kalloc().unwrap();
                let b = km.kalloc().unwrap();
                assert_ne!(a, b);
                // 全局耗尽
                assert_eq!(km.kalloc(), None);
                // 释放到 hart 1 的链表
                unsafe { km.kfree(a) };
                a.as_ptr() as usize
            });
            h.join().unwrap()
        });

        // hart 0 自己的链表已空，必须从 hart 1 偷回刚释放的那一页
        let p = km.kalloc().unwrap();
        assert_eq!(p.as_ptr() as usize, freed);
        assert_eq!(km.kalloc(), None);
    }

    #[test]
    fn conservation_and_exclusive_ownership_under_fuzz() {
        const PAGES: usize = 16;
        const NTHREAD: usize = 4;
        const ROUNDS: usize = 200;

        let (start, stop) = arena(PAGES);
        let km = Kmem::new();
        register_hart(0);
        unsafe { km.kinit(start, stop) };

        // 已分配页的全集；同一页在归还前再次出现即所有权被破坏
        let in_use = Mutex::new(HashSet::new());

        thread::scope(|s| {
            for t in 0..NTHREAD {
                let km = &km;
                let in_use = &in_use;
                s.spawn(move || {
                    register_hart(t);
                    let mut rng = fastrand::Rng::with_seed(0xa110c + t as u64);
                    let mut local = Vec::new();
                    for _ in 0..ROUNDS {
                        if rng.bool() || local.is_empty() {
                            if let Some(p) = km.kalloc() {
                                let fresh = in_use.lock().unwrap().insert(p.as_ptr() as usize);
                                assert!(fresh, "page handed out twice: {:p}", p);
                                local.push(p);
                            }
                        } else {
                            let p = local.swap_remove(rng.usize(..local.len()));
                            in_use.lock().unwrap().remove(&(p.as_ptr() as usize));
                            unsafe { km.kfree(p) };
                        }
                    }
                    for p in local {
                        in_use.lock().unwrap().remove(&(p.as_ptr() as usize));
                        unsafe { km.kfree(p) };
                    }
                });
            }
        });

        // 守恒：归还完毕后，所有页都应能重新分配出来
        let mut n = 0;
        while km.kalloc().is_some() {
            n += 1;
        }
        assert_eq!(n, PAGES);
    }
}
