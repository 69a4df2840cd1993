//! 缓存层
//!
//! 块缓冲缓存在内存中保存磁盘块的副本，减少重复的磁盘读取，
//! 同时为多个执行流访问同一磁盘块提供同步点。
//!
//! 缓存按 `(dev, blockno)` 散列为 [`NBUK`] 个桶，每个桶是一条单向链，
//! 由各自的自旋锁保护；命中路径只碰目标桶的锁。未命中时在全部桶中
//! 挑选一个未被引用、时间戳符合替换策略的缓冲块，摘下后迁移到目标桶。
//! 跨桶迁移由全局 `evict` 自旋锁串行化，并在目标桶内复查，保证同一
//! `(dev, blockno)` 任一时刻至多有一个被引用的缓冲块。

use array_macro::array;

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::clock;
use crate::consts::fs::{BSIZE, NBUF, NBUK};
use crate::driver::DISK;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};

pub static BCACHE: Bcache = Bcache::new();

/// 全局缓冲区缓存（Buffer Cache）结构体，用于块设备的读写缓存。
///
/// `Bcache` 维护一个固定大小的缓冲块池。控制信息（设备号、块号、
/// 引用计数、释放时间戳、链上的后继）存放在 `ctrls` 数组中，由所属
/// 散列桶的自旋锁保护；块数据本体存放在 `bufs` 数组中，由各缓冲块
/// 自己的睡眠锁保护。两个数组按下标一一对应。
///
/// 该结构在内核初始化阶段经 [`Bcache::binit`] 建立初始链表，
/// 贯穿系统运行期间，是文件系统与块设备驱动之间的缓冲层。
pub struct Bcache {
    /// 串行化跨桶驱逐事务的全局自旋锁。
    ///
    /// 任何把缓冲块装入目标桶的路径都必须先持有它，再持有目标桶锁，
    /// 从而保证并发未命中的执行流中只有一个完成安装，其余在复查时
    /// 转为命中。
    evict: SpinLock<()>,

    /// 散列桶数组。每个桶保存链头下标，桶锁同时保护链结构
    /// 以及链上所有缓冲块的控制信息。
    buckets: [SpinLock<Bucket>; NBUK],

    /// 缓冲块控制信息，与 `bufs` 按下标对应。
    ctrls: [BufCtrlCell; NBUF],

    /// 缓冲块数据本体，与 `ctrls` 按下标对应。
    bufs: [BufInner; NBUF],
}

/// 根据设备号与块号计算散列桶下标。
fn hash(dev: u32, blockno: u32) -> usize {
    (dev as u64 * blockno as u64 % NBUK as u64) as usize
}

/// 驱逐扫描的当前最优候选：候选所在桶的锁守卫，
/// 以及候选在链上的前驱（`None` 表示候选就在链头）。
struct Victim<'a> {
    bucket: SpinLockGuard<'a, Bucket>,
    prev: Option<usize>,
}

impl Bcache {
    const fn new() -> Self {
        Self {
            evict: SpinLock::new((), "bcache"),
            buckets: array![_ => SpinLock::new(Bucket::new(), "bcache.bucket"); NBUK],
            ctrls: array![_ => BufCtrlCell::new(); NBUF],
            bufs: array![_ => BufInner::new(); NBUF],
        }
    }

    /// 初始化缓冲区缓存。
    ///
    /// # 功能说明
    /// 把全部 [`NBUF`] 个缓冲块依次链入 0 号散列桶，并以当前节拍
    /// 作为它们的初始释放时间戳。缓冲块此后只会在驱逐时于桶间迁移，
    /// 永不销毁。
    ///
    /// # 可能的错误
    /// - 本函数应在系统启动时调用一次；重复调用会重建链表结构，
    ///   调用方需保证此时没有其他执行流访问缓存。
    pub fn binit(&self) {
        let mut bucket = self.buckets[0].lock();
        let now = clock::ticks();
        for i in 0..NBUF {
            // 安全性：持有 0 号桶锁，且此时所有缓冲块都归属 0 号桶
            let ctrl = unsafe { self.ctrl(i) };
            ctrl.ts = now;
            ctrl.next = if i + 1 < NBUF { Some(i + 1) } else { None };
        }
        bucket.head = Some(0);
        log::debug!("bcache: {} buffers in {} buckets", NBUF, NBUK);
    }

    /// 取得下标 `index` 处缓冲块的控制信息。
    ///
    /// # 安全性
    /// 调用者必须满足二者之一：
    /// - 持有该缓冲块当前所在散列桶的自旋锁；
    /// - 该缓冲块已被本执行流从链上摘下、尚未挂回（此时仅摘下者可见）。
    #[allow(clippy::mut_from_ref)]
    unsafe fn ctrl(&self, index: usize) -> &mut BufCtrl {
        &mut *self.ctrls[index].0.get()
    }

    /// 获取指定设备与块号对应的缓冲块。
    ///
    /// # 功能说明
    /// `bget` 是缓存的底层接口：命中则增加引用计数并返回；未命中则
    /// 驱逐一个未被引用的缓冲块，改写其身份后返回。返回的缓冲块已
    /// 持有睡眠锁。本函数不做磁盘 I/O，调用者根据 `valid` 标志决定
    /// 是否需要从磁盘装入数据。
    ///
    /// # 流程解释
    /// - 快速路径：锁住目标桶，沿链查找 `(dev, blockno)`；命中则
    ///   增加引用计数、放开桶锁、获取睡眠锁并返回；
    /// - 慢路径：按下标升序扫描所有桶，在引用计数为 0 的缓冲块中
    ///   挑选时间戳最大者（相等时后扫描到的胜出）。离开每个桶时只
    ///   保留当前最优候选所在桶的锁，因此同时持有的桶锁至多两把，
    ///   且总是低序号在先，不会互相死锁；
    /// - 把候选从源桶摘下、放开源桶锁，然后依次获取 `evict` 锁与
    ///   目标桶锁，把候选挂到目标桶头；
    /// - 复查目标桶：等待锁期间其他执行流可能已装入同一块。复查
    ///   跳过刚挂入的候选本身（其身份仍是旧块）。查到则转为命中，
    ///   候选留在目标桶中等待下次驱逐；
    /// - 复查落空则把候选改写为新身份：`valid` 清零、引用计数置 1；
    /// - 自始至终没有候选且复查落空，说明所有缓冲块都被引用，panic。
    ///
    /// # 参数
    /// - `dev`: 设备号；
    /// - `blockno`: 设备内的逻辑块号。
    ///
    /// # 返回值
    /// 持有睡眠锁的 [`Buf`]，其 `(dev, blockno)` 与请求一致。
    ///
    /// # 可能的错误
    /// - 所有缓冲块的引用计数都大于 0 时无法驱逐，
    ///   panic（`"bget: no buffers"`）。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let buk_id = hash(dev, blockno);

        // 快速路径：目标桶内查找
        {
            let bucket = self.buckets[buk_id].lock();
            let mut cur = bucket.head;
            while let Some(i) = cur {
                // 安全性：持有 buk_id 桶锁
                let ctrl = unsafe { self.ctrl(i) };
                if ctrl.dev == dev && ctrl.blockno == blockno {
                    ctrl.refcnt += 1;
                    drop(bucket);
                    return self.hold(i, dev, blockno);
                }
                cur = ctrl.next;
            }
        }

        // 慢路径：全桶扫描，挑选引用计数为 0 且时间戳最大的缓冲块。
        // 时间戳相等时取后扫描到的（>= 比较），与复查逻辑配合保证确定性。
        let mut max_ts = 0u64;
        let mut victim: Option<Victim<'_>> = None;
        for id in 0..NBUK {
            let bucket = self.buckets[id].lock();
            let mut improved = None;
            let mut prev = None;
            let mut cur = bucket.head;
            while let Some(i) = cur {
                // 安全性：持有 id 桶锁
                let ctrl = unsafe { self.ctrl(i) };
                if ctrl.refcnt == 0 && ctrl.ts >= max_ts {
                    max_ts = ctrl.ts;
                    improved = Some(prev);
                }
                prev = Some(i);
                cur = ctrl.next;
            }
            match improved {
                // 候选易主：新桶锁接管，旧候选桶锁随替换释放
                Some(prev) => victim = Some(Victim { bucket, prev }),
                None => drop(bucket),
            }
        }

        // 把候选从源桶摘下。桶锁自选定起一直持有，
        // 引用计数不可能在途中被抬高。
        let stolen = victim.map(|mut v| {
            let i = match v.prev {
                // 安全性：持有候选所在桶锁
                Some(p) => unsafe { self.ctrl(p) }.next.unwrap(),
                None => v.bucket.head.unwrap(),
            };
            let next = unsafe { self.ctrl(i) }.next;
            match v.prev {
                Some(p) => unsafe { self.ctrl(p) }.next = next,
                None => v.bucket.head = next,
            }
            unsafe { self.ctrl(i) }.next = None;
            i
            // 源桶锁在此释放；候选暂不属于任何桶，仅本执行流可见
        });

        let evict = self.evict.lock();
        let mut bucket = self.buckets[buk_id].lock();

        // 先把候选挂到目标桶头，复查与安装都在桶锁内完成
        if let Some(i) = stolen {
            // 安全性：候选由本执行流独占，即将归属已上锁的目标桶
            let ctrl = unsafe { self.ctrl(i) };
            ctrl.next = bucket.head;
            bucket.head = Some(i);
        }

        // 复查：等待 evict 锁期间，其他执行流可能已装入同一块。
        // 跳过候选本身，它的身份还是旧块。
        let mut cur = bucket.head;
        while let Some(i) = cur {
            // 安全性：持有目标桶锁
            let ctrl = unsafe { self.ctrl(i) };
            if Some(i) != stolen && ctrl.dev == dev && ctrl.blockno == blockno {
                ctrl.refcnt += 1;
                drop(bucket);
                drop(evict);
                return self.hold(i, dev, blockno);
            }
            cur = ctrl.next;
        }

        let i = match stolen {
            Some(i) => i,
            None => panic!("bget: no buffers"),
        };
        log::trace!("bcache: buf {} takes ({}, {})", i, dev, blockno);
        // 安全性：持有目标桶锁，候选已挂入目标桶
        let ctrl = unsafe { self.ctrl(i) };
        ctrl.dev = dev;
        ctrl.blockno = blockno;
        ctrl.refcnt = 1;
        self.bufs[i].valid.store(false, Ordering::Relaxed);
        drop(bucket);
        drop(evict);
        self.hold(i, dev, blockno)
    }

    /// 以持锁状态包装缓冲块。睡眠锁的获取可能使当前执行流挂起，
    /// 必须发生在所有自旋锁都已放开之后。
    fn hold(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 读取指定设备与块号对应的数据。
    ///
    /// # 功能说明
    /// 对外的读取接口。经 [`Bcache::bget`] 拿到缓冲块后，若其 `valid`
    /// 标志未置位（新驱逐所得，或尚未从磁盘装入过），则同步读一次
    /// 磁盘并置位。并发请求同一块的执行流由该块的睡眠锁串行化，
    /// 因此磁盘读至多发生一次。
    ///
    /// # 参数
    /// - `dev`: 设备号；
    /// - `blockno`: 设备内的逻辑块号。
    ///
    /// # 返回值
    /// 持有睡眠锁、内容与磁盘一致的 [`Buf`]。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            DISK.rw(&mut b, false);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 释放缓冲块的一个引用，由 [`Buf`] 的 `Drop` 在睡眠锁释放后调用。
    ///
    /// 引用计数降为 0 时，在桶锁内读取当前节拍记作释放时间戳，
    /// 保证时间戳与计数的变化对驱逐扫描一并可见。
    fn brelse(&self, index: usize, dev: u32, blockno: u32) {
        let _bucket = self.buckets[hash(dev, blockno)].lock();
        // 安全性：缓冲块身份在被引用期间不变，所在桶即身份散列桶
        let ctrl = unsafe { self.ctrl(index) };
        ctrl.refcnt -= 1;
        if ctrl.refcnt == 0 {
            ctrl.ts = clock::ticks();
        }
    }
}

/// 缓冲块守卫，代表对一个磁盘块缓存的独占访问。
///
/// 由 [`Bcache::bread`] 创建，持有期间该块的睡眠锁与一个引用计数。
/// 离开作用域时先释放睡眠锁，再归还引用；引用计数降为 0 后，
/// 该缓冲块重新成为驱逐候选。
pub struct Buf<'a> {
    cache: &'a Bcache,

    /// 在全局缓冲数组中的下标。
    index: usize,

    /// 所属设备号。被引用期间不变。
    dev: u32,

    /// 设备内的逻辑块号。被引用期间不变。
    blockno: u32,

    /// 块数据的睡眠锁守卫。生命周期内保持 `Some`，
    /// `Drop` 中先行取出释放，使睡眠锁先于引用计数归还。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    /// 所属设备号。
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// 设备内的逻辑块号。
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 块数据的只读视图。
    pub fn data(&self) -> &BufData {
        self.data.as_ref().unwrap().deref()
    }

    /// 块数据的可写视图。
    pub fn data_mut(&mut self) -> &mut BufData {
        self.data.as_mut().unwrap().deref_mut()
    }

    /// 把缓冲块当前内容同步写入磁盘。
    pub fn bwrite(&mut self) {
        DISK.rw(self, true);
    }

    /// 额外增加一个引用，把缓冲块钉在缓存中。
    ///
    /// # 功能说明
    /// 钉住的缓冲块在守卫释放后仍不会被驱逐，供上层（如日志层）
    /// 跨越释放周期保留缓存内容。必须与 [`Buf::unpin`] 配对。
    pub fn pin(&self) {
        let _bucket = self.cache.buckets[hash(self.dev, self.blockno)].lock();
        // 安全性：持有身份散列桶锁
        let ctrl = unsafe { self.cache.ctrl(self.index) };
        ctrl.refcnt += 1;
    }

    /// 解除一次钉住。
    ///
    /// # 可能的错误
    /// - 除本守卫自身的引用外没有多余引用（即未被钉住）时
    ///   panic（`"bunpin"`）。
    pub fn unpin(&self) {
        let _bucket = self.cache.buckets[hash(self.dev, self.blockno)].lock();
        // 安全性：持有身份散列桶锁
        let ctrl = unsafe { self.cache.ctrl(self.index) };
        if ctrl.refcnt <= 1 {
            panic!("bunpin: buffer not pinned");
        }
        ctrl.refcnt -= 1;
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.data.take());
        self.cache.brelse(self.index, self.dev, self.blockno);
    }
}

/// 散列桶：单向链的链头，值为缓冲块下标。
///
/// 桶锁保护链结构以及链上所有缓冲块的控制信息；
/// 缓冲块只有在同时持有 `evict` 锁与相关桶锁时才会迁移。
struct Bucket {
    head: Option<usize>,
}

impl Bucket {
    const fn new() -> Self {
        Self { head: None }
    }
}

/// 缓冲块控制信息。
///
/// 不含块数据本体，记录身份、引用计数、释放时间戳以及
/// 在所属桶链上的后继下标。
struct BufCtrl {
    /// 所属设备号，与 `blockno` 共同构成缓存身份。
    dev: u32,

    /// 设备内的逻辑块号。
    blockno: u32,

    /// 当前引用数。大于 0 时缓冲块不可被驱逐，身份不变。
    refcnt: usize,

    /// 引用计数上次降为 0 时的节拍，驱逐扫描据此挑选候选。
    /// 仅在 `refcnt == 0` 时有意义。
    ts: u64,

    /// 桶链上的后继缓冲块下标。
    next: Option<usize>,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            ts: 0,
            next: None,
        }
    }
}

/// 控制信息的共享单元。
///
/// 访问纪律：持有该缓冲块当前所在散列桶的自旋锁，或该块正被
/// 驱逐流程摘下、仅摘下者可见。满足纪律的前提下跨线程共享是安全的。
struct BufCtrlCell(UnsafeCell<BufCtrl>);

unsafe impl Sync for BufCtrlCell {}

impl BufCtrlCell {
    const fn new() -> Self {
        Self(UnsafeCell::new(BufCtrl::new()))
    }
}

/// 缓冲块的数据部分：实际块内容与有效性标志。
struct BufInner {
    /// 数据是否反映磁盘内容。由安装路径清零、`bread` 置位；
    /// 在持有桶锁或数据睡眠锁时访问。
    valid: AtomicBool,

    /// 块数据，由睡眠锁保护，一次只允许一个执行流读写。
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// 块数据本体。对齐到 8 字节，满足由它转换而来的结构的需要。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &[u8; BSIZE] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.0
    }
}

#[cfg(test)]
impl Bcache {
    /// 各散列桶链长之和，用于校验缓冲块守恒。
    fn census(&self) -> usize {
        let mut n = 0;
        for id in 0..NBUK {
            let bucket = self.buckets[id].lock();
            let mut cur = bucket.head;
            while let Some(i) = cur {
                n += 1;
                cur = unsafe { self.ctrl(i) }.next;
            }
        }
        n
    }
}
