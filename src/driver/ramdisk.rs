//! 内存块设备
//!
//! 以内存页充当磁盘扇区的块设备，接口与真实磁盘驱动一致：
//! 按 `(dev, blockno)` 同步读写整块。扇区在首次访问时创建并清零。
//! 设备为每个扇区维护读写次数统计，可用来观察上层缓存的命中情况。

use std::collections::BTreeMap;

use crate::consts::fs::BSIZE;
use crate::fs::Buf;
use crate::spinlock::SpinLock;

/// 全局块设备实例。
pub static DISK: RamDisk = RamDisk::new();

/// RAM 块设备。
///
/// 所有扇区存放在一张自旋锁保护的映射表中，键为 `(dev, blockno)`。
/// 同步接口：`rw` 返回即表示本次传输完成。
pub struct RamDisk {
    sectors: SpinLock<BTreeMap<(u32, u32), Sector>>,
}

/// 单个扇区的内容与 I/O 统计。
struct Sector {
    data: [u8; BSIZE],
    nread: u64,
    nwrite: u64,
}

impl Sector {
    fn new() -> Self {
        Self {
            data: [0; BSIZE],
            nread: 0,
            nwrite: 0,
        }
    }
}

impl RamDisk {
    const fn new() -> Self {
        Self {
            sectors: SpinLock::new(BTreeMap::new(), "ramdisk"),
        }
    }

    /// 同步读写一个磁盘块。
    ///
    /// # 功能说明
    /// `writing` 为真时把缓冲块的内容写入扇区，否则把扇区内容读入
    /// 缓冲块。调用者必须持有该缓冲块的睡眠锁（`Buf` 守卫本身即是
    /// 持有凭证）。
    ///
    /// # 参数
    /// - `buf`: 目标缓冲块，携带 `(dev, blockno)` 标识；
    /// - `writing`: 传输方向，真为写盘。
    pub fn rw(&self, buf: &mut Buf<'_>, writing: bool) {
        let key = (buf.dev(), buf.blockno());
        let mut sectors = self.sectors.lock();
        let sector = sectors.entry(key).or_insert_with(Sector::new);
        if writing {
            sector.data.copy_from_slice(&buf.data()[..]);
            sector.nwrite += 1;
        } else {
            buf.data_mut().copy_from_slice(&sector.data);
            sector.nread += 1;
        }
    }

    /// 扇区被真正读取的次数，从未被访问过的扇区计 0。
    pub fn nread(&self, dev: u32, blockno: u32) -> u64 {
        self.sectors
            .lock()
            .get(&(dev, blockno))
            .map_or(0, |s| s.nread)
    }

    /// 扇区被真正写入的次数。
    pub fn nwrite(&self, dev: u32, blockno: u32) -> u64 {
        self.sectors
            .lock()
            .get(&(dev, blockno))
            .map_or(0, |s| s.nwrite)
    }
}
