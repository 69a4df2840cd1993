//! 文件系统模块
//!
//! 当前只包含块缓冲缓存一层，对上提供按块读写与钉住接口，
//! 对下经块设备驱动同步读写磁盘。

mod bio;

pub use bio::{Bcache, Buf, BufData, BCACHE};
