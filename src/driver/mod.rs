//! 设备驱动模块

pub mod ramdisk;

pub use ramdisk::DISK;
