//! # 块设备接口层
//!
//! 闪存以**块**为单位组织：读取可以落在块内任意偏移，
//! 编程（prog）只写入已擦除的区域，擦除则总是作用于整块。
//! [`BlockDevice`] 就是对这种闪存语义的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 文件系统只通过块设备驱动接触原始字节。

#![no_std]

extern crate alloc;

mod memory;

pub use self::memory::MemoryDevice;

use core::any::Any;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("block {block} out of range, device has {count} blocks")]
    OutOfRange { block: usize, count: usize },

    #[error("access {off}+{len} crosses the end of block {block}")]
    OutOfBounds { block: usize, off: usize, len: usize },

    /// 底层存储（例如镜像文件）读写失败
    #[error("I/O error on block {block}")]
    Io { block: usize },
}

/// 块设备驱动特质
///
/// 读取只需要共享引用，写入与擦除需要独占引用，
/// 因此同一设备上的并发读是安全的，而写总是由调用者串行化。
pub trait BlockDevice: Send + Sync + Any {
    /// 块的字节数
    fn block_size(&self) -> usize;

    /// 块的总数
    fn block_count(&self) -> usize;

    fn read(&self, block_id: usize, off: usize, buf: &mut [u8]) -> Result<(), Error>;

    fn prog(&mut self, block_id: usize, off: usize, data: &[u8]) -> Result<(), Error>;

    fn erase(&mut self, block_id: usize) -> Result<(), Error>;

    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.read(block_id, 0, buf)
    }

    fn write_block(&mut self, block_id: usize, buf: &[u8]) -> Result<(), Error> {
        self.erase(block_id)?;
        self.prog(block_id, 0, buf)
    }

    /// 检查一次访问是否落在某个块之内
    fn check(&self, block_id: usize, off: usize, len: usize) -> Result<(), Error> {
        if block_id >= self.block_count() {
            return Err(Error::OutOfRange {
                block: block_id,
                count: self.block_count(),
            });
        }
        if off.checked_add(len).is_none_or(|end| end > self.block_size()) {
            return Err(Error::OutOfBounds {
                block: block_id,
                off,
                len,
            });
        }
        Ok(())
    }
}
