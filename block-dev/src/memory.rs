use alloc::vec;
use alloc::vec::Vec;

use crate::{BlockDevice, Error};

/// 内存中的闪存镜像
///
/// 擦除后的字节为[`MemoryDevice::ERASE_VALUE`]，与 NOR 闪存一致。
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    data: Vec<u8>,
    block_size: usize,
}

impl MemoryDevice {
    pub const ERASE_VALUE: u8 = 0xff;

    /// 创建一块全部处于擦除状态的设备
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            data: vec![Self::ERASE_VALUE; block_size * block_count],
            block_size,
        }
    }

    /// 以已有镜像为内容，多余的不满一块的尾部会被丢弃
    pub fn from_image(mut image: Vec<u8>, block_size: usize) -> Self {
        image.truncate(image.len() - image.len() % block_size);
        Self {
            data: image,
            block_size,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, block_id: usize, off: usize, len: usize) -> Result<core::ops::Range<usize>, Error> {
        self.check(block_id, off, len)?;
        let start = block_id * self.block_size + off;
        Ok(start..start + len)
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.data.len() / self.block_size
    }

    fn read(&self, block_id: usize, off: usize, buf: &mut [u8]) -> Result<(), Error> {
        let range = self.range(block_id, off, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn prog(&mut self, block_id: usize, off: usize, data: &[u8]) -> Result<(), Error> {
        let range = self.range(block_id, off, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, block_id: usize) -> Result<(), Error> {
        let range = self.range(block_id, 0, self.block_size)?;
        self.data[range].fill(Self::ERASE_VALUE);
        Ok(())
    }
}
