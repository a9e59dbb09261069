use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use block_dev::{BlockDevice, Error};

/// 以宿主机上的镜像文件为存储的块设备
#[derive(Debug)]
pub struct BlockFile {
    inner: Mutex<File>,
    block_size: usize,
    block_count: usize,
}

impl BlockFile {
    /// 把文件扩展到`block_size * block_count`字节
    pub fn create(fd: File, block_size: usize, block_count: usize) -> std::io::Result<Self> {
        fd.set_len((block_size * block_count) as u64)?;
        Ok(Self {
            inner: Mutex::new(fd),
            block_size,
            block_count,
        })
    }

    fn seek(file: &mut File, pos: usize, block: usize) -> Result<(), Error> {
        file.seek(SeekFrom::Start(pos as u64))
            .map(drop)
            .map_err(|e| {
                log::error!("seeking block {block}: {e}");
                Error::Io { block }
            })
    }
}

impl BlockDevice for BlockFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read(&self, block_id: usize, off: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.check(block_id, off, buf.len())?;
        let mut file = self.inner.lock().map_err(|_| Error::Io { block: block_id })?;
        Self::seek(&mut file, block_id * self.block_size + off, block_id)?;
        file.read_exact(buf).map_err(|e| {
            log::error!("reading block {block_id}: {e}");
            Error::Io { block: block_id }
        })
    }

    fn prog(&mut self, block_id: usize, off: usize, data: &[u8]) -> Result<(), Error> {
        self.check(block_id, off, data.len())?;
        let block_size = self.block_size;
        let file = self.inner.get_mut().map_err(|_| Error::Io { block: block_id })?;
        Self::seek(file, block_id * block_size + off, block_id)?;
        file.write_all(data).map_err(|e| {
            log::error!("writing block {block_id}: {e}");
            Error::Io { block: block_id }
        })
    }

    fn erase(&mut self, block_id: usize) -> Result<(), Error> {
        let erased = vec![block_dev::MemoryDevice::ERASE_VALUE; self.block_size];
        self.prog(block_id, 0, &erased)
    }
}
