//! 块分配器
//!
//! 磁盘上不保存空闲块信息：遍历全部元数据对与文件跳表即得到已用块，
//! 其余皆为空闲。遍历的结果缓存为位图，每次提交后失效。

use alloc::vec;
use alloc::vec::Vec;
use core::ops::ControlFlow;

use block_dev::BlockDevice;
use vfs::Error;

use crate::block::BlockId;
use crate::layout::{CtzStruct, ty};
use crate::LittleFs;

/// 块的占用情况
#[derive(Debug, Clone)]
pub struct Bitmap {
    groups: Vec<u64>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            groups: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// 标记为已用，返回此前是否空闲；越界的块号被忽略
    pub fn set(&mut self, block: usize) -> bool {
        if block >= self.len {
            return false;
        }
        let (group_index, ingroup_index) = (block / 64, block % 64);
        let free = self.groups[group_index] & (1 << ingroup_index) == 0;
        self.groups[group_index] |= 1 << ingroup_index;
        free
    }

    /// 从`start`开始循环查找第一个空闲块
    pub fn find_free(&self, start: usize) -> Option<usize> {
        let start = if start < self.len { start } else { 0 };
        self.first_free(start, self.len)
            .or_else(|| self.first_free(0, start))
    }

    fn first_free(&self, from: usize, to: usize) -> Option<usize> {
        let mut block = from;
        while block < to {
            let group_index = block / 64;
            // 屏蔽组内`block`之前的位
            let bits = self.groups[group_index] | ((1u64 << (block % 64)) - 1);
            if bits != u64::MAX {
                let found = group_index * 64 + bits.trailing_ones() as usize;
                return (found < to).then_some(found);
            }
            block = (group_index + 1) * 64;
        }
        None
    }

    pub fn count(&self) -> usize {
        self.groups.iter().map(|bits| bits.count_ones() as usize).sum()
    }
}

#[derive(Debug)]
pub struct Allocator {
    /// `None`表示需要重新遍历
    map: Option<Bitmap>,
    /// 下一次分配开始查找的位置
    cursor: usize,
    /// 本次操作已分配、尚未被任何提交引用的块
    inflight: Vec<BlockId>,
}

impl Allocator {
    pub fn new(cursor: usize) -> Self {
        Self {
            map: None,
            cursor,
            inflight: Vec::new(),
        }
    }

    /// 格式化时磁盘上还没有任何结构，所有块都是空闲的
    pub fn empty(block_count: usize) -> Self {
        Self {
            map: Some(Bitmap::new(block_count)),
            cursor: 0,
            inflight: Vec::new(),
        }
    }

    pub fn invalidate(&mut self) {
        self.map = None;
    }

    /// 一次操作开始时调用，此前分配的块都已被提交引用或已被放弃
    pub fn checkpoint(&mut self) {
        self.inflight.clear();
        self.map = None;
    }
}

impl<D: BlockDevice> LittleFs<D> {
    pub(crate) fn alloc(&mut self) -> Result<BlockId, Error> {
        let count = self.geometry.block_count;
        let mut rescanned = false;
        loop {
            let mut map = match self.allocator.map.take() {
                Some(map) => map,
                None => {
                    rescanned = true;
                    self.used_blocks()?
                }
            };

            let found = map.find_free(self.allocator.cursor);
            if let Some(block) = found {
                map.set(block);
            }
            self.allocator.map = Some(map);

            match found {
                Some(block) => {
                    let block = BlockId::new(block as u32);
                    self.allocator.cursor = (block.index() + 1) % count;
                    self.allocator.inflight.push(block);
                    log::trace!("allocated block {block}");
                    return Ok(block);
                }
                None if rescanned => {
                    log::warn!("no free blocks among {count}");
                    return Err(Error::NoSpace);
                }
                // 缓存的位图可能还记着已释放的块
                None => self.allocator.invalidate(),
            }
        }
    }

    /// 遍历得到已用块，含本次操作中已分配的块
    fn used_blocks(&self) -> Result<Bitmap, Error> {
        let mut map = self.referenced_blocks()?;
        for block in &self.allocator.inflight {
            map.set(block.index());
        }
        Ok(map)
    }

    /// 被元数据对与文件跳表引用的块
    pub(crate) fn referenced_blocks(&self) -> Result<Bitmap, Error> {
        let mut map = Bitmap::new(self.geometry.block_count);
        let mut chains = Vec::new();
        self.walk(|dir| {
            for block in dir.pair {
                map.set(block.index());
            }
            for entry in &dir.entries {
                if let Some((ty::CTZSTRUCT, data)) = &entry.data {
                    chains.push(CtzStruct::parse(data));
                }
            }
            ControlFlow::<()>::Continue(())
        })?;

        for ctz in chains {
            self.ctz_traverse(ctz?, |block| {
                map.set(block.index());
            })?;
        }
        Ok(map)
    }
}
