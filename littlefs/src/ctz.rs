//! CTZ 跳表
//!
//! 文件数据按块从后向前链接，结构记录只保存最后一块与文件大小。
//! 第`i`块（`i > 0`）开头存放`ctz(i) + 1`个小端序指针，
//! 第`k`个指针指向第`i - 2^k`块：
//!
//! ```text
//! .--------.  .--------.  .--------.  .--------.  .--------.
//! | data 0 |<-| data 1 |<-| data 2 |<-| data 3 |<-| data 4 |
//! |        |<-|        |--|        |  |        |  |        |
//! |        |  |        |<-|        |--|        |--|        |
//! '--------'  '--------'  '--------'  '--------'  '--------'
//! ```
//!
//! 于是任意位置都能在`O(log n)`次指针跳转内到达，
//! 而平均每块只有两个指针的开销。

use alloc::format;
use alloc::vec;

use block_dev::BlockDevice;
use vfs::Error;

use crate::block::{BlockId, DeviceExt};
use crate::layout::CtzStruct;
use crate::LittleFs;

/// 把文件偏移`off`换算为跳表中的块序号，`off`随之变为块内偏移
pub fn index(block_size: usize, off: &mut usize) -> usize {
    let size = *off;
    let b = block_size - 2 * 4;
    let i = size / b;
    if i == 0 {
        return 0;
    }

    let i = (size - 4 * (popc(i - 1) + 2)) / b;
    *off = size - b * i - 4 * popc(i);
    i
}

/// 第`index`块开头的指针个数
pub fn pointers(index: usize) -> usize {
    if index == 0 {
        0
    } else {
        index.trailing_zeros() as usize + 1
    }
}

fn popc(n: usize) -> usize {
    n.count_ones() as usize
}

/// 不小于`n`的最小的2的幂的指数
fn npw2(n: usize) -> usize {
    (usize::BITS - (n - 1).leading_zeros()) as usize
}

/// 正在构造的跳表
#[derive(Debug, Clone, Copy)]
pub struct CtzWriter {
    /// 当前块
    block: BlockId,
    /// 当前块内下一字节的位置
    off: usize,
    size: usize,
    /// 当前块是否为本次新分配的块
    writing: bool,
}

impl CtzWriter {
    /// 从空跳表开始
    pub fn new() -> Self {
        Self::extending(BlockId::NULL, 0)
    }

    /// 接在已有跳表`head`之后，`size`为保留的前缀长度，`head`为含第`size - 1`字节的块
    pub fn extending(head: BlockId, size: usize) -> Self {
        Self {
            block: head,
            off: 0,
            size,
            writing: false,
        }
    }

    pub fn finish(self) -> CtzStruct {
        CtzStruct {
            head: self.block.into(),
            size: self.size as u32,
        }
    }
}

impl<D: BlockDevice> LittleFs<D> {
    fn check_block(&self, block: BlockId) -> Result<BlockId, Error> {
        if block.index() >= self.geometry.block_count {
            return Err(Error::corrupt(format!("skip-list pointer {block} out of range")));
        }
        Ok(block)
    }

    fn read_pointer(&self, block: BlockId, slot: usize) -> Result<BlockId, Error> {
        let mut raw = [0u8; 4];
        self.dev.read_at(block, 4 * slot, &mut raw)?;
        self.check_block(BlockId::new(u32::from_le_bytes(raw)))
    }

    /// 找到文件偏移`pos`所在的块，返回块号与块内偏移
    pub(crate) fn ctz_find(&self, ctz: CtzStruct, pos: usize) -> Result<(BlockId, usize), Error> {
        let bs = self.block_size();
        let size = ctz.size as usize;
        if pos >= size {
            return Err(Error::corrupt(format!(
                "offset {pos} beyond skip list of {size} bytes"
            )));
        }

        let mut current = index(bs, &mut (size - 1));
        let mut off = pos;
        let target = index(bs, &mut off);
        let mut head = self.check_block(BlockId::new(ctz.head))?;

        while current > target {
            let skip = (npw2(current - target + 1) - 1).min(current.trailing_zeros() as usize);
            head = self.read_pointer(head, skip)?;
            current -= 1 << skip;
        }
        Ok((head, off))
    }

    /// 依次访问跳表的每一块，从最后一块开始
    pub(crate) fn ctz_traverse(
        &self,
        ctz: CtzStruct,
        mut f: impl FnMut(BlockId),
    ) -> Result<(), Error> {
        if ctz.size == 0 {
            return Ok(());
        }

        let mut index = index(self.block_size(), &mut (ctz.size as usize - 1));
        let mut head = self.check_block(BlockId::new(ctz.head))?;
        loop {
            f(head);
            if index == 0 {
                return Ok(());
            }

            // 奇数块只有一个指针；偶数块借第二个指针跳过一块
            if index & 1 == 1 {
                head = self.read_pointer(head, 0)?;
                index -= 1;
            } else {
                f(self.read_pointer(head, 0)?);
                head = self.read_pointer(head, 1)?;
                index -= 2;
            }
        }
    }

    /// 分配新块接在跳表之后，返回新块与其中下一字节的位置。
    ///
    /// 原来的最后一块未写满时，新块复制它的内容并取代它。
    fn ctz_extend(&mut self, head: BlockId, size: usize) -> Result<(BlockId, usize), Error> {
        let bs = self.block_size();
        let nblock = self.alloc()?;
        self.erase(nblock)?;

        if size == 0 {
            return Ok((nblock, 0));
        }

        let mut noff = size - 1;
        let index = index(bs, &mut noff);
        let noff = noff + 1;

        if noff != bs {
            let mut buf = vec![0u8; noff];
            self.dev.read_at(head, 0, &mut buf)?;
            self.dev.prog_at(nblock, 0, &buf)?;
            return Ok((nblock, noff));
        }

        let skips = pointers(index + 1);
        let mut nhead = head;
        for i in 0..skips {
            self.dev
                .prog_at(nblock, 4 * i, &u32::from(nhead).to_le_bytes())?;
            if i != skips - 1 {
                nhead = self.read_pointer(nhead, i)?;
            }
        }
        Ok((nblock, 4 * skips))
    }

    /// 在跳表末尾追加数据
    pub(crate) fn ctz_write(&mut self, writer: &mut CtzWriter, mut data: &[u8]) -> Result<(), Error> {
        let bs = self.block_size();
        while !data.is_empty() {
            if !writer.writing || writer.off == bs {
                (writer.block, writer.off) = self.ctz_extend(writer.block, writer.size)?;
                writer.writing = true;
            }

            let n = data.len().min(bs - writer.off);
            self.dev.prog_at(writer.block, writer.off, &data[..n])?;
            writer.off += n;
            writer.size += n;
            data = &data[n..];
        }
        Ok(())
    }

    /// 在跳表末尾追加`len`个0
    pub(crate) fn ctz_fill(&mut self, writer: &mut CtzWriter, mut len: usize) -> Result<(), Error> {
        let zeros = vec![0u8; len.min(self.block_size())];
        while len > 0 {
            let n = len.min(zeros.len());
            self.ctz_write(writer, &zeros[..n])?;
            len -= n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locate(bs: usize, off: usize) -> (usize, usize) {
        let mut off = off;
        let i = index(bs, &mut off);
        (i, off)
    }

    #[test]
    fn index_vectors() {
        assert_eq!((0, 0), locate(512, 0));
        assert_eq!((0, 504), locate(512, 504));
        assert_eq!((1, 4), locate(512, 512));
        assert_eq!((1, 511), locate(512, 1019));
        assert_eq!((2, 8), locate(512, 1020));
        assert_eq!((3, 4), locate(4096, 4096 + 4092 + 4088));
    }

    #[test]
    fn pointer_counts() {
        let counts: alloc::vec::Vec<_> = (0..9).map(pointers).collect();
        assert_eq!(alloc::vec![0, 1, 2, 1, 3, 1, 2, 1, 4], counts);
    }

    #[test]
    fn index_is_consistent_with_pointers() {
        // 每一块的数据从指针之后开始，到块末尾结束
        let bs = 256;
        let mut start = 0;
        for i in 0..40 {
            assert_eq!((i, 4 * pointers(i)), locate(bs, start));
            let end = start + bs - 4 * pointers(i);
            assert_eq!((i, bs - 1), locate(bs, end - 1));
            start = end;
        }
    }

    #[test]
    fn power_of_two() {
        assert_eq!(1, npw2(2));
        assert_eq!(2, npw2(3));
        assert_eq!(2, npw2(4));
        assert_eq!(3, npw2(5));
    }
}
