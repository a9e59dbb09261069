//! 元数据日志
//!
//! 一个元数据块的内容：
//!
//! ```text
//! | rev | tag data ... | crc | tag data ... | fcrc | crc | (erased) |
//!       '--- commit ------'  '--- commit ------------'
//! ```
//!
//! 每次提交以 CRC 记录结束；CRC 覆盖修订号（仅第一次提交）与提交内全部标签及数据，
//! 不覆盖提交末尾的填充。扫描在第一处无效标签、越界或 CRC 不符处停止，
//! 之前最后一次完整提交就是该块的有效日志。

use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use block_dev::BlockDevice;
use vfs::Error;

use crate::block::{BlockId, DeviceExt};
use crate::layout::crc::{self, crc32};
use crate::layout::{Fcrc, Tag, ty};
use crate::util::align_up;

/// 扫描单个块得到的有效日志
#[derive(Debug)]
pub struct Scan {
    pub rev: u32,
    /// 最后一次有效提交的结束位置，也是下一次追加的起点
    pub off: usize,
    /// 下一次追加时的异或基准
    pub etag: Tag,
    /// 提交之后仍处于擦除状态，可以直接追加
    pub erased: bool,
    /// 有效提交内的记录（不含 CRC 类记录），按日志顺序
    pub records: Vec<(Tag, Range<usize>)>,
    /// 各次提交 CRC 的累积
    pub seed: u32,
}

/// 扫描一个元数据块，块内没有任何完整提交时返回`None`。
///
/// # 参数
///
/// `fcrc`: 2.1 及以上的磁盘只在找到匹配的 FCRC 时才认为提交之后是擦除状态，
///         2.0 的磁盘没有 FCRC，提交对齐即可。
pub fn scan(buf: &[u8], prog_size: usize, fcrc: bool) -> Option<Scan> {
    let bs = buf.len();
    let rev = u32::from_le_bytes(buf.get(..4)?.try_into().ok()?);

    let mut off = 0;
    let mut ptag = Tag::NULL;
    let mut crc = crc32(crc::INIT, &buf[..4]);
    let mut seed = 0;

    let mut pending = Vec::new();
    let mut records = Vec::new();
    let mut pending_fcrc = None;
    let mut committed_fcrc = None;
    let mut last = None;
    let mut maybe_erased = false;

    loop {
        off += ptag.dsize();
        let Some(raw) = buf.get(off..off + 4) else {
            break;
        };
        crc = crc32(crc, raw);
        let tag = Tag::decode([raw[0], raw[1], raw[2], raw[3]], ptag);
        if !tag.is_valid() {
            // 紧跟在提交之后的无效标签可能只是擦除区域
            maybe_erased = ptag.type2() == ty::CCRC;
            break;
        }
        if off + tag.dsize() > bs {
            break;
        }
        ptag = tag;

        if tag.type2() == ty::CCRC {
            if tag.dsize() < 8 {
                break;
            }
            let stored = u32::from_le_bytes([buf[off + 4], buf[off + 5], buf[off + 6], buf[off + 7]]);
            if crc != stored {
                log::trace!("crc mismatch at {off}: {crc:#010x} != {stored:#010x}");
                break;
            }
            // 有效位的极性由提交声明
            ptag = ptag.perturb(tag.chunk() & 1 != 0);
            seed = crc32(seed, &stored.to_le_bytes());
            records.append(&mut pending);
            committed_fcrc = pending_fcrc.take();
            last = Some((off + tag.dsize(), ptag));
            crc = crc::INIT;
            continue;
        }

        let data = off + 4..off + tag.dsize();
        crc = crc32(crc, &buf[data.clone()]);
        if tag.type3() == ty::FCRC {
            pending_fcrc = Fcrc::parse(&buf[data]).ok();
        } else {
            pending.push((tag, data));
        }
    }

    let (end, etag) = last?;
    let erased = maybe_erased
        && end % prog_size == 0
        && (!fcrc
            || committed_fcrc.is_some_and(|f: Fcrc| {
                let size = f.size as usize;
                end + size <= bs && crc32(crc::INIT, &buf[end..end + size]) == f.crc
            }));

    Some(Scan {
        rev,
        off: end,
        etag,
        erased,
        records,
        seed,
    })
}

/// 正在写入的一次提交
#[derive(Debug)]
pub struct Commit {
    block: BlockId,
    off: usize,
    ptag: Tag,
    crc: u32,
    /// 本次提交的起点，校验从这里开始
    begin: usize,
    /// 记录不能越过的位置，留出 CRC 记录的空间
    end: usize,
}

impl Commit {
    /// 在已有日志之后追加
    pub fn append(block: BlockId, off: usize, ptag: Tag, end: usize) -> Self {
        Self {
            block,
            off,
            ptag,
            crc: crc::INIT,
            begin: off,
            end,
        }
    }

    /// 从刚擦除的块的开头写起
    pub fn fresh(block: BlockId, end: usize) -> Self {
        Self::append(block, 0, Tag::NULL, end)
    }

    pub fn prog<D: BlockDevice + ?Sized>(&mut self, dev: &mut D, data: &[u8]) -> Result<(), Error> {
        dev.prog_at(self.block, self.off, data)?;
        self.crc = crc32(self.crc, data);
        self.off += data.len();
        Ok(())
    }

    /// 写入一条记录，放不下时返回[`Error::NoSpace`]
    pub fn attr<D: BlockDevice + ?Sized>(&mut self, dev: &mut D, tag: Tag, data: &[u8]) -> Result<(), Error> {
        if self.off + tag.dsize() > self.end {
            return Err(Error::NoSpace);
        }
        debug_assert_eq!(tag.dsize() - 4, data.len());

        self.prog(dev, &tag.encode(self.ptag))?;
        self.prog(dev, data)?;
        self.ptag = tag.masked();
        Ok(())
    }

    /// 以 CRC 记录结束提交，并回读校验。
    ///
    /// 提交末尾对齐到编程单元；若之后还有完整的编程单元，
    /// 2.1 的磁盘会先写一条 FCRC 记录它当前的擦除状态。
    pub fn finish<D: BlockDevice + ?Sized>(
        &mut self,
        dev: &mut D,
        prog_size: usize,
        fcrc: bool,
    ) -> Result<(), Error> {
        let bs = dev.block_size();
        let end = align_up((self.off + 5 * 4).min(bs), prog_size);

        let mut off1 = 0;
        let mut crc1 = 0;

        // 填充不参与 CRC，因此过长的填充需要拆成多条 CRC 记录
        while self.off < end {
            let mut noff = (end - (self.off + 4)).min(0x3fe) + (self.off + 4);
            if noff < end {
                noff = noff.min(end - 5 * 4);
            }

            let mut eperturb = 0xff;
            if noff >= end && noff <= bs - prog_size {
                let mut next = vec![0u8; prog_size];
                dev.read_at(self.block, noff, &mut next)?;
                eperturb = next[0];
                if fcrc {
                    let fcrc = Fcrc {
                        size: prog_size as u32,
                        crc: crc32(crc::INIT, &next),
                    };
                    self.attr(
                        dev,
                        Tag::new(ty::FCRC, Tag::ID_NONE, Fcrc::SIZE as u16),
                        &fcrc.to_bytes()?,
                    )?;
                }
            }

            let ntag = Tag::new(
                ty::CCRC + u16::from(!eperturb >> 7),
                Tag::ID_NONE,
                (noff - (self.off + 4)) as u16,
            );
            let mut footer = [0u8; 8];
            footer[..4].copy_from_slice(&ntag.encode(self.ptag));
            self.crc = crc32(self.crc, &footer[..4]);
            footer[4..].copy_from_slice(&self.crc.to_le_bytes());
            dev.prog_at(self.block, self.off, &footer)?;

            if off1 == 0 {
                off1 = self.off + 4;
                crc1 = self.crc;
            }

            self.off = noff;
            self.ptag = ntag.perturb(eperturb & 0x80 == 0);
            self.crc = crc::INIT;
        }

        // 回读校验，填充提交不必检查
        let mut written = vec![0u8; off1 - self.begin];
        dev.read_at(self.block, self.begin, &mut written)?;
        let crc = crc32(crc::INIT, &written);
        if crc != crc1 {
            return Err(Error::corrupt(format!(
                "commit to block {} failed verification",
                self.block
            )));
        }

        let mut stored = [0u8; 4];
        dev.read_at(self.block, off1, &mut stored)?;
        if crc32(crc, &stored) != 0 {
            return Err(Error::corrupt(format!(
                "commit crc of block {} failed verification",
                self.block
            )));
        }

        Ok(())
    }

    /// 提交结束后的日志位置与异或基准
    pub fn state(&self) -> (usize, Tag) {
        (self.off, self.ptag)
    }
}

#[cfg(test)]
mod tests {
    use block_dev::MemoryDevice;

    use super::*;

    fn read(dev: &MemoryDevice, block: u32) -> Vec<u8> {
        let mut buf = vec![0u8; dev.block_size()];
        dev.read_block(block as usize, &mut buf).unwrap();
        buf
    }

    fn write_commit(dev: &mut MemoryDevice, fcrc: bool) -> (usize, Tag) {
        let block = BlockId::new(0);
        let mut commit = Commit::fresh(block, dev.block_size() - 8);
        commit.prog(dev, &7u32.to_le_bytes()).unwrap();
        commit
            .attr(dev, Tag::new(ty::CREATE, 0, 0), &[])
            .unwrap();
        commit
            .attr(dev, Tag::new(ty::REG, 0, 5), b"hello")
            .unwrap();
        commit.finish(dev, 16, fcrc).unwrap();
        commit.state()
    }

    #[test]
    fn commit_then_scan() {
        let mut dev = MemoryDevice::new(512, 2);
        let (off, etag) = write_commit(&mut dev, true);
        assert_eq!(0, off % 16);

        let scan = scan(&read(&dev, 0), 16, true).unwrap();
        assert_eq!(7, scan.rev);
        assert_eq!(off, scan.off);
        assert_eq!(etag, scan.etag);
        assert!(scan.erased);
        let tags: Vec<_> = scan.records.iter().map(|(tag, _)| tag.type3()).collect();
        assert_eq!(vec![ty::CREATE, ty::REG], tags);
        assert_eq!(b"hello", &read(&dev, 0)[scan.records[1].1.clone()]);
    }

    #[test]
    fn append_after_commit() {
        let mut dev = MemoryDevice::new(512, 2);
        let (off, etag) = write_commit(&mut dev, true);

        let mut commit = Commit::append(BlockId::new(0), off, etag, 504);
        commit
            .attr(&mut dev, Tag::new(ty::DELETE, 0, 0), &[])
            .unwrap();
        commit.finish(&mut dev, 16, true).unwrap();

        let scan = scan(&read(&dev, 0), 16, true).unwrap();
        assert_eq!(commit.state().0, scan.off);
        assert_eq!(3, scan.records.len());
    }

    #[test]
    fn torn_commit_is_ignored() {
        let mut dev = MemoryDevice::new(512, 2);
        let (off, etag) = write_commit(&mut dev, true);

        // 第二次提交只写了一半：记录已写入，CRC 丢失
        let mut commit = Commit::append(BlockId::new(0), off, etag, 504);
        commit
            .attr(&mut dev, Tag::new(ty::DELETE, 0, 0), &[])
            .unwrap();

        let scan = scan(&read(&dev, 0), 16, true).unwrap();
        assert_eq!(off, scan.off);
        assert_eq!(2, scan.records.len());
        // 之后的区域已被写过，不能再追加
        assert!(!scan.erased);
    }

    #[test]
    fn corrupted_byte_invalidates_commit() {
        let mut dev = MemoryDevice::new(512, 2);
        write_commit(&mut dev, false);
        let mut buf = read(&dev, 0);
        buf[12] ^= 0x01;
        assert!(scan(&buf, 16, false).is_none());
    }

    #[test]
    fn v2_0_needs_no_fcrc() {
        let mut dev = MemoryDevice::new(512, 2);
        let (off, _) = write_commit(&mut dev, false);
        let buf = read(&dev, 0);
        let scan20 = scan(&buf, 16, false).unwrap();
        assert!(scan20.erased);
        // 没有 FCRC 的块在 2.1 下不被视为可追加
        let scan21 = scan(&buf, 16, true).unwrap();
        assert_eq!(off, scan21.off);
        assert!(!scan21.erased);
    }
}
