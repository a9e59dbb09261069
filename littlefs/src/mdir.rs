//! 元数据对
//!
//! 一个元数据对由两块组成，修订号较新且含有效提交的一块为当前块。
//! 追加写入当前块；当前块写满时，把全部有效记录压缩进另一块并递增修订号，
//! 于是当前块的切换就是这次压缩本身，不需要额外的指针写入。

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use block_dev::BlockDevice;
use vfs::Error;

use crate::block::{BlockId, DeviceExt, NULL_PAIR, Pair, PairExt};
use crate::commit::{self, Commit};
use crate::layout::{GState, Tag, ty};
use crate::util::{align_up, seq_newer};
use crate::LittleFs;

/// 元数据对中的一个目录项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    /// 名字记录的类型：REG、DIR或SUPERBLOCK
    pub kind: u16,
    pub name: Vec<u8>,
    /// 结构记录的类型与数据
    pub data: Option<(u16, Vec<u8>)>,
    /// 自定义属性
    pub attrs: BTreeMap<u8, Vec<u8>>,
}

impl Entry {
    pub fn is_visible(&self) -> bool {
        matches!(self.kind, ty::REG | ty::DIR)
    }

    /// 压缩时按顺序写出的记录
    pub fn records(&self, id: u16) -> Vec<(Tag, &[u8])> {
        let mut records = Vec::with_capacity(2 + self.attrs.len());
        records.push((Tag::new(self.kind, id, self.name.len() as u16), &self.name[..]));
        if let Some((ty, data)) = &self.data {
            records.push((Tag::new(*ty, id, data.len() as u16), &data[..]));
        }
        for (&t, data) in &self.attrs {
            records.push((Tag::new(ty::USERATTR + u16::from(t), id, data.len() as u16), &data[..]));
        }
        records
    }

    /// 压缩后在块中占用的字节数
    pub fn disk_size(&self) -> usize {
        4 + self.name.len()
            + self.data.as_ref().map_or(0, |(_, data)| 4 + data.len())
            + self.attrs.values().map(|data| 4 + data.len()).sum::<usize>()
    }
}

/// 一条待提交的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub tag: Tag,
    pub data: Vec<u8>,
}

impl Attr {
    pub fn new(tag: Tag, data: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            data: data.into(),
        }
    }

    pub fn create(id: u16) -> Self {
        Self::new(Tag::new(ty::CREATE, id, 0), Vec::new())
    }

    pub fn delete(id: u16) -> Self {
        Self::new(Tag::new(ty::DELETE, id, 0), Vec::new())
    }

    pub fn name(kind: u16, id: u16, name: &[u8]) -> Self {
        Self::new(Tag::new(kind, id, name.len() as u16), name)
    }

    pub fn structure(kind: u16, id: u16, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self::new(Tag::new(kind, id, data.len() as u16), data)
    }

    pub fn user(t: u8, id: u16, data: &[u8]) -> Self {
        Self::new(Tag::new(ty::USERATTR + u16::from(t), id, data.len() as u16), data)
    }

    pub fn remove_user(t: u8, id: u16) -> Self {
        Self::new(Tag::new(ty::USERATTR + u16::from(t), id, Tag::SIZE_DELETED), Vec::new())
    }

    pub fn tail(split: bool, pair: Pair) -> Self {
        Self::new(Tag::new(ty::TAIL + u16::from(split), Tag::ID_NONE, 8), pair.to_bytes())
    }
}

/// 元数据对在内存中的模型：回放日志后的目录项与尾指针
#[derive(Debug, Clone)]
pub struct Mdir {
    /// `pair[0]`为当前块
    pub pair: Pair,
    pub rev: u32,
    /// 当前块中日志的结束位置
    pub off: usize,
    pub etag: Tag,
    /// 可以在`off`处直接追加
    pub erased: bool,
    /// 尾指针为硬链接，即同一目录的延续
    pub split: bool,
    pub tail: Pair,
    /// 本元数据对对全局状态的贡献
    pub gdelta: GState,
    pub seed: u32,
    pub entries: Vec<Entry>,
}

impl Mdir {
    /// 新分配的元数据对，还没有任何提交
    pub fn new(pair: Pair, rev: u32) -> Self {
        Self {
            pair,
            rev,
            off: 4,
            etag: Tag::NULL,
            erased: false,
            split: false,
            tail: NULL_PAIR,
            gdelta: GState::default(),
            seed: 0,
            entries: Vec::new(),
        }
    }

    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    /// 按日志顺序回放一条记录
    pub fn apply(&mut self, tag: Tag, data: &[u8]) -> Result<(), Error> {
        let id = usize::from(tag.id());
        match tag.type1() {
            ty::NAME => {
                if self.entries.len() <= id {
                    self.entries.resize_with(id + 1, Entry::default);
                }
                let entry = &mut self.entries[id];
                entry.kind = tag.type3();
                entry.name = data.to_vec();
            }
            ty::STRUCT => {
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.data = (!tag.is_delete()).then(|| (tag.type3(), data.to_vec()));
                }
            }
            ty::USERATTR => {
                if let Some(entry) = self.entries.get_mut(id) {
                    if tag.is_delete() {
                        entry.attrs.remove(&tag.chunk());
                    } else {
                        entry.attrs.insert(tag.chunk(), data.to_vec());
                    }
                }
            }
            ty::SPLICE => match tag.type3() {
                ty::CREATE if id <= self.entries.len() => self.entries.insert(id, Entry::default()),
                ty::DELETE if id < self.entries.len() => {
                    self.entries.remove(id);
                }
                _ => {
                    return Err(Error::corrupt(format!(
                        "splice of id {id} in a pair with {} entries",
                        self.entries.len()
                    )));
                }
            },
            ty::TAIL => {
                self.tail = Pair::from_bytes(data)?;
                self.split = tag.chunk() & 1 != 0;
            }
            ty::GLOBALS => self.gdelta = GState::parse(data)?,
            _ => log::trace!("ignoring record {:#010x}", tag.raw()),
        }
        Ok(())
    }
}

impl<D: BlockDevice> LittleFs<D> {
    /// 读取一个元数据对，两块都没有有效提交时返回[`Error::CorruptImage`]
    pub(crate) fn fetch(&self, pair: Pair) -> Result<Arc<Mdir>, Error> {
        if let Some(dir) = self.cache.lock().get(&pair) {
            return Ok(Arc::clone(dir));
        }

        let count = self.geometry.block_count;
        if pair.iter().any(|block| block.index() >= count) {
            return Err(Error::corrupt(format!(
                "metadata pair {} out of range",
                pair.display()
            )));
        }

        let bs = self.block_size();
        let mut blocks = [vec![0u8; bs], vec![0u8; bs]];
        for (buf, &block) in blocks.iter_mut().zip(&pair) {
            self.dev.read_at(block, 0, buf)?;
        }
        let revs = blocks
            .each_ref()
            .map(|buf| u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]));

        // 先试修订号较新的一块
        let newer = usize::from(seq_newer(revs[1], revs[0]));
        for i in [newer, 1 - newer] {
            let Some(scan) = commit::scan(&blocks[i], self.prog_size(), self.fcrc_enabled())
            else {
                log::debug!("block {} of {} has no valid commit", pair[i], pair.display());
                continue;
            };

            let mut dir = Mdir {
                pair: [pair[i], pair[1 - i]],
                rev: scan.rev,
                off: scan.off,
                etag: scan.etag,
                erased: scan.erased,
                seed: scan.seed,
                ..Mdir::new(pair, scan.rev)
            };
            for (tag, range) in scan.records {
                dir.apply(tag, &blocks[i][range])?;
            }

            let dir = Arc::new(dir);
            self.cache.lock().insert(pair, Arc::clone(&dir));
            return Ok(dir);
        }

        Err(Error::corrupt(format!(
            "neither block of metadata pair {} is valid",
            pair.display()
        )))
    }

    /// 丢弃缓存后重新读取，得到可修改的副本
    pub(crate) fn refetch(&self, pair: Pair) -> Result<Mdir, Error> {
        self.evict(&pair);
        Ok(Mdir::clone(&*self.fetch(pair)?))
    }

    pub(crate) fn evict(&self, pair: &Pair) {
        self.cache.lock().retain(|key, _| !key.overlaps(pair));
    }

    pub(crate) fn erase(&mut self, block: BlockId) -> Result<(), Error> {
        self.evict(&[block, block]);
        self.dev.erase_at(block)
    }

    /// 分配一个新的元数据对，沿用块上原有的修订号
    pub(crate) fn dir_alloc(&mut self) -> Result<Mdir, Error> {
        let second = self.alloc()?;
        let first = self.alloc()?;

        let mut raw = [0u8; 4];
        self.dev.read_at(first, 0, &mut raw)?;
        Ok(Mdir::new([first, second], u32::from_le_bytes(raw)))
    }

    /// 向元数据对提交一组记录。
    ///
    /// 优先追加；追加放不下或校验失败时压缩，压缩仍放不下时分裂。
    /// 删除使一个延续元数据对变空时，直接把它从链表中摘除。
    /// 返回后`dir`为提交后的最新状态。
    ///
    /// 失败的提交在链表中不可达，磁盘上的全局状态保持不变。
    pub(crate) fn dir_commit(&mut self, dir: &mut Mdir, attrs: &[Attr]) -> Result<(), Error> {
        let (gdisk, gdelta) = (self.gdisk, self.gdelta);
        self.commit_records(dir, attrs).inspect_err(|_| {
            self.gdisk = gdisk;
            self.gdelta = gdelta;
        })
    }

    fn commit_records(&mut self, dir: &mut Mdir, attrs: &[Attr]) -> Result<(), Error> {
        let mut next = dir.clone();
        let mut deleted = false;
        for attr in attrs {
            deleted |= attr.tag.type3() == ty::DELETE;
            next.apply(attr.tag, &attr.data)?;
        }
        self.evict(&dir.pair);

        if deleted && next.entries.is_empty() {
            if let Some(mut pred) = self.fs_pred(&dir.pair)? {
                if pred.split {
                    log::debug!("dropping empty {}", dir.pair.display());
                    self.dir_drop(&mut pred, &next)?;
                    *dir = next;
                    return Ok(());
                }
            }
        }

        if dir.erased {
            match self.dir_append(dir, attrs) {
                Ok(()) => {
                    self.settle_gstate();
                    self.allocator.invalidate();
                    *dir = self.refetch(dir.pair)?;
                    return Ok(());
                }
                Err(Error::NoSpace) => log::debug!("{} is full, compacting", dir.pair.display()),
                Err(Error::CorruptImage(reason)) => {
                    log::warn!("append to {} failed: {reason}", dir.pair.display())
                }
                Err(e) => return Err(e),
            }
        }

        self.dir_splitting_compact(&mut next)?;
        self.allocator.invalidate();
        *dir = self.refetch(next.pair)?;
        Ok(())
    }

    fn dir_append(&mut self, dir: &Mdir, attrs: &[Attr]) -> Result<(), Error> {
        let (prog_size, fcrc) = (self.prog_size(), self.fcrc_enabled());
        let delta = self.pending_delta();
        let mut commit = Commit::append(dir.pair[0], dir.off, dir.etag, self.block_size() - 8);

        for attr in attrs {
            commit.attr(&mut self.dev, attr.tag, &attr.data)?;
        }
        if !delta.is_zero() {
            let delta = delta ^ dir.gdelta;
            commit.attr(&mut self.dev, movestate_tag(), &delta.to_bytes()?)?;
        }
        commit.finish(&mut self.dev, prog_size, fcrc)?;

        log::debug!(
            "appended {} records to {} at {}",
            attrs.len(),
            dir.pair.display(),
            dir.off
        );
        Ok(())
    }

    /// 压缩，必要时先把靠后的目录项分裂到新的元数据对
    fn dir_splitting_compact(&mut self, dir: &mut Mdir) -> Result<(), Error> {
        let bs = self.block_size();
        let limit = (bs - 40).min(align_up(bs / 2, self.prog_size()));

        loop {
            let end = dir.entries.len();
            let mut split = 0;
            while end - split > 1 {
                let size: usize = dir.entries[split..].iter().map(Entry::disk_size).sum();
                if end - split < 0xff && size <= limit {
                    break;
                }
                split += (end - split) / 2;
            }
            if split == 0 {
                break;
            }

            match self.dir_split(dir, split) {
                Ok(()) => {}
                Err(Error::NoSpace) => {
                    log::warn!("unable to split {}, compacting in place", dir.pair.display());
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        self.dir_compact(dir)
    }

    fn dir_split(&mut self, dir: &mut Mdir, split: usize) -> Result<(), Error> {
        let mut tail = self.dir_alloc()?;
        tail.split = dir.split;
        tail.tail = dir.tail;
        tail.entries = dir.entries[split..].to_vec();
        self.dir_compact(&mut tail)?;

        log::debug!(
            "split {} at id {split} into {}",
            dir.pair.display(),
            tail.pair.display()
        );
        dir.entries.truncate(split);
        dir.tail = tail.pair;
        dir.split = true;
        Ok(())
    }

    /// 把全部有效记录写入非当前块，成功后它成为当前块
    fn dir_compact(&mut self, dir: &mut Mdir) -> Result<(), Error> {
        let (prog_size, fcrc) = (self.prog_size(), self.fcrc_enabled());
        let rev = dir.rev.wrapping_add(1);
        let block = dir.pair[1];
        let delta = self.pending_delta() ^ dir.gdelta;

        self.erase(block)?;
        let mut commit = Commit::fresh(block, self.block_size() - 8);
        commit.prog(&mut self.dev, &rev.to_le_bytes())?;
        for (id, entry) in dir.entries.iter().enumerate() {
            for (tag, data) in entry.records(id as u16) {
                commit.attr(&mut self.dev, tag, data)?;
            }
        }
        if !dir.tail.is_null() {
            let tail = Attr::tail(dir.split, dir.tail);
            commit.attr(&mut self.dev, tail.tag, &tail.data)?;
        }
        if !delta.is_zero() {
            commit.attr(&mut self.dev, movestate_tag(), &delta.to_bytes()?)?;
        }
        commit.finish(&mut self.dev, prog_size, fcrc)?;

        log::debug!(
            "compacted {} into block {block}, rev {rev}, {} entries",
            dir.pair.display(),
            dir.entries.len()
        );
        dir.pair.swap(0, 1);
        dir.rev = rev;
        (dir.off, dir.etag) = commit.state();
        dir.gdelta = delta;
        self.evict(&dir.pair);
        self.settle_gstate();
        Ok(())
    }

    /// 把`tail`从链表中摘除，它的全局状态增量转交给`pred`
    pub(crate) fn dir_drop(&mut self, pred: &mut Mdir, tail: &Mdir) -> Result<(), Error> {
        let gdelta = self.gdelta;
        self.gdelta ^= tail.gdelta;
        self.dir_commit(pred, &[Attr::tail(tail.split, tail.tail)])
            .inspect_err(|_| self.gdelta = gdelta)
    }

    /// 尚未写入磁盘的全局状态变化，孤儿计数只保留标志位
    fn pending_delta(&self) -> GState {
        (self.gstate ^ self.gdisk ^ self.gdelta).masked()
    }

    fn settle_gstate(&mut self) {
        self.gdisk = self.gstate;
        self.gdelta = GState::default();
    }
}

fn movestate_tag() -> Tag {
    Tag::new(ty::MOVESTATE, Tag::ID_NONE, GState::SIZE as u16)
}
