//! 目录树
//!
//! 所有元数据对经尾指针串成一条链表，从超级块所在的`{0, 1}`开始。
//! 一个目录占据链表中连续的一段：首个元数据对由父目录的目录项引用，
//! 其后以硬尾指针（`split`）相连的元数据对是它的延续。
//!
//! 目录项按名字排序，子目录只以元数据对的块号被引用，
//! 遍历到时才读取。

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::ops::ControlFlow::{self, Break, Continue};

use block_dev::BlockDevice;
use vfs::{DirEntry, DirEntryType, Error};

use crate::block::{NULL_PAIR, Pair, PairExt, ROOT_PAIR};
use crate::layout::{CtzStruct, Tag, ty};
use crate::mdir::{Attr, Entry, Mdir};
use crate::path::Path;
use crate::{ctz, LittleFs, Pending};

/// 目录项的结构记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Struct {
    /// 子目录的首个元数据对
    Dir(Pair),
    Inline(Vec<u8>),
    Ctz(CtzStruct),
}

impl Struct {
    pub fn of(entry: &Entry) -> Result<Self, Error> {
        match &entry.data {
            Some((ty::DIRSTRUCT, data)) => Ok(Self::Dir(Pair::from_bytes(data)?)),
            Some((ty::INLINESTRUCT, data)) => Ok(Self::Inline(data.clone())),
            Some((ty::CTZSTRUCT, data)) => Ok(Self::Ctz(CtzStruct::parse(data)?)),
            Some((other, _)) => Err(Error::corrupt(format!("unknown struct type {other:#x}"))),
            None => Err(Error::corrupt(format!(
                "entry {:?} has no struct",
                String::from_utf8_lossy(&entry.name)
            ))),
        }
    }

    /// 文件的字节数，目录为0
    pub fn size(&self) -> usize {
        match self {
            Self::Dir(_) => 0,
            Self::Inline(data) => data.len(),
            Self::Ctz(ctz) => ctz.size as usize,
        }
    }

    /// 文件数据占用的块数
    pub fn blocks(&self, block_size: usize) -> usize {
        match self {
            Self::Ctz(ctz) if ctz.size > 0 => ctz::index(block_size, &mut (ctz.size as usize - 1)) + 1,
            _ => 0,
        }
    }

    pub fn to_attr(&self, id: u16) -> Result<Attr, Error> {
        Ok(match self {
            Self::Dir(pair) => Attr::structure(ty::DIRSTRUCT, id, pair.to_bytes()),
            Self::Inline(data) => Attr::structure(ty::INLINESTRUCT, id, data.clone()),
            Self::Ctz(ctz) => Attr::structure(ty::CTZSTRUCT, id, ctz.to_bytes()?),
        })
    }
}

/// 目录中的一个位置
#[derive(Debug, Clone)]
pub struct Slot {
    /// 目录项所在（或应插入）的元数据对
    pub dir: Arc<Mdir>,
    pub id: u16,
    pub exists: bool,
}

impl Slot {
    pub fn entry(&self) -> Result<&Entry, Error> {
        if !self.exists {
            return Err(Error::NotFound);
        }
        self.dir
            .entries
            .get(usize::from(self.id))
            .ok_or(Error::NotFound)
    }
}

/// 按磁盘上的规则比较名字：先比较公共前缀，再比较长度
fn compare_name(disk: &[u8], name: &[u8]) -> Ordering {
    let len = disk.len().min(name.len());
    match disk[..len].cmp(&name[..len]) {
        Ordering::Equal if disk.len() == name.len() => Ordering::Equal,
        Ordering::Equal if name.len() < disk.len() => Ordering::Less,
        Ordering::Equal => Ordering::Greater,
        ord => ord,
    }
}

impl<D: BlockDevice> LittleFs<D> {
    /// 从`start`开始沿尾指针遍历元数据对，`whole`为假时只遍历同一目录的延续。
    ///
    /// 使用 Brent 算法检测环。
    fn walk_from<B>(
        &self,
        start: Pair,
        whole: bool,
        mut f: impl FnMut(&Mdir) -> ControlFlow<B>,
    ) -> Result<Option<B>, Error> {
        let mut pair = start;
        let mut tortoise = NULL_PAIR;
        let mut steps = 1usize;
        let mut period = 1usize;

        loop {
            if pair.is_sync(&tortoise) {
                log::warn!("cycle detected in tail list at {}", pair.display());
                return Err(Error::corrupt(format!(
                    "cycle in tail list at {}",
                    pair.display()
                )));
            }
            if steps == period {
                tortoise = pair;
                steps = 0;
                period *= 2;
            }
            steps += 1;

            let dir = self.fetch(pair)?;
            if let Break(b) = f(&dir) {
                return Ok(Some(b));
            }
            if dir.tail.is_null() || (!whole && !dir.split) {
                return Ok(None);
            }
            pair = dir.tail;
        }
    }

    /// 遍历全部元数据对
    pub(crate) fn walk<B>(&self, f: impl FnMut(&Mdir) -> ControlFlow<B>) -> Result<Option<B>, Error> {
        self.walk_from(ROOT_PAIR, true, f)
    }

    /// 尾指针指向`pair`的元数据对
    pub(crate) fn fs_pred(&self, pair: &Pair) -> Result<Option<Mdir>, Error> {
        self.walk(|dir| {
            if dir.tail.overlaps(pair) {
                Break(dir.clone())
            } else {
                Continue(())
            }
        })
    }

    /// 父目录中记录的`pair`
    pub(crate) fn fs_parent(&self, pair: &Pair) -> Result<Option<Pair>, Error> {
        self.walk(|dir| {
            for entry in &dir.entries {
                if let Some((ty::DIRSTRUCT, data)) = &entry.data {
                    match Pair::from_bytes(data) {
                        Ok(child) if child.overlaps(pair) => return Break(child),
                        _ => {}
                    }
                }
            }
            Continue(())
        })
    }

    /// 正在移动、已被复制到目的地的源目录项对外不可见
    pub(crate) fn is_hidden(&self, dir: &Mdir, id: u16) -> bool {
        self.gdisk.has_move()
            && self.gdisk.move_pair().overlaps(&dir.pair)
            && self.gdisk.move_id() == id
    }

    /// 在首个元数据对为`pair`的目录中查找`name`，找不到时给出插入位置
    pub(crate) fn dir_find(&self, pair: Pair, name: &[u8]) -> Result<Slot, Error> {
        let mut pair = pair;
        // 目录的延续在遍历元数据对时已检测过环
        for _ in 0..self.geometry.block_count {
            let dir = self.fetch(pair)?;
            for (id, entry) in dir.entries.iter().enumerate() {
                let id = id as u16;
                if !entry.is_visible() || self.is_hidden(&dir, id) {
                    continue;
                }
                match compare_name(&entry.name, name) {
                    Ordering::Equal => return Ok(Slot { dir, id, exists: true }),
                    Ordering::Greater => return Ok(Slot { dir, id, exists: false }),
                    Ordering::Less => {}
                }
            }
            if !dir.split {
                let id = dir.count();
                return Ok(Slot { dir, id, exists: false });
            }
            pair = dir.tail;
        }
        Err(Error::corrupt(format!(
            "directory chain at {} does not end",
            pair.display()
        )))
    }

    /// 规范化路径所指目录的首个元数据对
    pub(crate) fn open_dir(&self, path: &str) -> Result<Pair, Error> {
        let mut pair = self.root;
        for name in path.components() {
            let slot = self.dir_find(pair, name.as_bytes())?;
            let entry = slot.entry()?;
            if entry.kind != ty::DIR {
                return Err(Error::NotADirectory);
            }
            match Struct::of(entry)? {
                Struct::Dir(child) => pair = child,
                _ => return Err(Error::corrupt(format!("directory {name:?} without a pair"))),
            }
        }
        Ok(pair)
    }

    /// 规范化的非根路径的最后一项
    pub(crate) fn lookup(&self, path: &str) -> Result<Slot, Error> {
        let (parent, name) = path
            .parent_file()
            .ok_or(Error::InvalidArgument("root directory has no entry"))?;
        self.dir_find(self.open_dir(parent)?, name.as_bytes())
    }

    pub(crate) fn check_name(&self, name: &str) -> Result<(), Error> {
        if name.len() > self.cfg.name_max as usize {
            return Err(Error::NameTooLong);
        }
        Ok(())
    }

    pub(crate) fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, Error> {
        let mut entries = Vec::new();
        let mut failure = None;
        self.walk_from(self.open_dir(path)?, false, |dir| {
            for (id, entry) in dir.entries.iter().enumerate() {
                if !entry.is_visible() || self.is_hidden(dir, id as u16) {
                    continue;
                }
                let st = match Struct::of(entry) {
                    Ok(st) => st,
                    Err(e) => {
                        failure = Some(e);
                        return Break(());
                    }
                };
                let name = String::from_utf8_lossy(&entry.name).into_owned();
                entries.push(DirEntry {
                    path: path.join(&name),
                    name,
                    ty: if entry.kind == ty::DIR {
                        DirEntryType::Directory
                    } else {
                        DirEntryType::Regular
                    },
                    size: st.size() as u64,
                });
            }
            Continue(())
        })?;

        match failure {
            Some(e) => Err(e),
            None => Ok(entries),
        }
    }

    /// 插入新的目录项
    pub(crate) fn dir_insert(
        &mut self,
        slot: &Slot,
        kind: u16,
        name: &str,
        st: &Struct,
    ) -> Result<(), Error> {
        let id = slot.id;
        let mut dir = self.refetch(slot.dir.pair)?;
        self.dir_commit(
            &mut dir,
            &[
                Attr::create(id),
                Attr::name(kind, id, name.as_bytes()),
                st.to_attr(id)?,
            ],
        )
    }

    pub(crate) fn dir_mkdir(&mut self, path: &str) -> Result<(), Error> {
        let (parent, name) = path.parent_file().ok_or(Error::AlreadyExists)?;
        self.check_name(name)?;
        let slot = self.dir_find(self.open_dir(parent)?, name.as_bytes())?;
        if slot.exists {
            return Err(Error::AlreadyExists);
        }

        let mut cwd = self.refetch(slot.dir.pair)?;
        let mut pred = cwd.clone();
        while pred.split {
            pred = self.refetch(pred.tail)?;
        }

        // 新目录插在父目录链的末尾之后
        let mut dir = self.dir_alloc()?;
        self.dir_commit(&mut dir, &[Attr::tail(false, pred.tail)])?;

        let saved = self.gstate;
        if cwd.split {
            // 新目录已接入链表但还没有父目录引用
            self.gstate.add_orphans(1);
            self.dir_commit(&mut pred, &[Attr::tail(false, dir.pair)])
                .inspect_err(|_| self.gstate = saved)?;
            self.gstate.add_orphans(-1);
        }

        let id = slot.id;
        let mut attrs = vec![
            Attr::create(id),
            Attr::name(ty::DIR, id, name.as_bytes()),
            Struct::Dir(dir.pair).to_attr(id)?,
        ];
        if !cwd.split {
            attrs.push(Attr::tail(false, dir.pair));
        }
        if let Err(e) = self.dir_commit(&mut cwd, &attrs) {
            if cwd.split {
                self.leave_orphan();
            }
            return Err(e);
        }

        log::debug!("created directory {path} at {}", dir.pair.display());
        Ok(())
    }

    /// 删除文件（`dir`为假）或空目录
    pub(crate) fn dir_remove(&mut self, path: &str, dir: bool) -> Result<(), Error> {
        if path == "/" {
            return Err(Error::InvalidArgument("cannot remove the root directory"));
        }
        let slot = self.lookup(path)?;
        let entry = slot.entry()?;
        match (dir, entry.kind == ty::DIR) {
            (true, false) => return Err(Error::NotADirectory),
            (false, true) => return Err(Error::IsADirectory),
            _ => {}
        }

        let child = if dir {
            let Struct::Dir(pair) = Struct::of(entry)? else {
                return Err(Error::corrupt(format!("directory {path} without a pair")));
            };
            let child = self.fetch(pair)?;
            if !child.entries.is_empty() || child.split {
                return Err(Error::NotEmpty);
            }
            Some(pair)
        } else {
            None
        };

        let mut cwd = self.refetch(slot.dir.pair)?;
        let saved = self.gstate;
        if child.is_some() {
            // 删除目录项之后、摘除元数据对之前，子目录是孤儿
            self.gstate.add_orphans(1);
        }
        self.dir_commit(&mut cwd, &[Attr::delete(slot.id)])
            .inspect_err(|_| self.gstate = saved)?;

        if let Some(pair) = child {
            self.gstate.add_orphans(-1);
            if let Err(e) = self.drop_orphan(pair) {
                self.leave_orphan();
                return Err(e);
            }
        }

        log::debug!("removed {path}");
        Ok(())
    }

    /// 不同元数据对之间的移动分两次提交：先在目的地插入，再删除源目录项。
    /// 两次提交之间，全局状态记录着待删除的源目录项，掉电后挂载时补做删除。
    pub(crate) fn dir_rename(&mut self, old: &str, new: &str) -> Result<(), Error> {
        if old == "/" || new == "/" {
            return Err(Error::InvalidArgument("cannot rename the root directory"));
        }
        let old_slot = self.lookup(old)?;
        let entry = old_slot.entry()?.clone();
        if old == new {
            return Ok(());
        }
        if entry.kind == ty::DIR && new.is_within(old) {
            return Err(Error::InvalidArgument("cannot move a directory into itself"));
        }

        let (_, name) = new
            .parent_file()
            .ok_or(Error::InvalidArgument("cannot rename the root directory"))?;
        self.check_name(name)?;
        let new_slot = self.lookup(new)?;
        if new_slot.exists {
            return Err(Error::AlreadyExists);
        }

        let same_pair = old_slot.dir.pair.overlaps(&new_slot.dir.pair);
        let (old_id, new_id) = (old_slot.id, new_slot.id);

        let mut attrs = vec![
            Attr::create(new_id),
            Attr::name(entry.kind, new_id, name.as_bytes()),
        ];
        if let Some((kind, data)) = &entry.data {
            attrs.push(Attr::structure(*kind, new_id, data.clone()));
        }
        for (&t, data) in &entry.attrs {
            attrs.push(Attr::user(t, new_id, data));
        }

        if same_pair {
            // 插入点在源目录项之前时，源目录项的id随之后移
            let moved_id = if new_id <= old_id { old_id + 1 } else { old_id };
            attrs.push(Attr::delete(moved_id));
            let mut dir = self.refetch(new_slot.dir.pair)?;
            self.dir_commit(&mut dir, &attrs)?;
        } else {
            let mut dir = self.refetch(new_slot.dir.pair)?;
            let saved = self.gstate;
            self.gstate.prep_move(Some((old_id, old_slot.dir.pair)));
            self.dir_commit(&mut dir, &attrs)
                .inspect_err(|_| self.gstate = saved)?;

            self.gstate.prep_move(None);
            let deleted = self
                .refetch(old_slot.dir.pair)
                .and_then(|mut dir| self.dir_commit(&mut dir, &[Attr::delete(old_id)]));
            if let Err(e) = deleted {
                // 磁盘上记着这次移动，下一个修改操作开始时补做删除
                self.pending |= Pending::Move;
                return Err(e);
            }
        }

        log::debug!("renamed {old} to {new}");
        Ok(())
    }

    /// 把已经没有父目录引用的`pair`从链表中摘除
    fn drop_orphan(&mut self, pair: Pair) -> Result<(), Error> {
        let child = self.refetch(pair)?;
        let mut pred = self.fs_pred(&child.pair)?.ok_or_else(|| {
            Error::corrupt(format!("{} is missing from the tail list", pair.display()))
        })?;
        self.dir_drop(&mut pred, &child)
    }

    /// 链表中留下了孤儿，计入全局状态，下一个修改操作开始时摘除
    fn leave_orphan(&mut self) {
        self.gstate.add_orphans(1);
        self.pending |= Pending::Orphans;
    }

    /// 修复挂载前掉电或操作失败留下的不一致，每个修改操作开始前调用
    pub(crate) fn force_consistency(&mut self) -> Result<(), Error> {
        if self.pending.contains(Pending::Move) {
            self.demove()?;
            self.pending.remove(Pending::Move);
        }
        if self.pending.contains(Pending::Orphans) {
            self.deorphan()?;
            self.pending.remove(Pending::Orphans);
        }
        Ok(())
    }

    /// 完成中断的移动：删除仍留在源处的目录项
    fn demove(&mut self) -> Result<(), Error> {
        if !self.gdisk.has_move() {
            return Ok(());
        }
        if Tag::from(self.gdisk.tag).type3() != ty::DELETE {
            return Err(Error::corrupt(format!(
                "unknown global state {:#010x}",
                self.gdisk.tag
            )));
        }

        let pair = self.gdisk.move_pair();
        let id = self.gdisk.move_id();
        log::debug!("fixing move of id {id} in {}", pair.display());

        let mut dir = self.refetch(pair)?;
        self.gstate.prep_move(None);
        self.dir_commit(&mut dir, &[Attr::delete(id)])
    }

    /// 修复孤儿。
    ///
    /// 第一遍修复半孤儿：父目录引用的块与链表中的块不一致；
    /// 第二遍摘除没有父目录引用的目录。
    fn deorphan(&mut self) -> Result<(), Error> {
        if !self.gstate.has_orphans() {
            return Ok(());
        }

        for pass in 0..2 {
            let mut pdir = Mdir {
                split: true,
                tail: ROOT_PAIR,
                ..Mdir::new(NULL_PAIR, 0)
            };

            while !pdir.tail.is_null() {
                let dir = self.refetch(pdir.tail)?;

                // 只有目录的首个元数据对才有父目录
                if !pdir.split {
                    match (pass, self.fs_parent(&pdir.tail)?) {
                        (0, Some(pair)) if !pair.is_sync(&pdir.tail) => {
                            log::debug!(
                                "fixing half-orphan {} -> {}",
                                pdir.tail.display(),
                                pair.display()
                            );
                            let mut attrs = Vec::new();
                            if self.gstate.has_move() && self.gstate.move_pair().overlaps(&pdir.pair) {
                                attrs.push(Attr::delete(self.gstate.move_id()));
                                self.gstate.prep_move(None);
                            }
                            attrs.push(Attr::tail(false, pair));
                            self.dir_commit(&mut pdir, &attrs)?;
                            continue;
                        }
                        (1, None) => {
                            log::debug!("fixing orphan {}", dir.pair.display());
                            self.dir_drop(&mut pdir, &dir)?;
                            continue;
                        }
                        _ => {}
                    }
                }

                pdir = dir;
            }
        }

        let orphans = self.gstate.orphans();
        self.gstate.add_orphans(-(orphans as i16));
        Ok(())
    }
}
