use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;

use block_dev::{BlockDevice, MemoryDevice};
use enumflags2::{bitflags, BitFlags};
use spin::Mutex;
use vfs::{DirEntry, DirEntryType, DiskVersion, Error, Stat, Usage};

use crate::allocator::Allocator;
use crate::block::{Pair, ROOT_PAIR};
use crate::config::{Config, Geometry, BLOCK_SIZE_CANDIDATES, DISK_VERSION, MIN_BLOCK_SIZE};
use crate::dir::{Slot, Struct};
use crate::layout::crc::crc32;
use crate::layout::{GState, MAGIC, Superblock, ty};
use crate::mdir::{Attr, Mdir};
use crate::path::Path;

/// 挂载时发现、推迟到第一次修改时处理的不一致
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// 中断的移动
    Move = 1,
    /// 孤儿目录
    Orphans = 1 << 1,
}

/// 挂载的 littlefs 文件系统
///
/// 所有修改都直接作用于块设备；[`LittleFs::mount`]复制输入的镜像，
/// 因此调用者的缓冲区在[`LittleFs::to_image`]之前保持不变。
///
/// 只读操作可以并发执行，修改操作需要独占引用。
pub struct LittleFs<D: BlockDevice = MemoryDevice> {
    // 设备
    pub(crate) dev: D,
    pub(crate) geometry: Geometry,
    /// 生效的配置，挂载后的上限取自超级块
    pub(crate) cfg: Config,
    pub(crate) version: DiskVersion,
    /// 根目录的首个元数据对
    pub(crate) root: Pair,
    // 全局状态
    /// 内存中的全局状态，含孤儿计数
    pub(crate) gstate: GState,
    /// 已写入磁盘的全局状态
    pub(crate) gdisk: GState,
    /// 摘除元数据对时转交来的增量，随下一次提交写入
    pub(crate) gdelta: GState,
    pub(crate) pending: BitFlags<Pending>,
    // 分配与缓存
    pub(crate) allocator: Allocator,
    pub(crate) cache: Mutex<BTreeMap<Pair, Arc<Mdir>>>,
}

impl LittleFs<MemoryDevice> {
    /// 挂载镜像。
    ///
    /// `hint`给出的块大小为0时按候选值推断，块数为0时取超级块中的值。
    pub fn mount(image: &[u8], hint: Option<Geometry>, config: Config) -> Result<Self, Error> {
        let block_size = match hint {
            Some(geometry) if geometry.block_size > 0 => geometry.block_size,
            _ => Self::infer_block_size(image, &config).ok_or_else(|| {
                log::error!("no superblock found at any supported block size");
                Error::corrupt("no superblock found")
            })?,
        };
        config.validate(block_size)?;

        let available = image.len() / block_size;
        let block_count = match hint {
            Some(geometry) if geometry.block_count > 0 => geometry.block_count,
            _ => probe(image, block_size, &config)
                .ok_or_else(|| Error::corrupt("no superblock in blocks 0 and 1"))?
                .block_count as usize,
        };
        if block_count > available {
            return Err(Error::corrupt(alloc::format!(
                "image holds {available} blocks, geometry needs {block_count}"
            )));
        }

        let image = image[..block_count * block_size].to_vec();
        Self::open(MemoryDevice::from_image(image, block_size), config)
    }

    /// 依次尝试候选块大小，返回超级块记录的块大小与之相符的第一个
    pub fn infer_block_size(image: &[u8], config: &Config) -> Option<usize> {
        BLOCK_SIZE_CANDIDATES.into_iter().find(|&block_size| {
            image.len() % block_size == 0
                && probe(image, block_size, config).is_some()
        })
    }

    pub fn format(geometry: Geometry, config: Config) -> Result<Self, Error> {
        Self::format_device(
            MemoryDevice::new(geometry.block_size, geometry.block_count),
            config,
        )
    }

    /// 当前全部块的内容，包括空闲块
    pub fn to_image(&self) -> Vec<u8> {
        self.dev.as_bytes().to_vec()
    }
}

/// 只读取`{0, 1}`两块，检查其中是否有块大小为`block_size`的超级块
fn probe(image: &[u8], block_size: usize, config: &Config) -> Option<Superblock> {
    if block_size < MIN_BLOCK_SIZE || image.len() < 2 * block_size {
        return None;
    }
    let dev = MemoryDevice::from_image(image[..2 * block_size].to_vec(), block_size);
    let fs = LittleFs::new(dev, config.clone(), DISK_VERSION);
    let root = fs.fetch(ROOT_PAIR).ok()?;
    let superblock = superblock_of(&root)?.ok()?;
    (superblock.block_size as usize == block_size).then_some(superblock)
}

/// 元数据对中的超级块
fn superblock_of(dir: &Mdir) -> Option<Result<Superblock, Error>> {
    let entry = dir
        .entries
        .iter()
        .find(|entry| entry.kind == ty::SUPERBLOCK && entry.name == MAGIC)?;
    Some(match &entry.data {
        Some((ty::INLINESTRUCT, data)) => Superblock::parse(data),
        _ => Err(Error::corrupt("superblock without inline struct")),
    })
}

/// 超级块可以降低配置中的上限，但不能提高
fn limit(disk: u32, config: u32, what: &'static str) -> Result<u32, Error> {
    match disk {
        0 => Ok(config),
        disk if disk > config => Err(Error::InvalidArgument(what)),
        disk => Ok(disk),
    }
}

fn canonical(path: &str) -> Result<alloc::string::String, Error> {
    path.canonicalize()
        .ok_or(Error::InvalidArgument("path escapes the root directory"))
}

impl<D: BlockDevice> LittleFs<D> {
    fn new(dev: D, cfg: Config, version: DiskVersion) -> Self {
        let geometry = Geometry::new(dev.block_size(), dev.block_count());
        Self {
            dev,
            geometry,
            cfg,
            version,
            root: ROOT_PAIR,
            gstate: GState::default(),
            gdisk: GState::default(),
            gdelta: GState::default(),
            pending: BitFlags::empty(),
            allocator: Allocator::new(0),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// 挂载块设备上的文件系统
    pub fn open(dev: D, config: Config) -> Result<Self, Error> {
        config.validate(dev.block_size())?;
        if dev.block_count() < 2 {
            return Err(Error::corrupt("image holds fewer than two blocks"));
        }
        let mut fs = Self::new(dev, config, DISK_VERSION);
        let Geometry {
            block_size,
            block_count,
        } = fs.geometry;

        let mut superblock = None;
        let mut gstate = GState::default();
        let mut seed = 0;
        fs.walk(|dir| {
            gstate ^= dir.gdelta;
            seed = crc32(seed, &dir.seed.to_le_bytes());
            if let Some(found) = superblock_of(dir) {
                superblock = Some((dir.pair, found));
            }
            ControlFlow::<()>::Continue(())
        })
        .inspect_err(|e| log::error!("mount failed: {e}"))?;

        let Some((root, superblock)) = superblock else {
            log::error!("mount failed: no superblock in the tail list");
            return Err(Error::corrupt("no superblock"));
        };
        let superblock = superblock?;

        let version = superblock.version();
        if version.major != DISK_VERSION.major || version.minor > DISK_VERSION.minor {
            log::error!("mount failed: unsupported disk version {version}");
            return Err(Error::UnsupportedVersion {
                major: version.major,
                minor: version.minor,
            });
        }
        if superblock.block_size as usize != block_size {
            return Err(Error::InvalidArgument("block size differs from the superblock"));
        }
        if superblock.block_count as usize != block_count {
            return Err(Error::InvalidArgument("block count differs from the superblock"));
        }
        fs.cfg.name_max = limit(superblock.name_max, fs.cfg.name_max, "name_max exceeds the configured limit")?;
        fs.cfg.file_max = limit(superblock.file_max, fs.cfg.file_max, "file_max exceeds the configured limit")?;
        fs.cfg.attr_max = limit(superblock.attr_max, fs.cfg.attr_max, "attr_max exceeds the configured limit")?;
        fs.cfg.disk_version = version;
        fs.version = version;
        fs.root = root;

        gstate.settle();
        if !gstate.is_zero() {
            log::debug!(
                "found pending gstate {:#010x} {{{:#x}, {:#x}}}",
                gstate.tag,
                gstate.pair[0],
                gstate.pair[1]
            );
        }
        fs.gstate = gstate;
        fs.gdisk = gstate;
        if gstate.has_move() {
            fs.pending |= Pending::Move;
        }
        if gstate.has_orphans() {
            fs.pending |= Pending::Orphans;
        }

        fs.allocator = Allocator::new(seed as usize % block_count);
        // 可否追加取决于版本，需按真实版本重新读取
        fs.cache.lock().clear();

        log::debug!("mounted {version} image of {block_count} blocks x {block_size} bytes");
        Ok(fs)
    }

    /// 在块设备上格式化
    pub fn format_device(dev: D, config: Config) -> Result<Self, Error> {
        config.validate(dev.block_size())?;
        if dev.block_count() < 2 {
            return Err(Error::InvalidArgument("geometry needs at least two blocks"));
        }
        let version = config.disk_version;
        let mut fs = Self::new(dev, config, version);
        fs.write_superblock()?;
        log::debug!(
            "formatted {version} image of {} blocks x {} bytes",
            fs.geometry.block_count,
            fs.geometry.block_size
        );
        Ok(fs)
    }

    /// 就地重新格式化，保留磁盘版本
    pub fn reformat(&mut self) -> Result<(), Error> {
        self.write_superblock()
    }

    fn write_superblock(&mut self) -> Result<(), Error> {
        self.allocator = Allocator::empty(self.geometry.block_count);
        self.cache.lock().clear();
        self.gstate = GState::default();
        self.gdisk = GState::default();
        self.gdelta = GState::default();
        self.pending = BitFlags::empty();
        self.root = ROOT_PAIR;

        let superblock = Superblock {
            version: self.version.raw(),
            block_size: self.geometry.block_size as u32,
            block_count: self.geometry.block_count as u32,
            name_max: self.cfg.name_max,
            file_max: self.cfg.file_max,
            attr_max: self.cfg.attr_max,
        };

        let mut root = self.dir_alloc()?;
        self.dir_commit(
            &mut root,
            &[
                Attr::create(0),
                Attr::name(ty::SUPERBLOCK, 0, MAGIC),
                Attr::structure(ty::INLINESTRUCT, 0, superblock.to_bytes()?),
            ],
        )?;
        // 再压缩一次，覆盖另一块上可能残留的旧文件系统
        root.erased = false;
        self.dir_commit(&mut root, &[])?;

        self.refetch(ROOT_PAIR).map(drop)
    }

    pub(crate) fn block_size(&self) -> usize {
        self.geometry.block_size
    }

    pub(crate) fn prog_size(&self) -> usize {
        self.cfg.prog_size
    }

    /// 2.1 起提交之后带有 FCRC
    pub(crate) fn fcrc_enabled(&self) -> bool {
        self.version.minor >= 1
    }

    pub(crate) fn inline_max(&self) -> usize {
        self.cfg.inline_max(self.block_size())
    }

    /// 每个修改操作的开始
    fn begin(&mut self) -> Result<(), Error> {
        self.allocator.checkpoint();
        self.force_consistency()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn disk_version(&self) -> DiskVersion {
        self.version
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn into_device(self) -> D {
        self.dev
    }

    pub fn usage(&self) -> Result<Usage, Error> {
        let block_size = self.block_size() as u64;
        let capacity_bytes = block_size * self.geometry.block_count as u64;
        let used_bytes = block_size * self.referenced_blocks()?.count() as u64;
        Ok(Usage {
            capacity_bytes,
            used_bytes,
            free_bytes: capacity_bytes - used_bytes,
        })
    }

    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>, Error> {
        self.list_dir(&canonical(path)?)
    }

    /// 先序列出`path`之下的全部目录项
    pub fn list_recursive(&self, path: &str) -> Result<Vec<DirEntry>, Error> {
        let mut entries = Vec::new();
        let mut stack = self.list(path)?;
        stack.reverse();
        while let Some(entry) = stack.pop() {
            if entry.ty.is_dir() {
                let mut children = self.list_dir(&entry.path)?;
                children.reverse();
                stack.extend(children);
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn stat(&self, path: &str) -> Result<Stat, Error> {
        let path = canonical(path)?;
        let block_size = self.block_size();
        let (mode, blocks, size) = if path == "/" {
            (DirEntryType::Directory, self.dir_blocks(self.root)?, 0)
        } else {
            let slot = self.lookup(&path)?;
            let entry = slot.entry()?;
            match Struct::of(entry)? {
                Struct::Dir(pair) => (DirEntryType::Directory, self.dir_blocks(pair)?, 0),
                st => (DirEntryType::Regular, st.blocks(block_size), st.size()),
            }
        };

        Ok(Stat {
            mode,
            block_size: block_size as u64,
            blocks: blocks as u64,
            size: size as u64,
        })
    }

    /// 目录占用的元数据块数
    fn dir_blocks(&self, pair: Pair) -> Result<usize, Error> {
        let mut pairs = 0;
        let mut tail = pair;
        loop {
            let dir = self.fetch(tail)?;
            pairs += 1;
            if !dir.split || pairs > self.geometry.block_count {
                return Ok(2 * pairs);
            }
            tail = dir.tail;
        }
    }

    /// 路径所指的文件与其结构
    fn file(&self, path: &str) -> Result<(Slot, Struct), Error> {
        if path == "/" {
            return Err(Error::IsADirectory);
        }
        let slot = self.lookup(path)?;
        let st = Struct::of(slot.entry()?)?;
        if let Struct::Dir(_) = st {
            return Err(Error::IsADirectory);
        }
        Ok((slot, st))
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.read_file_at(path, 0, usize::MAX)
    }

    /// 读取`[offset, offset + len)`，越过文件末尾的部分被截去
    pub fn read_file_at(&self, path: &str, offset: usize, len: usize) -> Result<Vec<u8>, Error> {
        let (_, st) = self.file(&canonical(path)?)?;
        self.read_content(&st, offset, len)
    }

    /// 以`data`为全部内容写入文件，文件不存在时创建
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), Error> {
        let path = canonical(path)?;
        self.begin()?;
        self.update(&path, |fs, _| fs.new_content(data))
    }

    /// 在`offset`处写入，文件不存在时创建；越过文件末尾的空洞以0填充
    pub fn write_file_at(&mut self, path: &str, offset: usize, data: &[u8]) -> Result<(), Error> {
        let path = canonical(path)?;
        self.begin()?;
        self.update(&path, |fs, old| {
            let old = old.unwrap_or(Struct::Inline(Vec::new()));
            fs.write_content(&old, offset, data)
        })
    }

    pub fn truncate(&mut self, path: &str, size: usize) -> Result<(), Error> {
        let path = canonical(path)?;
        self.begin()?;
        let (slot, old) = self.file(&path)?;
        let st = self.truncate_content(&old, size)?;
        let mut dir = self.refetch(slot.dir.pair)?;
        self.dir_commit(&mut dir, &[st.to_attr(slot.id)?])
    }

    /// 以`f`算出的新结构替换文件的结构，或以之创建文件
    fn update(
        &mut self,
        path: &str,
        f: impl FnOnce(&mut Self, Option<Struct>) -> Result<Struct, Error>,
    ) -> Result<(), Error> {
        if path == "/" {
            return Err(Error::IsADirectory);
        }
        let slot = self.lookup(path)?;
        if slot.exists {
            let old = Struct::of(slot.entry()?)?;
            if let Struct::Dir(_) = old {
                return Err(Error::IsADirectory);
            }
            let st = f(self, Some(old))?;
            let mut dir = self.refetch(slot.dir.pair)?;
            self.dir_commit(&mut dir, &[st.to_attr(slot.id)?])
        } else {
            let (_, name) = path
                .parent_file()
                .ok_or(Error::InvalidArgument("root directory has no entry"))?;
            self.check_name(name)?;
            let st = f(self, None)?;
            self.dir_insert(&slot, ty::REG, name, &st)
        }
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), Error> {
        let path = canonical(path)?;
        self.begin()?;
        self.dir_mkdir(&path)
    }

    /// 移动文件或目录，目的路径已存在时返回[`Error::AlreadyExists`]
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), Error> {
        let (old, new) = (canonical(old)?, canonical(new)?);
        self.begin()?;
        self.dir_rename(&old, &new)
    }

    pub fn delete_file(&mut self, path: &str) -> Result<(), Error> {
        let path = canonical(path)?;
        self.begin()?;
        self.dir_remove(&path, false)
    }

    /// 删除空目录
    pub fn delete_dir(&mut self, path: &str) -> Result<(), Error> {
        let path = canonical(path)?;
        self.begin()?;
        self.dir_remove(&path, true)
    }

    /// 目录项的自定义属性
    fn attr_slot(&self, path: &str) -> Result<Slot, Error> {
        if path == "/" {
            return Err(Error::InvalidArgument("root directory has no attributes"));
        }
        let slot = self.lookup(path)?;
        slot.entry()?;
        Ok(slot)
    }

    pub fn get_attr(&self, path: &str, ty: u8) -> Result<Vec<u8>, Error> {
        let slot = self.attr_slot(&canonical(path)?)?;
        slot.entry()?
            .attrs
            .get(&ty)
            .cloned()
            .ok_or(Error::NoAttribute)
    }

    pub fn set_attr(&mut self, path: &str, ty: u8, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.cfg.attr_max as usize {
            return Err(Error::NoSpace);
        }
        let path = canonical(path)?;
        self.begin()?;
        let slot = self.attr_slot(&path)?;
        let mut dir = self.refetch(slot.dir.pair)?;
        self.dir_commit(&mut dir, &[Attr::user(ty, slot.id, data)])
    }

    pub fn remove_attr(&mut self, path: &str, ty: u8) -> Result<(), Error> {
        let path = canonical(path)?;
        self.begin()?;
        let slot = self.attr_slot(&path)?;
        if !slot.entry()?.attrs.contains_key(&ty) {
            return Ok(());
        }
        let mut dir = self.refetch(slot.dir.pair)?;
        self.dir_commit(&mut dir, &[Attr::remove_user(ty, slot.id)])
    }
}
