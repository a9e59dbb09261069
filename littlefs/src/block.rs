use core::fmt;

use block_dev::BlockDevice;
use derive_more::{From, Into};
use vfs::Error;

/// 块号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[repr(transparent)]
pub struct BlockId(u32);

impl BlockId {
    /// 空指针，用于没有后继的尾指针
    pub const NULL: Self = Self(0xffff_ffff);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 元数据对，`pair[0]`为当前块
pub type Pair = [BlockId; 2];

pub const NULL_PAIR: Pair = [BlockId::NULL; 2];

/// 超级块所在的元数据对
pub const ROOT_PAIR: Pair = [BlockId(0), BlockId(1)];

pub trait PairExt {
    /// 任意一块为空即为空
    fn is_null(&self) -> bool;

    /// 两个元数据对共用某一块
    fn overlaps(&self, other: &Pair) -> bool;

    /// 两个元数据对由同样的两块组成
    fn is_sync(&self, other: &Pair) -> bool;

    fn to_bytes(&self) -> [u8; 8];

    fn from_bytes(data: &[u8]) -> Result<Pair, Error>;

    fn display(&self) -> PairDisplay;
}

impl PairExt for Pair {
    fn is_null(&self) -> bool {
        self[0].is_null() || self[1].is_null()
    }

    fn overlaps(&self, other: &Pair) -> bool {
        self[0] == other[0] || self[1] == other[1] || self[0] == other[1] || self[1] == other[0]
    }

    fn is_sync(&self, other: &Pair) -> bool {
        (self[0] == other[0] && self[1] == other[1]) || (self[0] == other[1] && self[1] == other[0])
    }

    fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self[0].0.to_le_bytes());
        bytes[4..].copy_from_slice(&self[1].0.to_le_bytes());
        bytes
    }

    fn from_bytes(data: &[u8]) -> Result<Pair, Error> {
        let [a0, a1, a2, a3, b0, b1, b2, b3] = *data.first_chunk::<8>().ok_or_else(|| {
            Error::corrupt(alloc::format!("pair record of {} bytes", data.len()))
        })?;
        Ok([
            BlockId(u32::from_le_bytes([a0, a1, a2, a3])),
            BlockId(u32::from_le_bytes([b0, b1, b2, b3])),
        ])
    }

    fn display(&self) -> PairDisplay {
        PairDisplay(*self)
    }
}

pub struct PairDisplay(Pair);

impl fmt::Display for PairDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.0[0], self.0[1])
    }
}

/// 以[`BlockId`]访问块设备，越界访问视为镜像损坏
pub trait DeviceExt: BlockDevice {
    fn read_at(&self, block: BlockId, off: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.read(block.index(), off, buf).map_err(device_error)
    }

    fn prog_at(&mut self, block: BlockId, off: usize, data: &[u8]) -> Result<(), Error> {
        self.prog(block.index(), off, data).map_err(device_error)
    }

    fn erase_at(&mut self, block: BlockId) -> Result<(), Error> {
        self.erase(block.index()).map_err(device_error)
    }
}

impl<D: BlockDevice + ?Sized> DeviceExt for D {}

fn device_error(e: block_dev::Error) -> Error {
    match e {
        block_dev::Error::Io { .. } => Error::Io,
        e => Error::corrupt(alloc::format!("{e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(a: u32, b: u32) -> Pair {
        [BlockId::new(a), BlockId::new(b)]
    }

    #[test]
    fn pair_relations() {
        assert!(pair(0, 1).overlaps(&pair(1, 7)));
        assert!(!pair(0, 1).overlaps(&pair(2, 3)));
        assert!(pair(0, 1).is_sync(&pair(1, 0)));
        assert!(!pair(0, 1).is_sync(&pair(1, 2)));
        assert!(NULL_PAIR.is_null());
        assert!(!ROOT_PAIR.is_null());
    }

    #[test]
    fn pair_bytes() {
        let p = pair(0x12, 0x3456);
        let bytes = p.to_bytes();
        assert_eq!([0x12, 0, 0, 0, 0x56, 0x34, 0, 0], bytes);
        assert_eq!(p, Pair::from_bytes(&bytes).unwrap());
        assert!(Pair::from_bytes(&bytes[..5]).is_err());
        assert_eq!("{0x12, 0x3456}", alloc::format!("{}", p.display()));
    }
}
