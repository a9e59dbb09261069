//! 小端序的定长磁盘结构

use alloc::format;
use alloc::vec::Vec;

use binrw::io::Cursor;
use binrw::{BinRead, BinWrite, binrw};
use vfs::{DiskVersion, Error};

use crate::BlockId;

/// 超级块名字记录的内容
pub const MAGIC: &[u8; 8] = b"littlefs";

/// 超级块，作为根元数据对中 id 0 的内联结构存储
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
}

/// CTZ 跳表文件的结构记录
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtzStruct {
    /// 最后一块
    pub head: u32,
    pub size: u32,
}

/// 全局状态
///
/// 每个元数据对保存一份增量，全部增量异或起来就是全局状态。
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GState {
    /// 挂起的移动：DELETE标签；size字段为孤儿计数，最高位表示存在孤儿
    pub tag: u32,
    pub pair: [u32; 2],
}

/// 紧随提交之后、下一次编程区域的擦除状态校验
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fcrc {
    pub size: u32,
    pub crc: u32,
}

macro_rules! disk_struct {
    ($($ty:ty => $size:expr),* $(,)?) => {$(
        impl $ty {
            pub const SIZE: usize = $size;

            /// 不足的部分以0补齐
            pub fn parse(data: &[u8]) -> Result<Self, Error> {
                let mut buf = [0u8; $size];
                let len = data.len().min($size);
                buf[..len].copy_from_slice(&data[..len]);
                <$ty>::read(&mut Cursor::new(&buf[..]))
                    .map_err(|e| Error::corrupt(format!("{}: {e}", stringify!($ty))))
            }

            pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
                let mut buf = [0u8; $size];
                self.write(&mut Cursor::new(&mut buf[..]))
                    .map_err(|e| Error::corrupt(format!("{}: {e}", stringify!($ty))))?;
                Ok(buf.to_vec())
            }
        }
    )*};
}

disk_struct! {
    Superblock => 24,
    CtzStruct => 8,
    GState => 12,
    Fcrc => 8,
}

impl Superblock {
    pub fn version(&self) -> DiskVersion {
        DiskVersion::from_raw(self.version)
    }
}

impl GState {
    const MOVE_MASK: u32 = 0x7fff_fc00;

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// 磁盘上不记录孤儿计数，只记录最高位
    pub fn masked(mut self) -> Self {
        self.tag &= !0x3ff;
        self
    }

    pub fn has_orphans(&self) -> bool {
        self.tag & 0x3ff != 0
    }

    pub fn orphans(&self) -> u16 {
        (self.tag & 0x1ff) as u16
    }

    pub fn add_orphans(&mut self, orphans: i16) {
        self.tag = self.tag.wrapping_add_signed(orphans as i32);
        self.tag = (self.tag & 0x7fff_ffff) | ((self.has_orphans() as u32) << 31);
    }

    /// 挂载时，磁盘上的孤儿标志位换算为多一个孤儿
    pub fn settle(&mut self) {
        if self.tag & 0x8000_0000 != 0 {
            self.tag = self.tag.wrapping_add(1);
        }
    }

    pub fn has_move(&self) -> bool {
        self.tag & 0x7000_0000 != 0
    }

    pub fn move_id(&self) -> u16 {
        ((self.tag >> 10) & 0x3ff) as u16
    }

    pub fn move_pair(&self) -> [BlockId; 2] {
        [BlockId::new(self.pair[0]), BlockId::new(self.pair[1])]
    }

    /// 记录（`Some`）或清除（`None`）挂起的移动
    pub fn prep_move(&mut self, target: Option<(u16, [BlockId; 2])>) {
        self.tag &= !Self::MOVE_MASK;
        match target {
            Some((id, pair)) => {
                self.tag |= (0x4ff << 20) | ((id as u32 & 0x3ff) << 10);
                self.pair = [pair[0].into(), pair[1].into()];
            }
            None => self.pair = [0, 0],
        }
    }
}

impl core::ops::BitXor for GState {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        Self {
            tag: self.tag ^ rhs.tag,
            pair: [self.pair[0] ^ rhs.pair[0], self.pair[1] ^ rhs.pair[1]],
        }
    }
}

impl core::ops::BitXorAssign for GState {
    fn bitxor_assign(&mut self, rhs: Self) {
        *self = *self ^ rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_layout() {
        let sb = Superblock {
            version: 0x0002_0001,
            block_size: 4096,
            block_count: 256,
            name_max: 255,
            file_max: 0x7fff_ffff,
            attr_max: 1022,
        };
        let bytes = sb.to_bytes().unwrap();
        assert_eq!(Superblock::SIZE, bytes.len());
        assert_eq!([0x01, 0x00, 0x02, 0x00], bytes[0..4]);
        assert_eq!([0x00, 0x10, 0x00, 0x00], bytes[4..8]);
        assert_eq!(sb, Superblock::parse(&bytes).unwrap());
        assert_eq!(DiskVersion::new(2, 1), sb.version());
    }

    #[test]
    fn short_struct_is_zero_padded() {
        let sb = Superblock::parse(&[0x00, 0x00, 0x02, 0x00, 0x00, 0x02]).unwrap();
        assert_eq!(0x0002_0000, sb.version);
        assert_eq!(0x200, sb.block_size);
        assert_eq!(0, sb.attr_max);
    }

    #[test]
    fn orphans() {
        let mut g = GState::default();
        g.add_orphans(1);
        assert!(g.has_orphans());
        assert_eq!(0x8000_0001, g.tag);
        // 磁盘上只留下最高位
        let mut disk = g.masked();
        assert_eq!(0x8000_0000, disk.tag);
        disk.settle();
        assert_eq!(1, disk.orphans());
        g.add_orphans(-1);
        assert!(g.is_zero());

        // 计数位不为零时照样加一
        let mut foreign = GState {
            tag: 0x8000_0002,
            pair: [0, 0],
        };
        foreign.settle();
        assert_eq!(3, foreign.orphans());
        let mut plain = GState {
            tag: 0x0000_0002,
            pair: [0, 0],
        };
        plain.settle();
        assert_eq!(2, plain.orphans());
    }

    #[test]
    fn moves() {
        let mut g = GState::default();
        g.prep_move(Some((3, [BlockId::new(8), BlockId::new(9)])));
        assert!(g.has_move());
        assert_eq!(3, g.move_id());
        assert_eq!([8, 9], g.pair);
        g.prep_move(None);
        assert!(g.is_zero());
    }
}
