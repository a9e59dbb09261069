//! 元数据标签
//!
//! ```text
//! [--1--|----11----|----10----|----10----]
//!  valid    type        id        size
//! ```
//!
//! 标签以大端序存储，并与日志中前一个标签异或；
//! 第一个标签的“前一个标签”为`0xffffffff`。
//! `size == 0x3ff`表示记录被删除，此时数据长度为0。

use derive_more::{From, Into};

/// 标签类型
///
/// 高3位为一级类型（`type1`），低8位的含义由一级类型决定。
pub mod ty {
    pub const NAME: u16 = 0x000;
    pub const REG: u16 = 0x001;
    pub const DIR: u16 = 0x002;
    pub const SUPERBLOCK: u16 = 0x0ff;

    pub const STRUCT: u16 = 0x200;
    pub const DIRSTRUCT: u16 = 0x200;
    pub const INLINESTRUCT: u16 = 0x201;
    pub const CTZSTRUCT: u16 = 0x202;

    pub const USERATTR: u16 = 0x300;

    pub const SPLICE: u16 = 0x400;
    pub const CREATE: u16 = 0x401;
    pub const DELETE: u16 = 0x4ff;

    pub const CRC: u16 = 0x500;
    pub const CCRC: u16 = 0x500;
    pub const FCRC: u16 = 0x5ff;

    pub const TAIL: u16 = 0x600;
    pub const SOFTTAIL: u16 = 0x600;
    pub const HARDTAIL: u16 = 0x601;

    pub const GLOBALS: u16 = 0x700;
    pub const MOVESTATE: u16 = 0x7ff;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, From, Into)]
#[repr(transparent)]
pub struct Tag(u32);

impl Tag {
    /// 日志开头的“前一个标签”
    pub const NULL: Self = Self(0xffff_ffff);

    /// 不属于任何目录项的记录（尾指针、CRC、全局状态）使用的id
    pub const ID_NONE: u16 = 0x3ff;

    /// 表示删除的长度
    pub const SIZE_DELETED: u16 = 0x3ff;

    pub const fn new(ty: u16, id: u16, size: u16) -> Self {
        Self(((ty as u32) << 20) | ((id as u32 & 0x3ff) << 10) | (size as u32 & 0x3ff))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }

    pub const fn is_delete(self) -> bool {
        self.size() == Self::SIZE_DELETED
    }

    pub const fn type1(self) -> u16 {
        ((self.0 & 0x7000_0000) >> 20) as u16
    }

    pub const fn type2(self) -> u16 {
        ((self.0 & 0x7800_0000) >> 20) as u16
    }

    pub const fn type3(self) -> u16 {
        ((self.0 & 0x7ff0_0000) >> 20) as u16
    }

    pub const fn chunk(self) -> u8 {
        ((self.0 & 0x0ff0_0000) >> 20) as u8
    }

    pub const fn id(self) -> u16 {
        ((self.0 & 0x000f_fc00) >> 10) as u16
    }

    pub const fn size(self) -> u16 {
        (self.0 & 0x0000_03ff) as u16
    }

    /// 标签连同数据在磁盘上占用的字节数
    pub const fn dsize(self) -> usize {
        4 + if self.is_delete() { 0 } else { self.size() as usize }
    }

    /// 清除有效位后的标签，写入后成为下一条记录的异或基准
    pub const fn masked(self) -> Self {
        Self(self.0 & 0x7fff_ffff)
    }

    /// 与前一个标签异或后编码为磁盘字节
    pub const fn encode(self, prev: Tag) -> [u8; 4] {
        (self.masked().0 ^ prev.0).to_be_bytes()
    }

    pub const fn decode(raw: [u8; 4], prev: Tag) -> Self {
        Self(u32::from_be_bytes(raw) ^ prev.0)
    }

    /// 翻转有效位，提交的 CRC 标签借此声明下一次提交的有效位极性
    pub const fn perturb(self, bit: bool) -> Self {
        Self(self.0 ^ ((bit as u32) << 31))
    }
}
