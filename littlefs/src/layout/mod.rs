//! 磁盘数据结构层

pub mod crc;
mod superblock;
mod tag;

pub use self::superblock::{CtzStruct, Fcrc, GState, MAGIC, Superblock};
pub use self::tag::{Tag, ty};
