//! littlefs v2 文件系统引擎
//!
//! 在块设备（通常是内存中的镜像）上挂载、格式化并修改 littlefs 文件系统，
//! 磁盘格式与 littlefs 2.0/2.1 兼容。

#![no_std]

extern crate alloc;

/* littlefs 的整体架构，自上而下 */

// 文件系统层：挂载、格式化以及对外的全部操作
mod control;
use control::Pending;
pub use control::LittleFs;

// 目录树层：路径解析、目录项的增删与移动、掉电修复
mod dir;

// 文件内容层：内联文件与 CTZ 跳表
mod file;
mod ctz;

// 元数据对层：读取、追加、压缩与分裂
mod mdir;

// 元数据日志层：单个块内的提交
mod commit;

// 块分配器：遍历已用块得到空闲块
mod allocator;

// 磁盘数据结构层：标签、CRC 与定长结构
pub mod layout;

mod block;
pub use block::{BlockId, Pair};

mod config;
pub use config::{Config, Geometry, ATTR_MAX, BLOCK_SIZE_CANDIDATES, DISK_VERSION, FILE_MAX, NAME_MAX};

mod path;
mod util;

pub use block_dev::{BlockDevice, MemoryDevice};
pub use vfs::{DirEntry, DirEntryType, DiskVersion, Error, Stat, Usage};
