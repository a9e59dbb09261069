//! 文件系统配置

use vfs::{DiskVersion, Error};

/// 文件名的最大长度
pub const NAME_MAX: u32 = 255;
/// 文件的最大字节数
pub const FILE_MAX: u32 = 2_147_483_647;
/// 单个自定义属性的最大字节数
pub const ATTR_MAX: u32 = 1022;
/// 支持的最高磁盘版本
pub const DISK_VERSION: DiskVersion = DiskVersion::new(2, 1);

/// 块的最小字节数，小于此值放不下一次完整的提交
pub const MIN_BLOCK_SIZE: usize = 128;

/// 未给出块大小时，依次尝试的候选值
pub const BLOCK_SIZE_CANDIDATES: [usize; 10] =
    [4096, 512, 1024, 2048, 8192, 16384, 32768, 65536, 256, 128];

/// 镜像的几何参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: usize,
    /// 挂载时为0表示从超级块读取
    pub block_count: usize,
}

impl Geometry {
    pub const fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            block_count,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.block_size * self.block_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// 编程单元，提交按此对齐
    pub prog_size: usize,
    /// 限制内联文件的大小，超过块大小时按块大小计
    pub cache_size: usize,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
    /// 格式化时写入的版本
    pub disk_version: DiskVersion,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prog_size: 16,
            cache_size: 512,
            name_max: NAME_MAX,
            file_max: FILE_MAX,
            attr_max: ATTR_MAX,
            disk_version: DISK_VERSION,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self, block_size: usize) -> Result<(), Error> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(Error::InvalidArgument("block size below 128 bytes"));
        }
        if self.prog_size == 0 || block_size % self.prog_size != 0 {
            return Err(Error::InvalidArgument("block size is not a multiple of prog size"));
        }
        if self.cache_size == 0 {
            return Err(Error::InvalidArgument("cache size is zero"));
        }
        if self.name_max == 0 || self.name_max > NAME_MAX {
            return Err(Error::InvalidArgument("name_max out of range"));
        }
        if self.file_max == 0 || self.file_max > FILE_MAX {
            return Err(Error::InvalidArgument("file_max out of range"));
        }
        if self.attr_max > ATTR_MAX {
            return Err(Error::InvalidArgument("attr_max out of range"));
        }
        let DiskVersion { major, minor } = self.disk_version;
        if major != DISK_VERSION.major || minor > DISK_VERSION.minor {
            return Err(Error::UnsupportedVersion { major, minor });
        }
        Ok(())
    }

    /// 不超过此大小的文件内联在元数据中
    pub fn inline_max(&self, block_size: usize) -> usize {
        self.cache_size
            .min(block_size)
            .min(self.attr_max as usize)
            .min(block_size / 8)
    }
}
