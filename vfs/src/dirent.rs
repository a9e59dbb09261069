use alloc::string::String;

/// 列目录时交换的目录项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// 目录项自身的名字
    pub name: String,
    /// 从根目录开始的绝对路径
    pub path: String,
    pub ty: DirEntryType,
    /// 文件的字节数，目录恒为0
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DirEntryType {
    Directory,
    #[default]
    Regular,
}

impl DirEntryType {
    pub fn is_dir(self) -> bool {
        self == Self::Directory
    }
}
