use alloc::string::String;

use thiserror::Error;

/// 文件系统对外的错误
///
/// 调用者应依据[`Error::code`]分支，而不是错误信息的文本。
/// 错误码沿用 littlefs 的编号（负的 errno）。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("I/O error")]
    Io,

    /// 镜像结构损坏：超级块无效、元数据对的两块都无效、跳表不一致等
    #[error("corrupt image: {0}")]
    CorruptImage(String),

    #[error("unsupported disk version v{major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("no such file or directory")]
    NotFound,

    #[error("entry already exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("no space left on image")]
    NoSpace,

    #[error("file too large")]
    FileTooLarge,

    #[error("name too long")]
    NameTooLong,

    #[error("no such attribute")]
    NoAttribute,
}

impl Error {
    pub const fn code(&self) -> i32 {
        match self {
            Self::Io => -5,
            Self::CorruptImage(_) => -84,
            Self::UnsupportedVersion { .. } => -95,
            Self::NotFound => -2,
            Self::AlreadyExists => -17,
            Self::NotADirectory => -20,
            Self::IsADirectory => -21,
            Self::NotEmpty => -39,
            Self::InvalidArgument(_) => -22,
            Self::NoSpace => -28,
            Self::FileTooLarge => -27,
            Self::NameTooLong => -36,
            Self::NoAttribute => -61,
        }
    }

    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::CorruptImage(detail.into())
    }
}
