//! Error types for section-mmap
//!
//! section-mmap 的错误类型

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Error type for section cache operations
///
/// 分段缓存操作的错误类型
///
/// Unmapping a region that was never registered is not represented here: it aborts
/// the process, because continuing would risk touching freed memory.
///
/// 取消映射从未注册的区域不在此表示：它会直接终止进程，因为继续执行可能访问已释放的内存。
#[derive(Debug)]
pub enum Error {
    /// I/O error
    ///
    /// I/O 错误
    Io(io::Error),

    /// Another process holds the advisory lock on the file
    ///
    /// 其他进程持有该文件的建议锁
    Locked {
        path: PathBuf,
    },

    /// Write-side operation on a read-only file or cache
    ///
    /// 对只读文件或缓存执行写操作
    ReadOnly,

    /// Section index beyond the current section count
    ///
    /// 分段编号超出当前分段数量
    SectionOutOfRange {
        section: u32,
        count: u32,
    },

    /// Section size must be non-zero
    ///
    /// 分段大小必须大于 0
    InvalidSectionSize,

    /// File length is not a multiple of the section size
    ///
    /// 文件长度不是分段大小的整数倍
    MisalignedLength {
        len: u64,
        section_size: u32,
    },

    /// Access beyond the end of a section
    ///
    /// 访问超出分段末尾
    OffsetOutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// Region is no longer registered with the mapped file
    ///
    /// 区域已不在映射文件中注册
    NotMapped,

    /// Exclusive-mode mapping registered twice
    ///
    /// 独占模式映射被重复注册
    AlreadyRegistered {
        section: u32,
    },

    /// Exclusive-mode mapping not found on unlock
    ///
    /// 独占模式解锁时找不到映射
    NotRegistered {
        section: u32,
    },

    /// Dirty-marking a section that has no live lock
    ///
    /// 对没有持有锁的分段标记为脏
    NotLocked {
        section: u32,
    },

    /// Allocation failed while growing a bookkeeping structure
    ///
    /// 扩展簿记结构时内存分配失败
    OutOfMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Locked { path } => {
                write!(f, "File {} is locked by another process / 文件已被其他进程锁定", path.display())
            }
            Error::ReadOnly => write!(f, "File is opened read-only / 文件以只读方式打开"),
            Error::SectionOutOfRange { section, count } => {
                write!(
                    f,
                    "Section {} out of range, cache has {} sections / 分段 {} 超出范围，缓存共有 {} 个分段",
                    section, count, section, count
                )
            }
            Error::InvalidSectionSize => write!(f, "Section size must be greater than 0 / 分段大小必须大于 0"),
            Error::MisalignedLength { len, section_size } => {
                write!(
                    f,
                    "File length {} is not a multiple of section size {} / 文件长度 {} 不是分段大小 {} 的整数倍",
                    len, section_size, len, section_size
                )
            }
            Error::OffsetOutOfBounds { offset, len, size } => {
                write!(
                    f,
                    "Access at offset {} with length {} exceeds section size {} / 偏移 {} 长度 {} 超出分段大小 {}",
                    offset, len, size, offset, len, size
                )
            }
            Error::NotMapped => write!(f, "Region is not mapped / 区域未映射"),
            Error::AlreadyRegistered { section } => {
                write!(f, "Mapping of section {} already registered / 分段 {} 的映射已注册", section, section)
            }
            Error::NotRegistered { section } => {
                write!(f, "Mapping of section {} is not registered / 分段 {} 的映射未注册", section, section)
            }
            Error::NotLocked { section } => {
                write!(f, "Section {} is not locked / 分段 {} 未加锁", section, section)
            }
            Error::OutOfMemory => write!(f, "Out of memory / 内存不足"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Convert from io::Error to Error
///
/// 从 io::Error 转换到 Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

/// Convert from Error to io::Error for compatibility
///
/// 从 Error 转换到 io::Error 以保持兼容性
impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(io_err) => io_err,
            Error::Locked { .. } => io::Error::new(io::ErrorKind::WouldBlock, err.to_string()),
            Error::ReadOnly => io::Error::new(io::ErrorKind::PermissionDenied, err.to_string()),
            Error::OutOfMemory => io::Error::new(io::ErrorKind::OutOfMemory, err.to_string()),
            Error::NotMapped | Error::NotRegistered { .. } => {
                io::Error::new(io::ErrorKind::NotFound, err.to_string())
            }
            Error::AlreadyRegistered { .. } => io::Error::new(io::ErrorKind::AlreadyExists, err.to_string()),
            Error::SectionOutOfRange { .. }
            | Error::NotLocked { .. }
            | Error::InvalidSectionSize
            | Error::MisalignedLength { .. }
            | Error::OffsetOutOfBounds { .. } => io::Error::new(io::ErrorKind::InvalidInput, err.to_string()),
        }
    }
}

/// Result type alias using our custom Error type
///
/// 使用自定义 Error 类型的 Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
