//! Cache and sweeper configuration
//!
//! 缓存与清扫器配置

use std::time::Duration;

/// Maximum number of sections a reclaim batch buffers before it starts
/// reclaiming candidates one by one
///
/// 回收批次在开始逐个回收之前最多缓冲的分段数量
pub const RECLAIM_BATCH_CAPACITY: usize = 4;

/// Free age at which the sweep synchronizes a dirty section
///
/// 清扫对脏分段执行同步的空闲年龄
pub const SYNC_AGE: u8 = 4;

/// Free age at which the sweep unmaps a section
///
/// 清扫取消映射分段的空闲年龄
pub const UNMAP_AGE: u8 = 6;

/// How concurrent lockers of one section share mappings
///
/// 同一分段的并发加锁者如何共享映射
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MappingMode {
    /// All lockers alias one refcounted mapping that stays cached after unlock
    ///
    /// 所有加锁者共享一个引用计数的映射，解锁后保留在缓存中
    #[default]
    Shared,

    /// Every lock creates its own mapping, which unlock syncs and unmaps at once.
    /// Meant for memory debugging: stale pointers fault instead of aliasing.
    ///
    /// 每次加锁都创建独立映射，解锁时立即同步并取消映射。
    /// 用于内存调试：过期指针会触发错误而不是静默别名。
    Exclusive,
}

/// Options for opening a [`SectionCache`](super::SectionCache)
///
/// 打开 [`SectionCache`](super::SectionCache) 的选项
///
/// # Examples
///
/// ```
/// use section_mmap::{CacheOptions, MappingMode};
///
/// let options = CacheOptions::new(4096)
///     .max_lockfree(8)
///     .mode(MappingMode::Shared)
///     .create(true);
/// assert_eq!(options.section_size, 4096);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheOptions {
    /// Section size in bytes
    ///
    /// 分段大小（字节）
    pub section_size: u32,

    /// Cached-but-unlocked mappings to keep before locking reclaims others
    ///
    /// 加锁时触发回收前允许保留的已缓存未加锁映射数量
    pub max_lockfree: usize,

    pub mode: MappingMode,

    /// When false, durability requests succeed without touching the disk
    ///
    /// 为 false 时，持久化请求不访问磁盘直接成功
    pub sync_enabled: bool,

    pub writable: bool,
    pub create: bool,
    pub create_new: bool,

    /// Skip the advisory whole-file lock
    ///
    /// 不获取整个文件的建议锁
    pub shareable: bool,
}

impl CacheOptions {
    pub fn new(section_size: u32) -> Self {
        Self {
            section_size,
            max_lockfree: 32,
            mode: MappingMode::Shared,
            sync_enabled: true,
            writable: true,
            create: false,
            create_new: false,
            shareable: false,
        }
    }

    pub fn max_lockfree(mut self, max_lockfree: usize) -> Self {
        self.max_lockfree = max_lockfree;
        self
    }

    pub fn mode(mut self, mode: MappingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn sync_enabled(mut self, sync_enabled: bool) -> Self {
        self.sync_enabled = sync_enabled;
        self
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    pub fn shareable(mut self, shareable: bool) -> Self {
        self.shareable = shareable;
        self
    }
}

/// Timing of the background [`Sweeper`](super::Sweeper)
///
/// 后台 [`Sweeper`](super::Sweeper) 的时间参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SweepOptions {
    /// Pause between two aging passes
    ///
    /// 两次老化清扫之间的间隔
    pub interval: Duration,

    /// Pause after each synchronize issued by the sweep
    ///
    /// 清扫每次同步之后的暂停
    pub throttle: Duration,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            throttle: Duration::from_millis(10),
        }
    }
}
