//! Section-oriented memory-mapped file cache
//!
//! 面向分段的内存映射文件缓存
//!
//! This library divides a backing file into fixed-size sections, maps them on demand,
//! keeps mappings warm across lock/unlock cycles, tracks per-section dirtiness with
//! wraparound-safe generations and reclaims idle mappings without ever dropping a
//! mapping whose latest write is not yet on disk.
//!
//! 本库将底层文件划分为定长分段，按需映射，在加锁/解锁之间保持映射缓存，
//! 使用可回绕的代数跟踪每个分段的脏状态，并回收空闲映射，
//! 且绝不会在最新写入尚未落盘时丢弃映射。
//!
//! # Features
//!
//! - **Zero-copy access**: Lockers get a pointer straight into the mapping
//! - **Cached mappings**: Unlocked sections stay mapped up to a configurable budget
//! - **Cheap dirty tracking**: Writes between two syncs share one generation
//! - **Durability-safe eviction**: Sync first, unmap several sweeps later
//! - **Short locks**: map, unmap and msync run outside every lock
//!
//! # 特性
//!
//! - **零拷贝访问**：加锁者直接获得指向映射的指针
//! - **映射缓存**：解锁的分段在可配置的预算内保持映射
//! - **廉价的脏跟踪**：两次同步之间的写入共享同一代
//! - **持久化安全的淘汰**：先同步，数次清扫之后再取消映射
//! - **短暂持锁**：map、unmap 和 msync 都在锁外执行
//!
//! # Quick Start
//!
//! ## 快速开始
//!
//! ```
//! use section_mmap::{CacheOptions, Result, SectionCache};
//! # use tempfile::tempdir;
//! # fn main() -> Result<()> {
//! # let dir = tempdir()?;
//! # let path = dir.path().join("sections.bin");
//!
//! // Create a cache with 4 KiB sections and grow it
//! // 创建 4 KiB 分段的缓存并扩展
//! let cache = SectionCache::open(&path, CacheOptions::new(4096).create(true))?;
//! cache.try_append_pages(4)?;
//!
//! // Concurrent lockers of one section share a mapping
//! // 同一分段的并发加锁者共享一个映射
//! std::thread::scope(|s| {
//!     for byte in 0..2u8 {
//!         let cache = &cache;
//!         s.spawn(move || {
//!             let guard = cache.lock(byte as u32).unwrap();
//!             // Safety: each thread writes its own section
//!             // Safety: 每个线程写入自己的分段
//!             unsafe { guard.write_at(0, &[byte; 16]).unwrap() };
//!             guard.mark_dirty().unwrap();
//!         });
//!     }
//! });
//!
//! // Make everything durable
//! // 全部持久化
//! cache.flush_all()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Main Types
//!
//! - [`SectionCache`]: The section cache
//! - [`SectionGuard`]: Scoped lock on one section
//! - [`Generation`]: Wraparound-safe version of a section's contents
//! - [`Sweeper`]: Background aging sweep
//! - [`CommitHistory`]: Group durability helper
//! - [`MappedFile`]: Ranged mappings of one file with a live-region registry
//!
//! # 主要类型
//!
//! - [`SectionCache`]：分段缓存
//! - [`SectionGuard`]：单个分段的作用域锁
//! - [`Generation`]：分段内容的可回绕版本
//! - [`Sweeper`]：后台老化清扫
//! - [`CommitHistory`]：组持久化辅助
//! - [`MappedFile`]：带有活动区域注册表的单文件区间映射

mod cache;

pub use cache::{
    CacheOptions, CacheStats, CommitHistory, Error, FileOptions, Generation, MappedFile, MappedRegion,
    MappingMode, RECLAIM_BATCH_CAPACITY, RegionRef, Result, SYNC_AGE, SectionCache, SectionGuard,
    SectionState, SweepOptions, SweepReport, Sweeper, UNMAP_AGE,
};
