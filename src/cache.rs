//! Section cache over a memory-mapped file, based on memmap2
//!
//! 基于 memmap2 的内存映射文件分段缓存
//!
//! Components, leaves first:
//! - [`MappedFile`]: one file handle plus a registry of its live mappings
//! - [`Generation`]: wraparound-safe version number of a section's contents
//! - [`SectionCache`]: per-section lock counts, generations and cached mappings
//! - `ReclaimBatch`: bounded flush-then-unmap of idle sections outside the cache lock
//! - [`SectionCache::age_pass`] / [`Sweeper`]: syncs idle dirty sections, later unmaps them
//! - [`CommitHistory`]: makes a group of section generations durable together
//!
//! 组件（自底向上）：
//! - [`MappedFile`]：一个文件句柄及其活动映射的注册表
//! - [`Generation`]：分段内容的可回绕版本号
//! - [`SectionCache`]：每个分段的加锁计数、代数和缓存的映射
//! - `ReclaimBatch`：在缓存锁之外对空闲分段进行有界的先刷新后取消映射
//! - [`SectionCache::age_pass`] / [`Sweeper`]：同步空闲的脏分段，之后取消映射
//! - [`CommitHistory`]：将一组分段的代数一并持久化
//!
//! # Durability
//!
//! A section is only unmapped after its latest generation has been synchronized, so an
//! unmapped section is durable by definition. The sweep syncs a dirty idle section at
//! age 4 and unmaps it no earlier than age 6.
//!
//! # 持久化
//!
//! 分段只有在最新一代同步完成后才会被取消映射，因此未映射的分段按定义就是已持久化的。
//! 清扫在年龄 4 时同步空闲的脏分段，最早在年龄 6 时才取消映射。

mod error;
mod generation;
mod guard;
mod history;
mod mapped_file;
mod options;
mod reclaim;
mod section;
mod section_cache;
mod sweep;

#[cfg(test)]
mod tests;

// Re-export public API
// 重新导出公共 API
pub use error::{Error, Result};
pub use generation::Generation;
pub use guard::SectionGuard;
pub use history::CommitHistory;
pub use mapped_file::{FileOptions, MappedFile, MappedRegion, RegionRef};
pub use options::{CacheOptions, MappingMode, SweepOptions, RECLAIM_BATCH_CAPACITY, SYNC_AGE, UNMAP_AGE};
pub use section::SectionState;
pub use section_cache::{CacheStats, SectionCache};
pub use sweep::{SweepReport, Sweeper};
