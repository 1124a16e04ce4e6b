//! Per-section bookkeeping
//!
//! 分段簿记

use super::generation::Generation;
use super::mapped_file::MappedRegion;
use super::options::UNMAP_AGE;

/// Mutable state of one section, guarded by the cache lock
///
/// 单个分段的可变状态，由缓存锁保护
///
/// `update_gen` is either `syncing_gen` or one generation ahead of it, and `sync_gen`
/// never passes `syncing_gen`.
///
/// `update_gen` 等于 `syncing_gen` 或比它多一代，`sync_gen` 永远不会超过 `syncing_gen`。
#[derive(Debug)]
pub(crate) struct SectionMeta {
    pub(crate) lock_count: u32,
    pub(crate) mapping: Option<MappedRegion>,

    /// A locker is mapping this section with the cache lock released
    ///
    /// 某个加锁者正在释放缓存锁的情况下映射此分段
    pub(crate) mapping_in_progress: bool,

    pub(crate) update_gen: Generation,
    pub(crate) syncing_gen: Generation,
    pub(crate) sync_gen: Generation,

    /// In-flight synchronize calls; pins the section against reclaim
    ///
    /// 进行中的同步调用数量；阻止分段被回收
    pub(crate) syncer_count: u32,

    pub(crate) free_age: u8,
}

impl SectionMeta {
    pub(crate) fn new() -> Self {
        Self {
            lock_count: 0,
            mapping: None,
            mapping_in_progress: false,
            update_gen: Generation::INITIAL,
            syncing_gen: Generation::INITIAL,
            sync_gen: Generation::INITIAL,
            syncer_count: 0,
            free_age: 0,
        }
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.sync_gen != self.update_gen
    }

    /// Mapped with no lockers
    ///
    /// 已映射且无加锁者
    #[inline]
    pub(crate) fn is_lockfree(&self) -> bool {
        self.lock_count == 0 && self.mapping.is_some()
    }

    /// Candidate for aging and reclaim
    ///
    /// 可参与老化与回收
    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.is_lockfree() && self.syncer_count == 0 && !self.mapping_in_progress
    }

    /// Open a new generation unless one is already waiting for a sync attempt
    ///
    /// 开启新的一代，除非已有一代在等待同步
    pub(crate) fn mark_dirty(&mut self) -> Generation {
        if self.update_gen == self.syncing_gen {
            self.update_gen = self.update_gen.next();
        }
        debug_assert!(self.update_gen == self.syncing_gen.next());
        self.update_gen
    }

    /// Pin the section and claim the current generation for a sync attempt
    ///
    /// 固定分段并为同步尝试认领当前代
    pub(crate) fn begin_sync(&mut self) -> Generation {
        self.syncer_count += 1;
        self.syncing_gen.merge(self.update_gen);
        self.update_gen
    }

    /// Unpin after a sync attempt; success makes `target` durable
    ///
    /// 同步尝试后解除固定；成功时 `target` 成为已持久化
    pub(crate) fn finish_sync(&mut self, target: Generation, succeeded: bool) {
        debug_assert!(self.syncer_count > 0);
        self.syncer_count -= 1;
        if succeeded {
            self.sync_gen.merge(target);
        }
    }

    /// `generation` is on disk, or the section holds no mapping that could carry it
    ///
    /// `generation` 已落盘，或分段没有可能承载它的映射
    #[inline]
    pub(crate) fn is_durable(&self, generation: Generation) -> bool {
        self.mapping.is_none() || self.sync_gen.is_at_or_after(generation)
    }

    #[inline]
    pub(crate) fn age(&mut self) -> u8 {
        self.free_age = (self.free_age + 1).min(UNMAP_AGE);
        self.free_age
    }

    pub(crate) fn state(&self, mapped: bool) -> SectionState {
        SectionState {
            mapped,
            lock_count: self.lock_count,
            update_gen: self.update_gen,
            syncing_gen: self.syncing_gen,
            sync_gen: self.sync_gen,
            syncer_count: self.syncer_count,
            free_age: self.free_age,
        }
    }
}

/// Snapshot of one section's bookkeeping
///
/// 单个分段簿记的快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SectionState {
    pub mapped: bool,
    pub lock_count: u32,
    pub update_gen: Generation,
    pub syncing_gen: Generation,
    pub sync_gen: Generation,
    pub syncer_count: u32,
    pub free_age: u8,
}

impl SectionState {
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.sync_gen != self.update_gen
    }
}
