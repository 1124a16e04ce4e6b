//! Deferred flush-then-unmap of idle sections
//!
//! 空闲分段的延迟"先刷新后取消映射"

use super::generation::Generation;
use super::mapped_file::RegionRef;
use super::options::{RECLAIM_BATCH_CAPACITY, SYNC_AGE};
use super::section::SectionMeta;
use super::section_cache::{CacheState, SectionCache};
use parking_lot::MutexGuard;
use tracing::{debug, warn};

/// A section captured for reclaim
///
/// 被捕获待回收的分段
pub(crate) struct ReclaimCandidate {
    section: u32,
    /// `update_gen` at capture; the section must still be at it when unmapped
    generation: Generation,
    region: RegionRef,
    /// Captured dirty; the section was pinned with `begin_sync`
    needs_flush: bool,
}

impl ReclaimCandidate {
    fn capture(meta: &mut SectionMeta, section: u32, sync_enabled: bool) -> Option<Self> {
        if !meta.is_idle() {
            return None;
        }
        let region = meta.mapping.as_ref()?.share();
        let needs_flush = sync_enabled && meta.is_dirty();
        let generation = if needs_flush {
            meta.begin_sync()
        } else {
            meta.update_gen
        };
        Some(Self {
            section,
            generation,
            region,
            needs_flush,
        })
    }
}

/// Fixed-capacity batch of sections to flush and unmap outside the cache lock
///
/// 在缓存锁之外刷新并取消映射的定容分段批次
///
/// Candidates are captured under the cache lock by [`try_add`](Self::try_add). Once the
/// batch is full, further candidates are reclaimed on the spot instead of buffered, so
/// the caller never waits on more than `RECLAIM_BATCH_CAPACITY` queued syncs.
/// Dropping a batch that was not flushed only unpins what it pinned; it never unmaps.
/// It must not be dropped while the caller holds the cache lock.
///
/// 候选分段在缓存锁下由 [`try_add`](Self::try_add) 捕获。批次已满时，后续候选会被立即回收
/// 而不是缓冲，因此调用者等待的排队同步不会超过 `RECLAIM_BATCH_CAPACITY` 个。
/// 丢弃未刷新的批次只会解除它所固定的分段；从不取消映射。
/// 不能在调用者持有缓存锁时丢弃。
pub(crate) struct ReclaimBatch<'a> {
    cache: &'a SectionCache,
    entries: [Option<ReclaimCandidate>; RECLAIM_BATCH_CAPACITY],
    len: usize,
}

impl<'a> ReclaimBatch<'a> {
    pub(crate) fn new(cache: &'a SectionCache) -> Self {
        Self {
            cache,
            entries: Default::default(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.len == RECLAIM_BATCH_CAPACITY
    }

    fn contains(&self, section: u32) -> bool {
        self.entries[..self.len]
            .iter()
            .flatten()
            .any(|candidate| candidate.section == section)
    }

    /// Capture `section` if it is idle; returns whether it was buffered or reclaimed
    ///
    /// 若 `section` 空闲则捕获它；返回是否已缓冲或已回收
    pub(crate) fn try_add(&mut self, state: &mut MutexGuard<'_, CacheState>, section: u32) -> bool {
        if self.contains(section) {
            return false;
        }
        let sync_enabled = self.cache.sync_enabled;
        let Some(candidate) =
            ReclaimCandidate::capture(&mut state.sections[section as usize], section, sync_enabled)
        else {
            return false;
        };

        if self.is_full() {
            return self.cache.complete_reclaim(state, candidate);
        }
        self.entries[self.len] = Some(candidate);
        self.len += 1;
        true
    }

    /// Flush and unmap every buffered candidate that is still eligible
    ///
    /// 刷新并取消映射所有仍然符合条件的缓冲候选
    ///
    /// Returns the number of sections actually unmapped.
    ///
    /// 返回实际取消映射的分段数量。
    pub(crate) fn flush(&mut self) -> usize {
        if self.len == 0 {
            return 0;
        }
        let mut state = self.cache.state.lock();
        let mut reclaimed = 0;
        for slot in &mut self.entries[..self.len] {
            if let Some(candidate) = slot.take() {
                reclaimed += usize::from(self.cache.complete_reclaim(&mut state, candidate));
            }
        }
        self.len = 0;
        reclaimed
    }
}

impl Drop for ReclaimBatch<'_> {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        let mut state = self.cache.state.lock();
        for candidate in self.entries[..self.len].iter_mut().filter_map(Option::take) {
            if candidate.needs_flush {
                state.sections[candidate.section as usize].finish_sync(candidate.generation, false);
            }
        }
        debug!(count = self.len, "dropped unflushed reclaim batch");
        self.len = 0;
    }
}

impl SectionCache {
    /// Flush a captured candidate, re-validate it and unmap it
    ///
    /// 刷新已捕获的候选，重新验证后取消映射
    ///
    /// Entered and left with the cache lock held; the lock is released around the
    /// synchronize and unmap calls. The re-validation stays under the lock.
    /// A candidate that is dirty, locked or otherwise changed since capture is left
    /// mapped, and an aged one is rewound to just before the sync age so the sweep
    /// retries it from scratch.
    ///
    /// 进入和离开时都持有缓存锁；同步和取消映射调用期间会释放锁。重新验证在锁内进行。
    /// 自捕获以来变脏、被加锁或状态改变的候选保持映射，已老化的候选年龄回退到同步年龄之前，
    /// 让清扫从头重试。
    pub(crate) fn complete_reclaim(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        candidate: ReclaimCandidate,
    ) -> bool {
        let section = candidate.section;
        let index = section as usize;

        let synced = if candidate.needs_flush {
            let result = MutexGuard::unlocked(state, || self.file.synchronize(&candidate.region, true));
            state.sections[index].finish_sync(candidate.generation, result.is_ok());
            if let Err(err) = &result {
                warn!(section, generation = %candidate.generation, error = %err, "synchronize before reclaim failed");
            }
            result.is_ok()
        } else {
            true
        };

        let sync_enabled = self.sync_enabled;
        let meta = &mut state.sections[index];
        let eligible = synced
            && meta.is_idle()
            && meta.update_gen == candidate.generation
            && (!sync_enabled || !meta.is_dirty())
            && meta
                .mapping
                .as_ref()
                .is_some_and(|region| region.region().same_region(&candidate.region));
        if !eligible {
            if meta.lock_count == 0 && meta.free_age >= SYNC_AGE {
                meta.free_age = SYNC_AGE - 1;
            }
            debug!(section, synced, "reclaim candidate no longer eligible");
            return false;
        }

        let Some(region) = meta.mapping.take() else {
            return false;
        };
        meta.free_age = 0;
        state.lockfree -= 1;
        drop(candidate);

        MutexGuard::unlocked(state, || self.file.unmap(region));
        debug!(section, "reclaimed section");
        true
    }
}
