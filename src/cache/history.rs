//! Generations a group commit must make durable
//!
//! 组提交必须持久化的代数

use super::error::Result;
use super::generation::Generation;
use super::section_cache::SectionCache;
use std::collections::BTreeMap;
use tracing::debug;

/// Highest required generation per `(cache, section)`
///
/// 每个 `(缓存, 分段)` 需要持久化的最高代数
///
/// Callers record the generation returned by every `mark_dirty` that belongs to one
/// logical commit, then call [`force_sync_all`](Self::force_sync_all) to make all of
/// them durable together.
///
/// 调用者记录属于同一逻辑提交的每次 `mark_dirty` 所返回的代数，
/// 然后调用 [`force_sync_all`](Self::force_sync_all) 一并持久化。
///
/// # Examples
///
/// ```
/// # use section_mmap::{CacheOptions, CommitHistory, Result, SectionCache};
/// # use tempfile::tempdir;
/// # fn main() -> Result<()> {
/// # let dir = tempdir()?;
/// # let path = dir.path().join("commit.bin");
/// let cache = SectionCache::open(&path, CacheOptions::new(4096).create(true))?;
/// cache.try_append_pages(2)?;
///
/// let mut history = CommitHistory::new();
/// for section in 0..2 {
///     let guard = cache.lock(section)?;
///     unsafe { guard.write_at(0, &[section as u8 + 1])? };
///     history.record(&cache, section, guard.mark_dirty()?);
/// }
/// history.force_sync_all()?;
/// assert!(history.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct CommitHistory<'a> {
    entries: BTreeMap<(usize, u32), Entry<'a>>,
}

struct Entry<'a> {
    cache: &'a SectionCache,
    generation: Generation,
}

impl<'a> CommitHistory<'a> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    #[inline]
    fn key(cache: &SectionCache, section: u32) -> (usize, u32) {
        (std::ptr::from_ref(cache) as usize, section)
    }

    /// Require `generation` of `section` to become durable; keeps the latest per section
    ///
    /// 要求 `section` 的 `generation` 持久化；每个分段保留最新的代数
    pub fn record(&mut self, cache: &'a SectionCache, section: u32, generation: Generation) {
        self.entries
            .entry(Self::key(cache, section))
            .and_modify(|entry| entry.generation.merge(generation))
            .or_insert(Entry { cache, generation });
    }

    /// Generation currently required for `section`
    ///
    /// `section` 当前要求的代数
    pub fn required(&self, cache: &SectionCache, section: u32) -> Option<Generation> {
        self.entries
            .get(&Self::key(cache, section))
            .map(|entry| entry.generation)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Flush every recorded entry
    ///
    /// 刷新所有已记录的条目
    ///
    /// Every entry is attempted. Flushed entries are removed, failed ones stay for a
    /// retry, and the first failure is returned.
    ///
    /// 会尝试所有条目。成功刷新的条目被移除，失败的条目保留以便重试，并返回第一个失败。
    pub fn force_sync_all(&mut self) -> Result<()> {
        let mut first_err = None;
        let total = self.entries.len();
        self.entries.retain(|&(_, section), entry| {
            match entry.cache.ensure_flushed(section, entry.generation) {
                Ok(()) => false,
                Err(err) => {
                    first_err.get_or_insert(err);
                    true
                }
            }
        });
        debug!(total, failed = self.entries.len(), "forced commit history to disk");
        first_err.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for CommitHistory<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(&(_, section), entry)| (section, entry.generation)),
            )
            .finish()
    }
}
