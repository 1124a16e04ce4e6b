//! Section cache: lock, dirty tracking, durability and growth
//!
//! 分段缓存：加锁、脏跟踪、持久化与增长

use super::error::{Error, Result};
use super::generation::Generation;
use super::guard::SectionGuard;
use super::mapped_file::{FileOptions, MappedFile, MappedRegion, RegionRef};
use super::options::{CacheOptions, MappingMode};
use super::reclaim::ReclaimBatch;
use super::section::{SectionMeta, SectionState};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::path::Path;
use std::ptr::NonNull;
use tracing::{debug, trace, warn};

/// Fixed-size sections of a file, mapped on demand and cached across lock/unlock
///
/// 文件的定长分段，按需映射并在加锁/解锁之间缓存
///
/// Callers lock a section to get a pointer, write bytes directly, mark the section dirty
/// to obtain a [`Generation`], unlock, and later demand that generation be durable with
/// [`ensure_flushed`](Self::ensure_flushed).
///
/// 调用者加锁分段获得指针，直接写入字节，标记分段为脏以获得 [`Generation`]，
/// 解锁，之后通过 [`ensure_flushed`](Self::ensure_flushed) 要求该代持久化。
///
/// # Examples
///
/// ```
/// # use section_mmap::{CacheOptions, Result, SectionCache};
/// # use tempfile::tempdir;
/// # fn main() -> Result<()> {
/// # let dir = tempdir()?;
/// # let path = dir.path().join("sections.bin");
/// let cache = SectionCache::open(&path, CacheOptions::new(4096).create(true))?;
/// cache.try_append_pages(2)?;
///
/// let guard = cache.lock(1)?;
/// unsafe { guard.write_at(0, b"hello")? };
/// let generation = guard.mark_dirty()?;
/// guard.unlock()?;
///
/// cache.ensure_flushed(1, generation)?;
/// assert!(cache.is_durable(1, generation)?);
/// # Ok(())
/// # }
/// ```
pub struct SectionCache {
    pub(crate) file: MappedFile,
    section_size: u32,
    max_lockfree: usize,
    mode: MappingMode,
    pub(crate) sync_enabled: bool,
    pub(crate) state: Mutex<CacheState>,

    /// Signalled whenever a first-touch mapping attempt finishes
    ///
    /// 每次首次映射尝试结束时通知
    mapped: Condvar,
}

pub(crate) struct CacheState {
    pub(crate) sections: Vec<SectionMeta>,
    exclusive: Vec<ExclusiveMapping>,
    pub(crate) lockfree: usize,
    pub(crate) sweep_cursor: u32,
}

impl CacheState {
    fn check(&self, section: u32) -> Result<usize> {
        let count = self.sections.len();
        if (section as usize) < count {
            Ok(section as usize)
        } else {
            Err(Error::SectionOutOfRange {
                section,
                count: count as u32,
            })
        }
    }
}

/// A mapping owned by one exclusive-mode locker
///
/// 独占模式下单个加锁者拥有的映射
struct ExclusiveMapping {
    section: u32,
    region: MappedRegion,
}

/// Snapshot of cache-wide counters
///
/// 缓存整体计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheStats {
    pub sections: u32,
    pub mapped: usize,
    pub locked: usize,
    pub lockfree: usize,
    pub dirty: usize,
    pub syncing: usize,
}

impl SectionCache {
    /// Open (or create) a section cache over `path`
    ///
    /// 在 `path` 上打开（或创建）分段缓存
    ///
    /// # Errors
    /// - `InvalidSectionSize` if the section size is 0
    /// - `MisalignedLength` if the file length is not a multiple of the section size
    /// - `Locked` if another process holds the file
    ///
    /// # Errors
    /// - 分段大小为 0 时返回 `InvalidSectionSize`
    /// - 文件长度不是分段大小整数倍时返回 `MisalignedLength`
    /// - 其他进程持有文件时返回 `Locked`
    pub fn open(path: impl AsRef<Path>, options: CacheOptions) -> Result<Self> {
        if options.section_size == 0 {
            return Err(Error::InvalidSectionSize);
        }

        let file = if options.writable {
            MappedFile::open_read_write(
                path,
                FileOptions {
                    create: options.create,
                    create_new: options.create_new,
                    shareable: options.shareable,
                    ..Default::default()
                },
            )?
        } else {
            MappedFile::open_read_only(path)?
        };

        let len = file.len();
        let section_size = u64::from(options.section_size);
        if len % section_size != 0 {
            return Err(Error::MisalignedLength {
                len,
                section_size: options.section_size,
            });
        }
        let count = u32::try_from(len / section_size).map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file holds more sections than a u32 can index",
            ))
        })?;

        let mut sections = Vec::new();
        sections.try_reserve(count as usize)?;
        sections.extend((0..count).map(|_| SectionMeta::new()));

        debug!(
            path = %file.path().display(),
            sections = count,
            section_size = options.section_size,
            mode = ?options.mode,
            "opened section cache"
        );

        Ok(Self {
            file,
            section_size: options.section_size,
            max_lockfree: options.max_lockfree,
            mode: options.mode,
            sync_enabled: options.sync_enabled,
            state: Mutex::new(CacheState {
                sections,
                exclusive: Vec::new(),
                lockfree: 0,
                sweep_cursor: 0,
            }),
            mapped: Condvar::new(),
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    #[inline]
    pub fn section_size(&self) -> u32 {
        self.section_size
    }

    #[inline]
    pub fn mode(&self) -> MappingMode {
        self.mode
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.file.is_writable()
    }

    #[inline]
    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    /// Number of sections
    ///
    /// 分段数量
    pub fn section_count(&self) -> u32 {
        self.state.lock().sections.len() as u32
    }

    /// Sections that are mapped but have no lockers
    ///
    /// 已映射但没有加锁者的分段数量
    pub fn lockfree_count(&self) -> usize {
        self.state.lock().lockfree
    }

    /// Lock a section and return a guard pointing at its bytes
    ///
    /// 加锁分段并返回指向其字节的守卫
    ///
    /// In shared mode all lockers of a section receive the same pointer, and the mapping
    /// stays cached after the last unlock. In exclusive mode every lock gets its own mapping.
    ///
    /// 共享模式下同一分段的所有加锁者得到相同的指针，最后一次解锁后映射继续缓存。
    /// 独占模式下每次加锁都有独立映射。
    pub fn lock(&self, section: u32) -> Result<SectionGuard<'_>> {
        let ptr = match self.mode {
            MappingMode::Shared => self.lock_shared(section)?,
            MappingMode::Exclusive => self.lock_exclusive(section)?,
        };
        trace!(section, ptr = ?ptr, "locked section");
        Ok(SectionGuard::new(self, section, ptr, self.section_size as usize))
    }

    fn lock_shared(&self, section: u32) -> Result<NonNull<u8>> {
        // Declared before the state guard so it is dropped after the guard is released.
        let mut batch = ReclaimBatch::new(self);
        let mut state = self.state.lock();
        let index = state.check(section)?;

        loop {
            let meta = &mut state.sections[index];
            if let Some(region) = &meta.mapping {
                let ptr = region_ptr(region)?;
                let was_free = meta.lock_count == 0;
                meta.lock_count += 1;
                meta.free_age = 0;
                if was_free {
                    state.lockfree -= 1;
                }
                return Ok(ptr);
            }
            if !meta.mapping_in_progress {
                break;
            }
            self.mapped.wait(&mut state);
        }

        let meta = &mut state.sections[index];
        meta.mapping_in_progress = true;
        meta.lock_count = 1;

        if state.lockfree > self.max_lockfree {
            self.collect_reclaim(&mut state, &mut batch, section);
        }
        drop(state);

        let reclaimed = batch.flush();
        if reclaimed > 0 {
            debug!(section, reclaimed, "reclaimed lockfree sections before mapping");
        }

        let result = self.map_section(section).and_then(|region| match region_ptr(&region) {
            Ok(ptr) => Ok((region, ptr)),
            Err(err) => {
                self.file.unmap(region);
                Err(err)
            }
        });

        let mut state = self.state.lock();
        let meta = &mut state.sections[index];
        meta.mapping_in_progress = false;
        self.mapped.notify_all();
        match result {
            Ok((region, ptr)) => {
                meta.mapping = Some(region);
                meta.free_age = 0;
                Ok(ptr)
            }
            Err(err) => {
                meta.lock_count = 0;
                warn!(section, error = %err, "mapping section failed");
                Err(err)
            }
        }
    }

    /// Queue lockfree sections other than `except` until the budget would be met
    ///
    /// 将除 `except` 之外的空闲分段加入批次，直到满足预算
    fn collect_reclaim(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        batch: &mut ReclaimBatch<'_>,
        except: u32,
    ) {
        let count = state.sections.len() as u32;
        let mut needed = state.lockfree - self.max_lockfree;
        let start = state.sweep_cursor % count.max(1);
        for step in 0..count {
            if needed == 0 {
                break;
            }
            let section = (start + step) % count;
            if section == except || !state.sections[section as usize].is_idle() {
                continue;
            }
            if batch.try_add(state, section) {
                needed -= 1;
            }
        }
    }

    fn lock_exclusive(&self, section: u32) -> Result<NonNull<u8>> {
        self.state.lock().check(section)?;

        let region = self.map_section(section)?;
        let ptr = match region_ptr(&region) {
            Ok(ptr) => ptr,
            Err(err) => {
                self.file.unmap(region);
                return Err(err);
            }
        };

        let mut state = self.state.lock();
        if state
            .exclusive
            .iter()
            .any(|mapping| mapping.region.as_ptr() == region.as_ptr())
        {
            drop(state);
            self.file.unmap(region);
            return Err(Error::AlreadyRegistered { section });
        }
        if let Err(err) = state.exclusive.try_reserve(1) {
            drop(state);
            self.file.unmap(region);
            return Err(err.into());
        }
        state.sections[section as usize].lock_count += 1;
        state.exclusive.push(ExclusiveMapping { section, region });
        Ok(ptr)
    }

    fn map_section(&self, section: u32) -> Result<MappedRegion> {
        let offset = u64::from(section) * u64::from(self.section_size);
        let len = self.section_size as usize;
        if self.file.is_writable() {
            self.file.map_read_write(offset, len)
        } else {
            self.file.map_read_only(offset, len)
        }
    }

    /// Undo one `lock`; only reachable through [`SectionGuard`]
    ///
    /// 撤销一次 `lock`；只能通过 [`SectionGuard`] 调用
    pub(crate) fn release(&self, section: u32, ptr: NonNull<u8>) -> Result<()> {
        trace!(section, ptr = ?ptr, "unlocking section");
        match self.mode {
            MappingMode::Shared => self.release_shared(section, ptr),
            MappingMode::Exclusive => self.release_exclusive(section, ptr),
        }
    }

    fn release_shared(&self, section: u32, ptr: NonNull<u8>) -> Result<()> {
        let mut state = self.state.lock();
        let index = state.check(section)?;
        let meta = &mut state.sections[index];
        let holds = meta.lock_count > 0
            && meta
                .mapping
                .as_ref()
                .is_some_and(|region| region.as_ptr() == ptr.as_ptr().cast_const());
        if !holds {
            return Err(Error::NotRegistered { section });
        }

        meta.lock_count -= 1;
        if meta.lock_count == 0 {
            meta.free_age = 0;
            state.lockfree += 1;
        }
        Ok(())
    }

    fn release_exclusive(&self, section: u32, ptr: NonNull<u8>) -> Result<()> {
        let (region, flush) = {
            let mut state = self.state.lock();
            let index = state.check(section)?;
            let position = state
                .exclusive
                .iter()
                .position(|mapping| {
                    mapping.section == section && mapping.region.as_ptr() == ptr.as_ptr().cast_const()
                })
                .ok_or(Error::NotRegistered { section })?;
            let ExclusiveMapping { region, .. } = state.exclusive.swap_remove(position);

            let meta = &mut state.sections[index];
            meta.lock_count -= 1;
            let flush = (self.sync_enabled && self.file.is_writable() && meta.is_dirty())
                .then(|| meta.begin_sync());
            (region, flush)
        };

        if let Some(target) = flush {
            let result = self.file.synchronize(region.region(), false);
            if let Err(err) = &result {
                warn!(section, generation = %target, error = %err, "synchronize before unmap failed");
            }
            self.state.lock().sections[section as usize].finish_sync(target, result.is_ok());
        }
        self.file.unmap(region);
        Ok(())
    }

    /// Record a write to `section` and return its generation
    ///
    /// 记录对 `section` 的写入并返回其代数
    ///
    /// Writes between two sync attempts share one generation, so calling this twice
    /// in a row returns the same value. The section must be locked: an unmapped section
    /// counts as durable, so a generation opened without a live mapping would never be
    /// synchronized.
    ///
    /// 两次同步尝试之间的写入共享同一代，因此连续调用两次会返回相同的值。
    /// 分段必须已加锁：未映射的分段视为已持久化，没有活动映射时开启的代永远不会被同步。
    ///
    /// # Errors
    /// - `ReadOnly` if the cache was opened read-only
    /// - `NotLocked` if nobody holds a lock on the section
    ///
    /// # Errors
    /// - 缓存以只读方式打开时返回 `ReadOnly`
    /// - 没有任何加锁者持有该分段时返回 `NotLocked`
    pub fn mark_dirty(&self, section: u32) -> Result<Generation> {
        if !self.file.is_writable() {
            return Err(Error::ReadOnly);
        }
        let mut state = self.state.lock();
        let index = state.check(section)?;
        if state.sections[index].lock_count == 0 {
            return Err(Error::NotLocked { section });
        }
        let generation = state.sections[index].mark_dirty();
        trace!(section, generation = %generation, "marked section dirty");
        Ok(generation)
    }

    /// Whether `generation` of `section` has reached disk
    ///
    /// `section` 的 `generation` 是否已落盘
    pub fn is_durable(&self, section: u32, generation: Generation) -> Result<bool> {
        if !self.sync_enabled {
            return Ok(true);
        }
        let state = self.state.lock();
        let index = state.check(section)?;
        let meta = &state.sections[index];
        Ok(match self.mode {
            MappingMode::Shared => meta.is_durable(generation),
            MappingMode::Exclusive => meta.sync_gen.is_at_or_after(generation),
        })
    }

    /// Make sure `generation` of `section` is on disk
    ///
    /// 确保 `section` 的 `generation` 已落盘
    ///
    /// The section is pinned while the synchronize call runs with the cache lock released.
    /// A failed synchronize leaves the section dirty for a later retry.
    ///
    /// 同步调用期间分段被固定，且缓存锁已释放。同步失败时分段保持为脏，等待之后重试。
    pub fn ensure_flushed(&self, section: u32, generation: Generation) -> Result<()> {
        if !self.sync_enabled {
            return Ok(());
        }

        let mut state = self.state.lock();
        let index = state.check(section)?;
        let meta = &state.sections[index];

        let regions: Vec<RegionRef> = match self.mode {
            MappingMode::Shared => {
                if meta.is_durable(generation) {
                    return Ok(());
                }
                meta.mapping.iter().map(MappedRegion::share).collect()
            }
            MappingMode::Exclusive => {
                if meta.sync_gen.is_at_or_after(generation) {
                    return Ok(());
                }
                state
                    .exclusive
                    .iter()
                    .filter(|mapping| mapping.section == section)
                    .map(|mapping| mapping.region.share())
                    .collect()
            }
        };
        let target = state.sections[index].begin_sync();
        drop(state);

        let result = if regions.is_empty() {
            // Exclusive mappings already gone; their pages are in the page cache.
            self.file.sync_data()
        } else {
            regions
                .iter()
                .try_for_each(|region| self.file.synchronize(region, true))
        };

        self.state.lock().sections[index].finish_sync(target, result.is_ok());
        match &result {
            Ok(()) => debug!(section, generation = %target, "flushed section"),
            Err(err) => warn!(section, generation = %target, error = %err, "flushing section failed"),
        }
        result
    }

    /// Flush every dirty section to its current generation
    ///
    /// 将所有脏分段刷新到其当前代
    pub fn flush_all(&self) -> Result<()> {
        let pending: Vec<(u32, Generation)> = {
            let state = self.state.lock();
            state
                .sections
                .iter()
                .enumerate()
                .filter(|(_, meta)| meta.is_dirty())
                .map(|(section, meta)| (section as u32, meta.update_gen))
                .collect()
        };

        let mut first_err = None;
        for (section, generation) in pending {
            if let Err(err) = self.ensure_flushed(section, generation) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Append one zero-filled section, returning its number
    ///
    /// 追加一个全零分段，返回其编号
    pub fn try_append_page(&self) -> Result<u32> {
        self.try_append_pages(1)
    }

    /// Append `count` zero-filled sections, returning the number of the first one
    ///
    /// 追加 `count` 个全零分段，返回第一个的编号
    ///
    /// Capacity for the bookkeeping is reserved before the file is extended, and the
    /// bookkeeping is only appended once the extend succeeded, so a failure leaves both
    /// unchanged.
    ///
    /// 先为簿记预留容量再扩展文件，扩展成功后才追加簿记，因此失败时两者都保持不变。
    pub fn try_append_pages(&self, count: u32) -> Result<u32> {
        if !self.file.is_writable() {
            return Err(Error::ReadOnly);
        }

        let mut state = self.state.lock();
        let first = state.sections.len() as u32;
        if count == 0 {
            return Ok(first);
        }
        let total = first.checked_add(count).ok_or(Error::SectionOutOfRange {
            section: u32::MAX,
            count: first,
        })?;

        state.sections.try_reserve(count as usize)?;
        // set_len runs under the cache lock so concurrent appenders cannot interleave.
        self.file
            .extend_to(u64::from(total) * u64::from(self.section_size))?;
        state
            .sections
            .extend((0..count).map(|_| SectionMeta::new()));

        debug!(first, count, total, "appended sections");
        Ok(first)
    }

    /// Snapshot the bookkeeping of one section
    ///
    /// 获取单个分段簿记的快照
    pub fn section_state(&self, section: u32) -> Result<SectionState> {
        let state = self.state.lock();
        let index = state.check(section)?;
        let mapped = match self.mode {
            MappingMode::Shared => state.sections[index].mapping.is_some(),
            MappingMode::Exclusive => state
                .exclusive
                .iter()
                .any(|mapping| mapping.section == section),
        };
        Ok(state.sections[index].state(mapped))
    }

    /// Snapshot cache-wide counters
    ///
    /// 获取缓存整体计数器快照
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut stats = CacheStats {
            sections: state.sections.len() as u32,
            lockfree: state.lockfree,
            ..Default::default()
        };
        for meta in &state.sections {
            stats.mapped += usize::from(meta.mapping.is_some());
            stats.locked += usize::from(meta.lock_count > 0);
            stats.dirty += usize::from(meta.is_dirty());
            stats.syncing += usize::from(meta.syncer_count > 0);
        }
        stats.mapped += state.exclusive.len();
        stats
    }
}

#[inline]
fn region_ptr(region: &MappedRegion) -> Result<NonNull<u8>> {
    NonNull::new(region.as_mut_ptr()).ok_or_else(|| {
        Error::Io(io::Error::other(format!(
            "mapping at offset {} returned a null pointer",
            region.offset()
        )))
    })
}

impl std::fmt::Debug for SectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionCache")
            .field("file", &self.file)
            .field("section_size", &self.section_size)
            .field("max_lockfree", &self.max_lockfree)
            .field("mode", &self.mode)
            .field("sync_enabled", &self.sync_enabled)
            .finish()
    }
}

impl Drop for SectionCache {
    fn drop(&mut self) {
        if self.sync_enabled && self.file.is_writable() {
            if let Err(err) = self.flush_all() {
                warn!(path = %self.file.path().display(), error = %err, "flush on close failed");
            }
        }

        let state = self.state.get_mut();
        let regions: Vec<MappedRegion> = state
            .sections
            .iter_mut()
            .filter_map(|meta| meta.mapping.take())
            .chain(state.exclusive.drain(..).map(|mapping| mapping.region))
            .collect();
        state.lockfree = 0;
        for region in regions {
            self.file.unmap(region);
        }
    }
}
