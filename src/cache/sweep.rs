//! Background aging sweep
//!
//! 后台老化清扫

use super::error::Result;
use super::options::{SweepOptions, SYNC_AGE, UNMAP_AGE};
use super::reclaim::ReclaimBatch;
use super::section_cache::SectionCache;
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of one [`SectionCache::age_pass`]
///
/// 一次 [`SectionCache::age_pass`] 的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SweepReport {
    /// Sections examined
    ///
    /// 检查过的分段数
    pub visited: u32,

    /// Sections synchronized at the sync age
    ///
    /// 在同步年龄被同步的分段数
    pub synced: u32,

    /// Sections unmapped at the unmap age
    ///
    /// 在取消映射年龄被取消映射的分段数
    pub unmapped: u32,

    /// The abort flag stopped the pass early
    ///
    /// 中止标志提前结束了本次清扫
    pub aborted: bool,
}

impl SectionCache {
    /// Age every idle section once, syncing and unmapping the old ones
    ///
    /// 对每个空闲分段老化一次，同步并取消映射较老的分段
    ///
    /// Sections are visited round-robin from where the previous pass stopped. Each
    /// unlocked, mapped section that is not being synced ages by one; at age 4 a dirty
    /// section is synchronized (followed by a `throttle` pause), at age 6 it is flushed
    /// and unmapped through a reclaim batch. `abort` is polled between sections; a
    /// synchronize that already started runs to completion.
    ///
    /// 从上次清扫停止的位置开始轮询访问分段。每个未加锁、已映射且不在同步中的分段年龄加一；
    /// 年龄为 4 时同步脏分段（随后暂停 `throttle`），年龄为 6 时通过回收批次刷新并取消映射。
    /// 在分段之间轮询 `abort`；已经开始的同步会执行完毕。
    pub fn age_pass(&self, abort: &AtomicBool, throttle: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        // Declared before the state guard so it is dropped after the guard is released.
        let mut batch = ReclaimBatch::new(self);
        let mut state = self.state.lock();

        let count = state.sections.len() as u32;
        if count == 0 {
            return report;
        }
        let mut cursor = state.sweep_cursor % count;

        for _ in 0..count {
            if abort.load(Ordering::Relaxed) {
                report.aborted = true;
                break;
            }
            let section = cursor;
            cursor = (cursor + 1) % count;
            report.visited += 1;

            let meta = &mut state.sections[section as usize];
            if !meta.is_idle() {
                continue;
            }
            let age = meta.age();

            if age == SYNC_AGE && self.sync_enabled && meta.is_dirty() {
                let Some(region) = meta.mapping.as_ref().map(|region| region.share()) else {
                    continue;
                };
                let target = meta.begin_sync();
                let result = MutexGuard::unlocked(&mut state, || {
                    let result = self.file.synchronize(&region, true);
                    thread::sleep(throttle);
                    result
                });
                state.sections[section as usize].finish_sync(target, result.is_ok());
                match result {
                    Ok(()) => report.synced += 1,
                    Err(err) => {
                        warn!(section, generation = %target, error = %err, "sweep synchronize failed")
                    }
                }
            } else if age >= UNMAP_AGE {
                if batch.is_full() {
                    report.unmapped += MutexGuard::unlocked(&mut state, || batch.flush()) as u32;
                }
                batch.try_add(&mut state, section);
            }
        }

        state.sweep_cursor = cursor;
        drop(state);
        report.unmapped += batch.flush() as u32;

        debug!(
            visited = report.visited,
            synced = report.synced,
            unmapped = report.unmapped,
            aborted = report.aborted,
            "aging pass finished"
        );
        report
    }
}

/// Thread running [`SectionCache::age_pass`] periodically
///
/// 周期性执行 [`SectionCache::age_pass`] 的线程
///
/// # Examples
///
/// ```
/// # use section_mmap::{CacheOptions, Result, SectionCache, SweepOptions, Sweeper};
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use tempfile::tempdir;
/// # fn main() -> Result<()> {
/// # let dir = tempdir()?;
/// # let path = dir.path().join("swept.bin");
/// let cache = Arc::new(SectionCache::open(&path, CacheOptions::new(4096).create(true))?);
/// let sweeper = Sweeper::spawn(
///     Arc::clone(&cache),
///     SweepOptions { interval: Duration::from_millis(5), throttle: Duration::ZERO },
/// )?;
/// sweeper.stop();
/// # Ok(())
/// # }
/// ```
pub struct Sweeper {
    abort: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn a sweeper with its own abort flag
    ///
    /// 启动一个带有独立中止标志的清扫器
    pub fn spawn(cache: Arc<SectionCache>, options: SweepOptions) -> Result<Self> {
        Self::spawn_with_abort(cache, options, Arc::new(AtomicBool::new(false)))
    }

    /// Spawn a sweeper that stops when `abort` is set
    ///
    /// 启动一个在 `abort` 被设置时停止的清扫器
    pub fn spawn_with_abort(
        cache: Arc<SectionCache>,
        options: SweepOptions,
        abort: Arc<AtomicBool>,
    ) -> Result<Self> {
        let flag = Arc::clone(&abort);
        let handle = thread::Builder::new()
            .name("section-sweep".into())
            .spawn(move || run(&cache, &flag, options))?;
        Ok(Self {
            abort,
            handle: Some(handle),
        })
    }

    #[inline]
    pub fn abort_flag(&self) -> &Arc<AtomicBool> {
        &self.abort
    }

    /// Set the abort flag and wait for the thread to exit
    ///
    /// 设置中止标志并等待线程退出
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.abort.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sweeper thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const POLL_SLICE: Duration = Duration::from_millis(10);

fn run(cache: &SectionCache, abort: &AtomicBool, options: SweepOptions) {
    debug!(path = %cache.path().display(), "sweeper started");
    while !abort.load(Ordering::Relaxed) {
        cache.age_pass(abort, options.throttle);

        let deadline = Instant::now() + options.interval;
        loop {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL_SLICE));
        }
    }
    debug!(path = %cache.path().display(), "sweeper stopped");
}
