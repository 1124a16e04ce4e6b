//! 测试模块

use super::*;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_cache(path: &std::path::Path, section_size: u32) -> SectionCache {
    init_tracing();
    SectionCache::open(path, CacheOptions::new(section_size).create(true)).unwrap()
}

/// 加锁、写入、标记为脏并解锁
fn write_section(cache: &SectionCache, section: u32, byte: u8) -> Generation {
    let guard = cache.lock(section).unwrap();
    unsafe {
        guard.write_at(0, &vec![byte; guard.len()]).unwrap();
    }
    let generation = guard.mark_dirty().unwrap();
    guard.unlock().unwrap();
    generation
}

fn read_section(cache: &SectionCache, section: u32) -> Vec<u8> {
    let guard = cache.lock(section).unwrap();
    let mut buf = vec![0u8; guard.len()];
    unsafe {
        guard.read_at(0, &mut buf).unwrap();
    }
    buf
}

/// Generation 测试
#[cfg(test)]
mod generation_tests {
    use super::*;

    #[test]
    fn test_next_wraps_around() {
        let last = Generation::new(u32::MAX);
        assert_eq!(last.next(), Generation::new(0));
        assert_eq!(Generation::INITIAL.next(), Generation::new(1));
    }

    #[test]
    fn test_comparison_across_wrap() {
        let before = Generation::new(u32::MAX - 1);
        let after = Generation::new(2);

        // 回绕之后依然判断为更晚
        assert!(after.is_after(before));
        assert!(before.is_before(after));
        assert!(!before.is_after(after));
        assert!(after.is_at_or_after(after));
    }

    #[test]
    fn test_merge_never_moves_backwards() {
        let mut generation = Generation::new(10);
        generation.merge(Generation::new(7));
        assert_eq!(generation, Generation::new(10));

        generation.merge(Generation::new(11));
        assert_eq!(generation, Generation::new(11));

        // 回绕后的较新代数
        let mut high = Generation::new(u32::MAX);
        high.merge(Generation::new(3));
        assert_eq!(high, Generation::new(3));
        assert_eq!(Generation::new(3).latest(Generation::new(u32::MAX)), Generation::new(3));
    }
}

/// MappedFile 测试
#[cfg(test)]
mod mapped_file_tests {
    use super::*;

    fn rw_options() -> FileOptions {
        FileOptions {
            create: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_extend_never_shrinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extend.bin");

        let file = MappedFile::open_read_write(&path, rw_options()).unwrap();
        assert!(file.is_empty());

        file.extend_to(8192).unwrap();
        assert_eq!(file.len(), 8192);

        // 较小的长度不会截断
        file.extend_to(100).unwrap();
        assert_eq!(file.len(), 8192);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
    }

    #[test]
    fn test_map_registers_and_unmap_removes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.bin");

        let file = MappedFile::open_read_write(&path, rw_options()).unwrap();
        file.extend_to(3 * 4096).unwrap();

        let a = file.map_read_write(0, 4096).unwrap();
        let b = file.map_read_only(4096, 8192).unwrap();
        assert_eq!(file.region_count(), 2);
        assert_eq!(b.offset(), 4096);
        assert_eq!(b.len(), 8192);
        assert!(a.is_writable());
        assert!(!b.is_writable());

        file.unmap(a);
        assert_eq!(file.region_count(), 1);
        file.unmap(b);
        assert_eq!(file.region_count(), 0);
    }

    #[test]
    fn test_write_synchronize_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.bin");

        let file = MappedFile::open_read_write(&path, rw_options()).unwrap();
        file.extend_to(4096).unwrap();

        let region = file.map_read_write(0, 4096).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), region.as_mut_ptr(), 5);
        }
        file.synchronize(region.region(), false).unwrap();
        file.unmap(region);
        drop(file);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..5], b"hello");
    }

    #[test]
    fn test_synchronize_after_unmap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unmapped.bin");

        let file = MappedFile::open_read_write(&path, rw_options()).unwrap();
        file.extend_to(4096).unwrap();

        let region = file.map_read_write(0, 4096).unwrap();
        let shared = region.share();
        file.unmap(region);

        // 调用方选择忽略时视为成功
        file.synchronize(&shared, true).unwrap();
        assert!(matches!(file.synchronize(&shared, false), Err(Error::NotMapped)));
    }

    #[test]
    fn test_map_beyond_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("beyond.bin");

        let file = MappedFile::open_read_write(&path, rw_options()).unwrap();
        file.extend_to(4096).unwrap();

        assert!(matches!(file.map_read_write(4096, 4096), Err(Error::Io(_))));
        assert!(matches!(file.map_read_write(0, 0), Err(Error::Io(_))));
        assert_eq!(file.region_count(), 0);
    }

    #[test]
    fn test_overlapping_regions_are_allowed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overlap.bin");

        let file = MappedFile::open_read_write(&path, rw_options()).unwrap();
        file.extend_to(8192).unwrap();

        // 重叠只产生警告
        let a = file.map_read_write(0, 8192).unwrap();
        let b = file.map_read_write(4096, 4096).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(file.region_count(), 2);

        file.unmap(b);
        file.unmap(a);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.bin");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();

        let file = MappedFile::open_read_only(&path).unwrap();
        assert!(!file.is_writable());
        assert!(matches!(file.map_read_write(0, 4096), Err(Error::ReadOnly)));
        assert!(matches!(file.extend_to(8192), Err(Error::ReadOnly)));

        let region = file.map_read_only(0, 4096).unwrap();
        assert_eq!(unsafe { *region.as_ptr() }, 7);
        file.unmap(region);
    }

    #[test]
    fn test_advisory_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.bin");

        let _first = MappedFile::open_read_write(&path, rw_options()).unwrap();
        assert!(matches!(
            MappedFile::open_read_write(&path, FileOptions::default()),
            Err(Error::Locked { .. })
        ));

        // shareable 不获取锁
        let shared = MappedFile::open_read_write(
            &path,
            FileOptions {
                shareable: true,
                ..Default::default()
            },
        );
        assert!(shared.is_ok());
    }

    #[test]
    fn test_create_new_fails_on_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exists.bin");
        std::fs::write(&path, b"").unwrap();

        let result = MappedFile::open_read_write(
            &path,
            FileOptions {
                create_new: true,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists));
    }

    #[test]
    fn test_delete_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch.bin");

        let file = MappedFile::open_read_write(
            &path,
            FileOptions {
                create: true,
                delete_on_close: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_synchronize_all_and_set_modified() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all.bin");

        let file = MappedFile::open_read_write(&path, rw_options()).unwrap();
        file.extend_to(8192).unwrap();
        let a = file.map_read_write(0, 4096).unwrap();
        let b = file.map_read_write(4096, 4096).unwrap();
        unsafe {
            *a.as_mut_ptr() = 1;
            *b.as_mut_ptr() = 2;
        }
        file.synchronize_all().unwrap();

        let time = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        file.set_modified(time).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), time);

        file.unmap(a);
        file.unmap(b);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!((bytes[0], bytes[4096]), (1, 2));
    }
}

/// SectionCache 测试
#[cfg(test)]
mod section_cache_tests {
    use super::*;

    #[test]
    fn test_open_rejects_bad_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geometry.bin");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();

        assert!(matches!(
            SectionCache::open(&path, CacheOptions::new(0)),
            Err(Error::InvalidSectionSize)
        ));
        assert!(matches!(
            SectionCache::open(&path, CacheOptions::new(512)),
            Err(Error::MisalignedLength { len: 1000, section_size: 512 })
        ));

        // 整除时按长度确定分段数
        let cache = SectionCache::open(&path, CacheOptions::new(250)).unwrap();
        assert_eq!(cache.section_count(), 4);
    }

    #[test]
    fn test_append_pages_grows_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("append.bin");
        let cache = open_cache(&path, 1024);

        assert_eq!(cache.try_append_pages(10).unwrap(), 0);
        assert_eq!(cache.section_count(), 10);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10240);

        assert_eq!(cache.try_append_page().unwrap(), 10);
        assert_eq!(cache.section_count(), 11);

        // 新分段为全零
        assert!(read_section(&cache, 10).iter().all(|&b| b == 0));
        let state = cache.section_state(10).unwrap();
        assert_eq!(state.update_gen, Generation::INITIAL);
        assert_eq!(state.lock_count, 0);
    }

    #[test]
    fn test_lock_out_of_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("range.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(2).unwrap();

        assert!(matches!(
            cache.lock(2),
            Err(Error::SectionOutOfRange { section: 2, count: 2 })
        ));
        assert!(matches!(cache.mark_dirty(5), Err(Error::SectionOutOfRange { .. })));
        assert!(matches!(
            cache.ensure_flushed(9, Generation::new(1)),
            Err(Error::SectionOutOfRange { .. })
        ));
    }

    #[test]
    fn test_mark_dirty_coalesces_until_sync() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coalesce.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(1).unwrap();

        let guard = cache.lock(0).unwrap();
        let first = guard.mark_dirty().unwrap();
        let second = guard.mark_dirty().unwrap();
        assert_eq!(first, Generation::new(1));
        assert_eq!(first, second);

        cache.ensure_flushed(0, first).unwrap();
        assert!(cache.is_durable(0, first).unwrap());

        // 同步之后开启新的一代
        let third = guard.mark_dirty().unwrap();
        assert!(third.is_after(first));
        assert!(!cache.is_durable(0, third).unwrap());
        guard.unlock().unwrap();
    }

    #[test]
    fn test_ensure_flushed_tracks_generations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flushed.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(1).unwrap();

        let generation = write_section(&cache, 0, 0xAB);
        let state = cache.section_state(0).unwrap();
        assert!(state.is_dirty());
        assert!(state.mapped);

        cache.ensure_flushed(0, generation).unwrap();
        let state = cache.section_state(0).unwrap();
        assert!(!state.is_dirty());
        assert_eq!(state.sync_gen, generation);
        assert_eq!(state.syncing_gen, generation);
        assert_eq!(state.syncer_count, 0);

        // 已持久化时直接返回
        cache.ensure_flushed(0, generation).unwrap();
        cache.ensure_flushed(0, Generation::INITIAL).unwrap();
    }

    #[test]
    fn test_shared_lockers_alias_one_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(8).unwrap();

        let a = cache.lock(5).unwrap();
        let b = cache.lock(5).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(cache.section_state(5).unwrap().lock_count, 2);
        assert_eq!(cache.lockfree_count(), 0);

        drop(a);
        assert_eq!(cache.lockfree_count(), 0);
        drop(b);
        assert_eq!(cache.lockfree_count(), 1);

        // 解锁后映射保留
        let state = cache.section_state(5).unwrap();
        assert!(state.mapped);
        assert_eq!(state.lock_count, 0);
    }

    #[test]
    fn test_concurrent_first_touch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("first_touch.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(4).unwrap();

        let barrier = std::sync::Barrier::new(8);
        let pointers: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = &cache;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        let guard = cache.lock(3).unwrap();
                        let ptr = guard.as_ptr() as usize;
                        barrier.wait();
                        ptr
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(pointers.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.section_state(3).unwrap().lock_count, 0);
        assert_eq!(cache.lockfree_count(), 1);
        assert_eq!(cache.stats().mapped, 1);
    }

    #[test]
    fn test_lockfree_budget_is_enforced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("budget.bin");
        init_tracing();
        let cache = SectionCache::open(&path, CacheOptions::new(4096).create(true).max_lockfree(2)).unwrap();
        cache.try_append_pages(8).unwrap();

        for section in 0..8 {
            write_section(&cache, section, section as u8 + 1);
            let stats = cache.stats();
            assert!(stats.lockfree <= 3, "lockfree {} after section {}", stats.lockfree, section);
            assert_eq!(stats.mapped, stats.lockfree);
        }

        // 被回收的分段先刷新再取消映射
        let stats = cache.stats();
        assert!(stats.mapped < 8);
        for section in 0..8u32 {
            let state = cache.section_state(section).unwrap();
            if !state.mapped {
                assert!(!state.is_dirty());
            }
        }
        for section in 0..8u32 {
            assert!(read_section(&cache, section).iter().all(|&b| b == section as u8 + 1));
        }
    }

    #[test]
    fn test_exclusive_mode_distinct_mappings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exclusive.bin");
        init_tracing();
        let cache = SectionCache::open(
            &path,
            CacheOptions::new(4096).create(true).mode(MappingMode::Exclusive),
        )
        .unwrap();
        cache.try_append_pages(2).unwrap();

        let a = cache.lock(1).unwrap();
        let b = cache.lock(1).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(cache.stats().mapped, 2);

        // 两个映射共享同一文件页
        unsafe { a.write_at(0, b"xy").unwrap() };
        let mut buf = [0u8; 2];
        unsafe { b.read_at(0, &mut buf).unwrap() };
        assert_eq!(&buf, b"xy");

        let generation = a.mark_dirty().unwrap();
        a.unlock().unwrap();

        // 解锁时同步并立即取消映射
        let state = cache.section_state(1).unwrap();
        assert_eq!(state.sync_gen, generation);
        assert!(state.mapped);
        b.unlock().unwrap();
        assert!(!cache.section_state(1).unwrap().mapped);
        assert_eq!(cache.stats().mapped, 0);
        assert_eq!(cache.lockfree_count(), 0);
        assert!(cache.is_durable(1, generation).unwrap());
    }

    #[test]
    fn test_exclusive_ensure_flushed_while_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exclusive_flush.bin");
        init_tracing();
        let cache = SectionCache::open(
            &path,
            CacheOptions::new(4096).create(true).mode(MappingMode::Exclusive),
        )
        .unwrap();
        cache.try_append_pages(1).unwrap();

        let guard = cache.lock(0).unwrap();
        unsafe { guard.write_at(10, b"data").unwrap() };
        let generation = guard.mark_dirty().unwrap();
        assert!(!cache.is_durable(0, generation).unwrap());

        cache.ensure_flushed(0, generation).unwrap();
        assert!(cache.is_durable(0, generation).unwrap());
        guard.unlock().unwrap();
    }

    #[test]
    fn test_read_only_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("readonly.bin");
        {
            let cache = open_cache(&path, 4096);
            cache.try_append_pages(1).unwrap();
            let generation = write_section(&cache, 0, 9);
            cache.ensure_flushed(0, generation).unwrap();
        }

        let cache = SectionCache::open(&path, CacheOptions::new(4096).writable(false)).unwrap();
        assert!(!cache.is_writable());
        assert!(matches!(cache.mark_dirty(0), Err(Error::ReadOnly)));
        assert!(matches!(cache.try_append_pages(1), Err(Error::ReadOnly)));

        let guard = cache.lock(0).unwrap();
        assert!(matches!(guard.as_mut_ptr(), Err(Error::ReadOnly)));
        assert!(matches!(unsafe { guard.write_at(0, b"x") }, Err(Error::ReadOnly)));
        assert!(unsafe { guard.as_slice() }.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_guard_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bounds.bin");
        let cache = open_cache(&path, 64);
        cache.try_append_pages(1).unwrap();

        let guard = cache.lock(0).unwrap();
        assert_eq!(guard.len(), 64);
        assert_eq!(guard.section(), 0);

        // 刚好在边界内
        unsafe { guard.write_at(60, b"abcd").unwrap() };
        assert!(matches!(
            unsafe { guard.write_at(61, b"abcd") },
            Err(Error::OffsetOutOfBounds { offset: 61, len: 4, size: 64 })
        ));
        let mut buf = [0u8; 8];
        assert!(matches!(
            unsafe { guard.read_at(usize::MAX, &mut buf) },
            Err(Error::OffsetOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_guard_mut_slice() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slice.bin");
        let cache = open_cache(&path, 128);
        cache.try_append_pages(2).unwrap();

        let mut guard = cache.lock(1).unwrap();
        let slice = unsafe { guard.as_mut_slice() }.unwrap();
        assert_eq!(slice.len(), 128);
        slice[127] = 0xEE;
        guard.mark_dirty().unwrap();
        drop(guard);

        assert_eq!(read_section(&cache, 1)[127], 0xEE);
        assert!(read_section(&cache, 0).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sync_disabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nosync.bin");
        init_tracing();
        let cache = SectionCache::open(&path, CacheOptions::new(4096).create(true).sync_enabled(false)).unwrap();
        cache.try_append_pages(1).unwrap();

        let generation = write_section(&cache, 0, 1);
        assert!(cache.is_durable(0, generation).unwrap());
        cache.ensure_flushed(0, generation).unwrap();

        // 不访问磁盘，代数保持不变
        let state = cache.section_state(0).unwrap();
        assert_eq!(state.sync_gen, Generation::INITIAL);
    }

    #[test]
    fn test_flush_all_and_stats() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flush_all.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(4).unwrap();

        write_section(&cache, 0, 1);
        write_section(&cache, 2, 3);
        let guard = cache.lock(3).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.sections, 4);
        assert_eq!(stats.mapped, 3);
        assert_eq!(stats.locked, 1);
        assert_eq!(stats.lockfree, 2);
        assert_eq!(stats.dirty, 2);
        assert_eq!(stats.syncing, 0);

        cache.flush_all().unwrap();
        assert_eq!(cache.stats().dirty, 0);
        drop(guard);
    }

    #[test]
    fn test_mark_dirty_requires_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unlocked_dirty.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(1).unwrap();

        // 写入并解锁后，清扫在不同步的情况下取消映射干净分段
        let first = write_section(&cache, 0, 1);
        cache.ensure_flushed(0, first).unwrap();
        for _ in 0..UNMAP_AGE {
            cache.age_pass(&AtomicBool::new(false), Duration::ZERO);
        }
        assert!(!cache.section_state(0).unwrap().mapped);

        // 未加锁的分段不能开启新的一代
        assert!(matches!(cache.mark_dirty(0), Err(Error::NotLocked { section: 0 })));
        let state = cache.section_state(0).unwrap();
        assert_eq!(state.update_gen, first);
        assert!(!state.is_dirty());

        // 加锁后标记的代在刷新后保持已持久化
        let guard = cache.lock(0).unwrap();
        let generation = guard.mark_dirty().unwrap();
        assert!(generation.is_after(first));
        assert!(!cache.is_durable(0, generation).unwrap());
        guard.unlock().unwrap();

        cache.ensure_flushed(0, generation).unwrap();
        assert_eq!(cache.section_state(0).unwrap().sync_gen, generation);
        let guard = cache.lock(0).unwrap();
        assert!(cache.is_durable(0, generation).unwrap());
        drop(guard);
    }

    #[test]
    fn test_mark_dirty_exclusive_requires_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exclusive_dirty.bin");
        init_tracing();
        let cache = SectionCache::open(
            &path,
            CacheOptions::new(4096).create(true).mode(MappingMode::Exclusive),
        )
        .unwrap();
        cache.try_append_pages(1).unwrap();

        assert!(matches!(cache.mark_dirty(0), Err(Error::NotLocked { section: 0 })));
        let guard = cache.lock(0).unwrap();
        assert_eq!(cache.mark_dirty(0).unwrap(), Generation::new(1));
        guard.unlock().unwrap();
        assert!(matches!(cache.mark_dirty(0), Err(Error::NotLocked { .. })));
    }

    #[test]
    fn test_guard_points_into_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pointer.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(2).unwrap();

        let guard = cache.lock(1).unwrap();
        {
            let state = cache.state.lock();
            let region = state.sections[1].mapping.as_ref().unwrap();
            assert_eq!(guard.as_ptr(), region.as_ptr());
            assert_eq!(guard.len(), region.len());
            assert_eq!(region.offset(), 4096);
        }
        drop(guard);

        // 缓存映射的再次加锁仍指向同一映射
        let guard = cache.lock(1).unwrap();
        let state = cache.state.lock();
        assert_eq!(guard.as_ptr(), state.sections[1].mapping.as_ref().unwrap().as_ptr());
        drop(state);
        drop(guard);
    }

    #[test]
    fn test_concurrent_append_and_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grow.bin");
        let cache = open_cache(&path, 1024);
        cache.try_append_pages(1).unwrap();

        std::thread::scope(|s| {
            for _ in 0..2 {
                let cache = &cache;
                s.spawn(move || {
                    for _ in 0..5 {
                        cache.try_append_page().unwrap();
                    }
                });
            }
            let cache = &cache;
            s.spawn(move || {
                for byte in 0..20u8 {
                    write_section(cache, 0, byte);
                }
            });
        });

        // 增长期间的加锁不会破坏簿记与文件长度的一致性
        assert_eq!(cache.section_count(), 11);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 11 * 1024);
        assert_eq!(read_section(&cache, 0)[0], 19);
        assert!(read_section(&cache, 10).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_guard_drop_unlocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drop.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(1).unwrap();

        {
            let _guard = cache.lock(0).unwrap();
            assert_eq!(cache.section_state(0).unwrap().lock_count, 1);
        }
        assert_eq!(cache.section_state(0).unwrap().lock_count, 0);
        assert_eq!(cache.lockfree_count(), 1);
    }
}

/// ReclaimBatch 测试
#[cfg(test)]
mod reclaim_tests {
    use super::*;
    use crate::cache::reclaim::ReclaimBatch;

    fn cache_with_idle_sections(path: &std::path::Path, count: u32) -> SectionCache {
        init_tracing();
        let cache = SectionCache::open(path, CacheOptions::new(4096).create(true).max_lockfree(64)).unwrap();
        cache.try_append_pages(count).unwrap();
        for section in 0..count {
            drop(cache.lock(section).unwrap());
        }
        cache
    }

    #[test]
    fn test_flush_unmaps_idle_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("batch.bin");
        let cache = cache_with_idle_sections(&path, 3);
        assert_eq!(cache.lockfree_count(), 3);

        let mut batch = ReclaimBatch::new(&cache);
        {
            let mut state = cache.state.lock();
            assert!(batch.try_add(&mut state, 0));
            assert!(batch.try_add(&mut state, 2));
            // 重复添加被跳过
            assert!(!batch.try_add(&mut state, 0));
        }
        assert_eq!(batch.len(), 2);

        assert_eq!(batch.flush(), 2);
        assert_eq!(batch.len(), 0);
        assert_eq!(cache.lockfree_count(), 1);
        assert!(!cache.section_state(0).unwrap().mapped);
        assert!(cache.section_state(1).unwrap().mapped);
        assert!(!cache.section_state(2).unwrap().mapped);
    }

    #[test]
    fn test_locked_sections_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.bin");
        let cache = cache_with_idle_sections(&path, 2);

        let guard = cache.lock(1).unwrap();
        let mut batch = ReclaimBatch::new(&cache);
        {
            let mut state = cache.state.lock();
            assert!(!batch.try_add(&mut state, 1));
        }
        assert_eq!(batch.flush(), 0);
        drop(guard);
    }

    #[test]
    fn test_dirty_candidate_is_flushed_before_unmap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dirty.bin");
        let cache = cache_with_idle_sections(&path, 1);
        let generation = write_section(&cache, 0, 0x5A);

        let mut batch = ReclaimBatch::new(&cache);
        {
            let mut state = cache.state.lock();
            assert!(batch.try_add(&mut state, 0));
            // 捕获时固定分段
            assert_eq!(state.sections[0].syncer_count, 1);
        }
        assert_eq!(batch.flush(), 1);

        let state = cache.section_state(0).unwrap();
        assert!(!state.mapped);
        assert_eq!(state.sync_gen, generation);
        assert_eq!(state.syncer_count, 0);
        assert!(read_section(&cache, 0).iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_full_batch_reclaims_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overflow.bin");
        let cache = cache_with_idle_sections(&path, RECLAIM_BATCH_CAPACITY as u32 + 1);

        let mut batch = ReclaimBatch::new(&cache);
        {
            let mut state = cache.state.lock();
            for section in 0..RECLAIM_BATCH_CAPACITY as u32 {
                assert!(batch.try_add(&mut state, section));
            }
            assert!(batch.is_full());

            // 批次已满：新候选被立即回收
            let overflow = RECLAIM_BATCH_CAPACITY as u32;
            assert!(batch.try_add(&mut state, overflow));
            assert!(state.sections[overflow as usize].mapping.is_none());
            assert!(state.sections[0].mapping.is_some());
        }
        assert_eq!(batch.len(), RECLAIM_BATCH_CAPACITY);
        assert_eq!(batch.flush(), RECLAIM_BATCH_CAPACITY);
        assert_eq!(cache.stats().mapped, 0);
        assert_eq!(cache.lockfree_count(), 0);
    }

    #[test]
    fn test_relocked_candidate_is_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relocked.bin");
        let cache = cache_with_idle_sections(&path, 1);

        let mut batch = ReclaimBatch::new(&cache);
        {
            let mut state = cache.state.lock();
            assert!(batch.try_add(&mut state, 0));
        }

        // 捕获之后再次加锁
        let guard = cache.lock(0).unwrap();
        assert_eq!(batch.flush(), 0);
        assert!(cache.section_state(0).unwrap().mapped);
        drop(guard);
        assert_eq!(cache.lockfree_count(), 1);
    }

    #[test]
    fn test_redirtied_candidate_is_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redirtied.bin");
        let cache = cache_with_idle_sections(&path, 1);

        let mut batch = ReclaimBatch::new(&cache);
        {
            let mut state = cache.state.lock();
            assert!(batch.try_add(&mut state, 0));
        }

        // 捕获之后通过加锁写入产生新的一代
        let generation = write_section(&cache, 0, 7);
        assert_eq!(batch.flush(), 0);

        let state = cache.section_state(0).unwrap();
        assert!(state.mapped);
        assert_eq!(state.update_gen, generation);
        assert!(state.is_dirty());
    }

    #[test]
    fn test_dropped_batch_only_unpins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aborted.bin");
        let cache = cache_with_idle_sections(&path, 1);
        let generation = write_section(&cache, 0, 1);

        let mut batch = ReclaimBatch::new(&cache);
        {
            let mut state = cache.state.lock();
            assert!(batch.try_add(&mut state, 0));
        }
        drop(batch);

        // 未刷新的批次不取消映射，也不记录同步成功
        let state = cache.section_state(0).unwrap();
        assert!(state.mapped);
        assert_eq!(state.syncer_count, 0);
        assert_eq!(state.update_gen, generation);
        assert!(state.is_dirty());
        assert_eq!(cache.lockfree_count(), 1);
    }
}

/// 老化清扫测试
#[cfg(test)]
mod sweep_tests {
    use super::*;
    use crate::cache::reclaim::ReclaimBatch;
    use std::sync::Arc;

    fn pass(cache: &SectionCache) -> SweepReport {
        cache.age_pass(&AtomicBool::new(false), Duration::ZERO)
    }

    #[test]
    fn test_clean_section_unmapped_at_unmap_age() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clean.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(2).unwrap();
        drop(cache.lock(0).unwrap());

        for age in 1..UNMAP_AGE {
            let report = pass(&cache);
            assert_eq!(report.visited, 2);
            assert_eq!(report.unmapped, 0);
            let state = cache.section_state(0).unwrap();
            assert!(state.mapped);
            assert_eq!(state.free_age, age);
        }

        let report = pass(&cache);
        assert_eq!(report.unmapped, 1);
        assert!(!cache.section_state(0).unwrap().mapped);
        assert_eq!(cache.lockfree_count(), 0);
    }

    #[test]
    fn test_dirty_section_synced_before_unmap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dirty.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(1).unwrap();
        let generation = write_section(&cache, 0, 0x11);

        for _ in 1..SYNC_AGE {
            assert_eq!(pass(&cache).synced, 0);
            assert!(cache.section_state(0).unwrap().is_dirty());
        }

        // 年龄 4：同步但保持映射
        let report = pass(&cache);
        assert_eq!(report.synced, 1);
        let state = cache.section_state(0).unwrap();
        assert!(state.mapped);
        assert_eq!(state.sync_gen, generation);

        for _ in SYNC_AGE + 1..UNMAP_AGE {
            assert_eq!(pass(&cache).unmapped, 0);
        }
        assert_eq!(pass(&cache).unmapped, 1);
        assert!(!cache.section_state(0).unwrap().mapped);
        assert!(read_section(&cache, 0).iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_locked_section_does_not_age() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(1).unwrap();

        let guard = cache.lock(0).unwrap();
        for _ in 0..UNMAP_AGE * 2 {
            pass(&cache);
        }
        let state = cache.section_state(0).unwrap();
        assert!(state.mapped);
        assert_eq!(state.free_age, 0);
        drop(guard);
    }

    #[test]
    fn test_failed_reclaim_rewinds_age() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rewind.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(1).unwrap();
        drop(cache.lock(0).unwrap());

        for _ in 1..UNMAP_AGE {
            pass(&cache);
        }
        assert_eq!(cache.section_state(0).unwrap().free_age, UNMAP_AGE - 1);

        // 捕获之后、刷新之前，一次进行中的同步固定了该分段
        let mut batch = ReclaimBatch::new(&cache);
        let target = {
            let mut state = cache.state.lock();
            assert_eq!(state.sections[0].age(), UNMAP_AGE);
            assert!(batch.try_add(&mut state, 0));
            state.sections[0].begin_sync()
        };
        assert_eq!(batch.flush(), 0);

        // 回退到同步年龄之前
        let state = cache.section_state(0).unwrap();
        assert!(state.mapped);
        assert_eq!(state.free_age, SYNC_AGE - 1);
        cache.state.lock().sections[0].finish_sync(target, true);

        // 重新经过同步阶段后才取消映射
        for age in SYNC_AGE..UNMAP_AGE {
            assert_eq!(pass(&cache).unmapped, 0);
            let state = cache.section_state(0).unwrap();
            assert!(state.mapped);
            assert_eq!(state.free_age, age);
        }
        assert_eq!(pass(&cache).unmapped, 1);
        assert!(!cache.section_state(0).unwrap().mapped);
    }

    #[test]
    fn test_relock_resets_age() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relock.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(1).unwrap();
        drop(cache.lock(0).unwrap());

        for _ in 0..UNMAP_AGE - 1 {
            pass(&cache);
        }
        drop(cache.lock(0).unwrap());
        assert_eq!(cache.section_state(0).unwrap().free_age, 0);

        pass(&cache);
        assert!(cache.section_state(0).unwrap().mapped);
    }

    #[test]
    fn test_abort_stops_pass() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abort.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(3).unwrap();

        let report = cache.age_pass(&AtomicBool::new(true), Duration::ZERO);
        assert!(report.aborted);
        assert_eq!(report.visited, 0);

        let empty_dir = tempdir().unwrap();
        let empty = open_cache(&empty_dir.path().join("empty.bin"), 4096);
        assert_eq!(pass(&empty), SweepReport::default());
    }

    #[test]
    fn test_never_unmaps_dirty_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("property.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(16).unwrap();

        for round in 0..40u32 {
            // 每轮改写一部分分段
            for section in (0..16).filter(|s| (s + round) % 3 == 0) {
                write_section(&cache, section, round as u8);
            }
            pass(&cache);
            for section in 0..16 {
                let state = cache.section_state(section).unwrap();
                if !state.mapped {
                    assert_eq!(state.sync_gen, state.update_gen, "section {} unmapped while dirty", section);
                }
            }
        }
    }

    #[test]
    fn test_sweeper_thread_unmaps_idle_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("thread.bin");
        let cache = Arc::new(open_cache(&path, 4096));
        cache.try_append_pages(2).unwrap();
        let generation = write_section(&cache, 1, 3);

        let sweeper = Sweeper::spawn(
            Arc::clone(&cache),
            SweepOptions {
                interval: Duration::from_millis(1),
                throttle: Duration::ZERO,
            },
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while cache.section_state(1).unwrap().mapped {
            assert!(std::time::Instant::now() < deadline, "sweeper did not unmap section");
            std::thread::sleep(Duration::from_millis(5));
        }
        sweeper.stop();

        assert!(cache.is_durable(1, generation).unwrap());
        assert_eq!(cache.section_state(1).unwrap().sync_gen, generation);
    }

    #[test]
    fn test_external_abort_flag_stops_sweeper() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("external.bin");
        let cache = Arc::new(open_cache(&path, 4096));

        let abort = Arc::new(AtomicBool::new(false));
        let sweeper = Sweeper::spawn_with_abort(
            Arc::clone(&cache),
            SweepOptions::default(),
            Arc::clone(&abort),
        )
        .unwrap();
        assert!(Arc::ptr_eq(sweeper.abort_flag(), &abort));

        abort.store(true, std::sync::atomic::Ordering::Relaxed);
        drop(sweeper);
        assert_eq!(Arc::strong_count(&cache), 1);
    }
}

/// CommitHistory 测试
#[cfg(test)]
mod history_tests {
    use super::*;

    #[test]
    fn test_record_keeps_latest_generation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(1).unwrap();

        let mut history = CommitHistory::new();
        history.record(&cache, 0, Generation::new(3));
        history.record(&cache, 0, Generation::new(2));
        assert_eq!(history.required(&cache, 0), Some(Generation::new(3)));
        history.record(&cache, 0, Generation::new(5));
        assert_eq!(history.required(&cache, 0), Some(Generation::new(5)));
        assert_eq!(history.len(), 1);
        assert_eq!(history.required(&cache, 1), None);

        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn test_force_sync_all_across_caches() {
        let dir = tempdir().unwrap();
        let a = open_cache(&dir.path().join("a.bin"), 4096);
        let b = open_cache(&dir.path().join("b.bin"), 1024);
        a.try_append_pages(2).unwrap();
        b.try_append_pages(2).unwrap();

        let mut history = CommitHistory::new();
        for section in 0..2 {
            history.record(&a, section, write_section(&a, section, 1));
            history.record(&b, section, write_section(&b, section, 2));
        }
        assert_eq!(history.len(), 4);

        history.force_sync_all().unwrap();
        assert!(history.is_empty());
        for section in 0..2 {
            assert!(!a.section_state(section).unwrap().is_dirty());
            assert!(!b.section_state(section).unwrap().is_dirty());
        }
    }

    #[test]
    fn test_force_sync_all_keeps_failures() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("failure.bin");
        let cache = open_cache(&path, 4096);
        cache.try_append_pages(1).unwrap();

        let mut history = CommitHistory::new();
        history.record(&cache, 0, write_section(&cache, 0, 1));
        // 越界分段无法刷新
        history.record(&cache, 7, Generation::new(1));

        assert!(matches!(history.force_sync_all(), Err(Error::SectionOutOfRange { .. })));
        assert_eq!(history.len(), 1);
        assert_eq!(history.required(&cache, 7), Some(Generation::new(1)));
    }
}
