//! Ranged memory mappings of one file, based on memmap2
//!
//! 基于 memmap2 的单文件区间映射

use super::error::{Error, Result};
use fs2::FileExt;
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, warn};

/// Options for [`MappedFile::open_read_write`]
///
/// [`MappedFile::open_read_write`] 的选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileOptions {
    /// Create the file if it does not exist
    ///
    /// 文件不存在时创建
    pub create: bool,

    /// Fail if the file already exists
    ///
    /// 文件已存在时失败
    pub create_new: bool,

    /// Do not take the advisory whole-file lock
    ///
    /// 不获取整个文件的建议锁
    pub shareable: bool,

    /// Remove the file when the [`MappedFile`] is dropped
    ///
    /// [`MappedFile`] 释放时删除文件
    pub delete_on_close: bool,

    /// Synchronize writable regions before unmapping them
    ///
    /// 取消映射前同步可写区域
    pub autosync: bool,
}

/// One live mapping registered with a [`MappedFile`]
///
/// 在 [`MappedFile`] 中注册的一个活动映射
struct Region {
    map: MmapRaw,
    offset: u64,
    writable: bool,
}

/// Shared, non-owning reference to a registered region
///
/// 已注册区域的共享非独占引用
///
/// Holding a `RegionRef` keeps the memory valid even after the owning
/// [`MappedRegion`] has been unmapped; [`MappedFile::synchronize`] tells the two cases apart
/// through the registry.
///
/// 持有 `RegionRef` 可保证内存在 [`MappedRegion`] 被取消映射之后依然有效；
/// [`MappedFile::synchronize`] 通过注册表区分这两种情况。
#[derive(Clone)]
pub struct RegionRef {
    region: Arc<Region>,
}

impl RegionRef {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.region.map.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.region.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte offset of the region within the file
    ///
    /// 区域在文件中的字节偏移
    #[inline]
    pub fn offset(&self) -> u64 {
        self.region.offset
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.region.writable
    }

    /// Same underlying mapping
    ///
    /// 是否为同一底层映射
    #[inline]
    pub fn same_region(&self, other: &RegionRef) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }
}

impl std::fmt::Debug for RegionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionRef")
            .field("ptr", &self.as_ptr())
            .field("offset", &self.offset())
            .field("len", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Owning handle of a mapping
///
/// 映射的独占句柄
///
/// Only [`MappedFile::map_read_only`] / [`MappedFile::map_read_write`] produce it and only
/// [`MappedFile::unmap`] consumes it. Dropping it without unmapping keeps the region
/// registered until the [`MappedFile`] itself is dropped.
///
/// 只能由 [`MappedFile::map_read_only`] / [`MappedFile::map_read_write`] 创建，
/// 只能由 [`MappedFile::unmap`] 消耗。未取消映射就释放句柄时，
/// 区域会一直保持注册直到 [`MappedFile`] 本身被释放。
#[must_use = "a mapped region stays registered until passed to MappedFile::unmap"]
pub struct MappedRegion {
    inner: RegionRef,
}

impl MappedRegion {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    /// Mutable raw pointer to the mapping
    ///
    /// 映射的可变原始指针
    ///
    /// Writing through it on a read-only region faults.
    ///
    /// 对只读区域写入会触发段错误。
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.region.map.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.inner.offset()
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    /// Borrow the shared reference view
    ///
    /// 借用共享引用视图
    #[inline]
    pub fn region(&self) -> &RegionRef {
        &self.inner
    }

    /// Clone a shared reference for use outside the owner's lock
    ///
    /// 克隆一个共享引用，供在持有者的锁之外使用
    #[inline]
    pub fn share(&self) -> RegionRef {
        self.inner.clone()
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MappedRegion").field(&self.inner).finish()
    }
}

/// File with a registry of its live mappings
///
/// 带有活动映射注册表的文件
///
/// Every map call registers its region and every unmap call removes it. The registry
/// lock only covers that bookkeeping: the mmap, munmap and msync system calls run with
/// it released, so slow I/O on one region never blocks another.
///
/// 每次映射都会注册区域，每次取消映射都会移除。注册表锁只保护簿记：
/// mmap、munmap 和 msync 系统调用在释放锁后执行，因此一个区域的慢速 I/O 不会阻塞其他区域。
///
/// # Examples
///
/// ```
/// # use section_mmap::{FileOptions, MappedFile, Result};
/// # use tempfile::tempdir;
/// # fn main() -> Result<()> {
/// # let dir = tempdir()?;
/// # let path = dir.path().join("data.bin");
/// let file = MappedFile::open_read_write(&path, FileOptions { create: true, ..Default::default() })?;
/// file.extend_to(8192)?;
///
/// let region = file.map_read_write(4096, 4096)?;
/// unsafe { region.as_mut_ptr().write(7) };
/// file.synchronize(region.region(), false)?;
/// file.unmap(region);
/// # Ok(())
/// # }
/// ```
pub struct MappedFile {
    file: File,
    path: PathBuf,
    writable: bool,
    autosync: bool,
    delete_on_close: bool,

    /// Current file length; held across `set_len` so extends never race into a shrink
    ///
    /// 当前文件长度；在 `set_len` 期间持有，避免并发扩展变成截断
    length: Mutex<u64>,

    regions: Mutex<Vec<Arc<Region>>>,
}

impl MappedFile {
    /// Open an existing file for reading
    ///
    /// 以只读方式打开已有文件
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(file, path, false, FileOptions::default())
    }

    /// Open a file for reading and writing
    ///
    /// 以读写方式打开文件
    ///
    /// Unless `options.shareable` is set, an advisory exclusive lock is taken on the whole
    /// file and [`Error::Locked`] is returned if another process holds it.
    ///
    /// 除非设置了 `options.shareable`，否则会对整个文件加建议排他锁，
    /// 若其他进程已持有则返回 [`Error::Locked`]。
    pub fn open_read_write(path: impl AsRef<Path>, options: FileOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(options.create && !options.create_new)
            .create_new(options.create_new)
            .open(path)?;

        if !options.shareable {
            FileExt::try_lock_exclusive(&file).map_err(|err| match err.kind() {
                io::ErrorKind::WouldBlock => Error::Locked {
                    path: path.to_path_buf(),
                },
                _ => Error::Io(err),
            })?;
        }

        Self::from_file(file, path, true, options)
    }

    fn from_file(file: File, path: &Path, writable: bool, options: FileOptions) -> Result<Self> {
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, writable, "opened mapped file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable,
            autosync: options.autosync,
            delete_on_close: options.delete_on_close,
            length: Mutex::new(len),
            regions: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Current file length in bytes
    ///
    /// 当前文件长度（字节）
    #[inline]
    pub fn len(&self) -> u64 {
        *self.length.lock()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of currently registered regions
    ///
    /// 当前注册的区域数量
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Grow the file to at least `len` bytes; never shrinks
    ///
    /// 将文件扩展到至少 `len` 字节；从不缩小
    pub fn extend_to(&self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let mut length = self.length.lock();
        if *length >= len {
            return Ok(());
        }
        self.file.set_len(len)?;
        debug!(path = %self.path.display(), from = *length, to = len, "extended file");
        *length = len;
        Ok(())
    }

    /// Map `[offset, offset + len)` read-only
    ///
    /// 以只读方式映射 `[offset, offset + len)`
    pub fn map_read_only(&self, offset: u64, len: usize) -> Result<MappedRegion> {
        self.map(offset, len, false)
    }

    /// Map `[offset, offset + len)` read-write
    ///
    /// 以读写方式映射 `[offset, offset + len)`
    pub fn map_read_write(&self, offset: u64, len: usize) -> Result<MappedRegion> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.map(offset, len, true)
    }

    fn map(&self, offset: u64, len: usize, writable: bool) -> Result<MappedRegion> {
        let file_len = self.len();
        if len == 0 || offset.checked_add(len as u64).is_none_or(|end| end > file_len) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot map {len} bytes at offset {offset} of a {file_len} byte file"),
            )));
        }

        let mut options = MmapOptions::new();
        options.offset(offset).len(len);

        // Safety: the range lies within the file, and bytes inside it are caller-defined;
        // truncation never happens because the file only grows through `extend_to`.
        // Safety: 区间位于文件内部，其中的字节由调用者定义；
        // 文件只能通过 `extend_to` 增长，不会被截断。
        let map = if writable {
            options.map_raw(&self.file)?
        } else {
            options.map_raw_read_only(&self.file)?
        };

        let region = Arc::new(Region {
            map,
            offset,
            writable,
        });

        let mut regions = self.regions.lock();
        regions.try_reserve(1)?;
        if let Some(other) = regions.iter().find(|other| overlaps(other, &region)) {
            warn!(
                path = %self.path.display(),
                offset,
                len,
                other_offset = other.offset,
                other_len = other.map.len(),
                "mapping overlaps a registered region"
            );
        }
        regions.push(Arc::clone(&region));
        drop(regions);

        debug!(offset, len, writable, ptr = ?region.map.as_ptr(), "mapped region");
        Ok(MappedRegion {
            inner: RegionRef { region },
        })
    }

    /// Unregister and unmap a region
    ///
    /// 注销并取消映射区域
    ///
    /// The OS mapping is released once the last [`RegionRef`] to it is gone.
    /// A region that is not registered with this file (for example one produced by a
    /// different `MappedFile`) aborts the process.
    ///
    /// 当最后一个 [`RegionRef`] 释放后操作系统映射才会真正释放。
    /// 未在本文件注册的区域（例如由其他 `MappedFile` 产生的区域）会直接终止进程。
    pub fn unmap(&self, region: MappedRegion) {
        let removed = {
            let mut regions = self.regions.lock();
            regions
                .iter()
                .position(|other| Arc::ptr_eq(other, &region.inner.region))
                .map(|index| regions.swap_remove(index))
        };

        let Some(removed) = removed else {
            error!(
                path = %self.path.display(),
                ptr = ?region.as_ptr(),
                len = region.len(),
                "unmap of a region that was never registered"
            );
            std::process::abort();
        };

        if self.autosync && removed.writable {
            if let Err(err) = removed.map.flush() {
                warn!(offset = removed.offset, error = %err, "autosync before unmap failed");
            }
        }
        debug!(offset = removed.offset, len = removed.map.len(), "unmapped region");
    }

    /// Flush a region to disk and wait for completion
    ///
    /// 将区域刷新到磁盘并等待完成
    ///
    /// With `ignore_if_unmapped`, a region that has been unmapped concurrently counts as
    /// success: whoever unmapped it owns its durability. Otherwise it is [`Error::NotMapped`].
    ///
    /// 设置 `ignore_if_unmapped` 时，已被并发取消映射的区域视为成功：
    /// 其持久化由执行取消映射的一方负责。否则返回 [`Error::NotMapped`]。
    pub fn synchronize(&self, region: &RegionRef, ignore_if_unmapped: bool) -> Result<()> {
        let registered = self
            .regions
            .lock()
            .iter()
            .any(|other| Arc::ptr_eq(other, &region.region));
        if !registered {
            return if ignore_if_unmapped {
                Ok(())
            } else {
                Err(Error::NotMapped)
            };
        }
        if !region.is_writable() {
            return Ok(());
        }

        region.region.map.flush()?;
        debug!(offset = region.offset(), len = region.len(), "synchronized region");
        Ok(())
    }

    /// Flush every registered writable region, then the file data
    ///
    /// 刷新所有已注册的可写区域，然后刷新文件数据
    ///
    /// Every region is attempted; the first failure is returned.
    ///
    /// 会尝试所有区域；返回第一个失败。
    pub fn synchronize_all(&self) -> Result<()> {
        let snapshot: Vec<Arc<Region>> = self.regions.lock().iter().cloned().collect();

        let mut first_err = None;
        for region in snapshot.iter().filter(|region| region.writable) {
            if let Err(err) = region.map.flush() {
                warn!(offset = region.offset, error = %err, "synchronize failed");
                first_err.get_or_insert(Error::Io(err));
            }
        }
        if self.writable {
            if let Err(err) = self.file.sync_data() {
                first_err.get_or_insert(Error::Io(err));
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Flush file data written through mappings that no longer exist
    ///
    /// 刷新通过已不存在的映射写入的文件数据
    pub fn sync_data(&self) -> Result<()> {
        Ok(self.file.sync_data()?)
    }

    /// Set the modification timestamp
    ///
    /// 设置修改时间
    pub fn set_modified(&self, time: SystemTime) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        Ok(self.file.set_modified(time)?)
    }
}

fn overlaps(a: &Region, b: &Region) -> bool {
    let a_end = a.offset + a.map.len() as u64;
    let b_end = b.offset + b.map.len() as u64;
    a.offset < b_end && b.offset < a_end
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("writable", &self.writable)
            .field("len", &self.len())
            .field("regions", &self.region_count())
            .finish()
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        let regions = std::mem::take(self.regions.get_mut());
        if !regions.is_empty() {
            debug!(path = %self.path.display(), count = regions.len(), "tearing down mappings");
        }
        if self.autosync {
            for region in regions.iter().filter(|region| region.writable) {
                if let Err(err) = region.map.flush() {
                    warn!(offset = region.offset, error = %err, "autosync on close failed");
                }
            }
        }
        drop(regions);

        if self.delete_on_close {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %err, "delete on close failed");
            }
        }
    }
}
