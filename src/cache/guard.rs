//! Scoped lock on one section
//!
//! 单个分段的作用域锁

use super::error::{Error, Result};
use super::generation::Generation;
use super::section_cache::SectionCache;
use std::ptr::NonNull;
use tracing::warn;

/// Lock on one section, released on drop
///
/// 单个分段的锁，释放时自动解锁
///
/// The mapping stays valid for as long as the guard lives. In shared mode other guards
/// of the same section point at the same bytes; coordinating writes between them is up
/// to the caller, which is why the byte accessors are `unsafe`.
///
/// 守卫存活期间映射始终有效。共享模式下同一分段的其他守卫指向相同的字节；
/// 它们之间的写入协调由调用者负责，因此字节访问方法是 `unsafe` 的。
#[must_use = "dropping the guard unlocks the section immediately"]
pub struct SectionGuard<'a> {
    cache: &'a SectionCache,
    section: u32,
    ptr: NonNull<u8>,
    len: usize,
    released: bool,
}

impl<'a> SectionGuard<'a> {
    #[inline]
    pub(crate) fn new(cache: &'a SectionCache, section: u32, ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            cache,
            section,
            ptr,
            len,
            released: false,
        }
    }

    /// Section number
    ///
    /// 分段编号
    #[inline]
    pub fn section(&self) -> u32 {
        self.section
    }

    /// Section size in bytes
    ///
    /// 分段大小（字节）
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable pointer to the section bytes
    ///
    /// 指向分段字节的可变指针
    ///
    /// # Errors
    /// Returns `ReadOnly` if the cache was opened read-only
    ///
    /// # Errors
    /// 缓存以只读方式打开时返回 `ReadOnly`
    #[inline]
    pub fn as_mut_ptr(&self) -> Result<*mut u8> {
        if !self.cache.is_writable() {
            return Err(Error::ReadOnly);
        }
        Ok(self.ptr.as_ptr())
    }

    /// View the section as a byte slice
    ///
    /// 以字节切片查看分段
    ///
    /// # Safety
    ///
    /// No other thread may write to the section while the slice is alive.
    ///
    /// # Safety
    ///
    /// 切片存活期间不得有其他线程写入该分段。
    #[inline]
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View the section as a mutable byte slice
    ///
    /// 以可变字节切片查看分段
    ///
    /// # Safety
    ///
    /// No other guard of the same section may touch the bytes while the slice is alive.
    ///
    /// # Safety
    ///
    /// 切片存活期间同一分段的其他守卫不得访问这些字节。
    #[inline]
    pub unsafe fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        let ptr = self.as_mut_ptr()?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.len) })
    }

    /// Copy `data` into the section at `offset`
    ///
    /// 将 `data` 复制到分段的 `offset` 处
    ///
    /// # Safety
    ///
    /// No other thread may read or write the same bytes concurrently.
    ///
    /// # Safety
    ///
    /// 不得有其他线程并发读写相同的字节。
    ///
    /// # Errors
    /// - `ReadOnly` if the cache was opened read-only
    /// - `OffsetOutOfBounds` if the write does not fit in the section
    ///
    /// # Errors
    /// - 缓存以只读方式打开时返回 `ReadOnly`
    /// - 写入超出分段时返回 `OffsetOutOfBounds`
    pub unsafe fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.as_mut_ptr()?;
        self.check_bounds(offset, data.len())?;
        // Safety: bounds checked above; exclusivity is the caller's contract.
        // Safety: 上面已检查边界；独占性由调用者保证。
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.add(offset), data.len());
        }
        Ok(())
    }

    /// Copy section bytes at `offset` into `buf`
    ///
    /// 将分段 `offset` 处的字节复制到 `buf`
    ///
    /// # Safety
    ///
    /// No other thread may write the same bytes concurrently.
    ///
    /// # Safety
    ///
    /// 不得有其他线程并发写入相同的字节。
    pub unsafe fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(Error::OffsetOutOfBounds {
                offset,
                len,
                size: self.len,
            });
        }
        Ok(())
    }

    /// Mark this section dirty; see [`SectionCache::mark_dirty`]
    ///
    /// 将此分段标记为脏；参见 [`SectionCache::mark_dirty`]
    #[inline]
    pub fn mark_dirty(&self) -> Result<Generation> {
        self.cache.mark_dirty(self.section)
    }

    /// Unlock now and report failures instead of logging them
    ///
    /// 立即解锁，并返回失败而不是仅记录日志
    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.cache.release(self.section, self.ptr)
    }
}

impl std::fmt::Debug for SectionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionGuard")
            .field("section", &self.section)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.cache.release(self.section, self.ptr) {
            warn!(section = self.section, error = %err, "unlocking section on drop failed");
        }
    }
}

// Implement Send and Sync
// Safety: the mapping outlives the guard and SectionCache is Sync; byte access is unsafe
//
// 实现 Send 和 Sync
// Safety: 映射的生命周期长于守卫且 SectionCache 是 Sync；字节访问是 unsafe 的
unsafe impl Send for SectionGuard<'_> {}
unsafe impl Sync for SectionGuard<'_> {}
