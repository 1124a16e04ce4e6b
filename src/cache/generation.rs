//! Wraparound-safe generation counter
//!
//! 可回绕的代数计数器

use std::fmt;

/// Version number of a section's contents
///
/// 分段内容的版本号
///
/// Generations are compared like transport sequence numbers: `a` is after `b` when the
/// wrapping difference `a - b`, read as a signed value, is positive. There is no `Ord`;
/// ordering goes through these helpers.
///
/// 代数的比较方式与传输协议序号相同：当回绕差值 `a - b` 作为有符号数为正时，`a` 在 `b` 之后。
/// 没有实现 `Ord`；比较通过这些辅助方法进行。
///
/// # Examples
///
/// ```
/// use section_mmap::Generation;
///
/// let near_max = Generation::new(u32::MAX);
/// let wrapped = near_max.next();
/// assert_eq!(wrapped, Generation::new(0));
/// assert!(wrapped.is_after(near_max));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Generation(u32);

impl Generation {
    /// Generation of a freshly created section
    ///
    /// 新建分段的代数
    pub const INITIAL: Generation = Generation(0);

    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw counter value
    ///
    /// 原始计数值
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The following generation (wraps at `u32::MAX`)
    ///
    /// 下一代（在 `u32::MAX` 处回绕）
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Strictly after `other`
    ///
    /// 严格晚于 `other`
    #[inline]
    pub const fn is_after(self, other: Generation) -> bool {
        (self.0.wrapping_sub(other.0) as i32) > 0
    }

    /// After or equal to `other`
    ///
    /// 晚于或等于 `other`
    #[inline]
    pub const fn is_at_or_after(self, other: Generation) -> bool {
        (self.0.wrapping_sub(other.0) as i32) >= 0
    }

    /// Strictly before `other`
    ///
    /// 严格早于 `other`
    #[inline]
    pub const fn is_before(self, other: Generation) -> bool {
        other.is_after(self)
    }

    /// The later of the two generations
    ///
    /// 两者中较晚的代数
    #[inline]
    #[must_use]
    pub const fn latest(self, other: Generation) -> Self {
        if other.is_after(self) { other } else { self }
    }

    /// Raise `self` to `other` if `other` is later; never moves backwards
    ///
    /// 若 `other` 更晚则提升到 `other`；永不回退
    #[inline]
    pub fn merge(&mut self, other: Generation) {
        *self = self.latest(other);
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Generation {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
