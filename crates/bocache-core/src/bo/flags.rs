//! BO creation flags.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Buffer-object flag set.
///
/// Cache lookups require an exact flag match, so every bit here partitions the
/// cache.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoFlags(u32);

impl BoFlags {
    pub const NONE: Self = Self(0);
    /// Exported to or imported from another process or API. Never cached.
    pub const SHARED: Self = Self(1 << 0);
    /// May be exported later; allocated so that export is possible.
    pub const SHAREABLE: Self = Self(1 << 1);
    /// Cached (write-back) CPU mapping instead of write-combined.
    pub const WRITEBACK: Self = Self(1 << 2);
    /// Holds shader code.
    pub const EXEC: Self = Self(1 << 3);
    /// Must live in the low part of the GPU address space.
    pub const LOW_VA: Self = Self(1 << 4);
    /// GPU-read-only.
    pub const READONLY: Self = Self(1 << 5);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::SHARED, "shared"),
        (Self::SHAREABLE, "shareable"),
        (Self::WRITEBACK, "writeback"),
        (Self::EXEC, "exec"),
        (Self::LOW_VA, "low_va"),
        (Self::READONLY, "readonly"),
    ];

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits. Unknown bits are kept; backends may define their own.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// `self | other`, usable in constants.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_shared(self) -> bool {
        self.contains(Self::SHARED)
    }
}

impl BitOr for BoFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BoFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for BoFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for BoFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("BoFlags(NONE)");
        }
        f.write_str("BoFlags(")?;
        let mut rest = self.0;
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                rest &= !flag.0;
                first = false;
            }
        }
        if rest != 0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{rest:#x}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_predicate() {
        assert!(BoFlags::SHARED.is_shared());
        assert!((BoFlags::SHARED | BoFlags::EXEC).is_shared());
        assert!(!BoFlags::SHAREABLE.is_shared());
        assert!(!BoFlags::NONE.is_shared());
    }

    #[test]
    fn bit_ops() {
        let mut flags = BoFlags::WRITEBACK;
        flags |= BoFlags::LOW_VA;
        assert!(flags.contains(BoFlags::LOW_VA));
        assert_eq!(flags & BoFlags::WRITEBACK, BoFlags::WRITEBACK);
        assert_eq!(BoFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn debug_names_known_and_unknown_bits() {
        assert_eq!(format!("{:?}", BoFlags::NONE), "BoFlags(NONE)");
        assert_eq!(
            format!("{:?}", BoFlags::SHARED | BoFlags::EXEC),
            "BoFlags(shared | exec)"
        );
        assert_eq!(
            format!("{:?}", BoFlags::from_bits(0x100 | 1)),
            "BoFlags(shared | 0x100)"
        );
    }
}
