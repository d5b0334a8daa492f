//! Typed addresses and the user address-space layout.
//!
//! Virtual and physical addresses are distinct wrapper types so that the
//! two can never be confused in a mapping operation. Both validate on
//! construction and expose page-granular alignment helpers.
//!
//! The user-visible layout is fixed at build time:
//!
//! ```text
//! VA_LIMIT            ----------------------------  0x4000_0000
//!                      (reserved, never mappable)
//! USER_TOP            ----------------------------  0x2000_0000
//!                      exception stack (one page)
//! EXCEPTION_STACK_TOP - PAGE_SIZE ---------------   0x1fff_f000
//!                      guard gap (never mapped)
//! USER_STACK_TOP      ----------------------------  0x1fff_e000
//!                      ...
//! SCRATCH_BASE        ----------------------------  0x0040_0000
//!                      ...
//! 0                   ----------------------------
//! ```

/// The number of bits to shift an address to obtain its page number.
pub const PAGE_SHIFT: usize = 12;

/// Size of a memory page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask selecting the byte offset within a page.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Exclusive upper bound of the modeled virtual address space.
///
/// Two translation levels of 512 entries each over 4 KiB pages cover
/// exactly 1 GiB.
pub const VA_LIMIT: usize = 0x4000_0000;

/// Top of the user-addressable region. Nothing at or above this address is
/// ever mapped on behalf of an environment; it is also the boundary an
/// address-space duplication sweeps up to.
pub const USER_TOP: Va = Va(0x2000_0000);

/// Top of the exception stack. The single page below this address is the
/// dedicated stack for running an environment's fault upcall and must be
/// backed by a private, freshly allocated frame in every environment.
pub const EXCEPTION_STACK_TOP: Va = USER_TOP;

/// Top of the normal user stack. The page between the user stack and the
/// exception stack is a guard gap and stays unmapped.
pub const USER_STACK_TOP: Va = Va(0x2000_0000 - 2 * PAGE_SIZE);

/// The reserved staging address used to resolve a copy-on-write fault.
/// At most one mapping may be live here per environment.
pub const SCRATCH_BASE: Va = Va(0x0040_0000);

/// Represents a physical address.
///
/// [`Pa`] wraps a `usize` that names a location in the physical frame
/// pool. Frame numbers are the address shifted right by [`PAGE_SHIFT`].
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    ///
    /// # Returns
    /// - `Some(Pa)` if the address is within the representable range.
    /// - `None` otherwise.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 1 << 48 { Some(Self(addr)) } else { None }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align the physical address down to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align the physical address up to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the byte offset within the page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// [`Va`] wraps a `usize` address in the modeled virtual address space.
/// Construction rejects addresses at or beyond [`VA_LIMIT`], so every
/// `Va` in circulation can be decomposed into valid table indices.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Va(usize);

impl Va {
    /// The virtual address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new virtual address if the address is valid.
    ///
    /// # Returns
    /// - `Some(Va)` if `addr` is below [`VA_LIMIT`].
    /// - `None` otherwise.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < VA_LIMIT { Some(Self(addr)) } else { None }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the byte offset within the page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 += other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn va_validates_range() {
        assert!(Va::new(0).is_some());
        assert!(Va::new(VA_LIMIT - 1).is_some());
        assert!(Va::new(VA_LIMIT).is_none());
        assert!(Va::new(usize::MAX).is_none());
    }

    #[test]
    fn alignment_helpers() {
        let va = Va::new(0x1234_5678).unwrap();
        assert_eq!(va.page_down().into_usize(), 0x1234_5000);
        assert_eq!(va.page_up().into_usize(), 0x1234_6000);
        assert_eq!(va.offset(), 0x678);

        let pa = Pa::new(0x8_6001).unwrap();
        assert_eq!(pa.page_down().into_usize(), 0x8_6000);
        assert_eq!(pa.offset(), 0x1);
    }

    #[test]
    fn layout_is_ordered() {
        assert!(SCRATCH_BASE < USER_STACK_TOP);
        assert!(USER_STACK_TOP < EXCEPTION_STACK_TOP);
        assert_eq!(EXCEPTION_STACK_TOP, USER_TOP);
        assert_eq!(EXCEPTION_STACK_TOP - USER_STACK_TOP, 2 * PAGE_SIZE);
        assert!(USER_TOP.into_usize() < VA_LIMIT);
    }

    #[test]
    fn arithmetic() {
        let va = Va::new(0x2000).unwrap();
        assert_eq!((va + PAGE_SIZE).into_usize(), 0x3000);
        assert_eq!((va - PAGE_SIZE).into_usize(), 0x1000);
        assert_eq!(va + PAGE_SIZE - va, PAGE_SIZE);
    }
}
