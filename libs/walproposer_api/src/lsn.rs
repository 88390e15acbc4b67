//! Log sequence number: a byte offset into the WAL stream.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// A 64-bit WAL byte position. `Lsn(0)` is [`Lsn::INVALID`] and never denotes a real
/// position.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    /// `None` if `self < other`, matching postgres's `pg_lsn` subtraction semantics.
    pub fn checked_sub(self, other: impl Into<Lsn>) -> Option<Lsn> {
        let other = other.into();
        self.0.checked_sub(other.0).map(Lsn)
    }

    pub fn checked_add(self, other: u64) -> Option<Lsn> {
        self.0.checked_add(other).map(Lsn)
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;
    fn add(self, rhs: u64) -> Lsn {
        Lsn(self.0 + rhs)
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<u64> for Lsn {
    type Output = Lsn;
    fn sub(self, rhs: u64) -> Lsn {
        Lsn(self.0 - rhs)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_postgres_style() {
        assert_eq!(Lsn(0x16B3748).to_string(), "0/16B3748");
    }

    #[test]
    fn checked_sub_detects_underflow() {
        assert_eq!(Lsn(10).checked_sub(Lsn(20)), None);
        assert_eq!(Lsn(20).checked_sub(Lsn(10)), Some(Lsn(10)));
    }
}
