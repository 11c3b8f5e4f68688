//! Fiber ids

use core::fmt;

/// Runtime-wide fiber number
///
/// The registry draws these from a counter as fibers are spawned; within one
/// runtime a value is never handed out twice. `0` belongs to the root
/// fibers and `u32::MAX` means "not a fiber".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u32);

impl FiberId {
    /// Returned when the caller is not running inside a runtime
    pub const NONE: FiberId = FiberId(u32::MAX);

    /// Shared by the root fiber of every runtime thread
    pub const ROOT: FiberId = FiberId(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        FiberId(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        !self.is_none()
    }

    /// `None` for [`FiberId::NONE`]
    #[inline]
    pub const fn to_option(self) -> Option<FiberId> {
        match self.is_none() {
            true => None,
            false => Some(self),
        }
    }
}

impl From<u32> for FiberId {
    #[inline]
    fn from(raw: u32) -> Self {
        FiberId(raw)
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_option() {
            Some(id) => write!(f, "{}", id.0),
            None => f.write_str("none"),
        }
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_option() {
            Some(id) => write!(f, "FiberId({})", id.0),
            None => f.write_str("FiberId(NONE)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_sentinel() {
        assert!(FiberId::NONE.is_none());
        assert_eq!(FiberId::NONE.to_option(), None);
        assert_eq!(FiberId::default(), FiberId::NONE);
        assert_eq!(FiberId::NONE.to_string(), "none");
        assert_eq!(format!("{:?}", FiberId::NONE), "FiberId(NONE)");
    }

    #[test]
    fn test_root_and_plain_ids() {
        assert_eq!(FiberId::ROOT.to_option(), Some(FiberId::new(0)));

        let id = FiberId::from(7u32);
        assert!(id.is_some());
        assert_eq!(id.as_u32(), 7);
        assert_eq!(id.to_string(), "7");
        assert_eq!(format!("{:?}", id), "FiberId(7)");
        assert!(FiberId::new(3) < id);
    }
}
