use std::fmt;
use std::str::FromStr;

use crate::{Error, MAX_VNID, MIN_VNID, Result};

/// A contiguous range of VNIDs, `base..=base+size-1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VnidRange {
    pub base: u32,
    pub size: u32,
}

impl VnidRange {
    pub fn new(base: u32, size: u32) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidRange("size must be non-zero".into()));
        }
        if base < MIN_VNID {
            return Err(Error::InvalidRange(format!(
                "base must be at least {MIN_VNID}, got {base}"
            )));
        }
        let Some(last) = base.checked_add(size - 1) else {
            return Err(Error::InvalidRange(format!("range {base}+{size} overflows")));
        };
        if last > MAX_VNID {
            return Err(Error::InvalidRange(format!(
                "range must end at or below {MAX_VNID}, got {last}"
            )));
        }
        Ok(Self { base, size })
    }

    /// The full user-allocatable range.
    pub fn full() -> Self {
        Self {
            base: MIN_VNID,
            size: MAX_VNID - MIN_VNID + 1,
        }
    }

    /// Whether `id` falls in the range, and its offset from the base.
    pub fn contains(&self, id: u32) -> Option<u32> {
        if id >= self.base && id - self.base < self.size {
            Some(id - self.base)
        } else {
            None
        }
    }

    pub fn last(&self) -> u32 {
        self.base + self.size - 1
    }
}

// The text form doubles as the snapshot tag persisted alongside the
// allocation bitmap, so it must stay stable.
impl fmt::Display for VnidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.last())
    }
}

impl FromStr for VnidRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (base, last) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidRange(format!("expected base-last, got {s:?}")))?;
        let base: u32 = base
            .parse()
            .map_err(|_| Error::InvalidRange(format!("bad base in {s:?}")))?;
        let last: u32 = last
            .parse()
            .map_err(|_| Error::InvalidRange(format!("bad last in {s:?}")))?;
        if last < base {
            return Err(Error::InvalidRange(format!("range {s:?} is inverted")));
        }
        Self::new(base, last - base + 1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_new_and_contains() {
        let vr = VnidRange::new(200, 100).unwrap();
        assert_eq!(vr.contains(199), None);
        assert_eq!(vr.contains(200), Some(0));
        assert_eq!(vr.contains(250), Some(50));
        assert_eq!(vr.contains(299), Some(99));
        assert_eq!(vr.contains(300), None);
    }

    #[test]
    fn test_new_rejects_bad_ranges() {
        assert!(VnidRange::new(200, 0).is_err());
        assert!(VnidRange::new(5, 10).is_err());
        assert!(VnidRange::new(MAX_VNID, 2).is_err());
    }

    #[test]
    fn test_string_round_trip() {
        let vr = VnidRange::new(200, 100).unwrap();
        assert_eq!(vr.to_string(), "200-299");
        assert_eq!("200-299".parse::<VnidRange>().unwrap(), vr);

        let full = VnidRange::full();
        assert_eq!(full.to_string().parse::<VnidRange>().unwrap(), full);

        assert!("299-200".parse::<VnidRange>().is_err());
        assert!("banana".parse::<VnidRange>().is_err());
    }
}
