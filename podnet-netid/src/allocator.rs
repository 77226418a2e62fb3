use std::sync::Mutex;

use crate::{Error, Result, VnidRange};

/// Allocates VNIDs out of a range, backed by a contiguous bitmap.
///
/// All methods take `&self`; the bitmap is guarded internally so callers
/// may share the allocator across tasks.
pub struct Allocator {
    range: VnidRange,
    inner: Mutex<Bitmap>,
}

struct Bitmap {
    bits: Vec<u8>,
    allocated: u32,
}

impl Allocator {
    pub fn new(range: VnidRange) -> Self {
        Self {
            range,
            inner: Mutex::new(Bitmap {
                bits: vec![0; range.size.div_ceil(8) as usize],
                allocated: 0,
            }),
        }
    }

    pub fn range(&self) -> VnidRange {
        self.range
    }

    /// Reserves the provided VNID. `NotInRange` or `Allocated` if the id
    /// is outside the range or already reserved.
    pub fn allocate(&self, id: u32) -> Result<()> {
        let offset = self.range.contains(id).ok_or(Error::NotInRange)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.get(offset) {
            return Err(Error::Allocated);
        }
        inner.set(offset, true);
        Ok(())
    }

    /// Reserves the first free VNID in the range. `Full` when none remain.
    pub fn allocate_next(&self) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        for offset in 0..self.range.size {
            if !inner.get(offset) {
                inner.set(offset, true);
                return Ok(self.range.base + offset);
            }
        }
        Err(Error::Full)
    }

    /// Returns the VNID to the pool. Releasing an unallocated id or an id
    /// outside the range is a no-op.
    pub fn release(&self, id: u32) {
        let Some(offset) = self.range.contains(id) else {
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.get(offset) {
            inner.set(offset, false);
        }
    }

    /// Whether the VNID is currently allocated.
    pub fn has(&self, id: u32) -> bool {
        match self.range.contains(id) {
            Some(offset) => self.inner.lock().unwrap().get(offset),
            None => false,
        }
    }

    /// Count of VNIDs still free.
    pub fn free(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        self.range.size - inner.allocated
    }

    /// Captures the range tag and bitmap for persistence.
    pub fn snapshot(&self) -> (String, Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        (self.range.to_string(), inner.bits.clone())
    }

    /// Rehydrates a previously captured snapshot. Fails with
    /// `MismatchedRange` unless the stored range tag exactly matches the
    /// live range.
    pub fn restore(&self, range: &str, data: &[u8]) -> Result<()> {
        if range != self.range.to_string() {
            return Err(Error::MismatchedRange);
        }
        let mut inner = self.inner.lock().unwrap();
        let mut bits = data.to_vec();
        bits.resize(self.range.size.div_ceil(8) as usize, 0);
        inner.allocated = (0..self.range.size)
            .filter(|&offset| bits[(offset / 8) as usize] & (1 << (offset % 8)) != 0)
            .count() as u32;
        inner.bits = bits;
        Ok(())
    }
}

impl Bitmap {
    fn get(&self, offset: u32) -> bool {
        self.bits[(offset / 8) as usize] & (1 << (offset % 8)) != 0
    }

    fn set(&mut self, offset: u32, value: bool) {
        let byte = &mut self.bits[(offset / 8) as usize];
        let mask = 1 << (offset % 8);
        if value {
            *byte |= mask;
            self.allocated += 1;
        } else {
            *byte &= !mask;
            self.allocated -= 1;
        }
    }
}
