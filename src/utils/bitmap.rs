//! Bitmap data structure helper.

use std::fmt;

use crate::utils::MaekawaError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for u8 ID -> bool mapping. Used for quorum membership,
/// outstanding reply sets, and finished-node sets.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: u8, ones: bool) -> Self {
        if size == 0 {
            panic!("invalid bitmap size {}", size);
        }
        let mut bitset = FixedBitSet::with_capacity(size as usize);

        if ones {
            bitset.set_range(.., true);
        }

        Bitmap(bitset)
    }

    /// Creates a new bitmap of given size from vec literal. Indices in the
    /// vec are bits to be set as true.
    pub fn from(size: u8, ones: Vec<u8>) -> Self {
        let mut bitmap = Self::new(size, false);

        for idx in ones {
            if let Err(e) = bitmap.set(idx, true) {
                panic!("{}", e);
            }
        }

        bitmap
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<(), MaekawaError> {
        if idx as usize >= self.0.len() {
            return Err(MaekawaError::msg(format!("index {} out of bound", idx)));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, MaekawaError> {
        if idx as usize >= self.0.len() {
            return Err(MaekawaError::msg(format!("index {} out of bound", idx)));
        }
        Ok(self.0[idx as usize])
    }

    /// Like `get()`, but treats out-of-bound indices as unset.
    #[inline]
    pub fn contains(&self, idx: u8) -> bool {
        (idx as usize) < self.0.len() && self.0[idx as usize]
    }

    /// Clears all bits.
    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Returns true if no bit is set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Returns true if this bitmap shares at least one set bit with `other`.
    #[inline]
    pub fn intersects(&self, other: &Bitmap) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    /// Allows `for (id, bit) in map.iter()`.
    #[inline]
    pub fn iter(&self) -> BitmapIter {
        BitmapIter { map: self, idx: 0 }
    }

    /// Iterates over IDs whose bit is set, in ascending order.
    #[inline]
    pub fn ones(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.ones().map(|i| i as u8)
    }
}

/// Iterator over `Bitmap`, yielding `(id, bit)` pairs.
#[derive(Debug, Clone)]
pub struct BitmapIter<'m> {
    map: &'m Bitmap,
    idx: usize,
}

impl Iterator for BitmapIter<'_> {
    type Item = (u8, bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx < self.map.0.len() {
            let id = self.idx;
            self.idx += 1;
            Some((id as u8, self.map.0[id]))
        } else {
            None
        }
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self.ones() {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}
