//! Priority bitmaps: one bit per priority level, with a constant-time scan
//! for the most urgent (numerically largest) occupied level.
use core::fmt;

use super::Init;

/// A bit array indexed by priority level.
///
/// All methods panic when the given bit position is out of range.
pub trait PrioBitmap: Init + Send + Sync + Clone + Copy + fmt::Debug + 'static {
    /// The number of levels this bitmap can represent.
    const LEN: usize;

    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the topmost set bit, i.e., the most urgent
    /// occupied priority level.
    fn find_set(&self) -> Option<usize>;
}

macro_rules! impl_prio_bitmap {
    ($($ty:ty),*) => {
        $(
            impl PrioBitmap for $ty {
                const LEN: usize = <$ty>::BITS as usize;

                #[inline]
                fn get(&self, i: usize) -> bool {
                    assert!(i < Self::LEN);
                    (*self >> i) & 1 != 0
                }

                #[inline]
                fn clear(&mut self, i: usize) {
                    assert!(i < Self::LEN);
                    *self &= !(1 << i);
                }

                #[inline]
                fn set(&mut self, i: usize) {
                    assert!(i < Self::LEN);
                    *self |= 1 << i;
                }

                #[inline]
                fn find_set(&self) -> Option<usize> {
                    if *self == 0 {
                        None
                    } else {
                        Some(Self::LEN - 1 - self.leading_zeros() as usize)
                    }
                }
            }
        )*
    };
}

impl_prio_bitmap!(u8, u16, u32, u64, u128);
