//! Integer words used as the internal and leaf levels of a [super::MemBlock]
//!
//! Bit 0 of every bitmap is the most significant bit, so that "first set
//! bit" is a leading-zeros count.

use std::{
    fmt::Debug,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not, Shr},
};

/// Workaround for not being able to write `[T; Self::BITS]` in a trait
pub trait ConstGenericsHackWorkaround<T>: Send {
    fn init(x: T) -> Self
    where
        T: Copy;

    fn as_slice(&self) -> &[T];
    fn as_mut_slice(&mut self) -> &mut [T];
}
impl<T: Send, const N: usize> ConstGenericsHackWorkaround<T> for [T; N] {
    #[inline]
    fn init(x: T) -> Self
    where
        T: Copy,
    {
        [x; N]
    }

    #[inline]
    fn as_slice(&self) -> &[T] {
        self
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}

pub trait BitWord:
    Copy
    + Eq
    + Debug
    + Send
    + Sync
    + 'static
    + BitAnd<Output = Self>
    + BitAndAssign
    + BitOr<Output = Self>
    + BitOrAssign
    + Not<Output = Self>
    + Shr<u32, Output = Self>
{
    const BITS: u32;
    /// log2 of [Self::BITS]
    const SHIFT: u32;
    const ZERO: Self;
    const ONES: Self;
    /// Only the most significant bit set, i.e. bit index 0
    const MSB: Self;

    /// An array with one element per bit
    ///
    /// GAT is needed to work around limitations of const generics
    type ArrayTy<T: Copy + Send>: ConstGenericsHackWorkaround<T>;

    fn leading_zeros(self) -> u32;
    fn count_ones(self) -> u32;

    /// Word with only bit index `idx` (counting from the MSB) set
    #[inline]
    fn bit(idx: usize) -> Self {
        debug_assert!((idx as u32) < Self::BITS);
        Self::MSB >> idx as u32
    }

    /// Index of the first set bit counting from the MSB, [Self::BITS] if none
    #[inline]
    fn first_set(self) -> usize {
        self.leading_zeros() as usize
    }
}

macro_rules! bitword_impl {
    ($ty:ty, $bits:literal) => {
        impl BitWord for $ty {
            const BITS: u32 = $bits;
            const SHIFT: u32 = <$ty>::BITS.trailing_zeros();
            const ZERO: Self = 0;
            const ONES: Self = <$ty>::MAX;
            const MSB: Self = 1 << ($bits - 1);

            type ArrayTy<T: Copy + Send> = [T; $bits];

            #[inline]
            fn leading_zeros(self) -> u32 {
                <$ty>::leading_zeros(self)
            }

            #[inline]
            fn count_ones(self) -> u32 {
                <$ty>::count_ones(self)
            }
        }
    };
}
bitword_impl!(u8, 8);
bitword_impl!(u16, 16);
bitword_impl!(u32, 32);
bitword_impl!(u64, 64);
