use core::marker::PhantomData;
use core::ops::Range;

use crate::{LayoutError, Result};

/// A value with a fixed byte width that can be read from and written to a byte buffer.
pub trait Type {
    type Value: Copy;

    /// Width in bytes.
    const SIZE: usize;

    fn get(buf: &[u8], offset: usize) -> Result<Self::Value>;
    fn set(buf: &mut [u8], offset: usize, value: Self::Value) -> Result<()>;
}

/// Returns `offset..offset + len` if it lies within a buffer of `capacity` bytes.
#[doc(hidden)]
pub fn check_range(capacity: usize, offset: usize, len: usize) -> Result<Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(offset..end),
        _ => Err(LayoutError::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}

macro_rules! int_type {
    ($(#[$meta:meta])* $name:ident, $ty:ty, $from:ident, $to:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl Type for $name {
            type Value = $ty;

            const SIZE: usize = core::mem::size_of::<$ty>();

            fn get(buf: &[u8], offset: usize) -> Result<$ty> {
                let range = check_range(buf.len(), offset, Self::SIZE)?;
                let mut raw = [0u8; core::mem::size_of::<$ty>()];
                raw.copy_from_slice(&buf[range]);
                Ok(<$ty>::$from(raw))
            }

            fn set(buf: &mut [u8], offset: usize, value: $ty) -> Result<()> {
                let range = check_range(buf.len(), offset, Self::SIZE)?;
                buf[range].copy_from_slice(&value.$to());
                Ok(())
            }
        }
    };
}

int_type!(U8, u8, from_le_bytes, to_le_bytes);
int_type!(
    /// Little-endian `u16` (virtio ring fields).
    U16Le, u16, from_le_bytes, to_le_bytes
);
int_type!(U16Be, u16, from_be_bytes, to_be_bytes);
int_type!(
    /// Little-endian `u32`.
    U32Le, u32, from_le_bytes, to_le_bytes
);
int_type!(
    /// Big-endian `u32` (devicetree cells and tokens).
    U32Be, u32, from_be_bytes, to_be_bytes
);
int_type!(U64Le, u64, from_le_bytes, to_le_bytes);
int_type!(U64Be, u64, from_be_bytes, to_be_bytes);

/// `N` contiguous repetitions of `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedArray<T, const N: usize>(PhantomData<T>);

impl<T: Type, const N: usize> Type for FixedArray<T, N>
where
    T::Value: Default,
{
    type Value = [T::Value; N];

    const SIZE: usize = T::SIZE * N;

    fn get(buf: &[u8], offset: usize) -> Result<Self::Value> {
        check_range(buf.len(), offset, Self::SIZE)?;
        let mut out = [T::Value::default(); N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = T::get(buf, offset + i * T::SIZE)?;
        }
        Ok(out)
    }

    fn set(buf: &mut [u8], offset: usize, value: Self::Value) -> Result<()> {
        check_range(buf.len(), offset, Self::SIZE)?;
        for (i, v) in value.into_iter().enumerate() {
            T::set(buf, offset + i * T::SIZE, v)?;
        }
        Ok(())
    }
}

/// Declares a C-like struct whose fields are [`Type`]s laid out back to back.
///
/// The generated struct stores each field's decoded value and implements [`Type`] for itself.
/// `SIZE` is the sum of the field sizes, and `OFFSETS` holds the byte offset of every field in
/// declaration order, both evaluated at compile time.
///
/// ```
/// use linwasm_layout::{layout, Type, U16Le, U32Be};
///
/// layout! {
///     pub struct Pair {
///         pub a: U32Be,
///         pub b: U16Le,
///     }
/// }
///
/// assert_eq!(Pair::SIZE, 6);
/// assert_eq!(Pair::offset_of("b"), Some(4));
///
/// let mut buf = [0u8; 6];
/// Pair::set(&mut buf, 0, Pair { a: 1, b: 2 }).unwrap();
/// assert_eq!(buf, [0, 0, 0, 1, 2, 0]);
/// ```
#[macro_export]
macro_rules! layout {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($(#[$fmeta:meta])* $fvis:vis $field:ident : $ty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis struct $name {
            $($(#[$fmeta])* $fvis $field: <$ty as $crate::Type>::Value,)*
        }

        impl $name {
            const FIELD_NAMES: &'static [&'static str] = &[$(stringify!($field)),*];

            /// Byte offset of every field, in declaration order.
            pub const OFFSETS: &'static [usize] = &{
                let sizes = [$(<$ty as $crate::Type>::SIZE),*];
                let mut offsets = sizes;
                let mut acc = 0usize;
                let mut i = 0usize;
                while i < sizes.len() {
                    offsets[i] = acc;
                    acc += sizes[i];
                    i += 1;
                }
                offsets
            };

            /// Byte offset of the named field.
            pub fn offset_of(field: &str) -> Option<usize> {
                Self::FIELD_NAMES
                    .iter()
                    .position(|&name| name == field)
                    .map(|i| Self::OFFSETS[i])
            }
        }

        impl $crate::Type for $name {
            type Value = Self;

            const SIZE: usize = 0 $(+ <$ty as $crate::Type>::SIZE)*;

            fn get(buf: &[u8], offset: usize) -> $crate::Result<Self> {
                $crate::check_range(buf.len(), offset, <Self as $crate::Type>::SIZE)?;
                let mut at = offset;
                $(
                    let $field = <$ty as $crate::Type>::get(buf, at)?;
                    at += <$ty as $crate::Type>::SIZE;
                )*
                let _ = at;
                Ok(Self { $($field),* })
            }

            fn set(buf: &mut [u8], offset: usize, value: Self) -> $crate::Result<()> {
                $crate::check_range(buf.len(), offset, <Self as $crate::Type>::SIZE)?;
                let mut at = offset;
                $(
                    <$ty as $crate::Type>::set(buf, at, value.$field)?;
                    at += <$ty as $crate::Type>::SIZE;
                )*
                let _ = at;
                Ok(())
            }
        }
    };
}
