//! Bit-flag newtypes.

/// Declare a `u32` flag newtype with named constants.
macro_rules! bit_flags {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* const $flag:ident = $value:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);

        impl $name {
            pub const NONE: $name = $name(0);
            $( $(#[$fmeta])* pub const $flag: $name = $name($value); )*

            #[inline]
            pub fn bits(self) -> u32 {
                self.0
            }

            #[inline]
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            #[inline]
            pub fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            #[inline]
            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            #[inline]
            pub fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = $name;
            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }
    };
}

pub(crate) use bit_flags;
