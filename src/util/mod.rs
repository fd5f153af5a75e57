//! Utility types shared by every layer of the linker.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`Name`] / [`NameTable`] - Interned names with instance numbers
//! - [`Guid`] - Package content identifiers

mod error;
mod name;
mod guid;
mod flags;

pub use error::*;
pub use name::*;
pub use guid::*;
pub(crate) use flags::bit_flags;
