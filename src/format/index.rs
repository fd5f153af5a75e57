//! Signed resource index.
//!
//! `0` is the package itself, `n > 0` is export `n - 1` and `-n` is
//! import `n - 1`. Every outer, class, super and archetype reference in
//! the tables uses this encoding.

use std::fmt;

use crate::util::{Error, Result};

/// Decoded form of a [`PackageIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Root,
    Export(usize),
    Import(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageIndex(i32);

impl PackageIndex {
    /// The package root. In an archetype field it means "use class defaults".
    pub const ROOT: PackageIndex = PackageIndex(0);

    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub fn from_export(index: usize) -> Self {
        Self(index as i32 + 1)
    }

    #[inline]
    pub fn from_import(index: usize) -> Self {
        Self(-(index as i32) - 1)
    }

    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_export(self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn is_import(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn export_index(self) -> Option<usize> {
        self.is_export().then(|| (self.0 - 1) as usize)
    }

    #[inline]
    pub fn import_index(self) -> Option<usize> {
        self.is_import().then(|| (-self.0 - 1) as usize)
    }

    pub fn resource(self) -> Resource {
        match self.0 {
            0 => Resource::Root,
            n if n > 0 => Resource::Export((n - 1) as usize),
            n => Resource::Import((-n - 1) as usize),
        }
    }

    /// Reject indices outside `[-imports, exports]`.
    pub fn check(self, imports: usize, exports: usize) -> Result<Self> {
        let ok = match self.resource() {
            Resource::Root => true,
            Resource::Export(i) => i < exports,
            Resource::Import(i) => i < imports,
        };
        if ok {
            Ok(self)
        } else {
            Err(Error::BadResourceIndex { index: self.0, imports, exports })
        }
    }
}

impl fmt::Display for PackageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource() {
            Resource::Root => f.write_str("Root"),
            Resource::Export(i) => write!(f, "Export({})", i),
            Resource::Import(i) => write!(f, "Import({})", i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding() {
        assert_eq!(PackageIndex::from_export(0).raw(), 1);
        assert_eq!(PackageIndex::from_import(0).raw(), -1);
        assert_eq!(PackageIndex::from_import(4).import_index(), Some(4));
        assert_eq!(PackageIndex::from_export(9).export_index(), Some(9));
        assert_eq!(PackageIndex::ROOT.resource(), Resource::Root);
        assert_eq!(PackageIndex::from_raw(-3).resource(), Resource::Import(2));
        assert_eq!(PackageIndex::from_raw(3).export_index(), Some(2));
        assert_eq!(PackageIndex::from_raw(3).import_index(), None);
    }

    #[test]
    fn test_check_bounds() {
        assert!(PackageIndex::ROOT.check(0, 0).is_ok());
        assert!(PackageIndex::from_raw(2).check(0, 2).is_ok());
        assert!(PackageIndex::from_raw(3).check(0, 2).is_err());
        assert!(PackageIndex::from_raw(-1).check(1, 0).is_ok());
        assert!(matches!(
            PackageIndex::from_raw(-2).check(1, 0),
            Err(Error::BadResourceIndex { index: -2, .. })
        ));
    }
}
