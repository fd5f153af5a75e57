//! Names and the per-package name table.
//!
//! A package stores every distinct name string once. References carry the
//! table index plus an instance number, so `Mesh`, `Mesh_1` and `Mesh_2`
//! share one table entry.

use std::fmt;

use fxhash::FxHashMap;

use super::{Error, Result};

/// A name with an instance number. Number 0 has no suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    base: String,
    number: u32,
}

impl Name {
    /// Name without an instance suffix.
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into(), number: 0 }
    }

    /// Name with an explicit instance number.
    pub fn with_number(base: impl Into<String>, number: u32) -> Self {
        Self { base: base.into(), number }
    }

    /// The string stored in the name table.
    #[inline]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// The instance number (0 when unsuffixed).
    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.base.is_empty() || self.base == "None"
    }

    /// Compare against a plain string, honoring the instance suffix.
    pub fn matches(&self, text: &str) -> bool {
        if self.number == 0 {
            return self.base == text;
        }
        match text.strip_prefix(self.base.as_str()) {
            Some(rest) => rest
                .strip_prefix('_')
                .and_then(|n| n.parse::<u32>().ok())
                .is_some_and(|n| n == self.number),
            None => false,
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.number == 0 {
            f.write_str(&self.base)
        } else {
            write!(f, "{}_{}", self.base, self.number)
        }
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name::new(s)
    }
}

/// Dense table of name strings addressed by index.
///
/// Readers append entries in file order (duplicates are kept as-is);
/// writers use [`NameTable::intern`], which reuses existing entries.
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    entries: Vec<String>,
    lookup: FxHashMap<String, i32>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry as read from a file.
    pub fn push(&mut self, entry: String) -> i32 {
        let index = self.entries.len() as i32;
        self.lookup.entry(entry.clone()).or_insert(index);
        self.entries.push(entry);
        index
    }

    /// Return the index for `entry`, appending it if absent.
    pub fn intern(&mut self, entry: &str) -> i32 {
        match self.lookup.get(entry) {
            Some(&index) => index,
            None => self.push(entry.to_string()),
        }
    }

    /// Index of an existing entry.
    pub fn index_of(&self, entry: &str) -> Option<i32> {
        self.lookup.get(entry).copied()
    }

    /// Entry string for `index`. Out-of-range indices are corruption.
    pub fn get(&self, index: i32) -> Result<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
            .map(String::as_str)
            .ok_or(Error::BadNameIndex { index, count: self.entries.len() })
    }

    /// Build a [`Name`] from a serialized `(index, number)` pair.
    pub fn resolve(&self, index: i32, number: u32) -> Result<Name> {
        Ok(Name::with_number(self.get(index)?, number))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_display() {
        assert_eq!(Name::new("Mesh").to_string(), "Mesh");
        assert_eq!(Name::with_number("Mesh", 2).to_string(), "Mesh_2");
    }

    #[test]
    fn test_name_matches() {
        assert!(Name::new("Mesh").matches("Mesh"));
        assert!(Name::with_number("Mesh", 2).matches("Mesh_2"));
        assert!(!Name::with_number("Mesh", 2).matches("Mesh_3"));
        assert!(!Name::with_number("Mesh", 2).matches("Mesh"));
    }

    #[test]
    fn test_intern_dedups() {
        let mut table = NameTable::new();
        let a = table.intern("Core");
        let b = table.intern("Class");
        assert_eq!(table.intern("Core"), a);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_push_keeps_duplicates() {
        let mut table = NameTable::new();
        table.push("A".into());
        table.push("A".into());
        assert_eq!(table.len(), 2);
        assert_eq!(table.index_of("A"), Some(0));
    }

    #[test]
    fn test_bad_index() {
        let mut table = NameTable::new();
        table.push("A".into());
        assert!(matches!(table.get(1), Err(Error::BadNameIndex { index: 1, count: 1 })));
        assert!(matches!(table.get(-1), Err(Error::BadNameIndex { .. })));
        assert_eq!(table.resolve(0, 4).unwrap().to_string(), "A_4");
    }
}
