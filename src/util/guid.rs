//! Package content GUIDs.

use std::fmt;

use md5::{Digest, Md5};

/// 128-bit identifier stored in the package summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid(pub [u32; 4]);

impl Guid {
    pub const ZERO: Guid = Guid([0; 4]);

    /// Derive a GUID from arbitrary content bytes.
    pub fn from_content<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Md5::new();
        for part in parts {
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let b = &digest[i * 4..i * 4 + 4];
            *word = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        }
        Guid(words)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|&w| w != 0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}-{:08X}-{:08X}-{:08X}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}
