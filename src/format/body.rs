//! Export body encoding.
//!
//! An export body is the object's property image followed by the signed
//! indices of every object its properties reference:
//!
//! ```text
//! [property_len: i32][property bytes][ref_count: i32][ref: i32] * ref_count
//! ```

use std::io::Cursor;

use super::*;

/// Decoded export body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportBody {
    pub properties: Vec<u8>,
    pub references: Vec<PackageIndex>,
}

impl ExportBody {
    pub fn encode(&self, swap: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.properties.len() + 4 * self.references.len());
        // Writing into a Vec cannot fail.
        let _ = out.write_i32_as(self.properties.len() as i32, swap);
        out.extend_from_slice(&self.properties);
        let _ = out.write_i32_as(self.references.len() as i32, swap);
        for reference in &self.references {
            let _ = out.write_i32_as(reference.raw(), swap);
        }
        out
    }

    /// Decode from `bytes`, returning the body and the bytes consumed.
    ///
    /// Reading past the end reports `UnexpectedEof` carrying the position
    /// the decoder needed to reach.
    pub fn decode(bytes: &[u8], swap: bool, imports: usize, exports: usize) -> Result<(Self, usize)> {
        let mut cur = Cursor::new(bytes);
        let len = bytes.len() as u64;

        let prop_len = Self::length(cur.read_i32_as(swap).map_err(|_| Error::UnexpectedEof(4))?)?;
        let start = cur.position() as usize;
        let end = start + prop_len;
        if end as u64 > len {
            return Err(Error::UnexpectedEof(end as u64));
        }
        let properties = bytes[start..end].to_vec();
        cur.set_position(end as u64);

        let count = Self::length(cur.read_i32_as(swap).map_err(|_| Error::UnexpectedEof(end as u64 + 4))?)?;
        let refs_end = end as u64 + 4 + 4 * count as u64;
        if refs_end > len {
            return Err(Error::UnexpectedEof(refs_end));
        }
        let mut references = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = cur.read_i32_as(swap)?;
            references.push(PackageIndex::from_raw(raw).check(imports, exports)?);
        }
        Ok((Self { properties, references }, cur.position() as usize))
    }

    fn length(value: i32) -> Result<usize> {
        usize::try_from(value).map_err(|_| Error::corrupt(format!("negative length {} in export body", value)))
    }
}
