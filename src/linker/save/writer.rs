//! Sequential package writer with header patching.

use std::io::Cursor;

use crate::format::{write_string, ObjectExport, ObjectImport, PackageIndex, PackageSummary};
use crate::io::OStream;
use crate::util::{Error, NameTable, Result};

/// Writes the sections of one package in file order.
///
/// The summary and export table are written once with placeholder values
/// and rewritten by [`PackageWriter::patch_header`] when offsets are known.
pub(super) struct PackageWriter {
    stream: OStream<Cursor<Vec<u8>>>,
}

impl PackageWriter {
    pub fn new(mut stream: OStream<Cursor<Vec<u8>>>, swap: bool) -> Self {
        stream.set_byte_swap(swap);
        Self { stream }
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.stream.pos()
    }

    #[inline]
    fn swap(&self) -> bool {
        self.stream.byte_swap()
    }

    pub fn write_summary(&mut self, summary: &PackageSummary) -> Result<()> {
        let swap = self.swap();
        summary.write(&mut self.stream, swap)
    }

    pub fn write_names(&mut self, summary: &mut PackageSummary, names: &NameTable) -> Result<()> {
        let swap = self.swap();
        summary.name_offset = self.pos() as i32;
        summary.name_count = names.len() as i32;
        for name in names.iter() {
            write_string(&mut self.stream, name, swap)?;
        }
        Ok(())
    }

    pub fn write_imports(&mut self, summary: &mut PackageSummary, imports: &[ObjectImport], names: &NameTable) -> Result<()> {
        let swap = self.swap();
        summary.import_offset = self.pos() as i32;
        summary.import_count = imports.len() as i32;
        for import in imports {
            import.write(&mut self.stream, swap, names)?;
        }
        Ok(())
    }

    pub fn write_exports(&mut self, summary: &mut PackageSummary, exports: &[ObjectExport], names: &NameTable) -> Result<()> {
        summary.export_offset = self.pos() as i32;
        summary.export_count = exports.len() as i32;
        self.write_export_records(exports, names)
    }

    fn write_export_records(&mut self, exports: &[ObjectExport], names: &NameTable) -> Result<()> {
        let swap = self.swap();
        for export in exports {
            export.write(&mut self.stream, swap, names)?;
        }
        Ok(())
    }

    pub fn write_depends(&mut self, summary: &mut PackageSummary, depends: &[Vec<PackageIndex>]) -> Result<()> {
        summary.depends_offset = self.pos() as i32;
        for list in depends {
            self.stream.write_i32(list.len() as i32)?;
            for dependency in list {
                self.stream.write_i32(dependency.raw())?;
            }
        }
        Ok(())
    }

    /// Append one encoded export body. Returns its offset.
    pub fn write_body(&mut self, body: &[u8]) -> Result<u64> {
        let offset = self.pos();
        self.stream.write_bytes(body)?;
        Ok(offset)
    }

    /// Rewrite the summary and the export table with final values.
    pub fn patch_header(&mut self, summary: &PackageSummary, exports: &[ObjectExport], names: &NameTable) -> Result<()> {
        self.stream.seek_to(0)?;
        self.write_summary(summary)?;
        if self.pos() != summary.name_offset as u64 {
            return Err(Error::other(format!(
                "summary size changed while saving ({} != {})",
                self.pos(),
                summary.name_offset
            )));
        }
        self.stream.seek_to(summary.export_offset as u64)?;
        self.write_export_records(exports, names)?;
        self.stream.seek_end()?;
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.stream.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Name;

    #[test]
    fn test_patch_keeps_layout() {
        let mut names = NameTable::new();
        names.push("Chair".into());
        let mut summary = PackageSummary::default();
        let export = ObjectExport::new(Name::new("Chair"), PackageIndex::ROOT, PackageIndex::ROOT);

        let mut writer = PackageWriter::new(OStream::memory(), false);
        writer.write_summary(&summary).unwrap();
        writer.write_names(&mut summary, &names).unwrap();
        writer.write_imports(&mut summary, &[], &names).unwrap();
        writer.write_exports(&mut summary, std::slice::from_ref(&export), &names).unwrap();
        writer.write_depends(&mut summary, &[vec![]]).unwrap();
        summary.total_header_size = writer.pos() as i32;
        let offset = writer.write_body(&[0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let end = writer.pos();

        let mut patched = export.clone();
        patched.serial_offset = offset as i32;
        patched.serial_size = 8;
        writer.patch_header(&summary, &[patched], &names).unwrap();
        assert_eq!(writer.pos(), end);

        let bytes = writer.into_bytes();
        assert_eq!(bytes.len() as u64, end);
        let (read, swap) = PackageSummary::read(&mut Cursor::new(&bytes)).unwrap();
        assert!(!swap);
        assert_eq!(read.total_header_size, summary.total_header_size);
        assert_eq!(read.export_offset, summary.export_offset);
    }
}
