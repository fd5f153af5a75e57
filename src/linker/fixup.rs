//! Format-compatibility renames applied to freshly read import tables.

use tracing::debug;

use crate::format::{ObjectImport, CLASS_CLASS, CORE_PACKAGE, REDIRECTOR_CLASS, VER_MERGED_REDIRECTOR_CLASSES};
use crate::util::Name;

/// A class that was folded into another one.
#[derive(Debug, Clone, Copy)]
pub struct ImportFixup {
    /// Files older than this version get the rename.
    pub before_version: u16,
    pub old_package: &'static str,
    pub old_class: &'static str,
    pub new_package: &'static str,
    pub new_class: &'static str,
}

/// Renames applied by [`fixup_imports`].
pub const IMPORT_FIXUPS: &[ImportFixup] = &[
    ImportFixup {
        before_version: VER_MERGED_REDIRECTOR_CLASSES,
        old_package: CORE_PACKAGE,
        old_class: "Redirector",
        new_package: CORE_PACKAGE,
        new_class: REDIRECTOR_CLASS,
    },
    ImportFixup {
        before_version: VER_MERGED_REDIRECTOR_CLASSES,
        old_package: "Engine",
        old_class: "PackageRedirector",
        new_package: CORE_PACKAGE,
        new_class: REDIRECTOR_CLASS,
    },
];

/// Rewrite imports of renamed classes. Returns the number of records changed.
///
/// Both references *to* the class (an import's class fields) and the
/// import of the class object itself are rewritten. Pure; no I/O.
pub fn fixup_imports(imports: &mut [ObjectImport], file_version: u16) -> usize {
    let mut changed = 0;
    for fixup in IMPORT_FIXUPS.iter().filter(|f| file_version < f.before_version) {
        let packages: Vec<bool> = imports
            .iter()
            .map(|i| i.is_package() && i.object_name.matches(fixup.old_package))
            .collect();

        for import in imports.iter_mut() {
            if import.class_package.matches(fixup.old_package) && import.class_name.matches(fixup.old_class) {
                import.class_package = Name::new(fixup.new_package);
                import.class_name = Name::new(fixup.new_class);
                changed += 1;
            }

            let in_old_package = import
                .outer_index
                .import_index()
                .and_then(|o| packages.get(o).copied())
                .unwrap_or(false);
            if in_old_package
                && fixup.old_package == fixup.new_package
                && import.class_name.matches(CLASS_CLASS)
                && import.object_name.matches(fixup.old_class)
            {
                import.object_name = Name::new(fixup.new_class);
                changed += 1;
            }
        }
    }
    if changed > 0 {
        debug!(changed, file_version, "applied import fixups");
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{PackageIndex, PACKAGE_CLASS, PACKAGE_FILE_VERSION};

    fn table() -> Vec<ObjectImport> {
        vec![
            ObjectImport::new(Name::new("Core"), Name::new(PACKAGE_CLASS), PackageIndex::ROOT, Name::new("Core")),
            ObjectImport::new(Name::new("Core"), Name::new("Class"), PackageIndex::from_import(0), Name::new("Redirector")),
            ObjectImport::new(Name::new("Core"), Name::new("Redirector"), PackageIndex::from_import(3), Name::new("OldMesh")),
            ObjectImport::new(Name::new("Core"), Name::new(PACKAGE_CLASS), PackageIndex::ROOT, Name::new("Props")),
            ObjectImport::new(Name::new("Engine"), Name::new("PackageRedirector"), PackageIndex::from_import(3), Name::new("Moved")),
        ]
    }

    #[test]
    fn test_old_files_are_rewritten() {
        let mut imports = table();
        let changed = fixup_imports(&mut imports, VER_MERGED_REDIRECTOR_CLASSES - 1);
        assert_eq!(changed, 3);
        assert_eq!(imports[1].object_name, Name::new(REDIRECTOR_CLASS));
        assert_eq!(imports[2].class_name, Name::new(REDIRECTOR_CLASS));
        assert_eq!(imports[4].class_package, Name::new(CORE_PACKAGE));
        assert_eq!(imports[4].class_name, Name::new(REDIRECTOR_CLASS));
    }

    #[test]
    fn test_current_files_untouched() {
        let mut imports = table();
        assert_eq!(fixup_imports(&mut imports, PACKAGE_FILE_VERSION), 0);
        assert_eq!(imports, table());
    }
}
