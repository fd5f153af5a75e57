//! Package saving.
//!
//! Saving runs in these steps:
//!
//! 1. Tag exports and imports reachable from the roots, run pre-save
//!    hooks, tag again
//! 2. Sort names, imports and exports (optionally conforming to an older
//!    file), then order exports dependencies-first
//! 3. Write summary placeholder, tables, depends map and bodies
//! 4. Seek back and rewrite the summary and export table
//! 5. Optionally compress everything after the summary

mod tag;
mod order;
mod compress;
mod writer;

pub use compress::compress_package;

use std::ops::Range;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use fxhash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::SaveOptions;
use crate::format::{
    ExportBody, ExportFlags, GenerationInfo, ObjectExport, ObjectImport, PackageFlags, PackageIndex, PackageSummary,
};
use crate::io::{OStream, ReaderOptions};
use crate::object::{ObjectId, ObjectSpace};
use crate::util::{Error, Guid, Name, NameTable, Result};

use super::LinkerLoad;
use order::{conform_order, sort_dependencies_first};
use tag::{tag_package, TagSet};
use writer::PackageWriter;

/// What a save produced.
#[derive(Debug, Clone)]
pub struct SaveReport {
    /// Summary as written to disk.
    pub summary: PackageSummary,
    /// Export paths in table order.
    pub exports: Vec<String>,
    /// Import full names in table order.
    pub imports: Vec<String>,
    pub bytes_written: u64,
}

/// Save `package` to `path`.
///
/// `base`, when given, is an extra root; see [`SaveOptions::top_level_flags`]
/// for how the other roots are chosen.
pub fn save_package(
    objects: &mut ObjectSpace,
    package: ObjectId,
    base: Option<ObjectId>,
    path: impl AsRef<Path>,
    options: &SaveOptions,
) -> Result<SaveReport> {
    let path = path.as_ref();
    if !objects.is_package(package) {
        return Err(Error::other(format!("{} is not a package", objects.path_name(package))));
    }
    let previous = options
        .conform
        .as_ref()
        .map(|p| LinkerLoad::load_tables(p, ReaderOptions::new()))
        .transpose()?;

    let first = tag_package(objects, package, base, options.top_level_flags);
    for &id in &first.exports {
        if let Some(hook) = objects.pre_save_hook(id) {
            hook.pre_save(objects, id)?;
        }
    }
    let tags = tag_package(objects, package, base, options.top_level_flags);
    debug!(
        package = %objects.path_name(package),
        exports = tags.exports.len(),
        imports = tags.imports.len(),
        "tagged package"
    );

    let swap = options.force_byte_swapping;
    let layout = Layout::build(objects, package, &tags, previous.as_ref(), swap);

    let mut summary = PackageSummary {
        folder_name: options.folder_name.clone(),
        package_flags: {
            let mut flags = options.package_flags;
            flags.remove(PackageFlags::STORE_COMPRESSED);
            flags
        },
        ..PackageSummary::default()
    };
    if let Some(previous) = &previous {
        summary.generations = previous.summary().generations.clone();
    }
    summary.generations.push(GenerationInfo {
        export_count: layout.exports.len() as i32,
        name_count: layout.names.len() as i32,
        net_object_count: 0,
    });

    let mut writer = PackageWriter::new(OStream::memory(), swap);
    writer.write_summary(&summary)?;
    writer.write_names(&mut summary, &layout.names)?;
    writer.write_imports(&mut summary, &layout.imports, &layout.names)?;
    writer.write_exports(&mut summary, &layout.exports, &layout.names)?;
    writer.write_depends(&mut summary, &layout.depends)?;
    summary.total_header_size = writer.pos() as i32;

    let mut exports = layout.exports;
    let mut body_ranges: Vec<Range<usize>> = Vec::with_capacity(exports.len());
    for (export, body) in exports.iter_mut().zip(&layout.bodies) {
        let offset = writer.write_body(body)?;
        export.serial_offset = offset as i32;
        export.serial_size = body.len() as i32;
        body_ranges.push(offset as usize..offset as usize + body.len());
    }

    summary.guid = match &previous {
        Some(previous) => previous.summary().guid,
        None => {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
                .to_le_bytes();
            let name = objects.path_name(package);
            let parts = [name.as_bytes(), &stamp[..]].into_iter().chain(layout.bodies.iter().map(Vec::as_slice));
            Guid::from_content(parts)
        }
    };

    writer.patch_header(&summary, &exports, &layout.names)?;
    let plain = writer.into_bytes();

    let (bytes, summary) = if options.compression.is_none() {
        (plain, summary)
    } else {
        compress_package(&plain, &summary, &body_ranges, options.compression, options.chunk_size, swap)?
    };

    let mut out = OStream::create(path)?;
    out.write_bytes(&bytes)?;
    out.flush_all()?;

    info!(
        path = %path.display(),
        exports = exports.len(),
        imports = layout.imports.len(),
        bytes = bytes.len(),
        compressed = summary.is_compressed(),
        "saved package"
    );
    Ok(SaveReport {
        summary,
        exports: layout.export_paths,
        imports: layout.import_paths,
        bytes_written: bytes.len() as u64,
    })
}

/// Everything needed to write the tables.
struct Layout {
    names: NameTable,
    imports: Vec<ObjectImport>,
    exports: Vec<ObjectExport>,
    depends: Vec<Vec<PackageIndex>>,
    bodies: Vec<Vec<u8>>,
    export_paths: Vec<String>,
    import_paths: Vec<String>,
}

impl Layout {
    fn build(
        objects: &ObjectSpace,
        package: ObjectId,
        tags: &TagSet,
        previous: Option<&LinkerLoad>,
        swap: bool,
    ) -> Layout {
        let package_prefix = format!("{}.", objects.path_name(package));
        let class_name = |id: ObjectId| {
            objects
                .get(id)
                .and_then(|o| objects.get(o.class()))
                .map(|c| c.name().to_string())
                .unwrap_or_default()
        };
        // Path inside the package, then class name to keep keys unique.
        let relative = |id: ObjectId| {
            let path = objects.path_name(id);
            let path = path.strip_prefix(&package_prefix).map(str::to_string).unwrap_or(path);
            format!("{} {}", path, class_name(id))
        };

        // Imports, sorted by full name.
        let mut import_keys: Vec<(String, ObjectId)> = tags.imports.iter().map(|&id| (objects.full_name(id), id)).collect();
        import_keys.sort();
        let mut import_order: Vec<String> = import_keys.iter().map(|(k, _)| k.clone()).collect();
        if let Some(previous) = previous {
            let old: Vec<String> = (0..previous.imports().len()).map(|i| previous.import_full_name(i)).collect();
            import_order = conform_order(import_order, &old);
        }
        let by_key: FxHashMap<&str, ObjectId> = import_keys.iter().map(|(k, id)| (k.as_str(), *id)).collect();
        let imports: Vec<ObjectId> = import_order.iter().filter_map(|k| by_key.get(k.as_str()).copied()).collect();

        // Exports, sorted by path, then dependencies first.
        let mut export_keys: Vec<(String, ObjectId)> = tags.exports.iter().map(|&id| (relative(id), id)).collect();
        export_keys.sort();
        let mut export_order: Vec<String> = export_keys.iter().map(|(k, _)| k.clone()).collect();
        if let Some(previous) = previous {
            let prefix = format!("{}.", previous.package_name());
            let old: Vec<String> = (0..previous.exports().len())
                .map(|i| {
                    let path = previous.export_path_name(i);
                    let path = path.strip_prefix(&prefix).map(str::to_string).unwrap_or(path);
                    format!("{} {}", path, previous.export_class_name(i))
                })
                .collect();
            export_order = conform_order(export_order, &old);
        }
        let by_key: FxHashMap<&str, ObjectId> = export_keys.iter().map(|(k, id)| (k.as_str(), *id)).collect();
        let sorted: Vec<ObjectId> = export_order.iter().filter_map(|k| by_key.get(k.as_str()).copied()).collect();
        let exports = sort_dependencies_first(objects, &sorted, tags);

        let mut index: FxHashMap<ObjectId, PackageIndex> = FxHashMap::default();
        index.insert(package, PackageIndex::ROOT);
        for (i, &id) in imports.iter().enumerate() {
            index.insert(id, PackageIndex::from_import(i));
        }
        for (i, &id) in exports.iter().enumerate() {
            index.insert(id, PackageIndex::from_export(i));
        }
        let index_of = |id: Option<ObjectId>| id.and_then(|id| index.get(&id).copied()).unwrap_or(PackageIndex::ROOT);

        let name_of = |id: ObjectId| objects.get(id).map(|o| o.name().clone()).unwrap_or_else(|| Name::new("None"));
        let import_records: Vec<ObjectImport> = imports
            .iter()
            .map(|&id| {
                let (class, outer) = objects.get(id).map_or((id, None), |o| (o.class(), o.outer()));
                ObjectImport::new(
                    name_of(objects.outermost(class)),
                    name_of(class),
                    index_of(outer),
                    name_of(id),
                )
            })
            .collect();

        let mut export_records = Vec::with_capacity(exports.len());
        let mut bodies = Vec::with_capacity(exports.len());
        let mut depends = Vec::with_capacity(exports.len());
        for &id in &exports {
            let Some(object) = objects.get(id) else { continue };
            let is_class = objects.is_class(id);
            let class_index = if is_class { PackageIndex::ROOT } else { index_of(Some(object.class())) };
            let mut record = ObjectExport::new(object.name().clone(), class_index, index_of(object.outer()));
            if is_class {
                record.super_index = index_of(object.super_struct());
                record.export_flags = ExportFlags::SCRIPT_CLASS;
            }
            record.archetype_index = index_of(object.archetype());
            record.object_flags = object.flags.persistent();

            let mut references = Vec::with_capacity(object.references.len());
            for &target in &object.references {
                match index.get(&target) {
                    Some(&reference) => references.push(reference),
                    None => warn!(
                        export = %objects.path_name(id),
                        target = %objects.path_name(target),
                        "reference to untagged object not saved"
                    ),
                }
            }

            let mut dependencies: Vec<PackageIndex> = Vec::new();
            let candidates = [record.class_index, record.super_index, record.archetype_index]
                .into_iter()
                .chain(references.iter().copied());
            for dependency in candidates {
                if !dependency.is_root() && dependency != PackageIndex::from_export(export_records.len()) && !dependencies.contains(&dependency) {
                    dependencies.push(dependency);
                }
            }

            let body = ExportBody { properties: object.properties.clone(), references };
            bodies.push(body);
            depends.push(dependencies);
            export_records.push(record);
        }

        let mut name_set: Vec<String> = Vec::new();
        let mut add = |name: &Name| name_set.push(name.base().to_string());
        for import in &import_records {
            add(&import.class_package);
            add(&import.class_name);
            add(&import.object_name);
        }
        for export in &export_records {
            add(&export.object_name);
        }
        name_set.sort();
        name_set.dedup();
        if let Some(previous) = previous {
            let old: Vec<String> = previous.names().iter().map(str::to_string).collect();
            name_set = conform_order(name_set, &old);
        }
        let mut names = NameTable::new();
        for name in name_set {
            names.push(name);
        }

        let import_paths = imports.iter().map(|&id| objects.full_name(id)).collect();
        let export_paths = exports.iter().map(|&id| objects.path_name(id)).collect();
        Layout {
            names,
            imports: import_records,
            exports: export_records,
            depends,
            bodies: bodies.iter().map(|b| b.encode(swap)).collect(),
            export_paths,
            import_paths,
        }
    }
}
