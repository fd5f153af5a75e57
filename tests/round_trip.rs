//! Save packages, load them into a fresh object space and compare.

mod common;

use common::*;
use pkglink::core::CompressionFlags;
use pkglink::format::{PackageIndex, Resource};
use pkglink::io::ReaderOptions;
use pkglink::prelude::*;

use tempfile::TempDir;

/// Everything the linker promises to restore for one object.
#[derive(Debug, PartialEq)]
struct Snapshot {
    class: String,
    properties: Vec<u8>,
    references: Vec<String>,
    archetype: Option<String>,
    flags: u32,
}

fn snapshot(objects: &ObjectSpace, id: ObjectId) -> Snapshot {
    let o = objects.get(id).expect("live object");
    Snapshot {
        class: objects.path_name(o.class()),
        properties: o.properties.clone(),
        references: o.references.iter().map(|&r| objects.path_name(r)).collect(),
        archetype: o.archetype().map(|a| objects.path_name(a)),
        flags: o.flags.persistent().bits(),
    }
}

fn package_contents(objects: &ObjectSpace, package: &str) -> Vec<(String, Snapshot)> {
    let root = objects.find_package(package).expect("package");
    let mut out: Vec<(String, Snapshot)> = objects
        .iter()
        .filter(|&(id, _)| objects.is_in(id, root))
        .map(|(id, _)| (objects.path_name(id), snapshot(objects, id)))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn assert_isomorphic(options: &SaveOptions) {
    let dir = TempDir::new().expect("temp dir");
    let original = save_props(dir.path(), options);

    let mut session = session(dir.path());
    session.load_package("Props").expect("load Props");

    let expected = package_contents(&original, "Props");
    let loaded = package_contents(session.objects(), "Props");
    assert_eq!(expected.len(), 5);
    assert_eq!(loaded, expected);
}

#[test]
fn test_round_trip_isomorphism() {
    assert_isomorphic(&SaveOptions::new());
}

#[test]
fn test_round_trip_byte_swapped() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new().byte_swapped(true));
    let linker = LinkerLoad::load_tables(package_file(dir.path(), "Props"), ReaderOptions::new()).expect("tables");
    assert!(linker.is_byte_swapped());

    assert_isomorphic(&SaveOptions::new().byte_swapped(true));
}

#[test]
fn test_round_trip_compressed() {
    let dir = TempDir::new().expect("temp dir");
    let options = SaveOptions::new().compressed(CompressionFlags::ZLIB);
    let original = save_props(dir.path(), &options);

    let linker = LinkerLoad::load_tables(package_file(dir.path(), "Props"), ReaderOptions::new()).expect("tables");
    assert!(linker.summary().is_compressed());
    assert!(!linker.summary().compressed_chunks.is_empty());

    let mut session = session(dir.path());
    session.load_package("Props").expect("load compressed Props");
    assert_eq!(package_contents(session.objects(), "Props"), package_contents(&original, "Props"));
}

#[test]
fn test_round_trip_compressed_and_swapped() {
    assert_isomorphic(&SaveOptions::new().compressed(CompressionFlags::ZLIB).byte_swapped(true));
}

#[test]
fn test_round_trip_without_mmap() {
    let dir = TempDir::new().expect("temp dir");
    let original = save_props(dir.path(), &SaveOptions::new());
    let mut config = LinkerConfig::new();
    config.use_mmap = false;
    let mut session = session_with(dir.path(), config);
    session.load_package("Props").expect("load");
    assert_eq!(package_contents(session.objects(), "Props"), package_contents(&original, "Props"));
}

#[test]
fn test_index_invariant() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());
    let linker = LinkerLoad::load_tables(package_file(dir.path(), "Props"), ReaderOptions::new()).expect("tables");
    let (imports, exports) = (linker.imports().len(), linker.exports().len());
    assert!(imports > 0);
    assert_eq!(exports, 5);

    for export in linker.exports() {
        for index in [export.class_index, export.super_index, export.outer_index, export.archetype_index] {
            assert!(index.check(imports, exports).is_ok(), "{} out of range", index);
        }
        assert!(export.serial_size > 0);
    }
    for import in linker.imports() {
        assert!(!import.outer_index.is_export());
        assert!(import.outer_index.check(imports, exports).is_ok());
    }
    for list in linker.depends() {
        for index in list {
            assert!(!index.is_root());
            assert!(index.check(imports, exports).is_ok());
        }
    }
    assert_eq!(linker.depends().len(), exports);
}

#[test]
fn test_dependencies_precede_dependents() {
    let dir = TempDir::new().expect("temp dir");
    let mut objects = host_space();
    build_props(&mut objects);
    // A class defined inside the package, with an instance sorting before it.
    let props = objects.find_package("Props").expect("Props");
    let actor = class(&objects, "Actor");
    let widget = objects.define_class(props, "Widget", Some(actor), b"widget-defaults".to_vec());
    objects.create_object(widget, props, Name::new("AWidget"), ObjectFlags::PUBLIC);
    save(&mut objects, "Textures", dir.path(), &SaveOptions::new());
    save(&mut objects, "Props", dir.path(), &SaveOptions::new());

    let linker = LinkerLoad::load_tables(package_file(dir.path(), "Props"), ReaderOptions::new()).expect("tables");
    for (i, export) in linker.exports().iter().enumerate() {
        for index in [export.class_index, export.outer_index, export.archetype_index, export.super_index] {
            if let Resource::Export(dependency) = index.resource() {
                assert!(
                    dependency < i,
                    "{} comes after its dependency {}",
                    linker.export_path_name(i),
                    linker.export_path_name(dependency)
                );
            }
        }
    }
    // Classes come first.
    assert!(linker.exports()[0].is_class());
    assert_eq!(linker.export_path_name(0), "Props.Widget");

    let mut session = session(dir.path());
    session.load_package("Props").expect("load");
    let loaded = session.objects();
    assert_eq!(properties(loaded, "Props.AWidget"), b"widget-defaults");
    let widget = find_path(loaded, "Props.Widget").expect("class");
    assert!(loaded.is_class(widget));
    assert!(loaded.is_child_of(widget, class(loaded, "Actor")));
}

#[test]
fn test_depends_table_lists_body_references() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());
    let linker = LinkerLoad::load_tables(package_file(dir.path(), "Props"), ReaderOptions::new()).expect("tables");
    let chair = linker.find_export_by_path("Chair").expect("Chair");
    let depends: Vec<String> = linker.depends()[chair].iter().map(|&d| linker.index_path_name(d)).collect();
    assert!(depends.contains(&"Props.Cushion".to_string()));
    assert!(depends.contains(&"Textures.Brick".to_string()));
    assert!(depends.contains(&"Engine.StaticMesh".to_string()));
}

#[test]
fn test_conform_keeps_previous_order() {
    let dir = TempDir::new().expect("temp dir");
    let old_dir = TempDir::new().expect("temp dir");
    let mut objects = save_props(old_dir.path(), &SaveOptions::new());
    let first = LinkerLoad::load_tables(package_file(old_dir.path(), "Props"), ReaderOptions::new()).expect("tables");

    // A new object whose name sorts before everything else.
    let props = objects.find_package("Props").expect("Props");
    object(&mut objects, "StaticMesh", props, "Aardvark", b"new", vec![]);
    let options = SaveOptions::new().conform_to(package_file(old_dir.path(), "Props"));
    let report = save(&mut objects, "Props", dir.path(), &options);

    let old_paths: Vec<String> = (0..first.exports().len()).map(|i| first.export_path_name(i)).collect();
    assert_eq!(report.exports.len(), old_paths.len() + 1);
    assert_eq!(&report.exports[..old_paths.len()], &old_paths[..]);
    assert_eq!(report.exports.last().map(String::as_str), Some("Props.Aardvark"));

    let old_names: Vec<&str> = first.names().iter().collect();
    let second = LinkerLoad::load_tables(package_file(dir.path(), "Props"), ReaderOptions::new()).expect("tables");
    let new_names: Vec<&str> = second.names().iter().collect();
    assert_eq!(&new_names[..old_names.len()], &old_names[..]);

    // Same identity, one more generation.
    assert_eq!(second.summary().guid, first.summary().guid);
    assert_eq!(second.summary().generations.len(), first.summary().generations.len() + 1);
}

#[test]
fn test_unconformed_saves_get_new_guid() {
    let a = TempDir::new().expect("temp dir");
    let b = TempDir::new().expect("temp dir");
    save_props(a.path(), &SaveOptions::new());
    save_props(b.path(), &SaveOptions::new());
    let first = LinkerLoad::load_tables(package_file(a.path(), "Props"), ReaderOptions::new()).expect("tables");
    let second = LinkerLoad::load_tables(package_file(b.path(), "Props"), ReaderOptions::new()).expect("tables");
    assert!(first.summary().guid.is_valid());
    assert_ne!(first.summary().guid, second.summary().guid);
    assert_eq!(first.summary().generations.len(), 1);
}

#[test]
fn test_transient_objects_are_not_saved() {
    let dir = TempDir::new().expect("temp dir");
    let mut objects = host_space();
    build_props(&mut objects);
    let props = objects.find_package("Props").expect("Props");
    let scratch = object(&mut objects, "StaticMesh", props, "Scratch", b"temp", vec![]);
    if let Some(o) = objects.get_mut(scratch) {
        o.flags.insert(ObjectFlags::TRANSIENT);
    }
    save(&mut objects, "Textures", dir.path(), &SaveOptions::new());
    let report = save(&mut objects, "Props", dir.path(), &SaveOptions::new());
    assert!(!report.exports.iter().any(|p| p == "Props.Scratch"));
    assert_eq!(report.summary.export_count as usize, report.exports.len());
}

#[test]
fn test_pre_save_hook_objects_are_tagged() {
    let dir = TempDir::new().expect("temp dir");
    let mut objects = host_space();
    build_props(&mut objects);
    objects.register_pre_save("Light", |objects: &mut ObjectSpace, light: ObjectId| -> pkglink::Result<()> {
        let class = objects.find_class("Engine", "Texture").expect("Texture");
        let name = Name::new(format!("{}Shadow", objects.get(light).map(|o| o.name().to_string()).unwrap_or_default()));
        objects.create_object(class, light, name, ObjectFlags::PUBLIC);
        Ok(())
    });
    save(&mut objects, "Textures", dir.path(), &SaveOptions::new());
    let report = save(&mut objects, "Props", dir.path(), &SaveOptions::new());
    assert!(report.exports.iter().any(|p| p == "Props.Lamp1.Lamp1Shadow"));
    assert!(report.exports.iter().any(|p| p == "Props.LampTemplate.LampTemplateShadow"));
}

#[test]
fn test_root_index_is_package() {
    assert!(PackageIndex::ROOT.is_root());
    assert_eq!(PackageIndex::from_export(0).raw(), 1);
    assert_eq!(PackageIndex::from_import(0).raw(), -1);
}
