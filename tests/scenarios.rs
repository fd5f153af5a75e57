//! Cross-package loading, redirectors, archetypes and failure handling.

mod common;

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use common::*;
use fxhash::FxHashSet;
use pkglink::format::ENGINE_VERSION;
use pkglink::io::ReaderOptions;
use pkglink::prelude::*;

use tempfile::TempDir;

#[test]
fn test_cross_package_import() {
    let dir = TempDir::new().expect("temp dir");
    let mut objects = host_space();
    build_props(&mut objects);
    // A second reference to the same foreign object.
    let brick = find_path(&objects, "Textures.Brick").expect("Brick");
    let cushion = find_path(&objects, "Props.Cushion").expect("Cushion");
    if let Some(o) = objects.get_mut(cushion) {
        o.references.push(brick);
    }
    save(&mut objects, "Textures", dir.path(), &SaveOptions::new());
    save(&mut objects, "Props", dir.path(), &SaveOptions::new());

    let mut session = session(dir.path());
    session.load_package("Props").expect("load Props");

    let textures = session.find_linker("Textures").expect("imported package gets its own linker");
    let props = session.find_linker("Props").expect("Props linker");
    let source_export = session.linker(textures).and_then(|l| l.find_export_by_path("Brick"));
    assert!(source_export.is_some());
    let linker = session.linker(props).expect("registered");
    let import = linker
        .imports()
        .iter()
        .find(|i| i.object_name.to_string() == "Brick")
        .expect("Brick import");
    assert_eq!(import.source_linker, Some(textures));
    assert_eq!(import.source_index, source_export);

    let objects = session.objects();
    assert_eq!(reference_paths(objects, "Props.Chair"), vec!["Props.Cushion", "Textures.Brick"]);
    assert_eq!(reference_paths(objects, "Props.Cushion"), vec!["Textures.Brick"]);
    assert_eq!(properties(objects, "Textures.Brick"), b"brick-pixels");
    assert_eq!(reference_paths(objects, "Props.Chair.Leg"), vec!["Props.Chair"]);
    assert_eq!(session.stats().linkers_created, 2);
    // Five Props bodies and Brick once, despite two references to it.
    assert_eq!(session.stats().bodies_read, 6);

    let brick = find_path(session.objects(), "Textures.Brick");
    assert_eq!(session.load_object("Textures", "Brick").expect("load Brick"), brick);
    assert_eq!(session.stats().bodies_read, 6);
}

#[test]
fn test_redirector_is_followed() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    // Brick was renamed after Props was saved; a redirector keeps the old name.
    let mut objects = host_space();
    let textures = objects.create_package("Textures");
    let renamed = object(&mut objects, "Texture", textures, "BrickNew", b"new-pixels", vec![]);
    objects.create_redirector(textures, Name::new("Brick"), renamed);
    save(&mut objects, "Textures", dir.path(), &SaveOptions::new());

    let mut session = session(dir.path());
    session.load_package("Props").expect("load Props");
    assert_eq!(reference_paths(session.objects(), "Props.Chair"), vec!["Props.Cushion", "Textures.BrickNew"]);
    assert_eq!(properties(session.objects(), "Textures.BrickNew"), b"new-pixels");
    assert!(session.stats().redirectors_followed >= 1);

    let direct = session.load_object("Textures", "Brick").expect("load redirector");
    assert_eq!(direct, find_path(session.objects(), "Textures.BrickNew"));
}

#[test]
fn test_redirector_to_other_class_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let mut objects = host_space();
    let textures = objects.create_package("Textures");
    let light = object(&mut objects, "Light", textures, "NotATexture", b"", vec![]);
    objects.create_redirector(textures, Name::new("Brick"), light);
    save(&mut objects, "Textures", dir.path(), &SaveOptions::new());

    let mut strict = session(dir.path());
    assert!(matches!(strict.load_package("Props"), Err(Error::FailedImport { .. })));
}

#[test]
fn test_archetype_and_class_defaults() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let mut session = session(dir.path());
    let id = session.get_package_linker("Props").expect("linker");
    let linker = session.linker(id).expect("registered");
    let lamp_index = linker.find_export_by_path("Lamp1").expect("Lamp1");
    let chair_index = linker.find_export_by_path("Chair").expect("Chair");

    // Before its body is read an object starts from its archetype...
    let lamp = session.create_export(id, lamp_index).expect("create").expect("Lamp1");
    let o = session.objects().get(lamp).expect("live");
    assert_eq!(o.properties, b"template");
    assert!(o.flags.contains(ObjectFlags::NEED_LOAD));
    let template = o.archetype().expect("archetype");
    assert_eq!(session.objects().path_name(template), "Props.LampTemplate");

    // ...or from its class defaults when it has none.
    let chair = session.create_export(id, chair_index).expect("create").expect("Chair");
    assert_eq!(session.objects().get(chair).expect("live").properties, b"mesh-defaults");

    session.preload(lamp).expect("preload");
    let o = session.objects().get(lamp).expect("live");
    assert_eq!(o.properties, b"lamp1-overrides");
    assert!(!o.flags.contains(ObjectFlags::NEED_LOAD));
    assert!(o.flags.contains(ObjectFlags::NEED_POST_LOAD));
}

#[test]
fn test_missing_archetype_uses_class_defaults() {
    let dir = TempDir::new().expect("temp dir");
    let mut objects = host_space();
    let templates = objects.create_package("Templates");
    let template = object(&mut objects, "Light", templates, "Spot", b"spot", vec![]);
    let props = objects.create_package("Props");
    let lamp = object(&mut objects, "Light", props, "Lamp", b"lamp", vec![]);
    objects.set_archetype(lamp, Some(template));
    save(&mut objects, "Props", dir.path(), &SaveOptions::new());

    let config = LinkerConfig::new().with_import_policy(ImportPolicy::Lenient);
    let mut session = session_with(dir.path(), config);
    let id = session.get_package_linker("Props").expect("linker");
    let index = session.linker(id).and_then(|l| l.find_export_by_path("Lamp")).expect("Lamp");
    let lamp = session.create_export(id, index).expect("create").expect("Lamp");
    let o = session.objects().get(lamp).expect("live");
    assert_eq!(o.archetype(), None);
    assert_eq!(o.properties, LIGHT_DEFAULTS);
}

#[test]
fn test_self_archetype_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let mut objects = host_space();
    let props = objects.create_package("Props");
    let lamp = object(&mut objects, "Light", props, "Narcissus", b"", vec![]);
    objects.set_archetype(lamp, Some(lamp));
    save(&mut objects, "Props", dir.path(), &SaveOptions::new());

    let mut session = session(dir.path());
    let err = session.load_package("Props").unwrap_err();
    assert!(matches!(err, Error::ArchetypeCycle(ref path) if path == "Props.Narcissus"));
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn test_create_is_idempotent() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let mut session = session(dir.path());
    let id = session.get_package_linker("Props").expect("linker");
    let linker = session.linker(id).expect("registered");
    let chair_index = linker.find_export_by_path("Chair").expect("Chair");
    let brick_index = linker
        .imports()
        .iter()
        .position(|i| i.object_name.to_string() == "Brick")
        .expect("Brick import");

    let first = session.create_export(id, chair_index).expect("create");
    let second = session.create_export(id, chair_index).expect("create");
    assert!(first.is_some());
    assert_eq!(first, second);
    assert_eq!(session.stats().bodies_read, 0);

    let chair = first.expect("Chair");
    session.preload(chair).expect("preload");
    session.preload(chair).expect("preload again");
    assert_eq!(session.stats().bodies_read, 1);

    let brick = session.create_import(id, brick_index).expect("import");
    assert_eq!(session.create_import(id, brick_index).expect("import"), brick);
    assert_eq!(brick, find_path(session.objects(), "Textures.Brick"));
    let objects_before = session.objects().len();
    session.create_import(id, brick_index).expect("import");
    assert_eq!(session.objects().len(), objects_before);
}

#[test]
fn test_strict_import_failure_tears_down() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());
    std::fs::remove_file(package_file(dir.path(), "Textures")).expect("remove Textures");

    let mut session = session(dir.path());
    let before = session.objects().len();
    let err = session.load_package("Props").unwrap_err();
    match &err {
        Error::FailedImport { package, .. } => assert_eq!(package, "Props"),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert!(session.find_linker("Props").is_none());
    assert!(session.objects().find_package("Props").is_none());
    assert_eq!(session.objects().len(), before);
}

#[test]
fn test_lenient_import_failure_leaves_null() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());
    std::fs::remove_file(package_file(dir.path(), "Textures")).expect("remove Textures");

    let config = LinkerConfig::new().with_import_policy(ImportPolicy::Lenient);
    let mut session = session_with(dir.path(), config);
    session.load_package("Props").expect("lenient load");
    assert_eq!(reference_paths(session.objects(), "Props.Chair"), vec!["Props.Cushion"]);
    assert_eq!(properties(session.objects(), "Props.Lamp1"), b"lamp1-overrides");
}

#[test]
fn test_serial_size_mismatch_fails_load() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());
    let path = package_file(dir.path(), "Props");
    let offset = {
        let linker = LinkerLoad::load_tables(&path, ReaderOptions::new().use_mmap(false)).expect("tables");
        let index = linker.find_export_by_path("Cushion").expect("Cushion");
        linker.exports()[index].serial_offset as usize
    };
    // Claim a property image far larger than the recorded body.
    let mut bytes = std::fs::read(&path).expect("read");
    bytes[offset..offset + 4].copy_from_slice(&0x0001_0000i32.to_le_bytes());
    std::fs::write(&path, &bytes).expect("write");

    let mut session = session(dir.path());
    let err = session.load_package("Props").unwrap_err();
    match err {
        Error::SerialSizeMismatch { export, .. } => assert_eq!(export, "Props.Cushion"),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(session.find_linker("Props").is_none());
    assert!(find_path(session.objects(), "Props").is_none());
    assert!(!session.objects().iter().any(|(_, o)| o.name().to_string() == "Cushion"));
}

#[test]
fn test_bad_tag_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    std::fs::write(package_file(dir.path(), "Junk"), b"this is not a package at all").expect("write");
    let mut session = session(dir.path());
    let err = session.load_package("Junk").unwrap_err();
    assert!(matches!(err, Error::BadTag(_)));
    assert_eq!(err.kind(), ErrorKind::Format);
    assert!(session.find_linker("Junk").is_none());
}

#[test]
fn test_missing_package() {
    let dir = TempDir::new().expect("temp dir");
    let mut session = session(dir.path());
    assert!(matches!(session.load_package("Nowhere"), Err(Error::PackageNotFound(_))));
}

#[test]
fn test_post_load_hooks_run_once_archetype_first() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let calls: Arc<Mutex<Vec<(String, bool)>>> = Arc::default();
    let record = Arc::clone(&calls);
    let mut session = session(dir.path());
    session.objects_mut().register_post_load(
        "Light",
        move |session: &mut LoadSession, object: ObjectId| -> pkglink::Result<()> {
            let flags = session.objects().get(object).map(|o| o.flags).unwrap_or_default();
            let path = session.objects().path_name(object);
            record
                .lock()
                .expect("lock")
                .push((path, flags.contains(ObjectFlags::POST_LOADING)));
            // Hooks may pull in more objects.
            let brick = session.load_object("Textures", "Brick")?;
            assert!(brick.is_some());
            Ok(())
        },
    );
    session.load_package("Props").expect("load Props");

    let calls = calls.lock().expect("lock").clone();
    assert_eq!(
        calls,
        vec![("Props.LampTemplate".to_string(), true), ("Props.Lamp1".to_string(), true)]
    );
    for (_, o) in session.objects().iter() {
        assert!(!o.has_any_flags(ObjectFlags::NEED_LOAD | ObjectFlags::NEED_POST_LOAD | ObjectFlags::POST_LOADING));
    }
}

#[test]
fn test_gather_export_dependencies() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let mut session = session(dir.path());
    let props = session.get_package_linker("Props").expect("linker");
    let leg = session.linker(props).and_then(|l| l.find_export_by_path("Chair.Leg")).expect("Leg");
    let mut deps = FxHashSet::default();
    session.gather_export_dependencies(props, leg, &mut deps).expect("gather");

    let textures = session.find_linker("Textures").expect("Textures linker");
    let chair = session.linker(props).and_then(|l| l.find_export_by_path("Chair")).expect("Chair");
    let cushion = session.linker(props).and_then(|l| l.find_export_by_path("Cushion")).expect("Cushion");
    let brick = session.linker(textures).and_then(|l| l.find_export_by_path("Brick")).expect("Brick");
    assert!(deps.contains(&(props, chair)));
    assert!(deps.contains(&(props, cushion)));
    assert!(deps.contains(&(textures, brick)));
    assert_eq!(session.stats().bodies_read, 0);
}

#[test]
fn test_load_object_by_path() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let mut session = session(dir.path());
    let leg = session.load_object("Props", "Chair.Leg").expect("load").expect("Leg");
    assert_eq!(session.objects().path_name(leg), "Props.Chair.Leg");
    assert_eq!(session.objects().get(leg).map(|o| o.properties.clone()), Some(b"leg".to_vec()));
    assert!(session.loaded_objects().is_empty());
    assert_eq!(session.load_object("Props", "Chair.Arm").expect("lookup"), None);
}

#[test]
fn test_reset_loaders_keeps_objects() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let mut session = session(dir.path());
    session.load_package("Props").expect("load");
    let chair = find_path(session.objects(), "Props.Chair").expect("Chair");
    assert!(session.objects().get(chair).and_then(|o| o.linker()).is_some());

    assert!(session.reset_loader("Textures"));
    assert!(!session.reset_loader("Textures"));
    assert_eq!(session.reset_loaders(), 1);
    assert_eq!(session.linkers().count(), 0);
    assert_eq!(session.objects().get(chair).and_then(|o| o.linker()), None);
    assert_eq!(properties(session.objects(), "Props.Chair"), b"chair");

    // A fresh linker binds to the objects already in memory.
    let id = session.get_package_linker("Props").expect("relink");
    let index = session.linker(id).and_then(|l| l.find_export_by_path("Chair")).expect("Chair");
    assert_eq!(session.create_export(id, index).expect("create"), Some(chair));
}

#[test]
fn test_session_hands_back_objects() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());
    let mut session = session(dir.path());
    session.load_package("Props").expect("load");
    let objects = session.into_objects();
    assert!(find_path(&objects, "Props.Chair.Leg").is_some());
}

#[test]
fn test_self_contained_package_has_no_imports() {
    let dir = TempDir::new().expect("temp dir");
    let mut objects = host_space();
    let gizmos = objects.create_package("Gizmos");
    let gadget = objects.define_class(gizmos, "Gadget", None, b"gadget-defaults".to_vec());
    for (name, props) in [("AGadget", &b"instance"[..]), ("Settings", &b"scalar"[..])] {
        let id = objects.create_object(gadget, gizmos, Name::new(name), ObjectFlags::PUBLIC);
        if let Some(o) = objects.get_mut(id) {
            o.properties = props.to_vec();
        }
    }
    save(&mut objects, "Gizmos", dir.path(), &SaveOptions::new());

    let linker = LinkerLoad::load_tables(package_file(dir.path(), "Gizmos"), ReaderOptions::new()).expect("tables");
    assert!(linker.imports().is_empty());
    assert_eq!(linker.exports().len(), 3);

    let mut session = session(dir.path());
    session.load_package("Gizmos").expect("load");
    let loaded = session.objects();
    let class = find_path(loaded, "Gizmos.Gadget").expect("class");
    let instance = find_path(loaded, "Gizmos.AGadget").expect("instance");
    assert!(loaded.is_class(class));
    assert_eq!(loaded.get(instance).map(|o| o.class()), Some(class));
    assert_eq!(properties(loaded, "Gizmos.AGadget"), b"instance");
    assert_eq!(properties(loaded, "Gizmos.Settings"), b"scalar");
}

#[test]
fn test_table_ticks_resume_without_rereading() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());
    let path = package_file(dir.path(), "Props");
    let reference = LinkerLoad::load_tables(&path, ReaderOptions::new()).expect("tables");

    let mut linker = LinkerLoad::new("Props", &path, ReaderOptions::new());
    let mut ticks = 0;
    let mut last_phase = linker.phase();
    loop {
        let mut budget = TimeBudget::new(Duration::ZERO).with_granularity(1);
        let status = linker.tick_tables(&mut budget).expect("tick");
        ticks += 1;
        assert!(linker.phase() >= last_phase);
        last_phase = linker.phase();
        if status.is_done() {
            break;
        }
        assert!(ticks < 10_000, "tick made no progress");
    }
    assert!(ticks > 10, "a zero budget should need many ticks, took {}", ticks);
    assert_eq!(linker.records_read(), reference.records_read());
    assert_eq!(linker.names().len(), reference.names().len());
    assert_eq!(linker.exports().len(), reference.exports().len());
    for i in 0..linker.exports().len() {
        assert_eq!(linker.export_path_name(i), reference.export_path_name(i));
        assert_eq!(linker.find_export_by_path(&linker.export_path_name(i)["Props.".len()..]), Some(i));
    }
}

#[test]
fn test_serial_range_past_end_of_file_fails_load() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());
    let path = package_file(dir.path(), "Props");
    let (table_offset, table) = {
        let linker = LinkerLoad::load_tables(&path, ReaderOptions::new().use_mmap(false)).expect("tables");
        let index = linker.find_export_by_path("Cushion").expect("Cushion");
        let mut exports = linker.exports().to_vec();
        exports[index].serial_size = i32::MAX;
        let mut table = Vec::new();
        for export in &exports {
            export.write(&mut table, false, linker.names()).expect("encode export");
        }
        (linker.summary().export_offset as usize, table)
    };
    let mut bytes = std::fs::read(&path).expect("read");
    bytes[table_offset..table_offset + table.len()].copy_from_slice(&table);
    std::fs::write(&path, &bytes).expect("write");

    let mut session = session(dir.path());
    match session.load_package("Props").unwrap_err() {
        Error::SerialSizeMismatch { export, expected, actual } => {
            assert_eq!(export, "Props.Cushion");
            assert_eq!(expected, i32::MAX as i64);
            assert!(actual < expected);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(session.find_linker("Props").is_none());
}

#[test]
fn test_negative_chunk_directory_is_corruption() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new().compressed(CompressionFlags::ZLIB));
    let path = package_file(dir.path(), "Props");
    let mut bytes = std::fs::read(&path).expect("read");
    let (mut summary, swap) = PackageSummary::read(&mut Cursor::new(&bytes)).expect("summary");
    assert!(summary.compressed_chunks.len() >= 2);
    summary.compressed_chunks[0].uncompressed_offset = -1;
    let mut patched = Vec::new();
    summary.write(&mut patched, swap).expect("encode summary");
    bytes[..patched.len()].copy_from_slice(&patched);
    std::fs::write(&path, &bytes).expect("write");

    let err = LinkerLoad::load_tables(&path, ReaderOptions::new()).err().expect("corrupt chunk map");
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn test_imports_required_in_memory() {
    let dir = TempDir::new().expect("temp dir");
    let mut options = SaveOptions::new();
    options.package_flags = PackageFlags::REQUIRE_IMPORTS_ALREADY_LOADED;
    save_props(dir.path(), &options);

    // Textures is on disk but never opened on Props' behalf.
    let mut session = session(dir.path());
    match session.load_package("Props").unwrap_err() {
        Error::FailedImport { package, .. } => assert_eq!(package, "Props"),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(session.find_linker("Textures").is_none());
    assert_eq!(session.stats().imports_verified, 0);

    let mut session = session_with(dir.path(), LinkerConfig::new());
    session.load_package("Textures").expect("load Textures");
    let verified = session.stats().imports_verified;
    session.load_package("Props").expect("load Props");
    assert_eq!(session.stats().imports_verified, verified);
    assert_eq!(reference_paths(session.objects(), "Props.Chair"), vec!["Props.Cushion", "Textures.Brick"]);
}

#[test]
fn test_newer_engine_version_is_flagged() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());
    let path = package_file(dir.path(), "Props");
    let mut bytes = std::fs::read(&path).expect("read");
    let (mut summary, swap) = PackageSummary::read(&mut Cursor::new(&bytes)).expect("summary");
    summary.engine_version = ENGINE_VERSION + 1;
    let mut patched = Vec::new();
    summary.write(&mut patched, swap).expect("encode summary");
    bytes[..patched.len()].copy_from_slice(&patched);
    std::fs::write(&path, &bytes).expect("write");

    let mut session = session(dir.path());
    session.load_package("Props").expect("newer packages still load");
    let props = session.find_linker("Props").expect("Props linker");
    let flags = session.linker(props).map(|l| l.summary().package_flags).expect("registered");
    assert!(flags.contains(PackageFlags::SAVED_WITH_NEWER_VERSION));

    let textures = session.find_linker("Textures").expect("Textures linker");
    let flags = session.linker(textures).map(|l| l.summary().package_flags).expect("registered");
    assert!(!flags.contains(PackageFlags::SAVED_WITH_NEWER_VERSION));
}

#[test]
fn test_live_objects_satisfy_imports() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let mut config = LinkerConfig::new();
    config.probe_live_objects = true;
    config.verify_imports = false;
    let mut session = session_with(dir.path(), config.clone());
    let textures = session.objects_mut().create_package("Textures");
    let resident = object(session.objects_mut(), "Texture", textures, "Brick", b"resident", vec![]);

    session.load_package("Props").expect("load Props");
    assert!(session.find_linker("Textures").is_none());
    assert_eq!(session.stats().linkers_created, 1);
    assert_eq!(find_path(session.objects(), "Textures.Brick"), Some(resident));
    assert_eq!(reference_paths(session.objects(), "Props.Chair"), vec!["Props.Cushion", "Textures.Brick"]);
    assert_eq!(properties(session.objects(), "Textures.Brick"), b"resident");

    // Without probing the import goes through the Textures file.
    config.probe_live_objects = false;
    let mut session = session_with(dir.path(), config);
    let textures = session.objects_mut().create_package("Textures");
    object(session.objects_mut(), "Texture", textures, "Brick", b"resident", vec![]);
    session.load_package("Props").expect("load Props");
    assert!(session.find_linker("Textures").is_some());
}
