//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use pkglink::prelude::*;

pub const ACTOR_DEFAULTS: &[u8] = b"actor-defaults";
pub const LIGHT_DEFAULTS: &[u8] = b"light-defaults";

/// Object space with the host-defined `Engine` classes every test uses.
pub fn host_space() -> ObjectSpace {
    let mut objects = ObjectSpace::new();
    let engine = objects.create_package("Engine");
    let actor = objects.define_class(engine, "Actor", None, ACTOR_DEFAULTS.to_vec());
    objects.define_class(engine, "StaticMesh", Some(actor), b"mesh-defaults".to_vec());
    objects.define_class(engine, "Texture", None, b"texture-defaults".to_vec());
    objects.define_class(engine, "Light", Some(actor), LIGHT_DEFAULTS.to_vec());
    objects
}

pub fn class(objects: &ObjectSpace, name: &str) -> ObjectId {
    objects.find_class("Engine", name).expect("host class")
}

/// Create an object with the given properties and references.
pub fn object(
    objects: &mut ObjectSpace,
    class_name: &str,
    outer: ObjectId,
    name: &str,
    properties: &[u8],
    references: Vec<ObjectId>,
) -> ObjectId {
    let class = class(objects, class_name);
    let id = objects.create_object(class, outer, Name::new(name), ObjectFlags::PUBLIC | ObjectFlags::STANDALONE);
    let o = objects.get_mut(id).expect("created");
    o.properties = properties.to_vec();
    o.references = references;
    id
}

/// Path of `name` inside `dir`.
pub fn package_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.pkg", name))
}

/// Save `package` from `objects` into `dir`.
pub fn save(objects: &mut ObjectSpace, package: &str, dir: &Path, options: &SaveOptions) -> SaveReport {
    let id = objects.find_package(package).expect("package in memory");
    save_package(objects, id, None, package_file(dir, package), options).expect("save")
}

/// `Textures` with one brick texture, and `Props` referencing it.
///
/// `Props` holds `Chair` (with a nested `Leg`), `Cushion`, `LampTemplate`
/// and `Lamp1`, whose archetype is the template.
pub fn build_props(objects: &mut ObjectSpace) {
    let textures = objects.create_package("Textures");
    let brick = object(objects, "Texture", textures, "Brick", b"brick-pixels", vec![]);

    let props = objects.create_package("Props");
    let cushion = object(objects, "StaticMesh", props, "Cushion", b"cushion", vec![]);
    let chair = object(objects, "StaticMesh", props, "Chair", b"chair", vec![cushion, brick]);
    object(objects, "StaticMesh", chair, "Leg", b"leg", vec![chair]);

    let template = object(objects, "Light", props, "LampTemplate", b"template", vec![]);
    if let Some(o) = objects.get_mut(template) {
        o.flags.insert(ObjectFlags::ARCHETYPE);
    }
    let lamp = object(objects, "Light", props, "Lamp1", b"lamp1-overrides", vec![]);
    objects.set_archetype(lamp, Some(template));
}

/// Build and save `Textures` and `Props` into `dir`.
pub fn save_props(dir: &Path, options: &SaveOptions) -> ObjectSpace {
    let mut objects = host_space();
    build_props(&mut objects);
    save(&mut objects, "Textures", dir, &SaveOptions::new());
    save(&mut objects, "Props", dir, options);
    objects
}

/// Fresh session over the host classes searching `dir`.
pub fn session(dir: &Path) -> LoadSession {
    session_with(dir, LinkerConfig::new())
}

pub fn session_with(dir: &Path, config: LinkerConfig) -> LoadSession {
    LoadSession::with_objects(host_space(), config.with_search_path(dir))
}

/// Object at dotted `path` (e.g. `Props.Chair.Leg`).
pub fn find_path(objects: &ObjectSpace, path: &str) -> Option<ObjectId> {
    let mut parts = path.split('.');
    let mut current = objects.find_package(parts.next()?)?;
    for part in parts {
        current = objects
            .iter()
            .find(|(_, o)| o.outer() == Some(current) && o.name().to_string() == part)
            .map(|(id, _)| id)?;
    }
    Some(current)
}

pub fn properties(objects: &ObjectSpace, path: &str) -> Vec<u8> {
    let id = find_path(objects, path).unwrap_or_else(|| panic!("{} not loaded", path));
    objects.get(id).map(|o| o.properties.clone()).unwrap_or_default()
}

pub fn reference_paths(objects: &ObjectSpace, path: &str) -> Vec<String> {
    let id = find_path(objects, path).unwrap_or_else(|| panic!("{} not loaded", path));
    objects
        .get(id)
        .map(|o| o.references.iter().map(|&r| objects.path_name(r)).collect())
        .unwrap_or_default()
}
