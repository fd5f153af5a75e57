//! Object arena with name lookup and the intrinsic `Core` classes.

use std::fmt::Write as _;
use std::sync::Arc;

use fxhash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

use super::{LinkerBinding, Object, ObjectFlags, ObjectId, PostLoad, PreSave};
use crate::format::{CLASS_CLASS, CORE_PACKAGE, PACKAGE_CLASS, REDIRECTOR_CLASS};
use crate::util::Name;

type LookupKey = (Option<ObjectId>, Name);

/// Arena of live objects.
///
/// Created with the `Core` package and its intrinsic classes (`Class`,
/// `Package`, `ObjectRedirector`) already present.
pub struct ObjectSpace {
    slots: Vec<Option<Object>>,
    lookup: FxHashMap<LookupKey, SmallVec<[ObjectId; 2]>>,
    live: usize,
    core_package: ObjectId,
    class_class: ObjectId,
    package_class: ObjectId,
    redirector_class: ObjectId,
    post_load: FxHashMap<String, Arc<dyn PostLoad>>,
    pre_save: FxHashMap<String, Arc<dyn PreSave>>,
}

impl ObjectSpace {
    pub fn new() -> Self {
        let class_class = ObjectId(0);
        let core_package = ObjectId(1);
        let package_class = ObjectId(2);
        let redirector_class = ObjectId(3);

        let mut space = Self {
            slots: Vec::new(),
            lookup: FxHashMap::default(),
            live: 0,
            core_package,
            class_class,
            package_class,
            redirector_class,
            post_load: FxHashMap::default(),
            pre_save: FxHashMap::default(),
        };

        let native = ObjectFlags::PUBLIC | ObjectFlags::STANDALONE | ObjectFlags::NATIVE;
        for (name, class, outer) in [
            (CLASS_CLASS, class_class, Some(core_package)),
            (CORE_PACKAGE, package_class, None),
            (PACKAGE_CLASS, class_class, Some(core_package)),
            (REDIRECTOR_CLASS, class_class, Some(core_package)),
        ] {
            space.insert(Object {
                name: Name::new(name),
                class,
                outer,
                archetype: None,
                super_struct: None,
                linker: None,
                flags: native,
                properties: Vec::new(),
                references: Vec::new(),
            });
        }
        space
    }

    fn insert(&mut self, object: Object) -> ObjectId {
        let id = ObjectId(self.slots.len() as u32);
        self.lookup.entry((object.outer, object.name.clone())).or_default().push(id);
        self.slots.push(Some(object));
        self.live += 1;
        id
    }

    fn unlink(&mut self, id: ObjectId) {
        let Some(object) = self.get(id) else { return };
        let key = (object.outer, object.name.clone());
        if let Some(ids) = self.lookup.get_mut(&key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.lookup.remove(&key);
            }
        }
    }

    #[inline]
    pub fn core_package(&self) -> ObjectId {
        self.core_package
    }

    #[inline]
    pub fn class_class(&self) -> ObjectId {
        self.class_class
    }

    #[inline]
    pub fn package_class(&self) -> ObjectId {
        self.package_class
    }

    #[inline]
    pub fn redirector_class(&self) -> ObjectId {
        self.redirector_class
    }

    #[inline]
    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    #[inline]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &Object)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|o| (ObjectId(i as u32), o)))
    }

    /// Find an object by outer and name, optionally requiring an exact class.
    ///
    /// The most recently created match wins.
    pub fn find_object(&self, outer: Option<ObjectId>, name: &Name, class: Option<ObjectId>) -> Option<ObjectId> {
        let ids = self.lookup.get(&(outer, name.clone()))?;
        ids.iter()
            .rev()
            .copied()
            .find(|&id| class.map_or(true, |c| self.get(id).is_some_and(|o| o.class == c)))
    }

    pub fn find_package(&self, name: &str) -> Option<ObjectId> {
        self.find_object(None, &Name::new(name), Some(self.package_class))
    }

    /// Find a class object by package and class name.
    pub fn find_class(&self, package: &str, class: &str) -> Option<ObjectId> {
        let package = self.find_package(package)?;
        self.find_object(Some(package), &Name::new(class), Some(self.class_class))
    }

    /// Find or create a top-level package.
    pub fn create_package(&mut self, name: &str) -> ObjectId {
        if let Some(id) = self.find_package(name) {
            return id;
        }
        self.insert(Object {
            name: Name::new(name),
            class: self.package_class,
            outer: None,
            archetype: None,
            super_struct: None,
            linker: None,
            flags: ObjectFlags::PUBLIC | ObjectFlags::STANDALONE,
            properties: Vec::new(),
            references: Vec::new(),
        })
    }

    /// Define a host class whose default instance carries `defaults`.
    pub fn define_class(
        &mut self,
        package: ObjectId,
        name: &str,
        super_class: Option<ObjectId>,
        defaults: Vec<u8>,
    ) -> ObjectId {
        let id = self.create_object(
            self.class_class,
            package,
            Name::new(name),
            ObjectFlags::PUBLIC | ObjectFlags::STANDALONE | ObjectFlags::NATIVE,
        );
        if let Some(class) = self.get_mut(id) {
            class.super_struct = super_class;
            class.properties = defaults;
        }
        id
    }

    /// Find or create an object of `class` named `name` inside `outer`.
    pub fn create_object(&mut self, class: ObjectId, outer: ObjectId, name: Name, flags: ObjectFlags) -> ObjectId {
        if let Some(id) = self.find_object(Some(outer), &name, Some(class)) {
            return id;
        }
        let properties = self.class_defaults(class);
        self.insert(Object {
            name,
            class,
            outer: Some(outer),
            archetype: None,
            super_struct: None,
            linker: None,
            flags,
            properties,
            references: Vec::new(),
        })
    }

    /// Create a redirector named `name` inside `outer` pointing at `destination`.
    pub fn create_redirector(&mut self, outer: ObjectId, name: Name, destination: ObjectId) -> ObjectId {
        let id = self.create_object(self.redirector_class, outer, name, ObjectFlags::PUBLIC | ObjectFlags::STANDALONE);
        if let Some(redirector) = self.get_mut(id) {
            redirector.references = vec![destination];
        }
        id
    }

    /// Destination of a redirector object.
    pub fn redirector_destination(&self, id: ObjectId) -> Option<ObjectId> {
        let object = self.get(id)?;
        if object.class != self.redirector_class {
            return None;
        }
        object.references.first().copied()
    }

    /// Allocate a handle for an object whose class and outer are not known yet.
    ///
    /// The object is invisible to lookups until [`ObjectSpace::construct`].
    pub(crate) fn reserve(&mut self, name: Name) -> ObjectId {
        let id = ObjectId(self.slots.len() as u32);
        self.slots.push(Some(Object {
            name,
            class: self.class_class,
            outer: None,
            archetype: None,
            super_struct: None,
            linker: None,
            flags: ObjectFlags::NONE,
            properties: Vec::new(),
            references: Vec::new(),
        }));
        self.live += 1;
        id
    }

    /// Fill in a reserved object and make it visible to lookups.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn construct(
        &mut self,
        id: ObjectId,
        class: ObjectId,
        outer: Option<ObjectId>,
        archetype: Option<ObjectId>,
        flags: ObjectFlags,
        properties: Vec<u8>,
        linker: Option<LinkerBinding>,
    ) {
        let Some(object) = self.get_mut(id) else { return };
        object.class = class;
        object.outer = outer;
        object.archetype = archetype;
        object.flags = flags;
        object.properties = properties;
        object.linker = linker;
        let key = (outer, object.name.clone());
        self.lookup.entry(key).or_default().push(id);
        trace!(object = id.0, "constructed");
    }

    pub(crate) fn set_linker(&mut self, id: ObjectId, linker: Option<LinkerBinding>) {
        if let Some(object) = self.get_mut(id) {
            object.linker = linker;
        }
    }

    pub fn set_super_struct(&mut self, id: ObjectId, super_struct: Option<ObjectId>) {
        if let Some(object) = self.get_mut(id) {
            object.super_struct = super_struct;
        }
    }

    pub fn set_archetype(&mut self, id: ObjectId, archetype: Option<ObjectId>) {
        if let Some(object) = self.get_mut(id) {
            object.archetype = archetype;
        }
    }

    /// Move and/or rename an object.
    pub fn rename(&mut self, id: ObjectId, name: Name, outer: Option<ObjectId>) {
        if !self.contains(id) {
            return;
        }
        self.unlink(id);
        if let Some(object) = self.get_mut(id) {
            object.name = name.clone();
            object.outer = outer;
        }
        self.lookup.entry((outer, name)).or_default().push(id);
    }

    /// Remove an object. Handles to it become dangling.
    pub fn destroy(&mut self, id: ObjectId) {
        if !self.contains(id) {
            return;
        }
        self.unlink(id);
        self.slots[id.index()] = None;
        self.live -= 1;
    }

    #[inline]
    pub fn is_class(&self, id: ObjectId) -> bool {
        self.get(id).is_some_and(|o| o.class == self.class_class)
    }

    #[inline]
    pub fn is_package(&self, id: ObjectId) -> bool {
        self.get(id).is_some_and(|o| o.class == self.package_class)
    }

    /// Whether `class` is `ancestor` or derives from it.
    pub fn is_child_of(&self, class: ObjectId, ancestor: ObjectId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.get(id).and_then(|c| c.super_struct);
        }
        false
    }

    pub fn is_a(&self, object: ObjectId, class: ObjectId) -> bool {
        self.get(object).is_some_and(|o| self.is_child_of(o.class, class))
    }

    /// Top-level package containing `id` (itself for packages).
    pub fn outermost(&self, id: ObjectId) -> ObjectId {
        let mut current = id;
        while let Some(outer) = self.get(current).and_then(|o| o.outer) {
            current = outer;
        }
        current
    }

    /// Whether `id` lives anywhere inside `package`.
    pub fn is_in(&self, id: ObjectId, package: ObjectId) -> bool {
        let mut current = self.get(id).and_then(|o| o.outer);
        while let Some(outer) = current {
            if outer == package {
                return true;
            }
            current = self.get(outer).and_then(|o| o.outer);
        }
        false
    }

    /// Dotted path from the outermost package, e.g. `Pkg.Group.Object`.
    pub fn path_name(&self, id: ObjectId) -> String {
        let mut chain: SmallVec<[ObjectId; 8]> = SmallVec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            chain.push(c);
            current = self.get(c).and_then(|o| o.outer);
        }
        let mut out = String::new();
        for (i, c) in chain.iter().rev().enumerate() {
            if i > 0 {
                out.push('.');
            }
            match self.get(*c) {
                Some(o) => {
                    let _ = write!(out, "{}", o.name);
                }
                None => out.push_str("None"),
            }
        }
        out
    }

    /// Class name followed by the path name.
    pub fn full_name(&self, id: ObjectId) -> String {
        match self.get(id).and_then(|o| self.get(o.class)) {
            Some(class) => format!("{} {}", class.name, self.path_name(id)),
            None => format!("None {}", self.path_name(id)),
        }
    }

    /// Property image of the default instance of `class`.
    pub fn class_defaults(&self, class: ObjectId) -> Vec<u8> {
        self.get(class).map(|c| c.properties.clone()).unwrap_or_default()
    }

    /// Register a post-load hook for objects of the named class and its subclasses.
    pub fn register_post_load(&mut self, class_name: &str, hook: impl PostLoad + 'static) {
        self.post_load.insert(class_name.to_string(), Arc::new(hook));
    }

    /// Register a pre-save hook for objects of the named class and its subclasses.
    pub fn register_pre_save(&mut self, class_name: &str, hook: impl PreSave + 'static) {
        self.pre_save.insert(class_name.to_string(), Arc::new(hook));
    }

    pub fn post_load_hook(&self, object: ObjectId) -> Option<Arc<dyn PostLoad>> {
        self.class_chain_lookup(object, &self.post_load)
    }

    pub fn pre_save_hook(&self, object: ObjectId) -> Option<Arc<dyn PreSave>> {
        self.class_chain_lookup(object, &self.pre_save)
    }

    fn class_chain_lookup<T: ?Sized>(&self, object: ObjectId, hooks: &FxHashMap<String, Arc<T>>) -> Option<Arc<T>> {
        if hooks.is_empty() {
            return None;
        }
        let mut current = self.get(object).map(|o| o.class);
        while let Some(class) = current {
            let c = self.get(class)?;
            if let Some(hook) = hooks.get(c.name.base()) {
                return Some(Arc::clone(hook));
            }
            current = c.super_struct;
        }
        None
    }
}

impl Default for ObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsics() {
        let space = ObjectSpace::new();
        assert_eq!(space.find_package("Core"), Some(space.core_package()));
        assert_eq!(space.find_class("Core", "Class"), Some(space.class_class()));
        assert_eq!(space.find_class("Core", "ObjectRedirector"), Some(space.redirector_class()));
        assert!(space.is_class(space.package_class()));
        assert!(space.is_package(space.core_package()));
        assert_eq!(space.len(), 4);
    }

    #[test]
    fn test_create_object_find_or_create() {
        let mut space = ObjectSpace::new();
        let pkg = space.create_package("Props");
        let class = space.define_class(pkg, "Rock", None, b"mass=1".to_vec());
        let a = space.create_object(class, pkg, Name::new("Rock1"), ObjectFlags::PUBLIC);
        let b = space.create_object(class, pkg, Name::new("Rock1"), ObjectFlags::PUBLIC);
        assert_eq!(a, b);
        assert_eq!(space.get(a).unwrap().properties, b"mass=1");
        assert_eq!(space.path_name(a), "Props.Rock1");
        assert_eq!(space.full_name(a), "Rock Props.Rock1");
        assert!(space.is_in(a, pkg));
        assert_eq!(space.outermost(a), pkg);
    }

    #[test]
    fn test_reserve_is_hidden_until_constructed() {
        let mut space = ObjectSpace::new();
        let pkg = space.create_package("P");
        let id = space.reserve(Name::new("Thing"));
        assert!(space.find_object(Some(pkg), &Name::new("Thing"), None).is_none());
        space.construct(id, space.class_class(), Some(pkg), None, ObjectFlags::PUBLIC, vec![], None);
        assert_eq!(space.find_object(Some(pkg), &Name::new("Thing"), None), Some(id));
    }

    #[test]
    fn test_rename_and_destroy() {
        let mut space = ObjectSpace::new();
        let pkg = space.create_package("P");
        let class = space.define_class(pkg, "C", None, vec![]);
        let id = space.create_object(class, pkg, Name::new("Old"), ObjectFlags::PUBLIC);
        space.rename(id, Name::new("New"), Some(pkg));
        assert!(space.find_object(Some(pkg), &Name::new("Old"), None).is_none());
        assert_eq!(space.find_object(Some(pkg), &Name::new("New"), None), Some(id));
        let before = space.len();
        space.destroy(id);
        assert!(!space.contains(id));
        assert_eq!(space.len(), before - 1);
    }

    #[test]
    fn test_class_hierarchy_and_hooks() {
        let mut space = ObjectSpace::new();
        let pkg = space.create_package("P");
        let base = space.define_class(pkg, "Base", None, vec![]);
        let derived = space.define_class(pkg, "Derived", Some(base), vec![]);
        let obj = space.create_object(derived, pkg, Name::new("O"), ObjectFlags::PUBLIC);
        assert!(space.is_a(obj, base));
        assert!(!space.is_child_of(base, derived));

        space.register_pre_save("Base", |_: &mut ObjectSpace, _: ObjectId| -> crate::util::Result<()> { Ok(()) });
        assert!(space.pre_save_hook(obj).is_some());
        assert!(space.post_load_hook(obj).is_none());
    }

    #[test]
    fn test_redirector() {
        let mut space = ObjectSpace::new();
        let pkg = space.create_package("P");
        let class = space.define_class(pkg, "C", None, vec![]);
        let target = space.create_object(class, pkg, Name::new("Target"), ObjectFlags::PUBLIC);
        let redirector = space.create_redirector(pkg, Name::new("OldName"), target);
        assert_eq!(space.redirector_destination(redirector), Some(target));
        assert_eq!(space.redirector_destination(target), None);
    }
}
