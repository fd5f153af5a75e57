//! Reachability tagging of exports and imports.

use fxhash::FxHashSet;

use crate::object::{ObjectFlags, ObjectId, ObjectSpace};

/// Objects selected for one save, in discovery order.
#[derive(Debug, Default)]
pub(crate) struct TagSet {
    pub exports: Vec<ObjectId>,
    pub imports: Vec<ObjectId>,
    export_set: FxHashSet<ObjectId>,
    import_set: FxHashSet<ObjectId>,
}

impl TagSet {
    #[inline]
    pub fn is_export(&self, id: ObjectId) -> bool {
        self.export_set.contains(&id)
    }

    #[inline]
    pub fn is_import(&self, id: ObjectId) -> bool {
        self.import_set.contains(&id)
    }
}

/// Tag everything reachable from the roots of `package`.
///
/// Roots are `base` plus every object inside the package carrying one of
/// `top_level`. With no base and no flags every object inside the package
/// is a root. Objects inside the package become exports, everything else
/// reachable becomes an import together with its outer chain. Transient
/// objects are never tagged.
pub(crate) fn tag_package(
    objects: &ObjectSpace,
    package: ObjectId,
    base: Option<ObjectId>,
    top_level: ObjectFlags,
) -> TagSet {
    let mut tagger = Tagger { objects, package, tags: TagSet::default(), stack: Vec::new() };
    if let Some(base) = base {
        tagger.visit(base);
    }
    let everything = base.is_none() && top_level.is_empty();
    for (id, object) in objects.iter() {
        if objects.is_in(id, package) && (everything || object.flags.intersects(top_level)) {
            tagger.visit(id);
        }
    }
    while let Some(id) = tagger.stack.pop() {
        tagger.visit_references(id);
    }
    tagger.tags
}

struct Tagger<'a> {
    objects: &'a ObjectSpace,
    package: ObjectId,
    tags: TagSet,
    stack: Vec<ObjectId>,
}

impl Tagger<'_> {
    fn visit(&mut self, id: ObjectId) {
        let Some(object) = self.objects.get(id) else { return };
        if id == self.package || id == self.objects.class_class() {
            return;
        }
        if object.flags.contains(ObjectFlags::TRANSIENT) {
            return;
        }
        if self.objects.is_in(id, self.package) {
            if self.tags.export_set.insert(id) {
                self.tags.exports.push(id);
                self.stack.push(id);
            }
        } else {
            self.tag_import(id);
        }
    }

    fn tag_import(&mut self, id: ObjectId) {
        let mut current = Some(id);
        while let Some(id) = current {
            if !self.tags.import_set.insert(id) {
                break;
            }
            self.tags.imports.push(id);
            current = self.objects.get(id).and_then(|o| o.outer());
        }
    }

    fn visit_references(&mut self, id: ObjectId) {
        let Some(object) = self.objects.get(id) else { return };
        let mut next = vec![object.class()];
        next.extend(object.outer());
        next.extend(object.archetype());
        next.extend(object.super_struct());
        next.extend(object.references.iter().copied());
        for target in next {
            self.visit(target);
        }
    }
}
