//! Table ordering for saved packages.

use std::hash::Hash;

use fxhash::FxHashSet;

use crate::object::{ObjectId, ObjectSpace};

use super::tag::TagSet;

/// Keep the relative order of `previous` for items that still exist, then
/// append the rest in their current order.
pub(crate) fn conform_order<K: Eq + Hash + Clone>(items: Vec<K>, previous: &[K]) -> Vec<K> {
    let present: FxHashSet<&K> = items.iter().collect();
    let mut placed: FxHashSet<K> = FxHashSet::default();
    let mut out = Vec::with_capacity(items.len());
    for key in previous {
        if present.contains(key) && placed.insert(key.clone()) {
            out.push(key.clone());
        }
    }
    for key in items {
        if !placed.contains(&key) {
            placed.insert(key.clone());
            out.push(key);
        }
    }
    out
}

/// Reorder exports so that, where possible, every export's class, outer,
/// archetype and super class come before it. Classes are placed first.
///
/// Insertion is idempotent; cycles keep the order in which they are met.
pub(crate) fn sort_dependencies_first(objects: &ObjectSpace, exports: &[ObjectId], tags: &TagSet) -> Vec<ObjectId> {
    let mut sorter = Sorter { objects, tags, placed: FxHashSet::default(), out: Vec::with_capacity(exports.len()) };
    for &id in exports.iter().filter(|&&id| objects.is_class(id)) {
        sorter.place(id);
    }
    for &id in exports {
        sorter.place(id);
    }
    sorter.out
}

struct Sorter<'a> {
    objects: &'a ObjectSpace,
    tags: &'a TagSet,
    placed: FxHashSet<ObjectId>,
    out: Vec<ObjectId>,
}

impl Sorter<'_> {
    fn place(&mut self, id: ObjectId) {
        if !self.placed.insert(id) {
            return;
        }
        if let Some(object) = self.objects.get(id) {
            let dependencies = [object.class(), object.outer().unwrap_or(id), object.archetype().unwrap_or(id)]
                .into_iter()
                .chain(object.super_struct().filter(|_| self.objects.is_class(id)));
            for dependency in dependencies {
                if dependency != id && self.tags.is_export(dependency) {
                    self.place(dependency);
                }
            }
        }
        self.out.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::save::tag::tag_package;
    use crate::object::ObjectFlags;
    use crate::util::Name;

    #[test]
    fn test_conform_keeps_previous_order() {
        let items = vec!["a", "b", "c", "d"];
        let previous = ["d", "x", "b"];
        assert_eq!(conform_order(items, &previous), vec!["d", "b", "a", "c"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let mut objects = ObjectSpace::new();
        let props = objects.create_package("Props");
        let class_class = objects.class_class();
        let widget = objects.create_object(class_class, props, Name::new("Widget"), ObjectFlags::PUBLIC);
        let group = objects.create_object(widget, props, Name::new("Group"), ObjectFlags::PUBLIC);
        let template = objects.create_object(widget, group, Name::new("Template"), ObjectFlags::ARCHETYPE);
        let instance = objects.create_object(widget, props, Name::new("Instance"), ObjectFlags::PUBLIC);
        objects.set_archetype(instance, Some(template));

        let tags = tag_package(&objects, props, None, ObjectFlags::NONE);
        let sorted = sort_dependencies_first(&objects, &[instance, template, group, widget], &tags);
        let position = |id| sorted.iter().position(|&x| x == id).unwrap();
        assert_eq!(sorted.len(), 4);
        assert_eq!(position(widget), 0);
        assert!(position(group) < position(template));
        assert!(position(template) < position(instance));
    }
}
