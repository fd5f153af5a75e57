//! Host callbacks invoked around load and save.

use super::{ObjectId, ObjectSpace};
use crate::linker::LoadSession;
use crate::util::Result;

/// Post-construction fix-up, run once an object's body is loaded.
///
/// The hook may load further objects through the session; the caller
/// keeps preloading until nothing new appears.
pub trait PostLoad: Send + Sync {
    fn post_load(&self, session: &mut LoadSession, object: ObjectId) -> Result<()>;
}

/// Pre-save hook, run on every tagged export before tables are built.
///
/// Objects it creates inside the package are tagged by the second pass.
pub trait PreSave: Send + Sync {
    fn pre_save(&self, objects: &mut ObjectSpace, object: ObjectId) -> Result<()>;
}

impl<F> PostLoad for F
where
    F: Fn(&mut LoadSession, ObjectId) -> Result<()> + Send + Sync,
{
    fn post_load(&self, session: &mut LoadSession, object: ObjectId) -> Result<()> {
        self(session, object)
    }
}

impl<F> PreSave for F
where
    F: Fn(&mut ObjectSpace, ObjectId) -> Result<()> + Send + Sync,
{
    fn pre_save(&self, objects: &mut ObjectSpace, object: ObjectId) -> Result<()> {
        self(objects, object)
    }
}
