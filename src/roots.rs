use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::object::RefField;

/// Source of additional strong roots owned by the embedding runtime, such as the roots of
/// its concurrency model. Visited while the world is stopped.
pub trait RootProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Calls `visitor` for every root slot. The collector may rewrite the slots.
    fn visit_roots(&self, visitor: &mut dyn FnMut(&RefField));
}

/// Static root slots registered by the runtime.
#[derive(Default)]
pub struct StaticRoots {
    statics: Mutex<Vec<&'static RefField>>,
    /// Interned-string slots. Always hold old objects, so young cycles skip them.
    string_table: Mutex<Vec<&'static RefField>>,
    providers: RwLock<Vec<Arc<dyn RootProvider>>>,
}

impl StaticRoots {
    pub fn register_static(&self, slot: &'static RefField) {
        self.statics.lock().push(slot);
    }

    pub fn register_string_table(&self, slot: &'static RefField) {
        self.string_table.lock().push(slot);
    }

    pub fn add_provider(&self, provider: Arc<dyn RootProvider>) {
        log::debug!("root provider {} added", provider.name());
        self.providers.write().push(provider);
    }

    pub fn for_each_static(&self, mut f: impl FnMut(&RefField)) {
        for slot in self.statics.lock().iter() {
            f(slot);
        }
    }

    pub fn for_each_string_table(&self, mut f: impl FnMut(&RefField)) {
        for slot in self.string_table.lock().iter() {
            f(slot);
        }
    }

    pub fn for_each_provider_root(&self, mut f: impl FnMut(&RefField)) {
        for provider in self.providers.read().iter() {
            provider.visit_roots(&mut f);
        }
    }
}
