//! Root enumeration for the garbage collector and class-loader teardown.
use crate::ClassLinker;
use bitflags::bitflags;
use dexrt_types::ClassRef;
use tracing::debug;

bitflags! {
    /// What the collector wants from a root visit.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct VisitRootFlags: u32 {
        const ALL_ROOTS = 1 << 0;
        /// Only roots recorded since logging was last started.
        const NEW_ROOTS = 1 << 1;
        const CLEAR_LOG = 1 << 2;
        const START_LOGGING_NEW = 1 << 3;
        const STOP_LOGGING_NEW = 1 << 4;
    }
}

impl ClassLinker {
    /// Visits class roots on behalf of the collector.
    ///
    /// The class-loaders write lock is held for the duration so no table
    /// changes shape mid-visit; the visitor must not call back into the
    /// linker.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(ClassRef), flags: VisitRootFlags) {
        let registry = self.class_loaders().write();
        if flags.contains(VisitRootFlags::ALL_ROOTS) {
            registry.boot_table.visit(|class| visitor(class));
            if let Some(roots) = self.class_roots() {
                for root in roots.to_vec() {
                    visitor(root);
                }
            }
            for data in registry.loaders.iter() {
                data.table.visit(|class| visitor(class));
            }
        } else if flags.contains(VisitRootFlags::NEW_ROOTS) {
            for &class in self.new_class_roots_log().lock().iter() {
                visitor(class);
            }
        }
        if flags.contains(VisitRootFlags::CLEAR_LOG) {
            self.new_class_roots_log().lock().clear();
        }
        if flags.contains(VisitRootFlags::START_LOGGING_NEW) {
            self.set_log_new_roots(true);
        }
        if flags.contains(VisitRootFlags::STOP_LOGGING_NEW) {
            self.set_log_new_roots(false);
        }
    }

    /// Visits every loaded class in every table.
    pub fn visit_classes(&self, visitor: &mut dyn FnMut(ClassRef)) {
        let registry = self.class_loaders().read();
        registry.boot_table.visit(|class| visitor(class));
        for data in registry.loaders.iter() {
            data.table.visit(|class| visitor(class));
        }
    }

    /// Drops the bookkeeping of every loader whose managed object has been
    /// reclaimed: the class table and the arena (with every class, member
    /// array, and dex cache inside) are destroyed together. Returns how
    /// many loaders were torn down.
    pub fn cleanup_class_loaders(&self) -> usize {
        let removed = {
            let mut registry = self.class_loaders().write();
            let before = registry.loaders.len();
            registry.loaders.retain(|data| {
                let alive = data.weak.strong_count() > 0;
                if !alive {
                    debug!(
                        loader = data.id.0,
                        classes = data.table.len(),
                        "tearing down class loader"
                    );
                }
                alive
            });
            before - registry.loaders.len()
        };
        if removed > 0 {
            // Containers registered through the dead arenas go with them.
            self.purge_dead_dex_caches();
        }
        removed
    }
}
