//! Class loaders and their registry.
use crate::{arena::LinearAlloc, class_table::ClassTable};
use dexrt_dex::DexFile;
use dexrt_types::LoaderId;
use dexrt_utils::sync::{Arc, Weak};

/// A user-defined class loader: a parent delegate plus an ordered list of
/// containers. The boot loader is implicit (`None` at the API surface) and
/// owns the boot class path instead.
pub struct ClassLoader {
    id: LoaderId,
    parent: Option<Arc<ClassLoader>>,
    dex_files: Vec<Arc<DexFile>>,
}

impl ClassLoader {
    pub(crate) fn new(
        id: LoaderId,
        parent: Option<Arc<ClassLoader>>,
        dex_files: Vec<Arc<DexFile>>,
    ) -> Self {
        ClassLoader { id, parent, dex_files }
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<ClassLoader>> {
        self.parent.as_ref()
    }

    pub fn dex_files(&self) -> &[Arc<DexFile>] {
        &self.dex_files
    }
}

/// Linker-side bookkeeping for one user loader. The loader object itself is
/// held weakly; once the runtime drops it, cleanup destroys the table and
/// the arena with everything allocated in it.
pub(crate) struct ClassLoaderData {
    pub id: LoaderId,
    pub weak: Weak<ClassLoader>,
    pub table: ClassTable,
    pub alloc: Arc<LinearAlloc>,
}

/// Registry guarded by the class-loaders lock. Readers visit tables;
/// writers insert, update, remove, and snapshot.
#[derive(Default)]
pub(crate) struct LoaderRegistry {
    pub boot_table: ClassTable,
    pub loaders: Vec<ClassLoaderData>,
}

impl LoaderRegistry {
    pub fn table_for(&self, loader: LoaderId) -> Option<&ClassTable> {
        if loader.is_boot() {
            Some(&self.boot_table)
        } else {
            self.loaders.iter().find(|d| d.id == loader).map(|d| &d.table)
        }
    }

    pub fn table_for_mut(&mut self, loader: LoaderId) -> Option<&mut ClassTable> {
        if loader.is_boot() {
            Some(&mut self.boot_table)
        } else {
            self.loaders
                .iter_mut()
                .find(|d| d.id == loader)
                .map(|d| &mut d.table)
        }
    }

    pub fn data_for(&self, loader: LoaderId) -> Option<&ClassLoaderData> {
        self.loaders.iter().find(|d| d.id == loader)
    }

    pub fn loader_handle(&self, loader: LoaderId) -> Option<Arc<ClassLoader>> {
        self.data_for(loader).and_then(|d| d.weak.upgrade())
    }
}
