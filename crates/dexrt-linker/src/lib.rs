//! # dexrt-linker
//!
//! The class linker: loads, resolves, links, verifies, and initializes
//! classes lazily from registered containers, producing classes with
//! vtables, interface tables, IMTs, field layouts, and entrypoints.
//!
//! The linker is a process-wide value owned by the runtime and threaded
//! explicitly through every operation. Its lock order must be respected to
//! avoid deadlock:
//!
//! 1. `class_loaders` (reader/writer) before any per-class monitor;
//! 2. `dex_caches` (the dex lock) independent, never taken inside a
//!    per-class monitor;
//! 3. arena allocation never happens while holding the `class_loaders`
//!    writer lock.
use dexrt_dex::{DexFile, PrimitiveKind};
use dexrt_types::{ClassRef, IfTable, LoaderId};
use dexrt_utils::sync::{Arc, AtomicBool, AtomicU64, Mutex, Ordering, RwLock};
use rustc_hash::FxHashMap;
use std::sync::OnceLock;

pub mod arena;
mod array;
mod bootstrap;
pub mod class_table;
pub mod hooks;
mod initializer;
mod intern;
mod layout;
mod linker;
mod loaders;
mod method_link;
mod proxy;
mod resolver;
mod roots;
pub mod stats;

pub mod entrypoints;
pub mod image;

pub use entrypoints::TrampolineSet;
pub use hooks::{
    AcceptingVerifier, ClinitFailure, GcHooks, Interpreter, NopGcHooks, NopInterpreter,
    RuntimeConfig, Verifier, VerifyResult,
};
pub use image::AotImage;
pub use loaders::ClassLoader;
pub use roots::VisitRootFlags;

use arena::LinearAlloc;
use intern::InternTable;
use loaders::LoaderRegistry;
use stats::LinkerStats;

/// One registered container. The owning arena is held weakly so a dead
/// loader's caches drop out of the registry instead of dangling; `None`
/// marks immortal (boot or image) registrations.
pub(crate) struct RegisteredDex {
    pub cache: dexrt_types::DexCacheRef,
    pub owner: Option<dexrt_utils::sync::Weak<LinearAlloc>>,
}

impl RegisteredDex {
    pub fn is_live(&self) -> bool {
        match &self.owner {
            None => true,
            Some(weak) => weak.strong_count() > 0,
        }
    }
}

/// The well-known classes the type system is bootstrapped from.
#[derive(Clone)]
pub struct ClassRoots {
    pub object: ClassRef,
    pub class_class: ClassRef,
    pub string: ClassRef,
    pub reference: ClassRef,
    pub dex_cache_class: ClassRef,
    pub class_array: ClassRef,
    pub primitives: [ClassRef; 9],
}

pub(crate) fn primitive_root_index(kind: PrimitiveKind) -> usize {
    match kind {
        PrimitiveKind::Boolean => 0,
        PrimitiveKind::Byte => 1,
        PrimitiveKind::Char => 2,
        PrimitiveKind::Short => 3,
        PrimitiveKind::Int => 4,
        PrimitiveKind::Long => 5,
        PrimitiveKind::Float => 6,
        PrimitiveKind::Double => 7,
        PrimitiveKind::Void => 8,
    }
}

impl ClassRoots {
    pub fn primitive(&self, kind: PrimitiveKind) -> ClassRef {
        self.primitives[primitive_root_index(kind)]
    }

    /// Fixed serialization order shared with the AOT image.
    pub fn to_vec(&self) -> Vec<ClassRef> {
        let mut roots = vec![
            self.object,
            self.class_class,
            self.string,
            self.reference,
            self.dex_cache_class,
            self.class_array,
        ];
        roots.extend_from_slice(&self.primitives);
        roots
    }

    pub fn from_slice(roots: &[ClassRef]) -> Option<ClassRoots> {
        if roots.len() != 15 {
            return None;
        }
        let mut primitives = [roots[6]; 9];
        primitives.copy_from_slice(&roots[6..15]);
        Some(ClassRoots {
            object: roots[0],
            class_class: roots[1],
            string: roots[2],
            reference: roots[3],
            dex_cache_class: roots[4],
            class_array: roots[5],
            primitives,
        })
    }
}

pub struct ClassLinker {
    config: RuntimeConfig,
    verifier: Box<dyn Verifier>,
    interpreter: Box<dyn Interpreter>,
    gc: Box<dyn GcHooks>,

    boot_class_path: RwLock<Vec<Arc<DexFile>>>,
    boot_alloc: Arc<LinearAlloc>,

    /// The dex lock: registered containers and their caches.
    dex_caches: RwLock<Vec<RegisteredDex>>,

    /// The class-loaders lock: loader registry and every class table.
    class_loaders: RwLock<LoaderRegistry>,

    roots: OnceLock<ClassRoots>,
    array_iftable: OnceLock<Arc<IfTable>>,
    proxy_parent: OnceLock<ClassRef>,
    /// Trampoline addresses adopted from an AOT image, if any.
    trampolines: OnceLock<TrampolineSet>,

    /// Hand-built classes awaiting their defining container during
    /// bootstrap replay.
    boot_prealloc: Mutex<FxHashMap<Box<str>, ClassRef>>,

    init_done: AtomicBool,
    intern: InternTable,
    stats: LinkerStats,

    /// Log of class roots added while the GC asked for new-root logging.
    new_class_roots: Mutex<Vec<ClassRef>>,
    log_new_roots: AtomicBool,

    next_loader_id: AtomicU64,
}

impl ClassLinker {
    pub fn new(
        config: RuntimeConfig,
        verifier: Box<dyn Verifier>,
        interpreter: Box<dyn Interpreter>,
        gc: Box<dyn GcHooks>,
    ) -> Self {
        ClassLinker {
            config,
            verifier,
            interpreter,
            gc,
            boot_class_path: RwLock::new(Vec::new()),
            boot_alloc: Arc::new(LinearAlloc::new()),
            dex_caches: RwLock::new(Vec::new()),
            class_loaders: RwLock::new(LoaderRegistry::default()),
            roots: OnceLock::new(),
            array_iftable: OnceLock::new(),
            proxy_parent: OnceLock::new(),
            trampolines: OnceLock::new(),
            boot_prealloc: Mutex::new(FxHashMap::default()),
            init_done: AtomicBool::new(false),
            intern: InternTable::new(),
            stats: LinkerStats::default(),
            new_class_roots: Mutex::new(Vec::new()),
            log_new_roots: AtomicBool::new(false),
            next_loader_id: AtomicU64::new(1),
        }
    }

    /// A linker with the default hook stubs; the runtime installs real ones.
    pub fn with_defaults(config: RuntimeConfig) -> Self {
        ClassLinker::new(
            config,
            Box::new(AcceptingVerifier),
            Box::new(NopInterpreter),
            Box::new(NopGcHooks),
        )
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn stats(&self) -> &LinkerStats {
        &self.stats
    }

    pub fn intern_string(&self, s: &str) -> &'static str {
        self.intern.intern(s)
    }

    pub fn init_done(&self) -> bool {
        self.init_done.load(Ordering::Acquire)
    }

    pub(crate) fn set_init_done(&self) {
        self.init_done.store(true, Ordering::Release);
    }

    pub fn class_roots(&self) -> Option<&ClassRoots> {
        self.roots.get()
    }

    pub(crate) fn set_class_roots(&self, roots: ClassRoots) {
        if self.roots.set(roots).is_err() {
            panic!("class roots initialized twice");
        }
    }

    pub(crate) fn is_reference_root(&self, class: ClassRef) -> bool {
        self.class_roots().map(|r| r.reference == class).unwrap_or(false)
    }

    /// The globally shared itable of every array class.
    pub fn array_iftable(&self) -> Option<&Arc<IfTable>> {
        self.array_iftable.get()
    }

    pub(crate) fn set_array_iftable(&self, iftable: Arc<IfTable>) {
        if self.array_iftable.set(iftable).is_err() {
            panic!("array interface table initialized twice");
        }
    }

    pub fn boot_class_path(&self) -> Vec<Arc<DexFile>> {
        self.boot_class_path.read().clone()
    }

    pub(crate) fn set_boot_class_path(&self, path: Vec<Arc<DexFile>>) {
        *self.boot_class_path.write() = path;
    }

    pub(crate) fn boot_alloc(&self) -> &Arc<LinearAlloc> {
        &self.boot_alloc
    }

    /// Registers a user loader. The linker holds it weakly; dropping the
    /// returned handle makes the loader (and everything it loaded)
    /// collectable by [`ClassLinker::cleanup_class_loaders`].
    pub fn create_class_loader(
        &self,
        parent: Option<Arc<ClassLoader>>,
        dex_files: Vec<Arc<DexFile>>,
    ) -> Arc<ClassLoader> {
        let id = LoaderId(self.next_loader_id.fetch_add(1, Ordering::Relaxed));
        let loader = Arc::new(ClassLoader::new(id, parent, dex_files));
        let data = loaders::ClassLoaderData {
            id,
            weak: Arc::downgrade(&loader),
            table: class_table::ClassTable::new(),
            alloc: Arc::new(LinearAlloc::new()),
        };
        self.class_loaders.write().loaders.push(data);
        loader
    }

    pub(crate) fn loader_handle(&self, loader: LoaderId) -> Option<Arc<ClassLoader>> {
        if loader.is_boot() {
            return None;
        }
        self.class_loaders.read().loader_handle(loader)
    }

    /// The arena owning classes defined by `loader`.
    pub(crate) fn alloc_for(&self, loader: LoaderId) -> Arc<LinearAlloc> {
        if loader.is_boot() {
            return self.boot_alloc.clone();
        }
        self.class_loaders
            .read()
            .data_for(loader)
            .map(|d| d.alloc.clone())
            .expect("unregistered class loader")
    }

    pub(crate) fn class_loaders(&self) -> &RwLock<LoaderRegistry> {
        &self.class_loaders
    }

    pub(crate) fn dex_lock(&self) -> &RwLock<Vec<RegisteredDex>> {
        &self.dex_caches
    }

    /// Trampoline addresses wired from an adopted image, if one was bound.
    pub fn trampolines(&self) -> Option<TrampolineSet> {
        self.trampolines.get().copied()
    }

    pub(crate) fn set_trampolines(&self, trampolines: TrampolineSet) {
        let _ = self.trampolines.set(trampolines);
    }

    pub(crate) fn proxy_parent_class(&self) -> Option<ClassRef> {
        self.proxy_parent.get().copied()
    }

    pub(crate) fn set_proxy_parent_class(&self, parent: ClassRef) {
        let _ = self.proxy_parent.set(parent);
    }

    pub(crate) fn boot_prealloc_map(&self) -> &Mutex<FxHashMap<Box<str>, ClassRef>> {
        &self.boot_prealloc
    }

    pub(crate) fn log_new_roots(&self) -> bool {
        self.log_new_roots.load(Ordering::Relaxed)
    }

    pub(crate) fn set_log_new_roots(&self, logging: bool) {
        self.log_new_roots.store(logging, Ordering::Relaxed);
    }

    pub(crate) fn new_class_roots_log(&self) -> &Mutex<Vec<ClassRef>> {
        &self.new_class_roots
    }

    pub(crate) fn interpreter(&self) -> &dyn Interpreter {
        &*self.interpreter
    }

    pub(crate) fn verifier(&self) -> &dyn Verifier {
        &*self.verifier
    }

    pub(crate) fn gc_hooks(&self) -> &dyn GcHooks {
        &*self.gc
    }

    /// Frozen and live class counts for one loader's table.
    pub fn class_table_stats(&self, loader: LoaderId) -> Option<(usize, usize)> {
        let registry = self.class_loaders.read();
        registry
            .table_for(loader)
            .map(|t| (t.num_zygote_classes(), t.num_non_zygote_classes()))
    }

    /// Freezes every class table so the current contents become the shared
    /// pre-fork ("zygote") generation.
    pub fn move_class_tables_to_pre_zygote(&self) {
        let mut registry = self.class_loaders.write();
        registry.boot_table.freeze_snapshot();
        for data in registry.loaders.iter_mut() {
            data.table.freeze_snapshot();
        }
    }
}

impl std::fmt::Debug for ClassLinker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassLinker")
            .field("init_done", &self.init_done())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
