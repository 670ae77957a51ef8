//! # dexrt-types
//!
//! The runtime data model the class linker builds: classes, method and
//! field descriptors, the per-class status machine, and the per-container
//! resolution cache.
pub mod class;
pub mod dex_cache;
pub mod error;
pub mod field;
pub mod flags;
pub mod method;
pub mod status;
pub mod storage;

pub use class::{Class, ClassContainer, ClassMonitor, ClassRef, IfTable, IfTableEntry, ImtEntry, LoaderId};
pub use dex_cache::{DexCache, DexCacheRef};
pub use error::{LinkError, LinkResult};
pub use field::{ArtField, FieldRef, FIELD_OFFSET_UNSET};
pub use flags::{AccessFlags, ClassFlags};
pub use method::{ArtMethod, EntryPoint, InvokeKind, MethodRef, METHOD_INDEX_UNSET};
pub use status::ClassStatus;
pub use storage::{FieldStorage, StaticRef};

/// Size in bytes of a heap reference slot. References are pointer-sized.
pub const HEAP_REFERENCE_SIZE: usize = 8;

/// Size in bytes of the object header preceding instance data.
pub const OBJECT_HEADER_SIZE: u32 = 8;

/// Number of slots in the embedded interface method table.
pub const IMT_SIZE: usize = 64;

/// Sentinel for [`Class::reference_instance_offsets`]: the bitmap
/// overflowed and the GC must walk the super chain instead.
pub const CLASS_WALK_SUPER: u32 = 0xC000_0000;

/// Virtual dispatch indices are 16-bit.
pub const MAX_VTABLE_LENGTH: usize = 1 << 16;
