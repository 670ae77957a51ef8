//! # dexrt-dex
//!
//! In-memory model of the multi-class bytecode container ("dex file") that
//! the class linker consumes. The binary container format itself is parsed
//! elsewhere; this crate exposes the parsed form - string, type, prototype,
//! method, field, and class-def tables - plus class-data iteration and the
//! encoded static-value constants.
pub mod builder;
pub mod class_data;
pub mod descriptor;
pub mod encoded;
pub mod error;
mod file;

pub use builder::DexFileBuilder;
pub use class_data::{ClassData, EncodedField, EncodedMethod, MemberIter};
pub use descriptor::{descriptor_to_dot, modified_utf8_hash, PrimitiveKind};
pub use encoded::EncodedValue;
pub use error::DexError;
pub use builder::ClassBuilder;
pub use file::{ClassDef, CodeItem, DexFile, FieldId, MethodId, ProtoId, Signature};
