use crate::{
    class_data::ClassData, descriptor::descriptor_to_dot, encoded::EncodedValue, error::DexError,
};
use dexrt_utils::{ClassDefIndex, DexFieldIndex, DexMethodIndex, ProtoIndex, StringIndex, TypeIndex};
use rustc_hash::FxHashMap;
use std::fmt::{self, Debug, Formatter};

/// A method prototype: shorty plus return and parameter types.
#[derive(Clone, Debug, PartialEq)]
pub struct ProtoId {
    pub shorty: StringIndex,
    pub return_type: TypeIndex,
    pub parameters: Vec<TypeIndex>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodId {
    pub class_idx: TypeIndex,
    pub proto_idx: ProtoIndex,
    pub name_idx: StringIndex,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldId {
    pub class_idx: TypeIndex,
    pub type_idx: TypeIndex,
    pub name_idx: StringIndex,
}

/// The parts of a code item the linker cares about: the types named by the
/// method's catch handlers. Bytecode itself is interpreted elsewhere.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodeItem {
    pub handler_types: Vec<TypeIndex>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassDef {
    pub class_idx: TypeIndex,
    pub access_flags: u32,
    pub superclass_idx: Option<TypeIndex>,
    pub interfaces: Vec<TypeIndex>,
    pub source_file: Option<StringIndex>,
    /// Positional initial values for the leading static fields.
    pub static_values: Vec<EncodedValue>,
    pub class_data: ClassData,
}

/// One loaded container. Immutable once built; shared via `Arc` and compared
/// by identity.
pub struct DexFile {
    location: String,
    strings: Vec<Box<str>>,
    type_ids: Vec<StringIndex>,
    protos: Vec<ProtoId>,
    method_ids: Vec<MethodId>,
    field_ids: Vec<FieldId>,
    class_defs: Vec<ClassDef>,
    defs_by_descriptor: FxHashMap<Box<str>, ClassDefIndex>,
}

impl Debug for DexFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DexFile")
            .field("location", &self.location)
            .field("classes", &self.class_defs.len())
            .finish()
    }
}

impl DexFile {
    pub(crate) fn from_parts(
        location: String,
        strings: Vec<Box<str>>,
        type_ids: Vec<StringIndex>,
        protos: Vec<ProtoId>,
        method_ids: Vec<MethodId>,
        field_ids: Vec<FieldId>,
        class_defs: Vec<ClassDef>,
    ) -> Self {
        let mut defs_by_descriptor =
            FxHashMap::with_capacity_and_hasher(class_defs.len(), Default::default());
        for (i, def) in class_defs.iter().enumerate() {
            let descriptor = strings[type_ids[def.class_idx.as_usize()].as_usize()].clone();
            defs_by_descriptor.insert(descriptor, ClassDefIndex::new(i as u32));
        }
        DexFile {
            location,
            strings,
            type_ids,
            protos,
            method_ids,
            field_ids,
            class_defs,
            defs_by_descriptor,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn num_strings(&self) -> usize {
        self.strings.len()
    }

    pub fn num_types(&self) -> usize {
        self.type_ids.len()
    }

    pub fn num_methods(&self) -> usize {
        self.method_ids.len()
    }

    pub fn num_fields(&self) -> usize {
        self.field_ids.len()
    }

    pub fn num_class_defs(&self) -> usize {
        self.class_defs.len()
    }

    pub fn string(&self, idx: StringIndex) -> &str {
        &self.strings[idx.as_usize()]
    }

    pub fn get_string(&self, idx: StringIndex) -> Result<&str, DexError> {
        self.strings
            .get(idx.as_usize())
            .map(|s| &**s)
            .ok_or_else(|| DexError::BadStringIndex(idx.as_u32(), self.location.clone()))
    }

    pub fn type_descriptor(&self, idx: TypeIndex) -> &str {
        self.string(self.type_ids[idx.as_usize()])
    }

    pub fn get_type_descriptor(&self, idx: TypeIndex) -> Result<&str, DexError> {
        let string_idx = self
            .type_ids
            .get(idx.as_usize())
            .ok_or_else(|| DexError::BadTypeIndex(idx.as_u32(), self.location.clone()))?;
        self.get_string(*string_idx)
    }

    pub fn proto(&self, idx: ProtoIndex) -> &ProtoId {
        &self.protos[idx.as_usize()]
    }

    pub fn method_id(&self, idx: DexMethodIndex) -> &MethodId {
        &self.method_ids[idx.as_usize()]
    }

    pub fn get_method_id(&self, idx: DexMethodIndex) -> Result<&MethodId, DexError> {
        self.method_ids
            .get(idx.as_usize())
            .ok_or_else(|| DexError::BadMethodIndex(idx.as_u32(), self.location.clone()))
    }

    pub fn field_id(&self, idx: DexFieldIndex) -> &FieldId {
        &self.field_ids[idx.as_usize()]
    }

    pub fn get_field_id(&self, idx: DexFieldIndex) -> Result<&FieldId, DexError> {
        self.field_ids
            .get(idx.as_usize())
            .ok_or_else(|| DexError::BadFieldIndex(idx.as_u32(), self.location.clone()))
    }

    pub fn class_def(&self, idx: ClassDefIndex) -> &ClassDef {
        &self.class_defs[idx.as_usize()]
    }

    pub fn class_defs(&self) -> impl Iterator<Item = (ClassDefIndex, &ClassDef)> {
        self.class_defs
            .iter()
            .enumerate()
            .map(|(i, def)| (ClassDefIndex::new(i as u32), def))
    }

    pub fn class_descriptor(&self, def: &ClassDef) -> &str {
        self.type_descriptor(def.class_idx)
    }

    /// Descriptor lookup over this container's class defs.
    pub fn find_class_def(&self, descriptor: &str) -> Option<ClassDefIndex> {
        self.defs_by_descriptor.get(descriptor).copied()
    }

    pub fn method_name(&self, idx: DexMethodIndex) -> &str {
        self.string(self.method_id(idx).name_idx)
    }

    pub fn method_signature(&self, idx: DexMethodIndex) -> Signature<'_> {
        let proto = self.proto(self.method_id(idx).proto_idx);
        Signature {
            return_type: self.type_descriptor(proto.return_type),
            parameters: proto
                .parameters
                .iter()
                .map(|p| self.type_descriptor(*p))
                .collect(),
        }
    }

    pub fn method_class_descriptor(&self, idx: DexMethodIndex) -> &str {
        self.type_descriptor(self.method_id(idx).class_idx)
    }

    pub fn field_name(&self, idx: DexFieldIndex) -> &str {
        self.string(self.field_id(idx).name_idx)
    }

    pub fn field_type_descriptor(&self, idx: DexFieldIndex) -> &str {
        self.type_descriptor(self.field_id(idx).type_idx)
    }

    pub fn field_class_descriptor(&self, idx: DexFieldIndex) -> &str {
        self.type_descriptor(self.field_id(idx).class_idx)
    }

    /// Human-readable method name for diagnostics,
    /// e.g. `void java.lang.Object.notify()`.
    pub fn pretty_method(&self, idx: DexMethodIndex) -> String {
        let sig = self.method_signature(idx);
        let params: Vec<String> = sig.parameters.iter().map(|p| descriptor_to_dot(p)).collect();
        format!(
            "{} {}.{}({})",
            descriptor_to_dot(sig.return_type),
            descriptor_to_dot(self.method_class_descriptor(idx)),
            self.method_name(idx),
            params.join(", ")
        )
    }
}

/// A method signature projected to descriptor strings, comparable across
/// containers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature<'a> {
    pub return_type: &'a str,
    pub parameters: Vec<&'a str>,
}
