//! Programmatic container construction.
//!
//! The bootstrap path and the test suite build containers directly instead
//! of parsing the binary format. The builder interns strings, type ids,
//! prototypes, and member ids the way the container format does, so indices
//! handed out here behave like real container indices.
use crate::{
    class_data::{ClassData, EncodedField, EncodedMethod},
    descriptor::is_reference_descriptor,
    encoded::EncodedValue,
    file::{ClassDef, CodeItem, DexFile, FieldId, MethodId, ProtoId},
};
use dexrt_utils::{DexFieldIndex, DexMethodIndex, ProtoIndex, StringIndex, TypeIndex};
use rustc_hash::FxHashMap;
use std::sync::Arc;

pub struct DexFileBuilder {
    location: String,
    strings: Vec<Box<str>>,
    string_map: FxHashMap<Box<str>, StringIndex>,
    type_ids: Vec<StringIndex>,
    type_map: FxHashMap<StringIndex, TypeIndex>,
    protos: Vec<ProtoId>,
    proto_map: FxHashMap<(TypeIndex, Vec<TypeIndex>), ProtoIndex>,
    method_ids: Vec<MethodId>,
    method_map: FxHashMap<(TypeIndex, ProtoIndex, StringIndex), DexMethodIndex>,
    field_ids: Vec<FieldId>,
    field_map: FxHashMap<(TypeIndex, TypeIndex, StringIndex), DexFieldIndex>,
    class_defs: Vec<ClassDef>,
}

impl DexFileBuilder {
    pub fn new(location: impl Into<String>) -> Self {
        DexFileBuilder {
            location: location.into(),
            strings: Vec::new(),
            string_map: FxHashMap::default(),
            type_ids: Vec::new(),
            type_map: FxHashMap::default(),
            protos: Vec::new(),
            proto_map: FxHashMap::default(),
            method_ids: Vec::new(),
            method_map: FxHashMap::default(),
            field_ids: Vec::new(),
            field_map: FxHashMap::default(),
            class_defs: Vec::new(),
        }
    }

    pub fn string(&mut self, s: &str) -> StringIndex {
        if let Some(idx) = self.string_map.get(s) {
            return *idx;
        }
        let idx = StringIndex::new(self.strings.len() as u32);
        self.strings.push(s.into());
        self.string_map.insert(s.into(), idx);
        idx
    }

    pub fn type_idx(&mut self, descriptor: &str) -> TypeIndex {
        let string_idx = self.string(descriptor);
        if let Some(idx) = self.type_map.get(&string_idx) {
            return *idx;
        }
        let idx = TypeIndex::new(self.type_ids.len() as u32);
        self.type_ids.push(string_idx);
        self.type_map.insert(string_idx, idx);
        idx
    }

    pub fn proto(&mut self, return_type: &str, parameters: &[&str]) -> ProtoIndex {
        let ret = self.type_idx(return_type);
        let params: Vec<TypeIndex> = parameters.iter().map(|p| self.type_idx(p)).collect();
        if let Some(idx) = self.proto_map.get(&(ret, params.clone())) {
            return *idx;
        }
        let shorty = Self::shorty(return_type, parameters);
        let shorty_idx = self.string(&shorty);
        let idx = ProtoIndex::new(self.protos.len() as u32);
        self.protos.push(ProtoId { shorty: shorty_idx, return_type: ret, parameters: params.clone() });
        self.proto_map.insert((ret, params), idx);
        idx
    }

    fn shorty(return_type: &str, parameters: &[&str]) -> String {
        fn shorty_char(descriptor: &str) -> char {
            if is_reference_descriptor(descriptor) {
                'L'
            } else {
                descriptor.chars().next().unwrap_or('V')
            }
        }
        let mut s = String::with_capacity(parameters.len() + 1);
        s.push(shorty_char(return_type));
        for p in parameters {
            s.push(shorty_char(p));
        }
        s
    }

    pub fn method(
        &mut self,
        class: &str,
        name: &str,
        return_type: &str,
        parameters: &[&str],
    ) -> DexMethodIndex {
        let class_idx = self.type_idx(class);
        let proto_idx = self.proto(return_type, parameters);
        let name_idx = self.string(name);
        if let Some(idx) = self.method_map.get(&(class_idx, proto_idx, name_idx)) {
            return *idx;
        }
        let idx = DexMethodIndex::new(self.method_ids.len() as u32);
        self.method_ids.push(MethodId { class_idx, proto_idx, name_idx });
        self.method_map.insert((class_idx, proto_idx, name_idx), idx);
        idx
    }

    pub fn field(&mut self, class: &str, type_descriptor: &str, name: &str) -> DexFieldIndex {
        let class_idx = self.type_idx(class);
        let type_idx = self.type_idx(type_descriptor);
        let name_idx = self.string(name);
        if let Some(idx) = self.field_map.get(&(class_idx, type_idx, name_idx)) {
            return *idx;
        }
        let idx = DexFieldIndex::new(self.field_ids.len() as u32);
        self.field_ids.push(FieldId { class_idx, type_idx, name_idx });
        self.field_map.insert((class_idx, type_idx, name_idx), idx);
        idx
    }

    /// Starts a class definition. Call [`ClassBuilder::finish`] to commit it.
    pub fn class<'a>(&'a mut self, descriptor: &str) -> ClassBuilder<'a> {
        let class_idx = self.type_idx(descriptor);
        ClassBuilder {
            descriptor: descriptor.to_string(),
            dex: self,
            class_idx,
            access_flags: 0,
            superclass: None,
            interfaces: Vec::new(),
            source_file: None,
            static_values: Vec::new(),
            data: ClassData::default(),
        }
    }

    pub fn build(self) -> Arc<DexFile> {
        Arc::new(DexFile::from_parts(
            self.location,
            self.strings,
            self.type_ids,
            self.protos,
            self.method_ids,
            self.field_ids,
            self.class_defs,
        ))
    }
}

pub struct ClassBuilder<'a> {
    dex: &'a mut DexFileBuilder,
    descriptor: String,
    class_idx: TypeIndex,
    access_flags: u32,
    superclass: Option<TypeIndex>,
    interfaces: Vec<TypeIndex>,
    source_file: Option<StringIndex>,
    static_values: Vec<EncodedValue>,
    data: ClassData,
}

impl<'a> ClassBuilder<'a> {
    pub fn access_flags(mut self, flags: u32) -> Self {
        self.access_flags = flags;
        self
    }

    pub fn super_class(mut self, descriptor: &str) -> Self {
        self.superclass = Some(self.dex.type_idx(descriptor));
        self
    }

    pub fn interface(mut self, descriptor: &str) -> Self {
        let idx = self.dex.type_idx(descriptor);
        self.interfaces.push(idx);
        self
    }

    pub fn source_file(mut self, name: &str) -> Self {
        self.source_file = Some(self.dex.string(name));
        self
    }

    pub fn static_field(mut self, name: &str, type_descriptor: &str, access_flags: u32) -> Self {
        let field_idx = self.dex.field(&self.descriptor.clone(), type_descriptor, name);
        self.data.static_fields.push(EncodedField { field_idx, access_flags });
        self
    }

    /// Appends a positional initial value for the next static field slot.
    pub fn static_value(mut self, value: EncodedValue) -> Self {
        self.static_values.push(value);
        self
    }

    pub fn instance_field(mut self, name: &str, type_descriptor: &str, access_flags: u32) -> Self {
        let field_idx = self.dex.field(&self.descriptor.clone(), type_descriptor, name);
        self.data.instance_fields.push(EncodedField { field_idx, access_flags });
        self
    }

    pub fn direct_method(
        self,
        name: &str,
        return_type: &str,
        parameters: &[&str],
        access_flags: u32,
    ) -> Self {
        self.direct_method_with_handlers(name, return_type, parameters, access_flags, &[])
    }

    pub fn direct_method_with_handlers(
        mut self,
        name: &str,
        return_type: &str,
        parameters: &[&str],
        access_flags: u32,
        handler_types: &[&str],
    ) -> Self {
        let method =
            self.encoded_method(name, return_type, parameters, access_flags, handler_types);
        self.data.direct_methods.push(method);
        self
    }

    pub fn virtual_method(
        self,
        name: &str,
        return_type: &str,
        parameters: &[&str],
        access_flags: u32,
    ) -> Self {
        self.virtual_method_with_handlers(name, return_type, parameters, access_flags, &[])
    }

    pub fn virtual_method_with_handlers(
        mut self,
        name: &str,
        return_type: &str,
        parameters: &[&str],
        access_flags: u32,
        handler_types: &[&str],
    ) -> Self {
        let method =
            self.encoded_method(name, return_type, parameters, access_flags, handler_types);
        self.data.virtual_methods.push(method);
        self
    }

    fn encoded_method(
        &mut self,
        name: &str,
        return_type: &str,
        parameters: &[&str],
        access_flags: u32,
        handler_types: &[&str],
    ) -> EncodedMethod {
        const ACC_NATIVE: u32 = 0x0100;
        const ACC_ABSTRACT: u32 = 0x0400;
        let method_idx = self.dex.method(&self.descriptor.clone(), name, return_type, parameters);
        // Abstract and native methods carry no code item.
        let code = if access_flags & (ACC_ABSTRACT | ACC_NATIVE) != 0 {
            None
        } else {
            Some(CodeItem {
                handler_types: handler_types.iter().map(|t| self.dex.type_idx(t)).collect(),
            })
        };
        EncodedMethod { method_idx, access_flags, code }
    }

    pub fn finish(self) -> &'a mut DexFileBuilder {
        let def = ClassDef {
            class_idx: self.class_idx,
            access_flags: self.access_flags,
            superclass_idx: self.superclass,
            interfaces: self.interfaces,
            source_file: self.source_file,
            static_values: self.static_values,
            class_data: self.data,
        };
        self.dex.class_defs.push(def);
        self.dex
    }
}
