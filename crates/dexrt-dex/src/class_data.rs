//! Per-class member data.
//!
//! Members are grouped the way the container stores them: static fields,
//! then instance fields, then direct methods, then virtual methods. Member
//! indices within each group are monotonic non-decreasing; a duplicated
//! index is tolerated by consumers and the duplicate entry ignored.
use dexrt_utils::{DexFieldIndex, DexMethodIndex};

#[derive(Clone, Debug, PartialEq)]
pub struct EncodedField {
    pub field_idx: DexFieldIndex,
    pub access_flags: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EncodedMethod {
    pub method_idx: DexMethodIndex,
    pub access_flags: u32,
    /// Whether the method carries a code item. Abstract and some native
    /// methods have none.
    pub code: Option<super::CodeItem>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassData {
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

impl ClassData {
    pub fn num_fields(&self) -> usize {
        self.static_fields.len() + self.instance_fields.len()
    }

    pub fn num_methods(&self) -> usize {
        self.direct_methods.len() + self.virtual_methods.len()
    }

    /// Iterates one member group, skipping duplicated member indices.
    pub fn unique_fields<'a>(group: &'a [EncodedField]) -> MemberIter<'a, EncodedField> {
        MemberIter { items: group, pos: 0, last: None }
    }

    pub fn unique_methods<'a>(group: &'a [EncodedMethod]) -> MemberIter<'a, EncodedMethod> {
        MemberIter { items: group, pos: 0, last: None }
    }
}

pub trait HasMemberIndex {
    fn member_index(&self) -> u32;
}

impl HasMemberIndex for EncodedField {
    fn member_index(&self) -> u32 {
        self.field_idx.as_u32()
    }
}

impl HasMemberIndex for EncodedMethod {
    fn member_index(&self) -> u32 {
        self.method_idx.as_u32()
    }
}

/// Iterator over one member group that drops duplicate indices.
pub struct MemberIter<'a, T> {
    items: &'a [T],
    pos: usize,
    last: Option<u32>,
}

impl<'a, T: HasMemberIndex> Iterator for MemberIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        while self.pos < self.items.len() {
            let item = &self.items[self.pos];
            self.pos += 1;
            let idx = item.member_index();
            if self.last == Some(idx) {
                continue;
            }
            self.last = Some(idx);
            return Some(item);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(idx: u32) -> EncodedField {
        EncodedField { field_idx: DexFieldIndex::new(idx), access_flags: 0 }
    }

    #[test]
    fn duplicate_member_indices_are_ignored() {
        let group = vec![field(0), field(1), field(1), field(2)];
        let seen: Vec<u32> = ClassData::unique_fields(&group)
            .map(|f| f.field_idx.as_u32())
            .collect();
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
