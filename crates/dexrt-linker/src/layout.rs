//! Field layout.
//!
//! Fields are packed by size with gap reuse: references first at an aligned
//! offset, then primitives from large to small, filling alignment gaps
//! recorded along the way. The result is each field's byte offset, the
//! instance size, and the reference-offset bitmap the GC scans.
use dexrt_types::{
    ArtField, Class, ClassFlags, ClassRef, LinkError, LinkResult, CLASS_WALK_SUPER,
    HEAP_REFERENCE_SIZE, OBJECT_HEADER_SIZE,
};
use dexrt_utils::align_up;
use std::{cmp::Ordering, collections::BinaryHeap, collections::VecDeque};

/// Descriptor of the reference root whose `referent` field the GC treats
/// specially.
pub(crate) const REFERENCE_DESCRIPTOR: &str = "Ljava/lang/ref/Reference;";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct FieldGap {
    start: u32,
    size: u32,
}

impl Ord for FieldGap {
    fn cmp(&self, other: &Self) -> Ordering {
        // Largest size first; within a size, lowest offset first.
        self.size
            .cmp(&other.size)
            .then(other.start.cmp(&self.start))
    }
}

impl PartialOrd for FieldGap {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of alignment gaps. Only sizes {4, 2, 1} occur: gaps come
/// from padding below the 8-byte reference/long alignment. The greedy
/// largest-first strategy is optimal for this size set only.
#[derive(Default)]
pub(crate) struct FieldGaps {
    heap: BinaryHeap<FieldGap>,
}

impl FieldGaps {
    /// Records `[start, end)` as gaps, split into maximal power-of-two
    /// aligned sub-gaps.
    pub fn add(&mut self, mut start: u32, end: u32) {
        while start < end {
            let remaining = end - start;
            let size = if start % 2 != 0 || remaining < 2 {
                1
            } else if start % 4 != 0 || remaining < 4 {
                2
            } else {
                4
            };
            debug_assert!(matches!(size, 1 | 2 | 4));
            self.heap.push(FieldGap { start, size });
            start += size;
        }
    }

    /// Takes the start offset of the largest gap able to hold `size` bytes,
    /// re-queuing any remainder.
    pub fn take(&mut self, size: u32) -> Option<u32> {
        let top = *self.heap.peek()?;
        if top.size < size {
            return None;
        }
        self.heap.pop();
        if top.size > size {
            self.add(top.start + size, top.start + top.size);
        }
        Some(top.start)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

fn sorted_fields(fields: &'static [ArtField]) -> VecDeque<&'static ArtField> {
    let mut sorted: Vec<&ArtField> = fields.iter().collect();
    // References first, then size buckets from large to small; within a
    // bucket the container field index keeps the order deterministic.
    sorted.sort_by_key(|f| {
        (
            !f.is_reference(),
            std::cmp::Reverse(f.size()),
            f.dex_field_index().as_u32(),
        )
    });
    sorted.into()
}

fn shuffle_forward(
    size: u32,
    field_offset: &mut u32,
    fields: &mut VecDeque<&'static ArtField>,
    gaps: &mut FieldGaps,
) {
    while let Some(field) = fields.front() {
        if field.is_reference() || field.size() as u32 != size {
            break;
        }
        let field = fields.pop_front().unwrap();
        match gaps.take(size) {
            Some(offset) => {
                debug_assert!(offset % size == 0);
                field.set_offset(offset);
            }
            None => {
                let offset = align_up(*field_offset as usize, size as usize) as u32;
                if offset != *field_offset {
                    gaps.add(*field_offset, offset);
                }
                field.set_offset(offset);
                *field_offset = offset + size;
            }
        }
    }
}

struct LayoutResult {
    size: u32,
    num_reference_fields: u32,
}

fn layout_fields(fields: &'static [ArtField], start_offset: u32) -> LayoutResult {
    let mut remaining = sorted_fields(fields);
    let mut field_offset = start_offset;
    let mut gaps = FieldGaps::default();
    let mut num_reference_fields = 0u32;

    // References go first, at reference-aligned offsets.
    while let Some(field) = remaining.front() {
        if !field.is_reference() {
            break;
        }
        let field = remaining.pop_front().unwrap();
        let aligned = align_up(field_offset as usize, HEAP_REFERENCE_SIZE) as u32;
        if aligned != field_offset {
            gaps.add(field_offset, aligned);
            field_offset = aligned;
        }
        field.set_offset(field_offset);
        field_offset += HEAP_REFERENCE_SIZE as u32;
        num_reference_fields += 1;
    }

    // Gaps are a max-heap, so shuffle from largest to smallest or gap fills
    // would be suboptimal.
    shuffle_forward(8, &mut field_offset, &mut remaining, &mut gaps);
    shuffle_forward(4, &mut field_offset, &mut remaining, &mut gaps);
    shuffle_forward(2, &mut field_offset, &mut remaining, &mut gaps);
    shuffle_forward(1, &mut field_offset, &mut remaining, &mut gaps);
    debug_assert!(remaining.is_empty(), "missed {} fields", remaining.len());

    LayoutResult { size: field_offset, num_reference_fields }
}

/// Lays out the instance fields of `class`, producing field offsets, the
/// object size, and the reference counts. The super class must already be
/// resolved.
pub(crate) fn link_instance_fields(class: ClassRef) -> LinkResult<()> {
    let fields = class.instance_fields();
    let start = match class.super_class() {
        Some(super_class) => {
            debug_assert!(super_class.is_resolved(), "{super_class:?}");
            super_class.object_size()
        }
        None => OBJECT_HEADER_SIZE,
    };

    let mut result = layout_fields(fields, start);

    // The reference root's `referent` field is deliberately left out of the
    // scanned count; the GC treats it specially.
    if class.descriptor() == REFERENCE_DESCRIPTOR {
        if result.num_reference_fields as usize != fields.len() {
            return Err(LinkError::ClassFormat(
                "reference root declares non-reference instance fields".into(),
            ));
        }
        match fields.last() {
            Some(last) if last.name() == "referent" => result.num_reference_fields -= 1,
            _ => {
                return Err(LinkError::ClassFormat(
                    "reference root must declare `referent` last".into(),
                ))
            }
        }
    }

    class.set_num_reference_instance_fields(result.num_reference_fields);
    if result.num_reference_fields == 0 || class.super_class().is_none() {
        // The header's class slot is scanned unconditionally, so a class
        // with no declared references and a reference-free super can skip
        // body scanning entirely.
        let super_free = class
            .super_class()
            .map(|s| s.class_flags().contains(ClassFlags::NO_REFERENCE_FIELDS))
            .unwrap_or(true);
        if super_free {
            class.add_class_flags(ClassFlags::NO_REFERENCE_FIELDS);
        }
    }

    if !class.is_variable_size() {
        let size = align_up(result.size as usize, 8) as u32;
        let previous = class.object_size();
        debug_assert!(
            previous == 0 || previous == size,
            "object size changed from {previous} to {size} for {}",
            class.descriptor()
        );
        class.set_object_size(size);
    }
    Ok(())
}

/// Lays out the static fields of `class`; returns the static-area size.
pub(crate) fn link_static_fields(class: ClassRef) -> LinkResult<u32> {
    let fields = class.static_fields();
    let result = layout_fields(fields, 0);
    class.set_num_reference_static_fields(result.num_reference_fields);
    Ok(align_up(result.size as usize, 8) as u32)
}

/// Computes the bitmap of leading reference slots, falling back to the
/// walk-super sentinel when the bitmap overflows.
pub(crate) fn create_reference_instance_offsets(class: &Class) {
    let mut reference_offsets = 0u32;
    if let Some(super_class) = class.super_class() {
        reference_offsets = super_class.reference_instance_offsets();
        if reference_offsets != CLASS_WALK_SUPER {
            let num_reference_fields = class.num_reference_instance_fields();
            if num_reference_fields != 0 {
                let start_offset =
                    align_up(super_class.object_size() as usize, HEAP_REFERENCE_SIZE) as u32;
                let start_bit =
                    (start_offset - OBJECT_HEADER_SIZE) / HEAP_REFERENCE_SIZE as u32;
                if start_bit + num_reference_fields > 32 {
                    reference_offsets = CLASS_WALK_SUPER;
                } else {
                    let mask = (0xffff_ffffu64 << start_bit) as u32
                        & (0xffff_ffffu64 >> (32 - (start_bit + num_reference_fields))) as u32;
                    reference_offsets |= mask;
                }
            }
        }
    }
    class.set_reference_instance_offsets(reference_offsets);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::LinearAlloc;
    use dexrt_dex::DexFileBuilder;
    use dexrt_types::{ClassStatus, LoaderId};

    fn build_class(
        arena: &LinearAlloc,
        descriptor: &str,
        fields: &[(&str, &str)],
        super_class: Option<ClassRef>,
    ) -> ClassRef {
        let mut builder = DexFileBuilder::new("layout-test.dex");
        let mut class_builder = builder.class(descriptor).access_flags(0x1);
        for (name, ty) in fields {
            class_builder = class_builder.instance_field(name, ty, 0x1);
        }
        class_builder.finish();
        let dex = builder.build();

        let class = arena.alloc_class(Class::new(descriptor, LoaderId::BOOT));
        if let Some(s) = super_class {
            class.set_super_class(s);
        }
        let def = dex.class_def(dex.find_class_def(descriptor).unwrap());
        let arts: Vec<ArtField> = def
            .class_data
            .instance_fields
            .iter()
            .map(|f| ArtField::new(dex.clone(), f.field_idx, f.access_flags))
            .collect();
        let slice = arena.alloc_fields(arts);
        for f in slice {
            f.set_declaring_class(class);
        }
        class.set_instance_fields(slice);
        class
    }

    fn object_root(arena: &LinearAlloc) -> ClassRef {
        let object = arena.alloc_class(Class::new("Ljava/lang/Object;", LoaderId::BOOT));
        object.set_object_size(OBJECT_HEADER_SIZE);
        object.set_status(ClassStatus::Resolved);
        object
    }

    fn offset_of(class: ClassRef, name: &str) -> u32 {
        class
            .instance_fields()
            .iter()
            .find(|f| f.name() == name)
            .unwrap()
            .offset()
    }

    #[test]
    fn mixed_field_layout() {
        // {long l, byte b, Object r, int i} under a super of size 8.
        let arena = LinearAlloc::new();
        let object = object_root(&arena);
        let class = build_class(
            &arena,
            "La/Mixed;",
            &[("l", "J"), ("b", "B"), ("r", "Ljava/lang/Object;"), ("i", "I")],
            Some(object),
        );
        link_instance_fields(class).unwrap();
        create_reference_instance_offsets(&class);

        assert_eq!(offset_of(class, "r"), 8);
        assert_eq!(offset_of(class, "l"), 16);
        assert_eq!(offset_of(class, "i"), 24);
        assert_eq!(offset_of(class, "b"), 28);
        assert_eq!(class.object_size(), 32);
        assert_eq!(class.num_reference_instance_fields(), 1);
        // Only the slot at offset 8 (bit 0) holds a reference.
        assert_eq!(class.reference_instance_offsets(), 0b1);
        assert!(!class.class_flags().contains(ClassFlags::NO_REFERENCE_FIELDS));
    }

    #[test]
    fn gaps_are_reused_largest_first() {
        // A reference at a 12-byte super boundary forces a 4-byte pad the
        // int can reuse.
        let arena = LinearAlloc::new();
        let object = object_root(&arena);
        let mid = build_class(&arena, "La/Mid;", &[("x", "I")], Some(object));
        link_instance_fields(mid).unwrap();
        mid.set_status(ClassStatus::Resolved);
        assert_eq!(mid.object_size(), 16);
        assert_eq!(offset_of(mid, "x"), 8);

        // Instance sizes round up to 8, so force an unaligned start with a
        // hand-set super size.
        let unrounded = build_class(&arena, "La/Unrounded;", &[], Some(object));
        unrounded.set_object_size(12);
        unrounded.set_status(ClassStatus::Resolved);

        let class = build_class(
            &arena,
            "La/Gaps;",
            &[("r", "Ljava/lang/Object;"), ("s", "S"), ("c", "C"), ("b", "B")],
            Some(unrounded),
        );
        link_instance_fields(class).unwrap();
        // Reference aligns from 12 up to 16, leaving a gap at 12..16 that
        // the short and char fill, then the byte appends.
        assert_eq!(offset_of(class, "r"), 16);
        assert_eq!(offset_of(class, "s"), 12);
        assert_eq!(offset_of(class, "c"), 14);
        assert_eq!(offset_of(class, "b"), 24);
        assert_eq!(class.object_size(), 32);
    }

    #[test]
    fn field_order_is_deterministic_within_bucket() {
        let arena = LinearAlloc::new();
        let object = object_root(&arena);
        let class = build_class(
            &arena,
            "La/Tie;",
            &[("z", "I"), ("a", "I"), ("m", "I")],
            Some(object),
        );
        link_instance_fields(class).unwrap();
        // Declaration (container index) order, not name order.
        assert_eq!(offset_of(class, "z"), 8);
        assert_eq!(offset_of(class, "a"), 12);
        assert_eq!(offset_of(class, "m"), 16);
    }

    #[test]
    fn referent_is_excluded_from_scanning() {
        let arena = LinearAlloc::new();
        let object = object_root(&arena);
        let class = build_class(
            &arena,
            REFERENCE_DESCRIPTOR,
            &[
                ("pendingNext", "Ljava/lang/ref/Reference;"),
                ("queue", "Ljava/lang/Object;"),
                ("queueNext", "Ljava/lang/ref/Reference;"),
                ("referent", "Ljava/lang/Object;"),
            ],
            Some(object),
        );
        link_instance_fields(class).unwrap();
        assert_eq!(class.instance_fields().len(), 4);
        assert_eq!(class.num_reference_instance_fields(), 3);
    }

    #[test]
    fn bitmap_overflow_walks_super() {
        let arena = LinearAlloc::new();
        let object = object_root(&arena);
        let fields: Vec<(String, &str)> = (0..33)
            .map(|i| (format!("r{i}"), "Ljava/lang/Object;"))
            .collect();
        let borrowed: Vec<(&str, &str)> =
            fields.iter().map(|(n, t)| (n.as_str(), *t)).collect();
        let class = build_class(&arena, "La/Wide;", &borrowed, Some(object));
        link_instance_fields(class).unwrap();
        create_reference_instance_offsets(&class);
        assert_eq!(class.reference_instance_offsets(), CLASS_WALK_SUPER);
    }

    #[test]
    fn static_fields_start_at_zero() {
        let arena = LinearAlloc::new();
        let mut builder = DexFileBuilder::new("statics.dex");
        builder
            .class("La/S;")
            .access_flags(0x1)
            .static_field("a", "J", 0x9)
            .static_field("b", "B", 0x9)
            .static_field("r", "Ljava/lang/String;", 0x9)
            .finish();
        let dex = builder.build();
        let class = arena.alloc_class(Class::new("La/S;", LoaderId::BOOT));
        let def = dex.class_def(dex.find_class_def("La/S;").unwrap());
        let arts: Vec<ArtField> = def
            .class_data
            .static_fields
            .iter()
            .map(|f| ArtField::new(dex.clone(), f.field_idx, f.access_flags))
            .collect();
        class.set_static_fields(arena.alloc_fields(arts));

        let size = link_static_fields(class).unwrap();
        let offsets: Vec<(String, u32)> = class
            .static_fields()
            .iter()
            .map(|f| (f.name().to_string(), f.offset()))
            .collect();
        // Reference first at 0, then the long, then the byte.
        assert_eq!(offsets[2], ("r".to_string(), 0));
        assert_eq!(offsets[0], ("a".to_string(), 8));
        assert_eq!(offsets[1], ("b".to_string(), 16));
        assert_eq!(size, 24);
        assert_eq!(class.num_reference_static_fields(), 1);
    }

    #[test]
    fn gap_queue_prefers_largest_then_lowest() {
        let mut gaps = FieldGaps::default();
        gaps.add(9, 16); // 1@9, 2@10, 4@12
        assert_eq!(gaps.take(4), Some(12));
        assert_eq!(gaps.take(2), Some(10));
        assert_eq!(gaps.take(2), None);
        assert_eq!(gaps.take(1), Some(9));
        assert!(gaps.is_empty());
    }
}
