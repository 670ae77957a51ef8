//! Access flags and runtime class flags.
use bitflags::bitflags;

bitflags! {
    /// Access flags as stored in the container, plus runtime-internal bits
    /// in the high range that never appear on disk.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x1_0000;
        const DECLARED_SYNCHRONIZED = 0x2_0000;

        /// Runtime: verification is known unnecessary for this method.
        const PREVERIFIED = 0x0008_0000;
        /// Runtime: synthesized abstract method standing in for an
        /// unimplemented interface method.
        const MIRANDA = 0x0010_0000;
        /// Runtime: non-abstract interface method.
        const DEFAULT = 0x0040_0000;
        /// Runtime: marker for conflicting default implementations; any
        /// dispatch through this method raises an incompatible-class-change
        /// error.
        const DEFAULT_CONFLICT = 0x0080_0000;
    }
}

impl AccessFlags {
    /// Visibility bits only.
    pub fn visibility(self) -> AccessFlags {
        self & (AccessFlags::PUBLIC | AccessFlags::PRIVATE | AccessFlags::PROTECTED)
    }

    pub fn is_public(self) -> bool {
        self.contains(AccessFlags::PUBLIC)
    }

    pub fn is_package_private(self) -> bool {
        self.visibility().is_empty()
    }
}

bitflags! {
    /// Runtime role tags for a class. These are the dispatch key for the
    /// class's behavioral variants; there is no subclass hierarchy.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        /// No instance fields containing references (scanning can skip the
        /// body entirely).
        const NO_REFERENCE_FIELDS = 1 << 0;
        const STRING = 1 << 1;
        const OBJECT_ARRAY = 1 << 2;
        const PRIMITIVE_ARRAY = 1 << 3;
        const CLASS_LOADER = 1 << 4;
        const DEX_CACHE = 1 << 5;
        const SOFT_REFERENCE = 1 << 6;
        const WEAK_REFERENCE = 1 << 7;
        const FINALIZER_REFERENCE = 1 << 8;
        const PHANTOM_REFERENCE = 1 << 9;
        const FINALIZABLE = 1 << 10;
        const PROXY = 1 << 11;
        /// Placeholder inserted during definition; replaced by the final
        /// class and then retired.
        const TEMP = 1 << 12;
        /// Interface declaring at least one non-abstract method.
        const HAS_DEFAULT_METHODS = 1 << 13;
        /// Interface already covered by recursive default-interface
        /// initialization. A traversal shortcut; not initialization status.
        const RECURSIVELY_INITIALIZED = 1 << 14;
        /// Instances are not fixed-size (strings, arrays).
        const VARIABLE_SIZE = 1 << 15;
    }
}

impl ClassFlags {
    pub fn is_reference(self) -> bool {
        self.intersects(
            ClassFlags::SOFT_REFERENCE
                | ClassFlags::WEAK_REFERENCE
                | ClassFlags::FINALIZER_REFERENCE
                | ClassFlags::PHANTOM_REFERENCE,
        )
    }
}
