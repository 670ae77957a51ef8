//! Index newtypes for the container tables.
//!
//! Container members are referenced by position in one of the per-container
//! id tables. Mixing those positions up compiles fine with bare `u32`s, so
//! each table gets its own index type.
use std::fmt::{self, Display, Formatter};

macro_rules! container_index {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub const fn new(index: u32) -> Self {
                $name(index)
            }

            pub const fn as_u32(self) -> u32 {
                self.0
            }

            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(index: u32) -> Self {
                $name(index)
            }
        }

        impl From<$name> for u32 {
            fn from(index: $name) -> Self {
                index.0
            }
        }

        impl From<$name> for usize {
            fn from(index: $name) -> Self {
                index.0 as usize
            }
        }
    };
}

container_index! {
    /// Position in a container's string table.
    StringIndex
}

container_index! {
    /// Position in a container's type-id table.
    TypeIndex
}

container_index! {
    /// Position in a container's prototype table.
    ProtoIndex
}

container_index! {
    /// Position in a container's method-id table.
    DexMethodIndex
}

container_index! {
    /// Position in a container's field-id table.
    DexFieldIndex
}

container_index! {
    /// Position in a container's class-def table.
    ClassDefIndex
}
