use thiserror::Error;

/// The error kinds the linker distinguishes.
///
/// A class that fails definition or initialization stores its failure and
/// replays it on every subsequent access; only `NoClassDefFound` may morph
/// into the generic `EarlierFailure` for replay.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinkError {
    #[error("no class definition found for {descriptor}")]
    NoClassDefFound {
        descriptor: String,
        #[source]
        cause: Option<Box<LinkError>>,
    },

    #[error("circular class resolution involving {0}")]
    ClassCircularity(String),

    #[error("class format error: {0}")]
    ClassFormat(String),

    #[error("illegal access: {0}")]
    IllegalAccess(String),

    #[error("incompatible class change: {0}")]
    IncompatibleClassChange(String),

    #[error("verification of {descriptor} failed: {message}")]
    Verify { descriptor: String, message: String },

    #[error("linkage error: {0}")]
    Linkage(String),

    #[error("allocation failed: {0}")]
    OutOfMemory(String),

    #[error("re-use of erroneous class {0}")]
    EarlierFailure(String),

    #[error("exception in initializer of {descriptor}: {message}")]
    ExceptionInInitializer { descriptor: String, message: String },
}

impl LinkError {
    pub fn no_class_def(descriptor: impl Into<String>) -> LinkError {
        LinkError::NoClassDefFound { descriptor: descriptor.into(), cause: None }
    }

    pub fn no_class_def_caused(descriptor: impl Into<String>, cause: LinkError) -> LinkError {
        LinkError::NoClassDefFound {
            descriptor: descriptor.into(),
            cause: Some(Box::new(cause)),
        }
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
