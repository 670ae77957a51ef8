use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DexError {
    #[error("string index {0} out of bounds in {1}")]
    BadStringIndex(u32, String),
    #[error("type index {0} out of bounds in {1}")]
    BadTypeIndex(u32, String),
    #[error("proto index {0} out of bounds in {1}")]
    BadProtoIndex(u32, String),
    #[error("method index {0} out of bounds in {1}")]
    BadMethodIndex(u32, String),
    #[error("field index {0} out of bounds in {1}")]
    BadFieldIndex(u32, String),
    #[error("class-def index {0} out of bounds in {1}")]
    BadClassDefIndex(u32, String),
    #[error("static value count {values} exceeds static field count {fields}")]
    TooManyStaticValues { values: usize, fields: usize },
}
