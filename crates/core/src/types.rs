//! Column type definitions for rill.

/// Column types a table can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Boolean type (true/false)
    Bool,
    /// Double precision number
    Number,
    /// UTF-8 string
    String,
}

impl ValueType {
    /// Returns the lowercase type name used in schema dumps.
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Bool => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
        }
    }
}
