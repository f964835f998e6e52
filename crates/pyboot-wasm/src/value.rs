use serde::{Deserialize, Serialize};

/// One step of an accessor chain leading from a module to a host object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessorStep {
    NamedField(String),
    Prototype,
}

/// A serialized reference to a host-side object: the module it hangs off and
/// the property accesses that reach it. Resolved again on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedRef {
    pub module_name: String,
    pub accessor_chain: Vec<AccessorStep>,
}

impl SerializedRef {
    pub fn new(module_name: impl Into<String>, accessor_chain: Vec<AccessorStep>) -> Self {
        SerializedRef {
            module_name: module_name.into(),
            accessor_chain,
        }
    }
}

impl std::fmt::Display for SerializedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.module_name)?;
        for step in &self.accessor_chain {
            match step {
                AccessorStep::NamedField(name) => write!(f, ".{name}")?,
                AccessorStep::Prototype => write!(f, ".[prototype]")?,
            }
        }
        Ok(())
    }
}

/// Introspection over a host-side object held in the interpreter's reference
/// table. The bootstrap core uses it to serialize recognised objects and to
/// describe unrecognised ones in user-facing diagnostics.
pub trait ForeignValue {
    /// The host-language type name of the value.
    fn type_name(&self) -> &str;

    /// Enumerable keys, when the value is object-like.
    fn keys(&self) -> Option<Vec<String>>;

    /// The stack trace, when the value is error-like.
    fn stack(&self) -> Option<String>;

    /// A JSON rendering of the value, when one exists.
    fn json_repr(&self) -> Option<serde_json::Value>;

    /// The serialized form, when this value is one the host knows how to
    /// reconstruct.
    fn as_serialized_ref(&self) -> Option<SerializedRef>;
}
