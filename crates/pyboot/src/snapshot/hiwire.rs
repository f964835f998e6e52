//! Serialization of the interpreter's host-object reference table.
//!
//! Only objects the host can reconstruct by re-walking an accessor chain are
//! serializable. Anything else aborts a dedicated capture with a diagnostic
//! the user can act on.

use pyboot_wasm::{ForeignValue, SerializedRef, WasmError};

use crate::error::{InternalError, UserError};

const MAX_KEYS: usize = 10;
const MAX_STACK_LINES: usize = 10;
const MAX_JSON_CHARS: usize = 256;

/// The host-object references a restore knows how to rehydrate.
pub struct HiwireRegistry {
    known_modules: Vec<String>,
}

impl Default for HiwireRegistry {
    fn default() -> Self {
        HiwireRegistry {
            // The worker entrypoint helper is re-created on every boot and
            // can always be resolved again by name.
            known_modules: vec!["python-entrypoint-helper".to_owned()],
        }
    }
}

impl HiwireRegistry {
    pub fn with_known_modules(known_modules: Vec<String>) -> Self {
        HiwireRegistry { known_modules }
    }

    pub fn recognises(&self, reference: &SerializedRef) -> bool {
        self.known_modules.iter().any(|module| *module == reference.module_name)
    }

    /// The serializer handed to the interpreter during a dedicated capture.
    pub fn serializer(&self) -> impl FnMut(&dyn ForeignValue) -> pyboot_wasm::Result<SerializedRef> + '_ {
        move |value| match value.as_serialized_ref() {
            Some(reference) if self.recognises(&reference) => Ok(reference),
            _ => Err(WasmError::HiwireSerialization(describe_value(value).into())),
        }
    }

    /// The deserializer handed to `finalize_bootstrap` during restore.
    pub fn deserializer(&self) -> impl FnMut(&SerializedRef) -> pyboot_wasm::Result<()> + '_ {
        move |reference| {
            if self.recognises(reference) {
                Ok(())
            } else {
                Err(WasmError::Other(
                    InternalError::UnknownSerializedRef(reference.to_string())
                        .to_string()
                        .into(),
                ))
            }
        }
    }
}

/// Maps a serializer failure coming back out of the interpreter to the
/// user-facing error it is.
pub fn serialization_user_error(err: WasmError) -> crate::error::BootError {
    match err {
        WasmError::HiwireSerialization(description) => UserError::UnserializableGlobal(description.into_owned()).into(),
        other => other.into(),
    }
}

/// A user-facing description of a value that cannot go into a snapshot:
/// its type, a sample of its keys, its stack when it is error-like, its JSON
/// contents when it has any, and the remediation.
pub fn describe_value(value: &dyn ForeignValue) -> String {
    let mut description = format!(
        "a top-level global of type `{}` cannot be serialized into a dedicated snapshot",
        value.type_name()
    );

    if let Some(keys) = value.keys() {
        let sample: Vec<&str> = keys.iter().take(MAX_KEYS).map(String::as_str).collect();
        let suffix = if keys.len() > MAX_KEYS { ", …" } else { "" };
        description.push_str(&format!("; keys: {}{suffix}", sample.join(", ")));
    }

    if let Some(json) = value.json_repr() {
        let mut rendered = json.to_string();
        if rendered.len() > MAX_JSON_CHARS {
            let cut = (0..=MAX_JSON_CHARS).rev().find(|i| rendered.is_char_boundary(*i)).unwrap_or(0);
            rendered.truncate(cut);
            rendered.push('…');
        }
        description.push_str(&format!("; contents: {rendered}"));
    }

    if let Some(stack) = value.stack() {
        let lines: Vec<&str> = stack.lines().take(MAX_STACK_LINES).collect();
        description.push_str("\nstack:\n");
        description.push_str(&lines.join("\n"));
    }

    description.push_str("\nDelete the global (del it at the end of the top-level scope) to make the worker snapshot-compatible.");
    description
}

#[cfg(test)]
mod tests {
    use pyboot_wasm::AccessorStep;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testutil::FakeForeign;

    fn entrypoint_ref() -> SerializedRef {
        SerializedRef::new(
            "python-entrypoint-helper",
            vec![AccessorStep::NamedField("default".to_owned()), AccessorStep::Prototype],
        )
    }

    #[test]
    fn recognised_references_serialize_to_their_chain() {
        let registry = HiwireRegistry::default();
        let value = FakeForeign {
            type_name: "function".to_owned(),
            serialized: Some(entrypoint_ref()),
            ..FakeForeign::default()
        };
        let mut serializer = registry.serializer();
        assert_eq!(serializer(&value).unwrap(), entrypoint_ref());
    }

    #[test]
    fn unrecognised_values_become_a_user_diagnostic() {
        let registry = HiwireRegistry::default();
        let value = FakeForeign {
            type_name: "WebSocket".to_owned(),
            keys: Some((0..15).map(|i| format!("k{i}")).collect()),
            ..FakeForeign::default()
        };
        let mut serializer = registry.serializer();
        let err = serializer(&value).unwrap_err();
        let message = match serialization_user_error(err) {
            crate::error::BootError::User(crate::error::UserError::UnserializableGlobal(m)) => m,
            other => panic!("expected a user error, got {other:?}"),
        };
        assert!(message.contains("type `WebSocket`"));
        assert!(message.contains("k0, k1"));
        assert!(message.contains("k9, …"));
        assert!(!message.contains("k10,"));
        assert!(message.contains("Delete the global"));
    }

    #[test]
    fn error_like_values_include_ten_stack_lines() {
        let stack: String = (0..14).map(|i| format!("at frame{i}\n")).collect();
        let value = FakeForeign {
            type_name: "TypeError".to_owned(),
            stack: Some(stack),
            ..FakeForeign::default()
        };
        let description = describe_value(&value);
        assert!(description.contains("type `TypeError`"));
        assert!(description.contains("at frame0"));
        assert!(description.contains("at frame9"));
        assert!(!description.contains("at frame10"));
    }

    #[test]
    fn json_contents_are_truncated() {
        let value = FakeForeign {
            type_name: "Object".to_owned(),
            json: Some(serde_json::json!({ "payload": "x".repeat(600) })),
            ..FakeForeign::default()
        };
        let description = describe_value(&value);
        assert!(description.contains("contents: "));
        assert!(description.contains('…'));
        assert!(description.len() < 600);
    }

    #[test]
    fn deserializer_rejects_unknown_references() {
        let registry = HiwireRegistry::default();
        let mut deserializer = registry.deserializer();
        assert!(deserializer(&entrypoint_ref()).is_ok());
        let unknown = SerializedRef::new("user-module", vec![]);
        assert!(deserializer(&unknown).is_err());
    }
}
