use crate::error::NimbusError;
use std::sync::LazyLock;

/// Names for `from_name` lookups must match this pattern: ASCII letters,
/// digits, underscore or hyphen, 1-64 characters, no spaces or slashes.
static NAME_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("valid regex"));

pub fn validate_object_name(kind: &str, name: &str) -> Result<(), NimbusError> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(NimbusError::invalid_parameter(
            "name",
            format!(
                "{kind} name {name:?} must match [a-zA-Z0-9_-]{{1,64}} (no spaces, no slashes)"
            ),
        ))
    }
}

/// Maps a server `NotFound` during a named lookup to a core `NotFound`
/// whose message names the object kind and the name that was looked up.
pub fn not_found_for(kind: &str, name: &str) -> NimbusError {
    NimbusError::not_found(format!("{kind} '{name}' not found"))
}

/// The identifier prefixes stable across the platform's RPC surface.
/// Callers may pattern-match these only for diagnostics (see spec section 6).
pub mod id_prefix {
    pub const APP: &str = "ap-";
    pub const SANDBOX: &str = "sb-";
    pub const IMAGE: &str = "im-";
    pub const VOLUME: &str = "vo-";
    pub const QUEUE: &str = "qu-";
    pub const DICT: &str = "di-";
    pub const SECRET: &str = "st-";
    pub const PROXY: &str = "pr-";
    pub const FUNCTION: &str = "fu-";
    pub const FUNCTION_ALT: &str = "fid-";
    pub const FUNCTION_CALL: &str = "fc-";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct App {
    pub id: String,
    pub name: String,
}

/// A tagged dynamic value used for `experimental_options` and bound class
/// parameters. Unknown tag combinations are rejected at construction time
/// rather than carried around as an untyped blob.
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicValue {
    Bool(bool),
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl DynamicValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            DynamicValue::Bool(_) => "bool",
            DynamicValue::Int(_) => "int",
            DynamicValue::String(_) => "string",
            DynamicValue::Bytes(_) => "bytes",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn accepts_valid_names() {
        assert!(validate_object_name("dict", "my-dict_1").is_ok());
    }

    #[test]
    fn rejects_spaces_and_slashes() {
        assert!(validate_object_name("dict", "has space").is_err());
        assert!(validate_object_name("dict", "has/slash").is_err());
        assert!(validate_object_name("dict", &"x".repeat(65)).is_err());
    }
}
