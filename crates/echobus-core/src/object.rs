//! Declarative object and method registration metadata.
//!
//! An [`ObjectSpec`] is handed to the bus at registration time. It carries
//! no logic: the bus uses it to route calls and reject unknown methods
//! before they ever reach the service.

use serde::{Deserialize, Serialize};

/// Wire type of a declared method argument field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// UTF-8 string field.
    String,
}

/// A single named argument field of a method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name as it appears in call arguments.
    pub name: String,
    /// Declared field type.
    pub ty: FieldType,
}

/// A named method with its declared argument fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSpec {
    /// Method name.
    pub name: String,
    /// Declared argument fields. Callers may omit any of them.
    pub fields: Vec<FieldSpec>,
}

impl MethodSpec {
    /// Create a method spec with no declared fields.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Declare an argument field on this method.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
        });
        self
    }
}

/// A named bus object and the methods it exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSpec {
    /// Object name, unique per bus.
    pub name: String,
    /// Methods callable on this object.
    pub methods: Vec<MethodSpec>,
}

impl ObjectSpec {
    /// Create an object spec with no methods.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Add a method to this object.
    #[must_use]
    pub fn method(mut self, method: MethodSpec) -> Self {
        self.methods.push(method);
        self
    }

    /// Returns `true` if this object declares a method with `name`.
    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }
}
