//! Parameter contracts for tools.
//!
//! Remote tools describe their arguments with a JSON Schema object. That
//! schema is translated once into a closed [`ParamKind`] per property so the
//! generation loop can check model-supplied arguments before anything is sent
//! over the wire, and so the schema shown to the model is always well formed.

use anyhow::{Result, bail};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

/// Primitive kind a single parameter may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Array(Box<ParamKind>),
    /// Closed set of string values.
    Enum(Vec<String>),
}

impl ParamKind {
    fn to_json_schema(&self) -> Value {
        match self {
            ParamKind::String => json!({ "type": "string" }),
            ParamKind::Number => json!({ "type": "number" }),
            ParamKind::Boolean => json!({ "type": "boolean" }),
            ParamKind::Array(item) => json!({ "type": "array", "items": item.to_json_schema() }),
            ParamKind::Enum(values) => json!({ "type": "string", "enum": values }),
        }
    }

    fn describe(&self) -> String {
        match self {
            ParamKind::String => "string".to_string(),
            ParamKind::Number => "number".to_string(),
            ParamKind::Boolean => "boolean".to_string(),
            ParamKind::Array(item) => format!("array of {}", item.describe()),
            ParamKind::Enum(values) => format!("one of [{}]", values.join(", ")),
        }
    }

    fn check(&self, name: &str, value: &Value) -> Result<(), ContractViolation> {
        let wrong_kind = || ContractViolation::WrongKind {
            name: name.to_string(),
            expected: self.describe(),
        };
        match (self, value) {
            (ParamKind::String, Value::String(_)) => Ok(()),
            (ParamKind::Number, Value::Number(_)) => Ok(()),
            (ParamKind::Boolean, Value::Bool(_)) => Ok(()),
            (ParamKind::Enum(values), Value::String(s)) => {
                if values.iter().any(|v| v == s) {
                    Ok(())
                } else {
                    Err(ContractViolation::NotInSet {
                        name: name.to_string(),
                        value: s.clone(),
                        allowed: values.clone(),
                    })
                }
            }
            (ParamKind::Array(item), Value::Array(items)) => {
                for (i, element) in items.iter().enumerate() {
                    item.check(&format!("{}[{}]", name, i), element)?;
                }
                Ok(())
            }
            _ => Err(wrong_kind()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub kind: ParamKind,
    pub required: bool,
    pub description: Option<String>,
}

/// Why a set of arguments was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("arguments must be a JSON object")]
    NotAnObject,
    #[error("missing required parameter '{0}'")]
    Missing(String),
    #[error("parameter '{name}' must be {expected}")]
    WrongKind { name: String, expected: String },
    #[error("parameter '{name}' has value '{value}', expected one of [{}]", .allowed.join(", "))]
    NotInSet {
        name: String,
        value: String,
        allowed: Vec<String>,
    },
}

/// Named parameters of one tool, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamContract {
    params: BTreeMap<String, ParamSpec>,
}

impl ParamContract {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn param(
        mut self,
        name: impl Into<String>,
        kind: ParamKind,
        required: bool,
        description: Option<&str>,
    ) -> Self {
        self.params.insert(
            name.into(),
            ParamSpec {
                kind,
                required,
                description: description.map(str::to_string),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamSpec)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Translate a JSON Schema object into a contract.
    ///
    /// A missing or `null` schema yields an empty contract. A schema whose
    /// `properties` is not an object of objects is rejected.
    pub fn from_json_schema(schema: &Value) -> Result<Self> {
        let schema = match schema {
            Value::Null => return Ok(Self::new()),
            Value::Object(map) => map,
            other => bail!("parameter schema must be an object, got {}", type_name(other)),
        };

        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let properties = match schema.get("properties") {
            None | Some(Value::Null) => return Ok(Self::new()),
            Some(Value::Object(props)) => props,
            Some(other) => bail!("'properties' must be an object, got {}", type_name(other)),
        };

        let mut contract = Self::new();
        for (name, property) in properties {
            let Value::Object(property) = property else {
                bail!("property '{}' must be an object", name);
            };
            contract.params.insert(
                name.clone(),
                ParamSpec {
                    kind: translate_property(property),
                    required: required.contains(&name.as_str()),
                    description: property
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
            );
        }
        Ok(contract)
    }

    /// Render the contract back into a JSON Schema object for the model.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.params {
            let mut schema = spec.kind.to_json_schema();
            if let (Some(desc), Some(obj)) = (&spec.description, schema.as_object_mut()) {
                obj.insert("description".to_string(), json!(desc));
            }
            properties.insert(name.clone(), schema);
            if spec.required {
                required.push(name.clone());
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check model-supplied arguments. `null` is treated as `{}`.
    /// Unknown keys are passed through untouched.
    pub fn validate(&self, args: &Value) -> Result<(), ContractViolation> {
        let empty = Map::new();
        let args = match args {
            Value::Null => &empty,
            Value::Object(map) => map,
            _ => return Err(ContractViolation::NotAnObject),
        };

        for (name, spec) in &self.params {
            match args.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(ContractViolation::Missing(name.clone()));
                }
                None | Some(Value::Null) => {}
                Some(value) => spec.kind.check(name, value)?,
            }
        }
        Ok(())
    }
}

fn translate_property(property: &Map<String, Value>) -> ParamKind {
    match property.get("type").and_then(Value::as_str) {
        Some("array") => {
            let items = property.get("items").and_then(Value::as_object);
            let element = match items {
                Some(items) => match string_enum(items) {
                    Some(values) => ParamKind::Enum(values),
                    None => primitive(items.get("type").and_then(Value::as_str)),
                },
                None => ParamKind::String,
            };
            ParamKind::Array(Box::new(element))
        }
        Some("string") => match string_enum(property) {
            Some(values) => ParamKind::Enum(values),
            None => ParamKind::String,
        },
        other => primitive(other),
    }
}

fn primitive(type_name: Option<&str>) -> ParamKind {
    match type_name {
        Some("number") | Some("integer") => ParamKind::Number,
        Some("boolean") => ParamKind::Boolean,
        _ => ParamKind::String,
    }
}

/// Non-empty list of the string members of an `enum`, if any.
fn string_enum(schema: &Map<String, Value>) -> Option<Vec<String>> {
    let values: Vec<String> = schema
        .get("enum")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    (!values.is_empty()).then_some(values)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
