//! Typed input schemas for capabilities.
//!
//! A schema validates raw arguments before planning and is exported as JSON
//! Schema for the decision-maker. Validation fills in defaults, so planners
//! can rely on every declared field with a default being present.

use serde_json::{json, Map, Value};

use crate::error::GateError;
use crate::invocation::{ArgValue, Arguments};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Boolean,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    fn accepts(self, value: &ArgValue) -> bool {
        matches!(
            (self, value),
            (Self::String, ArgValue::Str(_))
                | (Self::Integer, ArgValue::Int(_))
                | (Self::Boolean, ArgValue::Bool(_))
        )
    }
}

/// Characters a string field may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// Anything; the sanitizer still applies.
    Free,
    /// Identifiers: `[A-Za-z0-9._@:-]`.
    Token,
    /// Token characters plus `/`.
    Path,
    /// Token characters plus space.
    Phrase,
}

impl Charset {
    fn allows(self, c: char) -> bool {
        let token = c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | ':' | '-');
        match self {
            Self::Free => true,
            Self::Token => token,
            Self::Path => token || c == '/',
            Self::Phrase => token || c == ' ',
        }
    }

    fn regex(self) -> Option<&'static str> {
        match self {
            Self::Free => None,
            Self::Token => Some(r"^[A-Za-z0-9._@:-]+$"),
            Self::Path => Some(r"^[A-Za-z0-9._@:/-]+$"),
            Self::Phrase => Some(r"^[A-Za-z0-9._@: -]+$"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub description: &'static str,
    pub required: bool,
    pub default: Option<ArgValue>,
    pub range: Option<(i64, i64)>,
    pub charset: Charset,
}

impl FieldSpec {
    fn new(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: true,
            default: None,
            range: None,
            charset: Charset::Free,
        }
    }

    /// A required string field.
    pub fn string(name: &'static str, description: &'static str) -> Self {
        Self::new(name, FieldKind::String, description)
    }

    pub fn integer(name: &'static str, description: &'static str) -> Self {
        Self::new(name, FieldKind::Integer, description)
    }

    pub fn boolean(name: &'static str, description: &'static str) -> Self {
        Self::new(name, FieldKind::Boolean, description)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Makes the field optional with `value` filled in when absent.
    pub fn default(mut self, value: ArgValue) -> Self {
        self.required = false;
        self.default = Some(value);
        self
    }

    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.range = Some((min, max));
        self
    }

    pub fn charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    fn check(&self, value: &ArgValue) -> Result<(), String> {
        if !self.kind.accepts(value) {
            return Err(format!(
                "expected {}, got {}",
                self.kind.name(),
                value.type_name()
            ));
        }
        match value {
            ArgValue::Int(n) => {
                if let Some((min, max)) = self.range {
                    if *n < min || *n > max {
                        return Err(format!("{n} is outside {min}..={max}"));
                    }
                }
            }
            ArgValue::Str(s) => {
                if s.is_empty() && self.charset != Charset::Free {
                    return Err("must not be empty".to_string());
                }
                if let Some(bad) = s.chars().find(|c| !self.charset.allows(*c)) {
                    return Err(format!("character {bad:?} is not allowed"));
                }
            }
            ArgValue::Bool(_) => {}
        }
        Ok(())
    }

    fn to_json(&self) -> Value {
        let mut prop = Map::new();
        prop.insert("type".to_string(), json!(self.kind.name()));
        prop.insert("description".to_string(), json!(self.description));
        if let Some((min, max)) = self.range {
            prop.insert("minimum".to_string(), json!(min));
            prop.insert("maximum".to_string(), json!(max));
        }
        if let Some(pattern) = self.charset.regex() {
            prop.insert("pattern".to_string(), json!(pattern));
        }
        if let Some(default) = &self.default {
            prop.insert("default".to_string(), json!(default));
        }
        Value::Object(prop)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Checks `arguments` against the schema and returns them with defaults
    /// applied. Unknown fields are rejected.
    pub fn validate(&self, arguments: &Arguments) -> Result<Arguments, GateError> {
        if let Some(unknown) = arguments
            .keys()
            .find(|k| !self.fields.iter().any(|f| f.name == k.as_str()))
        {
            return Err(GateError::InvalidArguments(format!(
                "unknown argument '{unknown}'"
            )));
        }

        let mut validated = Arguments::new();
        for field in &self.fields {
            match arguments.get(field.name) {
                Some(value) => {
                    field.check(value).map_err(|reason| {
                        GateError::InvalidArguments(format!(
                            "invalid argument '{}': {reason}",
                            field.name
                        ))
                    })?;
                    validated.insert(field.name.to_string(), value.clone());
                }
                None if field.required => {
                    return Err(GateError::InvalidArguments(format!(
                        "missing required argument '{}'",
                        field.name
                    )));
                }
                None => {
                    if let Some(default) = &field.default {
                        validated.insert(field.name.to_string(), default.clone());
                    }
                }
            }
        }
        Ok(validated)
    }

    /// JSON Schema for the decision-maker's tool definition.
    pub fn to_json(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.name.to_string(), f.to_json()))
            .collect();
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}
