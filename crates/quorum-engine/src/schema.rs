use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Closed schema variant covering the JSON-Schema subset tool parameters
/// actually use. Validated once at config load, not per call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamSchema {
    Object {
        #[serde(default)]
        properties: BTreeMap<String, ParamSchema>,
        #[serde(default)]
        required: Vec<String>,
        #[serde(default = "default_true", rename = "additionalProperties")]
        additional_properties: bool,
    },
    Array {
        items: Box<ParamSchema>,
    },
    String,
    Number,
    Boolean,
    Null,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl SchemaIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl ParamSchema {
    pub fn empty_object() -> Self {
        Self::Object {
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: true,
        }
    }

    /// Structural consistency check run at config load: every required name
    /// must exist among the declared properties.
    pub fn check_consistency(&self) -> Result<(), String> {
        match self {
            Self::Object {
                properties,
                required,
                ..
            } => {
                for name in required {
                    if !properties.contains_key(name) {
                        return Err(format!(
                            "required property '{name}' is not declared in properties"
                        ));
                    }
                }
                for (name, property) in properties {
                    property
                        .check_consistency()
                        .map_err(|issue| format!("{name}.{issue}"))?;
                }
                Ok(())
            }
            Self::Array { items } => items.check_consistency(),
            _ => Ok(()),
        }
    }

    pub fn validate_value(&self, value: &Value) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        self.validate_at("$", value, &mut issues);
        issues
    }

    fn validate_at(&self, path: &str, value: &Value, issues: &mut Vec<SchemaIssue>) {
        match self {
            Self::Object {
                properties,
                required,
                additional_properties,
            } => {
                let Some(object) = value.as_object() else {
                    issues.push(SchemaIssue::new(path, "expected object"));
                    return;
                };
                for name in required {
                    if !object.contains_key(name) {
                        issues.push(SchemaIssue::new(
                            path,
                            format!("missing required property '{name}'"),
                        ));
                    }
                }
                for (name, entry) in object {
                    match properties.get(name) {
                        Some(property) => {
                            property.validate_at(&format!("{path}.{name}"), entry, issues);
                        }
                        None if !additional_properties => {
                            issues.push(SchemaIssue::new(
                                path,
                                format!("unexpected property '{name}'"),
                            ));
                        }
                        None => {}
                    }
                }
            }
            Self::Array { items } => {
                let Some(entries) = value.as_array() else {
                    issues.push(SchemaIssue::new(path, "expected array"));
                    return;
                };
                for (index, entry) in entries.iter().enumerate() {
                    items.validate_at(&format!("{path}[{index}]"), entry, issues);
                }
            }
            Self::String => {
                if !value.is_string() {
                    issues.push(SchemaIssue::new(path, "expected string"));
                }
            }
            Self::Number => {
                if !value.is_number() {
                    issues.push(SchemaIssue::new(path, "expected number"));
                }
            }
            Self::Boolean => {
                if !value.is_boolean() {
                    issues.push(SchemaIssue::new(path, "expected boolean"));
                }
            }
            Self::Null => {
                if !value.is_null() {
                    issues.push(SchemaIssue::new(path, "expected null"));
                }
            }
        }
    }

    /// The JSON-Schema rendering advertised to the model. The serde shape of
    /// this enum is already the subset we speak, so this is a plain
    /// serialization.
    pub fn to_json_schema(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Render validation issues for an error message, reporting at most `max`.
pub fn format_issues(issues: &[SchemaIssue], max: usize) -> String {
    let mut rendered: Vec<String> = issues
        .iter()
        .take(max)
        .map(|issue| format!("{}: {}", issue.path, issue.message))
        .collect();
    if issues.len() > max {
        rendered.push(format!("(+{} more)", issues.len() - max));
    }
    rendered.join("; ")
}
