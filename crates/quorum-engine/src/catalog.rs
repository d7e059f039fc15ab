use quorum_llm::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EngineError;
use crate::schema::{ParamSchema, SchemaIssue, format_issues};

pub const TOOL_NOT_IN_CATALOG_CODE: &str = "E_TOOL_NOT_IN_CATALOG";
pub const TOOL_INVALID_ARGS_CODE: &str = "E_TOOL_INVALID_ARGS";

/// Maximum number of schema violations quoted in one error message.
const MAX_REPORTED_ISSUES: usize = 5;

/// One tool as declared by the active revision's configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResource {
    pub name: String,
    pub description: String,
    /// Package/extension the handler is registered under.
    pub package: String,
    pub parameters: ParamSchema,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message_limit: Option<usize>,
}

/// Catalog entry visible to the model and the executor for one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCatalogItem {
    pub name: String,
    pub description: String,
    pub parameters: ParamSchema,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message_limit: Option<usize>,
}

impl ToolCatalogItem {
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.to_json_schema(),
        }
    }
}

/// Rebuilt per step from the active revision's tool resources. Schema
/// consistency failures are configuration errors and fail the step.
pub fn build_catalog(resources: &[ToolResource]) -> Result<Vec<ToolCatalogItem>, EngineError> {
    let mut items = Vec::with_capacity(resources.len());
    for resource in resources {
        resource.parameters.check_consistency().map_err(|issue| {
            EngineError::InvalidConfiguration(format!(
                "tool '{}' has an invalid parameter schema: {issue}",
                resource.name
            ))
        })?;
        items.push(ToolCatalogItem {
            name: resource.name.clone(),
            description: resource.description.clone(),
            parameters: resource.parameters.clone(),
            source: resource.package.clone(),
            error_message_limit: resource.error_message_limit,
        });
    }
    Ok(items)
}

pub fn find_catalog_item<'a>(
    catalog: &'a [ToolCatalogItem],
    name: &str,
) -> Option<&'a ToolCatalogItem> {
    catalog.iter().find(|item| item.name == name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    Ok,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolErrorInfo {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Outcome of one tool call, happy or not. Tool-level failures are values a
/// model can react to, never engine errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub status: ToolResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
}

impl ToolCallResult {
    pub fn ok(tool_call_id: impl Into<String>, tool_name: impl Into<String>, output: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            status: ToolResultStatus::Ok,
            output: Some(output),
            error: None,
        }
    }

    /// A call naming an operation outside the current catalog. The handler is
    /// never invoked.
    pub fn not_in_catalog(tool_call_id: impl Into<String>, tool_name: &str) -> Self {
        Self::failed(
            tool_call_id,
            tool_name,
            ToolErrorInfo {
                name: "ToolNotInCatalogError".to_string(),
                message: format!("Tool not in catalog: {tool_name}"),
                code: Some(TOOL_NOT_IN_CATALOG_CODE.to_string()),
            },
        )
    }

    pub fn invalid_args(
        tool_call_id: impl Into<String>,
        tool_name: &str,
        issues: &[SchemaIssue],
    ) -> Self {
        Self::failed(
            tool_call_id,
            tool_name,
            ToolErrorInfo {
                name: "ToolInputValidationError".to_string(),
                message: format!(
                    "Invalid arguments for tool '{tool_name}': {}",
                    format_issues(issues, MAX_REPORTED_ISSUES)
                ),
                code: Some(TOOL_INVALID_ARGS_CODE.to_string()),
            },
        )
    }

    /// A handler failure, with the message truncated to the per-tool limit.
    pub fn execution_error(
        tool_call_id: impl Into<String>,
        tool_name: &str,
        error_name: impl Into<String>,
        message: &str,
        limit: usize,
    ) -> Self {
        Self::failed(
            tool_call_id,
            tool_name,
            ToolErrorInfo {
                name: error_name.into(),
                message: truncate_error_message(message, limit),
                code: None,
            },
        )
    }

    fn failed(tool_call_id: impl Into<String>, tool_name: &str, error: ToolErrorInfo) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.to_string(),
            status: ToolResultStatus::Error,
            output: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolResultStatus::Error
    }

    /// Text folded into the transcript as the tool message body.
    pub fn transcript_content(&self) -> String {
        if let Some(error) = &self.error {
            return format!("{}: {}", error.name, error.message);
        }
        match &self.output {
            Some(Value::String(text)) => text.clone(),
            Some(value) => value.to_string(),
            None => String::new(),
        }
    }
}

/// First `limit` characters plus a fixed marker; short messages pass through
/// unchanged.
pub fn truncate_error_message(message: &str, limit: usize) -> String {
    if message.chars().count() <= limit {
        return message.to_string();
    }
    let head: String = message.chars().take(limit).collect();
    format!("{head}... (truncated)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn resource(name: &str) -> ToolResource {
        ToolResource {
            name: name.to_string(),
            description: format!("{name} tool"),
            package: "demo".to_string(),
            parameters: ParamSchema::empty_object(),
            required: false,
            error_message_limit: None,
        }
    }

    #[test]
    fn build_catalog_preserves_declaration_order() {
        let catalog =
            build_catalog(&[resource("beta"), resource("alpha")]).expect("build catalog");
        let names: Vec<&str> = catalog.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(names, vec!["beta", "alpha"]);
    }

    #[test]
    fn build_catalog_rejects_inconsistent_schema() {
        let mut bad = resource("broken");
        bad.parameters = ParamSchema::Object {
            properties: BTreeMap::new(),
            required: vec!["ghost".to_string()],
            additional_properties: true,
        };
        let error = build_catalog(&[bad]).expect_err("schema must be rejected");
        assert!(matches!(error, EngineError::InvalidConfiguration(_)));
    }

    #[test]
    fn not_in_catalog_result_carries_name_and_code() {
        let result = ToolCallResult::not_in_catalog("call-1", "missing_tool");
        assert_eq!(result.status, ToolResultStatus::Error);
        let error = result.error.expect("error info");
        assert_eq!(error.name, "ToolNotInCatalogError");
        assert_eq!(error.code.as_deref(), Some("E_TOOL_NOT_IN_CATALOG"));
    }

    #[test]
    fn long_error_messages_are_truncated_with_marker() {
        let message = "x".repeat(2000);
        let result =
            ToolCallResult::execution_error("call-1", "demo_tool", "DemoError", &message, 1000);
        let error = result.error.expect("error info");
        assert!(error.message.ends_with("... (truncated)"));
        assert!(error.message.chars().count() <= 1015);
    }

    #[test]
    fn short_error_messages_pass_through() {
        let result =
            ToolCallResult::execution_error("call-1", "demo_tool", "DemoError", "boom", 1000);
        assert_eq!(result.error.expect("error info").message, "boom");
    }
}
