//! Kind-specific validation of request parameters, run before a request is
//! admitted.

use crate::error::{OrchestratorError, Result};
use crate::request::RequestKind;
use serde_json::{Map, Value};
use std::collections::HashSet;

const MAX_RESOURCE_NAME_LEN: usize = 63;

pub fn validate_parameters(kind: RequestKind, parameters: &Value) -> Result<()> {
    let params = parameters
        .as_object()
        .ok_or_else(|| invalid("parameters must be a JSON object"))?;

    match kind {
        RequestKind::Image => validate_image(params),
        RequestKind::Template => validate_template(params),
        RequestKind::Instance => validate_instance(params),
        RequestKind::System => validate_system(params),
    }
}

/// Project identifiers follow the cloud provider's rules: 6 to 30 characters,
/// lowercase letters, digits and hyphens, starting with a letter.
pub fn validate_project_id(project: &str) -> Result<()> {
    let valid_len = (6..=30).contains(&project.len());
    let valid_start = project.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_chars = project
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid_len && valid_start && valid_chars && !project.ends_with('-') {
        Ok(())
    } else {
        Err(invalid(format!("invalid project id: {:?}", project)))
    }
}

fn validate_image(params: &Map<String, Value>) -> Result<()> {
    let name = required_str(params, "name")?;
    validate_resource_name("name", name)?;
    for field in ["zone", "image_project", "image_family", "network", "os_type"] {
        required_str(params, field)?;
    }
    positive_int(params, "disk_size")?;

    if let Some(instance_name) = params.get("instance_name") {
        let instance_name = instance_name
            .as_str()
            .ok_or_else(|| invalid("instance_name must be a string"))?;
        validate_resource_name("instance_name", instance_name)?;
    }

    if let Some(steps) = params.get("steps") {
        let steps = steps
            .as_array()
            .ok_or_else(|| invalid("steps must be an array of strings"))?;
        if !steps.iter().all(|s| s.as_str().is_some_and(|s| !s.is_empty())) {
            return Err(invalid("steps must be an array of strings"));
        }
    }

    if let Some(metadata) = params.get("metadata") {
        let items = metadata
            .as_array()
            .ok_or_else(|| invalid("metadata must be an array of {key, value} items"))?;
        for item in items {
            let has_key = item.get("key").and_then(Value::as_str).is_some();
            let has_value = item.get("value").and_then(Value::as_str).is_some();
            if !has_key || !has_value {
                return Err(invalid("metadata must be an array of {key, value} items"));
            }
        }
    }

    Ok(())
}

fn validate_template(params: &Map<String, Value>) -> Result<()> {
    let name = required_str(params, "name")?;
    validate_resource_name("name", name)?;
    required_str(params, "image_project")?;
    required_str(params, "image_family")?;
    let default_size = required_str(params, "default_size_name")?;

    let sizes = params
        .get("sizes")
        .and_then(Value::as_array)
        .filter(|sizes| !sizes.is_empty())
        .ok_or_else(|| invalid("sizes must be a non-empty array"))?;

    // Validate every size up front so no partial template family is created.
    let mut names = HashSet::new();
    for size in sizes {
        let size = size
            .as_object()
            .ok_or_else(|| invalid("each size must be an object"))?;
        let size_name = required_str(size, "name")?;
        for field in ["cpus", "memory", "disk_size"] {
            positive_int(size, field)?;
        }
        if !names.insert(size_name.to_string()) {
            return Err(invalid(format!("duplicate size name: {}", size_name)));
        }
    }

    if !names.contains(default_size) {
        return Err(invalid(format!(
            "default_size_name {} does not match any size",
            default_size
        )));
    }

    Ok(())
}

fn validate_instance(params: &Map<String, Value>) -> Result<()> {
    required_str(params, "template")?;
    for field in ["size", "name", "zone"] {
        if let Some(value) = params.get(field) {
            if !value.as_str().is_some_and(|s| !s.is_empty()) {
                return Err(invalid(format!("{} must be a non-empty string", field)));
            }
        }
    }
    if let Some(name) = params.get("name").and_then(Value::as_str) {
        validate_resource_name("name", name)?;
    }
    Ok(())
}

fn validate_system(params: &Map<String, Value>) -> Result<()> {
    let name = required_str(params, "name")?;
    validate_resource_name("name", name)?;

    let components = params
        .get("components")
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| invalid("components must be a non-empty array"))?;

    if !components.iter().all(|c| c.as_str().is_some_and(|c| !c.is_empty())) {
        return Err(invalid("components must be strings"));
    }
    Ok(())
}

fn required_str<'a>(params: &'a Map<String, Value>, field: &str) -> Result<&'a str> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| invalid(format!("missing required field: {}", field)))
}

fn positive_int(params: &Map<String, Value>, field: &str) -> Result<u64> {
    params
        .get(field)
        .and_then(Value::as_u64)
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid(format!("{} must be a positive integer", field)))
}

fn validate_resource_name(field: &str, name: &str) -> Result<()> {
    let valid_start = name.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid_start && valid_chars && name.len() <= MAX_RESOURCE_NAME_LEN && !name.ends_with('-') {
        Ok(())
    } else {
        Err(invalid(format!("invalid {}: {:?}", field, name)))
    }
}

fn invalid(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidParameters(message.into())
}
