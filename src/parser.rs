//! YAML parser with validation for resource files

use crate::copy::validate_copy_spec;
use crate::error::{CommandError, Result};
use crate::lifecycle::validate_spec;
use crate::models::{
    CommandSpec, CopySpec, ResourceDeclaration, ResourceFile, MAX_RESOURCE_COUNT,
    MAX_RESOURCE_NAME_LEN, MAX_YAML_SIZE,
};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parse a resource file from disk.
///
/// Enforces the limits applied to every resource file:
/// - YAML size must be <= 1MB
/// - At most 1,000 resources
/// - Resource names are alphanumeric plus underscore/dash and unique
/// - Every resource passes [`validate_spec`] (glob patterns, connection
///   settings, local-only output collection)
/// - A `copy` resource declares nothing else besides `options.deleteBeforeReplace`
///   and passes [`validate_copy_spec`]
///
/// # Errors
///
/// * `CommandError::Io` - If file cannot be read
/// * `CommandError::YamlSizeExceeded` - If file exceeds 1MB
/// * `CommandError::YamlParse` - If YAML is malformed or names an unknown field
/// * `CommandError::InvalidResourceName` - If a resource name is invalid
/// * `CommandError::Validation` / `CommandError::InvalidGlob` - If a resource is misconfigured
///
/// # Example
///
/// ```no_run
/// use command_provider::parser::parse_resource_file;
///
/// let file = parse_resource_file("resources.yaml")?;
/// println!("Loaded {} resources", file.resources.len());
/// # Ok::<(), command_provider::error::CommandError>(())
/// ```
pub fn parse_resource_file<P: AsRef<Path>>(path: P) -> Result<ResourceFile> {
    let content = fs::read_to_string(path)?;
    parse_resource_yaml(&content)
}

/// Parse a resource file from a YAML string.
///
/// # Example
///
/// ```
/// use command_provider::parser::parse_resource_yaml;
///
/// let yaml = r#"
/// resources:
///   - name: hello
///     create: echo hello
/// "#;
///
/// let file = parse_resource_yaml(yaml)?;
/// assert_eq!(file.resources[0].name, "hello");
/// # Ok::<(), command_provider::error::CommandError>(())
/// ```
pub fn parse_resource_yaml(content: &str) -> Result<ResourceFile> {
    if content.len() > MAX_YAML_SIZE {
        return Err(CommandError::YamlSizeExceeded(content.len()));
    }

    let file: ResourceFile = serde_yaml::from_str(content)?;

    if file.resources.len() > MAX_RESOURCE_COUNT {
        return Err(CommandError::Validation(format!(
            "Resource file declares {} resources (limit {})",
            file.resources.len(),
            MAX_RESOURCE_COUNT
        )));
    }

    let mut seen_names = HashSet::with_capacity(file.resources.len());
    for resource in &file.resources {
        validate_resource_name(&resource.name)?;
        if !seen_names.insert(resource.name.as_str()) {
            return Err(CommandError::Validation(format!(
                "Duplicate resource name '{}'",
                resource.name,
            )));
        }
    }

    for resource in &file.resources {
        validate_resource(resource)?;
    }

    Ok(file)
}

/// Validate resource name format and length
pub fn validate_resource_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_RESOURCE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if !valid {
        return Err(CommandError::InvalidResourceName {
            name: name.to_string(),
            max: MAX_RESOURCE_NAME_LEN,
        });
    }
    Ok(())
}

fn validate_resource(resource: &ResourceDeclaration) -> Result<()> {
    if let Some(copy) = &resource.copy {
        return validate_copy_resource(resource, copy);
    }

    validate_spec(&resource.spec).map_err(|e| match e {
        CommandError::Validation(message) => {
            CommandError::Validation(format!("Resource '{}': {}", resource.name, message))
        }
        other => other,
    })?;

    let options = &resource.options;
    if let Some(field) = options
        .replace_on_changes
        .iter()
        .find(|field| options.ignore_changes.contains(field))
    {
        return Err(CommandError::Validation(format!(
            "Resource '{}': '{}' is listed in both ignoreChanges and replaceOnChanges",
            resource.name, field
        )));
    }

    Ok(())
}

fn validate_copy_resource(resource: &ResourceDeclaration, copy: &CopySpec) -> Result<()> {
    if resource.spec != CommandSpec::default() {
        return Err(CommandError::Validation(format!(
            "Resource '{}': a copy resource cannot declare command fields",
            resource.name
        )));
    }
    let options = &resource.options;
    if !options.ignore_changes.is_empty() || !options.replace_on_changes.is_empty() {
        return Err(CommandError::Validation(format!(
            "Resource '{}': ignoreChanges and replaceOnChanges do not apply to copy resources",
            resource.name
        )));
    }

    validate_copy_spec(copy).map_err(|e| match e {
        CommandError::Validation(message) => {
            CommandError::Validation(format!("Resource '{}': {}", resource.name, message))
        }
        other => other,
    })
}
