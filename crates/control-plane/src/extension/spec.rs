//! Declarative extension specs, written as YAML or JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ExtensionError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid placeholder pattern")
});

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Command,
    Package,
    Service,
    File,
    User,
    Docker,
    DockerCompose,
    Proxy,
}

impl StepKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Package => "package",
            Self::Service => "service",
            Self::File => "file",
            Self::User => "user",
            Self::Docker => "docker",
            Self::DockerCompose => "docker_compose",
            Self::Proxy => "proxy",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub revert_cmd: Option<String>,
    #[serde(default)]
    pub revert_action: Option<String>,
}

impl StepSpec {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
            .filter(|seconds| *seconds > 0)
            .map_or(DEFAULT_STEP_TIMEOUT, Duration::from_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtensionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableSpec>,
    pub steps: Vec<StepSpec>,
}

impl ExtensionSpec {
    /// Parses a JSON or YAML document and checks that it is runnable.
    ///
    /// # Errors
    /// Returns `InvalidSpec` for syntax errors, an empty step list, blank or
    /// duplicate step names, and placeholders naming undeclared variables.
    pub fn parse(text: &str) -> Result<Self, ExtensionError> {
        let trimmed = text.trim_start();
        let spec: Self = if trimmed.starts_with('{') {
            serde_json::from_str(trimmed).map_err(|error| ExtensionError::InvalidSpec(error.to_string()))?
        } else {
            serde_yaml::from_str(text).map_err(|error| ExtensionError::InvalidSpec(error.to_string()))?
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), ExtensionError> {
        let invalid = |message: String| Err(ExtensionError::InvalidSpec(message));
        if self.name.trim().is_empty() {
            return invalid("extension name is required".to_string());
        }
        if self.steps.is_empty() {
            return invalid("an extension needs at least one step".to_string());
        }

        let mut names = BTreeSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return invalid(format!("a {} step has no name", step.kind.as_str()));
            }
            if !names.insert(step.name.as_str()) {
                return invalid(format!("step name '{}' is used twice", step.name));
            }

            let mut referenced = BTreeSet::new();
            for value in step.properties.values() {
                collect_placeholders(value, &mut referenced);
            }
            for text in step.revert_cmd.iter().chain(step.revert_action.iter()) {
                collect_placeholders_in(text, &mut referenced);
            }
            if let Some(unknown) = referenced.iter().find(|name| !self.variables.contains_key(*name)) {
                return invalid(format!("step '{}' uses undeclared variable '{unknown}'", step.name));
            }
        }
        Ok(())
    }

    /// Combines caller values with declared defaults. Scalars are accepted
    /// as strings; values for undeclared names are rejected.
    ///
    /// # Errors
    /// Returns `Variable` for missing required values, unknown names and
    /// non-scalar values.
    pub fn resolve_variables(&self, provided: &BTreeMap<String, Value>) -> Result<BTreeMap<String, String>, ExtensionError> {
        if let Some(unknown) = provided.keys().find(|name| !self.variables.contains_key(*name)) {
            return Err(ExtensionError::Variable(format!("unknown variable '{unknown}'")));
        }

        let mut resolved = BTreeMap::new();
        for (name, declared) in &self.variables {
            let value = match provided.get(name) {
                Some(Value::String(text)) => Some(text.clone()),
                Some(Value::Number(number)) => Some(number.to_string()),
                Some(Value::Bool(flag)) => Some(flag.to_string()),
                Some(Value::Null) | None => declared.default.clone(),
                Some(_) => {
                    return Err(ExtensionError::Variable(format!("variable '{name}' must be a scalar")));
                }
            };
            match value {
                Some(value) => {
                    resolved.insert(name.clone(), value);
                }
                None if declared.required => {
                    return Err(ExtensionError::Variable(format!("variable '{name}' is required")));
                }
                None => {
                    resolved.insert(name.clone(), String::new());
                }
            }
        }
        Ok(resolved)
    }
}

fn collect_placeholders_in(text: &str, names: &mut BTreeSet<String>) {
    for captures in PLACEHOLDER.captures_iter(text) {
        names.insert(captures[1].to_string());
    }
}

fn collect_placeholders(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => collect_placeholders_in(text, names),
        Value::Array(items) => items.iter().for_each(|item| collect_placeholders(item, names)),
        Value::Object(map) => map.values().for_each(|item| collect_placeholders(item, names)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Replaces every `{{ name }}` in `template`.
///
/// # Errors
/// Returns `Variable` when a placeholder has no value.
pub fn substitute(template: &str, variables: &BTreeMap<String, String>) -> Result<String, ExtensionError> {
    let mut missing = None;
    let replaced = PLACEHOLDER.replace_all(template, |captures: &regex::Captures<'_>| {
        let name = &captures[1];
        if let Some(value) = variables.get(name) {
            value.clone()
        } else {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        }
    });
    match missing {
        Some(name) => Err(ExtensionError::Variable(format!("no value for variable '{name}'"))),
        None => Ok(replaced.into_owned()),
    }
}

/// Substitutes inside every string of a property value.
///
/// # Errors
/// Returns `Variable` when a placeholder has no value.
pub fn substitute_value(value: &Value, variables: &BTreeMap<String, String>) -> Result<Value, ExtensionError> {
    Ok(match value {
        Value::String(text) => Value::String(substitute(text, variables)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, variables))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| Ok((key.clone(), substitute_value(item, variables)?)))
                .collect::<Result<_, ExtensionError>>()?,
        ),
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const YAML: &str = r#"
name: redis
description: Installs redis
variables:
  port:
    default: "6379"
  password:
    required: true
steps:
  - name: install
    type: package
    properties:
      name: redis-server
      state: present
  - name: configure
    type: command
    properties:
      cmd: "redis-cli -p {{ port }} config set requirepass {{password}}"
    timeout: 30
    revert_cmd: "redis-cli -p {{ port }} config set requirepass ''"
"#;

    #[test]
    fn yaml_and_json_specs_parse_alike() {
        let from_yaml = ExtensionSpec::parse(YAML).expect("yaml");
        assert_eq!(from_yaml.steps.len(), 2);
        assert_eq!(from_yaml.steps[1].kind, StepKind::Command);
        assert_eq!(from_yaml.steps[1].timeout(), Duration::from_secs(30));
        assert_eq!(from_yaml.steps[0].timeout(), DEFAULT_STEP_TIMEOUT);

        let as_json = serde_json::to_string(&from_yaml).expect("json");
        assert_eq!(ExtensionSpec::parse(&as_json).expect("json spec"), from_yaml);
    }

    #[test]
    fn undeclared_variables_and_duplicate_steps_are_rejected() {
        let undeclared = YAML.replace("{{password}}", "{{ secret }}");
        assert!(matches!(
            ExtensionSpec::parse(&undeclared),
            Err(ExtensionError::InvalidSpec(message)) if message.contains("secret")
        ));

        let duplicate = YAML.replace("name: configure", "name: install");
        assert!(ExtensionSpec::parse(&duplicate).is_err());

        assert!(ExtensionSpec::parse("name: empty\nsteps: []").is_err());
        assert!(ExtensionSpec::parse("name: x\nsteps:\n  - name: a\n    type: teleport").is_err());
    }

    #[test]
    fn variables_fall_back_to_defaults_and_required_ones_must_be_given() {
        let spec = ExtensionSpec::parse(YAML).expect("spec");

        let missing = spec.resolve_variables(&BTreeMap::new());
        assert!(matches!(missing, Err(ExtensionError::Variable(message)) if message.contains("password")));

        let provided = BTreeMap::from([("password".to_string(), json!("s3cret"))]);
        let resolved = spec.resolve_variables(&provided).expect("resolved");
        assert_eq!(resolved["port"], "6379");
        assert_eq!(resolved["password"], "s3cret");

        let numeric = BTreeMap::from([("password".to_string(), json!("x")), ("port".to_string(), json!(7000))]);
        assert_eq!(spec.resolve_variables(&numeric).expect("numeric")["port"], "7000");

        let unknown = BTreeMap::from([("password".to_string(), json!("x")), ("user".to_string(), json!("y"))]);
        assert!(spec.resolve_variables(&unknown).is_err());
    }

    #[test]
    fn substitution_fills_every_placeholder() {
        let variables = BTreeMap::from([("port".to_string(), "6379".to_string())]);
        assert_eq!(
            substitute("redis-cli -p {{ port }} ping && echo {{port}}", &variables).expect("substituted"),
            "redis-cli -p 6379 ping && echo 6379"
        );
        assert!(substitute("{{ missing }}", &variables).is_err());
        assert_eq!(substitute("no placeholders {}", &variables).expect("plain"), "no placeholders {}");

        let nested = json!({ "env": { "PORT": "{{ port }}" }, "ports": ["{{ port }}:6379"], "replicas": 1 });
        assert_eq!(
            substitute_value(&nested, &variables).expect("nested"),
            json!({ "env": { "PORT": "6379" }, "ports": ["6379:6379"], "replicas": 1 })
        );
    }
}
