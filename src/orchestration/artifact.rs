use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Side-output declared by a task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub path: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

fn default_format() -> String {
    "text".to_string()
}

impl Artifact {
    pub fn new(path: impl Into<String>, format: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            format: format.into(),
            label: label.into(),
            content: None,
            reference: None,
            produced_by: None,
            step: None,
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// Pulls the `artifacts` array out of a task result.
///
/// A missing or null `artifacts` key yields no artifacts. Anything else that
/// does not describe artifacts is reported so the invoker can reject the
/// result.
pub fn extract_artifacts(value: &Value, produced_by: &str) -> Result<Vec<Artifact>, String> {
    let Some(raw) = value.get("artifacts") else {
        return Ok(Vec::new());
    };
    let entries = match raw {
        Value::Null => return Ok(Vec::new()),
        Value::Array(entries) => entries,
        _ => return Err("`artifacts` must be an array".to_string()),
    };

    let mut artifacts = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let mut artifact: Artifact = serde_json::from_value(entry.clone())
            .map_err(|err| format!("artifacts[{idx}] is malformed: {err}"))?;
        if artifact.path.trim().is_empty() {
            return Err(format!("artifacts[{idx}] requires a non-empty `path`"));
        }
        if artifact.content.is_some() && artifact.reference.is_some() {
            return Err(format!(
                "artifacts[{idx}] must carry either `content` or `reference`, not both"
            ));
        }
        artifact.produced_by = Some(produced_by.to_string());
        artifacts.push(artifact);
    }
    Ok(artifacts)
}
