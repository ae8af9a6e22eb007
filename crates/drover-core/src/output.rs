use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single finding with the sources backing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub claim: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Closed set of output shapes a capability can produce.
///
/// Arbitrary JSON is normalized into one of these once, at the boundary
/// (`from_value`), so rendering never has to sniff keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityOutput {
    Text {
        text: String,
    },
    Code {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        code: String,
    },
    Findings {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        findings: Vec<Finding>,
    },
    Structured {
        data: Value,
    },
}

impl CapabilityOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn code(language: Option<&str>, code: impl Into<String>) -> Self {
        Self::Code {
            language: language.map(str::to_string),
            code: code.into(),
        }
    }

    pub fn structured(data: Value) -> Self {
        Self::Structured { data }
    }

    /// Normalize any serializable capability output into the closed union.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::text(""),
            Value::String(s) => Self::Text { text: s },
            Value::Object(ref obj) => {
                if obj.contains_key("kind") {
                    if let Ok(parsed) = serde_json::from_value::<CapabilityOutput>(value.clone()) {
                        return parsed;
                    }
                }

                if let Some(code) = obj.get("code").and_then(Value::as_str) {
                    let language = obj
                        .get("language")
                        .or_else(|| obj.get("lang"))
                        .and_then(Value::as_str);
                    return Self::code(language, code);
                }

                if let Some(items) = obj.get("findings").and_then(Value::as_array) {
                    let summary = obj
                        .get("summary")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let findings = items.iter().filter_map(finding_from_value).collect();
                    return Self::Findings { summary, findings };
                }

                if obj.len() == 1 {
                    if let Some(text) = obj.get("text").and_then(Value::as_str) {
                        return Self::text(text);
                    }
                }

                Self::Structured { data: value }
            }
            other => Self::Structured { data: other },
        }
    }

    /// Render into normalized human-readable text.
    pub fn render(&self) -> String {
        match self {
            Self::Text { text } => text.trim_end().to_string(),
            Self::Code { language, code } => format!(
                "```{}\n{}\n```",
                language.as_deref().unwrap_or(""),
                code.trim_end()
            ),
            Self::Findings { summary, findings } => {
                let mut out = String::new();
                if let Some(summary) = summary {
                    out.push_str(summary.trim_end());
                    out.push_str("\n\n");
                }
                if findings.is_empty() {
                    out.push_str("(no findings)");
                }
                for (i, finding) in findings.iter().enumerate() {
                    if i > 0 {
                        out.push('\n');
                    }
                    out.push_str("- ");
                    out.push_str(&finding.claim);
                    if !finding.sources.is_empty() {
                        out.push_str(&format!(" [sources: {}]", finding.sources.join(", ")));
                    }
                }
                out
            }
            Self::Structured { data } => render_structured(data),
        }
    }
}

fn finding_from_value(value: &Value) -> Option<Finding> {
    match value {
        Value::String(s) => Some(Finding {
            claim: s.clone(),
            sources: vec![],
        }),
        Value::Object(obj) => {
            let claim = ["claim", "finding", "text", "summary"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))?
                .to_string();
            let sources = obj
                .get("sources")
                .and_then(Value::as_array)
                .map(|srcs| {
                    srcs.iter()
                        .filter_map(|s| match s {
                            Value::String(s) => Some(s.clone()),
                            Value::Object(o) => o
                                .get("url")
                                .or_else(|| o.get("title"))
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(Finding { claim, sources })
        }
        _ => None,
    }
}

fn render_structured(data: &Value) -> String {
    if let Some(err) = data.get("error") {
        let message = match err {
            Value::String(s) => s.clone(),
            Value::Object(o) => o
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
            other => other.to_string(),
        };
        return format!("Error: {}", message);
    }
    serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string())
}

/// Outcome status reported by a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityStatus {
    Success,
    Error,
}

/// Result of `Capability::execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResult {
    pub status: CapabilityStatus,
    pub output: CapabilityOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CapabilityResult {
    pub fn success(output: CapabilityOutput) -> Self {
        Self {
            status: CapabilityStatus::Success,
            output,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: CapabilityStatus::Error,
            output: CapabilityOutput::structured(serde_json::json!({ "error": message })),
            error: Some(message),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CapabilityStatus::Success
    }

    /// Parse a raw `{status, output, error?}` document from an external collaborator.
    pub fn from_value(value: Value) -> Self {
        let status = match value.get("status").and_then(Value::as_str) {
            Some("error") => CapabilityStatus::Error,
            _ => CapabilityStatus::Success,
        };
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        let output =
            CapabilityOutput::from_value(value.get("output").cloned().unwrap_or(Value::Null));
        Self {
            status,
            output,
            error,
        }
    }
}
