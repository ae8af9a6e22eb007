use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use drover_core::error::{DroverError, Result};
use drover_core::output::{CapabilityOutput, CapabilityResult};
use drover_core::traits::Capability;
use drover_core::types::{Payload, UPSTREAM_KEY};
use drover_engine::CapabilityRegistry;

/// Registry with the built-in capabilities.
pub fn builtin_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(EchoCapability);
    registry.register(JoinCapability);
    registry.register(CommandCapability);
    registry
}

/// Returns its `text` input, or the whole input as structured data.
pub struct EchoCapability;

impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the `text` input unchanged."
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<CapabilityResult>> {
        Box::pin(async move {
            let output = match input.get("text").and_then(|v| v.as_str()) {
                Some(text) => CapabilityOutput::text(text),
                None => CapabilityOutput::structured(serde_json::Value::Object(input)),
            };
            Ok(CapabilityResult::success(output))
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }
}

/// Concatenates the rendered outputs of its upstream steps.
pub struct JoinCapability;

impl Capability for JoinCapability {
    fn name(&self) -> &str {
        "join"
    }

    fn description(&self) -> &str {
        "Concatenate upstream outputs, optionally under a `title`."
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<CapabilityResult>> {
        Box::pin(async move {
            let Some(serde_json::Value::Object(upstream)) = input.get(UPSTREAM_KEY) else {
                return Ok(CapabilityResult::error("no upstream content to join"));
            };

            let mut sections = Vec::with_capacity(upstream.len() + 1);
            if let Some(title) = input.get("title").and_then(|v| v.as_str()) {
                sections.push(format!("# {}", title));
            }
            // serde_json maps iterate in key order, so output is stable
            for (step_id, value) in upstream {
                let rendered = CapabilityOutput::from_value(value.clone()).render();
                sections.push(format!("## {}\n{}", step_id, rendered));
            }
            Ok(CapabilityResult::success(CapabilityOutput::text(
                sections.join("\n\n"),
            )))
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn requires_upstream(&self) -> bool {
        true
    }
}

/// Runs a shell command; stdout is the output.
pub struct CommandCapability;

#[derive(Deserialize)]
struct CommandInput {
    command: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
}

fn default_timeout() -> u64 {
    120
}

impl Capability for CommandCapability {
    fn name(&self) -> &str {
        "command"
    }

    fn description(&self) -> &str {
        "Run `command` with sh -c. A non-zero exit status is an error."
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<CapabilityResult>> {
        Box::pin(async move {
            let params: CommandInput = serde_json::from_value(serde_json::Value::Object(input))
                .map_err(|e| DroverError::Capability {
                    capability: "command".into(),
                    message: format!("invalid input: {}", e),
                })?;

            debug!(command = %params.command, "Running command");

            let timeout = std::time::Duration::from_secs(params.timeout);
            let result = tokio::time::timeout(timeout, async {
                tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(&params.command)
                    .kill_on_drop(true)
                    .output()
                    .await
            })
            .await;

            match result {
                Ok(Ok(output)) => {
                    let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
                    if stdout.len() > 30000 {
                        let mut end = 30000;
                        while !stdout.is_char_boundary(end) {
                            end -= 1;
                        }
                        stdout.truncate(end);
                        stdout.push_str("\n... (output truncated)");
                    }

                    if output.status.success() {
                        Ok(CapabilityResult::success(CapabilityOutput::text(stdout)))
                    } else {
                        let code = output.status.code().unwrap_or(-1);
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        Ok(CapabilityResult::error(format!(
                            "exit code {}: {}",
                            code,
                            stderr.trim_end()
                        )))
                    }
                }
                Ok(Err(e)) => Err(DroverError::Capability {
                    capability: "command".into(),
                    message: e.to_string(),
                }),
                Err(_) => Err(DroverError::CapabilityTimeout {
                    capability: "command".into(),
                    timeout_secs: params.timeout,
                }),
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        600
    }
}
