//! Dockerfile rendering for stage builds
//!
//! Each stage is built as a single-stage Dockerfile on top of the previous
//! stage's artifact.

use std::collections::BTreeMap;

/// Label keys stamped onto stage artifacts
pub mod labels {
    /// Marks an image as a kiln stage artifact
    pub const STAGE_ARTIFACT: &str = "io.kiln.stage";
    /// Image name from the configuration
    pub const IMAGE: &str = "io.kiln.image";
    /// Stage signature
    pub const SIGNATURE: &str = "io.kiln.signature";
}

/// Generate a Dockerfile building one stage on top of `base`
pub fn generate_dockerfile(
    base: &str,
    instructions: &[String],
    labels: &BTreeMap<String, String>,
) -> String {
    let mut lines = Vec::with_capacity(instructions.len() + labels.len() + 2);

    lines.push(format!("FROM {}", base));
    lines.extend(instructions.iter().cloned());

    for (key, value) in labels {
        lines.push(format!("LABEL {}={}", key, dockerfile_quote(value)));
    }

    lines.push(String::new());
    lines.join("\n")
}

/// `ENV` instruction for one variable
pub fn env_instruction(key: &str, value: &str) -> String {
    format!("ENV {}={}", key, dockerfile_quote(value))
}

/// `RUN` instruction in exec form, so the command reaches the shell verbatim
pub fn run_instruction(shell: &str, command: &str) -> String {
    let argv = [shell, "-c", command];
    // Serializing a string array cannot fail
    let json = serde_json::to_string(&argv).unwrap_or_default();
    format!("RUN {}", json)
}

/// Quote a value for Dockerfile ENV/LABEL instructions.
/// Embedded double quotes and backslashes are escaped to prevent injection.
fn dockerfile_quote(value: &str) -> String {
    if value.is_empty()
        || value.contains('$')
        || value.contains(' ')
        || value.contains('"')
        || value.contains('\\')
    {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", escaped)
    } else {
        value.to_string()
    }
}
