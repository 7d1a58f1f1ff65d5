//! Stage signature computation
//!
//! A signature is `sha256(domain, stage, upstream, contributors...)` where
//! the contributors are always written in the order of the `LocalInputs`
//! fields. Each contributor is a tag byte, a presence byte and a
//! length-prefixed payload, so no two different input sets can collide by
//! concatenation.

use crate::stage::StageKind;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Upstream signature of the first stage of every image
pub const ROOT_SIGNATURE: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const SIGNATURE_DOMAIN: &[u8] = b"kiln-stage-signature/v1";

/// Inputs local to one stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalInputs {
    /// Base reference (registry image, or the signature of a base image)
    pub base: Option<String>,
    /// User commands or raw instructions
    pub instructions: Vec<String>,
    /// Environment for user commands
    pub env: BTreeMap<String, String>,
    /// Builder-specific configuration (the command shell)
    pub builder_config: Option<String>,
    /// Digest of declared dependency files
    pub dependencies_digest: Option<String>,
    /// Opaque git patch content
    pub git_patch: Option<Vec<u8>>,
}

/// Compute a stage signature from its upstream signature and local inputs
pub fn compute_signature(kind: StageKind, upstream: &str, inputs: &LocalInputs) -> String {
    let mut hasher = Sha256::new();

    write_bytes(&mut hasher, SIGNATURE_DOMAIN);
    write_bytes(&mut hasher, kind.name().as_bytes());
    write_bytes(&mut hasher, upstream.as_bytes());

    write_optional(&mut hasher, 1, inputs.base.as_deref().map(str::as_bytes));

    hasher.update([2u8, 1u8]);
    hasher.update((inputs.instructions.len() as u64).to_be_bytes());
    for instruction in &inputs.instructions {
        write_bytes(&mut hasher, instruction.as_bytes());
    }

    hasher.update([3u8, 1u8]);
    hasher.update((inputs.env.len() as u64).to_be_bytes());
    for (key, value) in &inputs.env {
        write_bytes(&mut hasher, key.as_bytes());
        write_bytes(&mut hasher, value.as_bytes());
    }

    write_optional(&mut hasher, 4, inputs.builder_config.as_deref().map(str::as_bytes));
    write_optional(&mut hasher, 5, inputs.dependencies_digest.as_deref().map(str::as_bytes));
    write_optional(&mut hasher, 6, inputs.git_patch.as_deref());

    hex::encode(hasher.finalize())
}

fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn write_optional(hasher: &mut Sha256, tag: u8, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            hasher.update([tag, 1u8]);
            write_bytes(hasher, bytes);
        }
        None => hasher.update([tag, 0u8]),
    }
}

/// Running signature chain over the present stages of one image
#[derive(Debug, Clone)]
pub struct SignatureChain {
    upstream: String,
}

impl SignatureChain {
    /// Start a chain at the root signature
    pub fn new() -> Self {
        Self {
            upstream: ROOT_SIGNATURE.to_string(),
        }
    }

    /// Signature of the last pushed stage (or the root)
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Add the next present stage and return its signature.
    /// Absent stages are simply never pushed.
    pub fn push(&mut self, kind: StageKind, inputs: &LocalInputs) -> String {
        let signature = compute_signature(kind, &self.upstream, inputs);
        self.upstream = signature.clone();
        signature
    }
}

impl Default for SignatureChain {
    fn default() -> Self {
        Self::new()
    }
}
