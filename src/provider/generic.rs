//! Profile for any configured CLI; relies on text heuristics only.

use crate::provider::base::{render_prompt, ProviderProfile};
use crate::provider::{ProviderCapabilities, StartArgs};

/// Profile for a provider declared under `[providers.<id>]`.
#[derive(Debug, Clone)]
pub struct GenericProfile {
    provider_id: String,
    binary: String,
}

impl GenericProfile {
    /// Profile for `provider_id` launching `binary`.
    #[must_use]
    pub fn new(provider_id: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            binary: binary.into(),
        }
    }
}

impl ProviderProfile for GenericProfile {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn build_args(&self, args: &StartArgs, _caps: &ProviderCapabilities) -> Vec<String> {
        vec![render_prompt(&args.task, &args.policy)]
    }
}
