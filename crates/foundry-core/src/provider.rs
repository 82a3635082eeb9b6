use crate::artifact::GeneratedFile;
use crate::error::EngineResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical identifier of an AI provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Anthropic Claude family.
    Claude,
    /// OpenAI GPT-4 family.
    Gpt4,
    /// Google Gemini family.
    Gemini,
    /// xAI Grok family.
    Grok,
    /// Local Ollama models.
    Ollama,
}

impl ProviderId {
    /// Capability rank used for lead selection and role affinity.
    /// Higher is more capable.
    pub fn capability_rank(self) -> u8 {
        match self {
            ProviderId::Claude => 5,
            ProviderId::Gpt4 => 4,
            ProviderId::Gemini => 3,
            ProviderId::Grok => 2,
            ProviderId::Ollama => 1,
        }
    }

    /// Default model identifier for this provider.
    pub fn default_model(self) -> &'static str {
        match self {
            ProviderId::Claude => "claude-sonnet-4-20250514",
            ProviderId::Gpt4 => "gpt-4o",
            ProviderId::Gemini => "gemini-2.0-flash",
            ProviderId::Grok => "grok-2",
            ProviderId::Ollama => "llama3.1",
        }
    }

    /// Sort a provider list by descending capability rank.
    pub fn rank_descending(mut providers: Vec<ProviderId>) -> Vec<ProviderId> {
        providers.sort_by(|a, b| b.capability_rank().cmp(&a.capability_rank()));
        providers
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderId::Claude => write!(f, "claude"),
            ProviderId::Gpt4 => write!(f, "gpt4"),
            ProviderId::Gemini => write!(f, "gemini"),
            ProviderId::Grok => write!(f, "grok"),
            ProviderId::Ollama => write!(f, "ollama"),
        }
    }
}

/// Options for one provider generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Token budget for the response.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// System prompt, when the role defines one.
    pub system_prompt: Option<String>,
    /// Whether the caller's power tier is active for this call.
    pub power_mode: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4_000,
            temperature: 0.7,
            system_prompt: None,
            power_mode: false,
        }
    }
}

/// Routes generation requests to concrete AI providers.
///
/// The engine never talks to a provider client directly; everything goes
/// through this trait so tests can script responses.
#[async_trait]
pub trait ProviderRouter: Send + Sync {
    /// Generate text with the given provider. Cancellation is handled by the
    /// caller racing this future against its scope; implementations should
    /// simply honor being dropped.
    async fn generate(
        &self,
        provider: ProviderId,
        prompt: &str,
        options: GenerateOptions,
    ) -> EngineResult<String>;

    /// Providers currently usable by any caller.
    async fn available_providers(&self) -> Vec<ProviderId>;

    /// Providers currently usable by a specific owner (key quotas, plans).
    async fn available_providers_for(&self, owner_id: &str) -> Vec<ProviderId> {
        let _ = owner_id;
        self.available_providers().await
    }
}

/// Fire-and-forget persistence of build state. Failures are logged by the
/// engine and never fail the build.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Upsert the serialized build state and its artifact set, keyed by
    /// build id.
    async fn save_snapshot(
        &self,
        build_id: Uuid,
        state: serde_json::Value,
        files: &[GeneratedFile],
    ) -> EngineResult<()>;
}

/// Result of a final-readiness validation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether the artifact set is deliverable as-is.
    pub passed: bool,
    /// Human-readable issues found, empty when passed.
    pub issues: Vec<String>,
}

/// Validates a proposed artifact set before a build is declared complete.
#[async_trait]
pub trait ReadinessValidator: Send + Sync {
    /// Check the deduplicated artifact set for deliverability.
    async fn validate(&self, files: &[GeneratedFile]) -> ValidationReport;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn capability_ranking_order() {
        assert!(ProviderId::Claude.capability_rank() > ProviderId::Gpt4.capability_rank());
        assert!(ProviderId::Gpt4.capability_rank() > ProviderId::Gemini.capability_rank());
        assert!(ProviderId::Gemini.capability_rank() > ProviderId::Grok.capability_rank());
        assert!(ProviderId::Grok.capability_rank() > ProviderId::Ollama.capability_rank());
    }

    #[test]
    fn rank_descending_sorts() {
        let ranked = ProviderId::rank_descending(vec![
            ProviderId::Ollama,
            ProviderId::Claude,
            ProviderId::Gemini,
        ]);
        assert_eq!(
            ranked,
            vec![ProviderId::Claude, ProviderId::Gemini, ProviderId::Ollama]
        );
    }

    #[test]
    fn provider_serde_lowercase() {
        let json = serde_json::to_string(&ProviderId::Gpt4).unwrap();
        assert_eq!(json, "\"gpt4\"");
        let parsed: ProviderId = serde_json::from_str("\"claude\"").unwrap();
        assert_eq!(parsed, ProviderId::Claude);
    }

    #[test]
    fn display_matches_serde() {
        assert_eq!(ProviderId::Gemini.to_string(), "gemini");
        assert_eq!(ProviderId::Ollama.to_string(), "ollama");
    }
}
