//! Configuration types for the assistant core.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment overrides for secrets and the model directory root.
//! Unknown keys in the file produce warnings, never errors.

use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Top-level configuration for the assistant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Activation gating settings (wake word, continuous, manual).
    pub activation: ActivationConfig,
    /// Voice synthesis settings.
    pub voice: VoiceConfig,
    /// Query routing thresholds and feature weights.
    pub router: RouterConfig,
    /// On-device model settings.
    pub local: LocalModelConfig,
    /// Remote model provider settings.
    pub remote: RemoteModelConfig,
    /// Response integration settings.
    pub integration: IntegrationConfig,
    /// Adaptive optimizer settings.
    pub optimizer: OptimizerConfig,
    /// Conversation memory settings.
    pub memory: MemoryConfig,
    /// Logging settings (used by the binary).
    pub logging: LoggingConfig,
    /// Checkpoint persistence settings.
    pub persistence: PersistenceConfig,
}

/// How the assistant decides to start listening.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    /// Activate on wake-word detection.
    #[default]
    WakeWord,
    /// Always listen and process.
    Continuous,
    /// Activate on a schedule.
    Scheduled,
    /// Activate only on an explicit trigger.
    Manual,
    /// Disabled.
    Off,
}

/// Activation gating configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// Activation mode.
    pub mode: ActivationMode,
    /// RMS energy threshold for speech gating.
    pub energy_threshold: f32,
    /// Inactivity timeout in seconds before returning to INACTIVE.
    pub timeout_s: u64,
    /// Wake phrase checked by the wake-word detector.
    pub wake_word: String,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            mode: ActivationMode::WakeWord,
            energy_threshold: 0.01,
            timeout_s: 30,
            wake_word: "hey sona".to_owned(),
        }
    }
}

/// Voice output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Whether assistant replies are synthesized to audio.
    pub tts_enabled: bool,
    /// Voice preset name passed to the TTS engine.
    pub voice: String,
    /// Speaking rate multiplier.
    pub speaking_rate: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            tts_enabled: true,
            voice: "default".to_owned(),
            speaking_rate: 1.0,
        }
    }
}

/// Feature weights used by the router's scoring pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterWeights {
    /// Weight of query length in the complexity score.
    pub length: f32,
    /// Weight of multi-part / nested-clause cues in the complexity score.
    pub structure: f32,
    /// Weight of prior-turn references in the complexity score.
    pub context_dependence: f32,
    /// Weight of creative-writing cues in the creativity score.
    pub creative_cues: f32,
    /// Weight of open-ended question forms in the creativity score.
    pub open_question: f32,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            length: 0.3,
            structure: 0.45,
            context_dependence: 0.25,
            creative_cues: 0.7,
            open_question: 0.3,
        }
    }
}

/// Query routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Word count above which a query always goes to the API track.
    pub threshold_very_long: usize,
    /// Word count below which a query is a candidate for local-only.
    pub threshold_simple: usize,
    /// Complexity score below which short queries stay local.
    pub complexity_local_threshold: f32,
    /// Creativity score above which queries go to the API track.
    pub creativity_api_threshold: f32,
    /// Time-sensitivity score above which responsiveness wins (local).
    pub time_sensitivity_threshold: f32,
    /// Complexity score above which both tracks run in parallel.
    pub parallel_threshold: f32,
    /// Feature weights for scoring.
    pub weights: RouterWeights,
    /// Latency prior for the local track when no history exists (ms).
    pub prior_local_latency_ms: f64,
    /// Latency prior for the API track when no history exists (ms).
    pub prior_api_latency_ms: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            threshold_very_long: 60,
            threshold_simple: 12,
            complexity_local_threshold: 0.4,
            creativity_api_threshold: 0.65,
            time_sensitivity_threshold: 0.5,
            parallel_threshold: 0.6,
            weights: RouterWeights::default(),
            prior_local_latency_ms: 800.0,
            prior_api_latency_ms: 2_000.0,
        }
    }
}

/// Prompt template family for the on-device model.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelArchitecture {
    /// Llama 2 chat template.
    Llama2,
    /// Mistral instruct template (also the fallback for unknown models).
    #[default]
    Mistral,
    /// Vicuna v1.5 template.
    Vicuna,
    /// ChatML template.
    Chatml,
}

/// On-device model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalModelConfig {
    /// Model ID resolved through the model registry.
    pub model_id: String,
    /// Path to the model registry document.
    pub registry_path: Option<PathBuf>,
    /// Prompt template family.
    pub architecture: ModelArchitecture,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
    /// Top-k sampling cutoff.
    pub top_k: u32,
    /// Repetition penalty.
    pub repeat_penalty: f32,
    /// Stop sequences terminating generation.
    pub stop_sequences: Vec<String>,
    /// Context window size in tokens.
    pub context_size: u32,
    /// Inference thread count (0 = runtime default).
    pub threads: u32,
    /// Prompt batch size.
    pub batch_size: u32,
    /// Layers offloaded to GPU (0 = CPU only).
    pub gpu_layers: u32,
    /// Reduce VRAM usage at the cost of speed.
    pub low_vram: bool,
    /// Preferred quantization level (e.g. "q4_0"), if the registry has options.
    pub quantization: Option<String>,
    /// Per-call deadline in milliseconds.
    pub timeout_ms: u64,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            model_id: "local-default".to_owned(),
            registry_path: None,
            architecture: ModelArchitecture::Mistral,
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            stop_sequences: Vec::new(),
            context_size: 4096,
            threads: 0,
            batch_size: 512,
            gpu_layers: 0,
            low_vram: false,
            quantization: None,
            timeout_ms: 6_000,
        }
    }
}

/// Remote model provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteModelConfig {
    /// Provider name (used for logging and the price table).
    pub provider: String,
    /// Model identifier sent with each request.
    pub model: String,
    /// Chat completions endpoint URL.
    pub api_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Per-call deadline in milliseconds (includes retries).
    pub timeout_ms: u64,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (doubles per attempt).
    pub base_backoff_ms: u64,
    /// Cap on concurrent outstanding API requests.
    pub max_concurrent_requests: usize,
}

impl Default for RemoteModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            api_url: "https://api.openai.com/v1/chat/completions".to_owned(),
            api_key_env: "SONA_API_KEY".to_owned(),
            timeout_ms: 12_000,
            max_retries: 3,
            base_backoff_ms: 500,
            max_concurrent_requests: 4,
        }
    }
}

/// Response integration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Similarity at or above which the preferred source is used alone.
    pub similarity_high: f32,
    /// Similarity at or above which responses are combined.
    pub similarity_medium: f32,
    /// Preference weight for the API track when sources agree.
    pub api_preference_weight: f32,
    /// Preference weight for the local track when sources agree.
    pub local_preference_weight: f32,
    /// Emit whichever track finished first, ignoring similarity.
    pub latency_priority: bool,
    /// Minimum local token count before STAGED escalates to the API.
    pub min_acceptable_tokens: u32,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            similarity_high: 0.8,
            similarity_medium: 0.5,
            api_preference_weight: 0.6,
            local_preference_weight: 0.4,
            latency_priority: false,
            min_acceptable_tokens: 8,
        }
    }
}

/// Optimization strategy selecting how adaptation heuristics are weighted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStrategy {
    /// Re-weights the heuristics based on the recent targets-met rate.
    #[default]
    Adaptive,
    /// Favors low end-to-end latency.
    LatencyFocused,
    /// Favors low memory/CPU/battery usage.
    ResourceEfficient,
    /// Favors the higher-quality track.
    QualityFocused,
    /// Favors low per-request cost.
    CostOptimized,
}

/// Hard resource limits consulted by the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConstraints {
    /// Maximum process resident memory in MiB.
    pub max_memory_mb: u64,
    /// Maximum system CPU utilization percentage.
    pub max_cpu_percent: f32,
    /// Maximum GPU memory in MiB (0 = unconstrained).
    pub max_gpu_memory_mb: u64,
    /// Cap on concurrent outstanding requests.
    pub max_concurrent_requests: usize,
    /// Target end-to-end latency in milliseconds.
    pub target_latency_ms: f64,
    /// Maximum estimated cost per request in USD.
    pub max_cost_per_request: f64,
    /// Battery percentage below which parallel processing is disallowed.
    pub battery_threshold_percent: f32,
}

impl Default for ResourceConstraints {
    fn default() -> Self {
        Self {
            max_memory_mb: 4_096,
            max_cpu_percent: 85.0,
            max_gpu_memory_mb: 0,
            max_concurrent_requests: 4,
            target_latency_ms: 2_500.0,
            max_cost_per_request: 0.05,
            battery_threshold_percent: 20.0,
        }
    }
}

/// Adaptive optimizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Strategy selecting heuristic weightings.
    pub strategy: OptimizationStrategy,
    /// Resource limits.
    pub constraints: ResourceConstraints,
    /// Seconds between adaptation passes.
    pub adaptation_interval_s: u64,
    /// Seconds between resource samples.
    pub monitor_interval_s: u64,
    /// Whether the resource monitor runs at all.
    pub monitoring_enabled: bool,
    /// Per-path metric ring capacity.
    pub metrics_window: usize,
    /// API success rate below which local bias increases.
    pub min_api_success: f32,
    /// Quality gap (api − local) above which API preference increases.
    pub quality_gap_threshold: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: OptimizationStrategy::Adaptive,
            constraints: ResourceConstraints::default(),
            adaptation_interval_s: 30,
            monitor_interval_s: 5,
            monitoring_enabled: true,
            metrics_window: 100,
            min_api_success: 0.8,
            quality_gap_threshold: 0.15,
        }
    }
}

/// Conversation memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Whether memory retrieval/storage runs at all.
    pub enabled: bool,
    /// Token budget for retrieved context attached to a turn.
    pub working_memory_token_cap: usize,
    /// History length beyond which summarization triggers.
    pub summarization_threshold: usize,
    /// Number of oldest entries replaced by one summary message.
    pub summarize_batch: usize,
    /// Hard cap on rolling conversation history length.
    pub max_conversation_history: usize,
    /// Top-K snippets pulled per retrieval.
    pub max_relevant_memories: usize,
    /// Vector store directory (managed by the memory engine).
    pub vector_store_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            working_memory_token_cap: 2_048,
            summarization_threshold: 20,
            summarize_batch: 10,
            max_conversation_history: 50,
            max_relevant_memories: 5,
            vector_store_path: None,
        }
    }
}

/// Logging configuration consumed by the binary at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Optional log file path; stderr only when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            file: None,
        }
    }
}

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Root data directory; defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    /// Checkpoints retained per conversation (older ones pruned).
    pub checkpoint_keep: usize,
    /// Seconds between directory backups (disabled when unset).
    pub backup_interval_s: Option<u64>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            checkpoint_keep: 20,
            backup_interval_s: None,
        }
    }
}

/// Environment variable overriding the model directory root.
pub const MODEL_DIR_ENV: &str = "SONA_MODEL_DIR";

/// Top-level sections recognized in the config file.
const KNOWN_SECTIONS: &[&str] = &[
    "activation",
    "voice",
    "router",
    "local",
    "remote",
    "integration",
    "optimizer",
    "memory",
    "logging",
    "persistence",
];

impl AssistantConfig {
    /// Load configuration: defaults, then the file at `path` if present.
    ///
    /// Unknown top-level sections are logged as warnings and ignored.
    /// The result is validated before being returned.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                warn_unknown_sections(&raw, p);
                toml::from_str(&raw)
                    .map_err(|e| AssistantError::Config(format!("{}: {e}", p.display())))?
            }
            Some(p) => {
                warn!(path = %p.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve the persistence data directory, falling back to the
    /// platform data dir.
    pub fn data_dir(&self) -> PathBuf {
        self.persistence.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sona")
        })
    }

    /// Validate value ranges across all sections.
    pub fn validate(&self) -> Result<()> {
        fn unit(name: &str, v: f32) -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(AssistantError::Config(format!(
                    "{name} must be within [0, 1], got {v}"
                )));
            }
            Ok(())
        }

        if !(0.0..=2.0).contains(&self.local.temperature) {
            return Err(AssistantError::Config(format!(
                "local.temperature must be within [0, 2], got {}",
                self.local.temperature
            )));
        }
        if self.local.context_size < 512 {
            return Err(AssistantError::Config(format!(
                "local.context_size must be at least 512, got {}",
                self.local.context_size
            )));
        }
        if self.local.timeout_ms == 0 || self.remote.timeout_ms == 0 {
            return Err(AssistantError::Config(
                "track timeouts must be nonzero".to_owned(),
            ));
        }
        if self.remote.max_concurrent_requests == 0 {
            return Err(AssistantError::Config(
                "remote.max_concurrent_requests must be nonzero".to_owned(),
            ));
        }

        unit(
            "router.complexity_local_threshold",
            self.router.complexity_local_threshold,
        )?;
        unit(
            "router.creativity_api_threshold",
            self.router.creativity_api_threshold,
        )?;
        unit(
            "router.time_sensitivity_threshold",
            self.router.time_sensitivity_threshold,
        )?;
        unit("router.parallel_threshold", self.router.parallel_threshold)?;
        if self.router.threshold_simple >= self.router.threshold_very_long {
            return Err(AssistantError::Config(format!(
                "router.threshold_simple ({}) must be below router.threshold_very_long ({})",
                self.router.threshold_simple, self.router.threshold_very_long
            )));
        }

        unit("integration.similarity_high", self.integration.similarity_high)?;
        unit(
            "integration.similarity_medium",
            self.integration.similarity_medium,
        )?;
        if self.integration.similarity_medium > self.integration.similarity_high {
            return Err(AssistantError::Config(format!(
                "integration.similarity_medium ({}) must not exceed similarity_high ({})",
                self.integration.similarity_medium, self.integration.similarity_high
            )));
        }

        if self.optimizer.metrics_window == 0 {
            return Err(AssistantError::Config(
                "optimizer.metrics_window must be nonzero".to_owned(),
            ));
        }
        unit("optimizer.min_api_success", self.optimizer.min_api_success)?;

        if self.memory.summarization_threshold == 0 {
            return Err(AssistantError::Config(
                "memory.summarization_threshold must be nonzero".to_owned(),
            ));
        }
        if self.memory.max_conversation_history < self.memory.summarization_threshold {
            return Err(AssistantError::Config(format!(
                "memory.max_conversation_history ({}) must be at least summarization_threshold ({})",
                self.memory.max_conversation_history, self.memory.summarization_threshold
            )));
        }
        if self.memory.summarize_batch == 0 {
            return Err(AssistantError::Config(
                "memory.summarize_batch must be nonzero".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Log a warning for each unrecognized top-level section in the raw file.
fn warn_unknown_sections(raw: &str, path: &Path) {
    let Ok(value) = raw.parse::<toml::Value>() else {
        return;
    };
    let Some(table) = value.as_table() else {
        return;
    };
    for key in table.keys() {
        if !KNOWN_SECTIONS.contains(&key.as_str()) {
            warn!(path = %path.display(), key, "unknown config section ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AssistantConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let mut config = AssistantConfig::default();
        config.local.temperature = 2.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_small_context() {
        let mut config = AssistantConfig::default();
        config.local.context_size = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_similarity_thresholds() {
        let mut config = AssistantConfig::default();
        config.integration.similarity_medium = 0.9;
        config.integration.similarity_high = 0.6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let raw = r#"
            [router]
            threshold_simple = 6

            [integration]
            latency_priority = true
        "#;
        let config: AssistantConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.router.threshold_simple, 6);
        assert!(config.integration.latency_priority);
        // Untouched sections keep their defaults.
        assert_eq!(config.remote.max_retries, 3);
        config.validate().unwrap();
    }

    #[test]
    fn activation_mode_round_trips() {
        let mode: ActivationMode = toml::from_str::<ActivationConfig>("mode = \"continuous\"")
            .unwrap()
            .mode;
        assert_eq!(mode, ActivationMode::Continuous);
    }
}
