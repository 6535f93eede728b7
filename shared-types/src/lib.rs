//! Shared types for the scientist loop
//!
//! These types form the wire contract between:
//! - the message bus and every agent subscribed to it
//! - the world model (persisted as JSON blobs)
//! - external experiment runners (via `ExperimentConfig::to_api_format`)
//!
//! Serializable with serde for JSON.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Experiment Configuration
// ============================================================================

/// Reconstruction algorithm family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconFamily {
    #[serde(rename = "CIAS-Core")]
    CiasCore,
    #[serde(rename = "CIAS-Core-ELP")]
    CiasCoreElp,
    #[serde(rename = "GAP-Net")]
    GapNet,
    #[serde(rename = "Other")]
    Other,
}

impl ReconFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CiasCore => "CIAS-Core",
            Self::CiasCoreElp => "CIAS-Core-ELP",
            Self::GapNet => "GAP-Net",
            Self::Other => "Other",
        }
    }
}

/// Uncertainty quantification scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UqScheme {
    Conformal,
    Ensemble,
    #[serde(rename = "None")]
    Disabled,
}

impl UqScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conformal => "Conformal",
            Self::Ensemble => "Ensemble",
            Self::Disabled => "None",
        }
    }
}

/// Forward model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardConfig {
    pub compression_ratio: u32,
    pub mask_type: String,
    pub sensor_noise: f64,
    pub resolution: [u32; 2],
    pub frame_rate: u32,
}

/// Reconstruction network parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconParams {
    pub num_stages: u32,
    pub num_features: u32,
    pub num_blocks: u32,
    pub learning_rate: f64,
    pub use_physics_prior: bool,
    pub activation: String,
}

/// Training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: u32,
    pub num_epochs: u32,
    pub optimizer: String,
    pub scheduler: String,
    pub early_stopping: bool,
    pub early_stopping_patience: u32,
    pub gradient_clip: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            num_epochs: 50,
            optimizer: "Adam".to_string(),
            scheduler: "CosineAnnealing".to_string(),
            early_stopping: true,
            early_stopping_patience: 10,
            gradient_clip: 1.0,
        }
    }
}

/// Complete experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment_id: String,
    pub forward_config: ForwardConfig,
    pub recon_family: ReconFamily,
    pub recon_params: ReconParams,
    pub uq_scheme: UqScheme,
    #[serde(default)]
    pub uq_params: BTreeMap<String, serde_json::Value>,
    pub train_config: TrainConfig,
    pub created_at: DateTime<Utc>,
}

/// Identity view of a configuration: every field except id and timestamp.
#[derive(Serialize)]
struct ConfigIdentity<'a> {
    forward_config: &'a ForwardConfig,
    recon_family: ReconFamily,
    recon_params: &'a ReconParams,
    uq_scheme: UqScheme,
    uq_params: &'a BTreeMap<String, serde_json::Value>,
    train_config: &'a TrainConfig,
}

impl ExperimentConfig {
    /// Generate a fresh experiment id (`exp_<ulid>`).
    pub fn new_id() -> String {
        format!("exp_{}", ulid::Ulid::new().to_string().to_lowercase())
    }

    /// SHA-256 hex digest over the full configuration tuple.
    ///
    /// Two configurations are duplicates iff their fingerprints match; the
    /// experiment id and creation timestamp do not participate.
    pub fn fingerprint(&self) -> String {
        let identity = ConfigIdentity {
            forward_config: &self.forward_config,
            recon_family: self.recon_family,
            recon_params: &self.recon_params,
            uq_scheme: self.uq_scheme,
            uq_params: &self.uq_params,
            train_config: &self.train_config,
        };
        // Serializing plain structs and a BTreeMap cannot fail.
        let bytes = serde_json::to_vec(&identity).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Request body understood by external experiment runners.
    pub fn to_api_format(&self) -> serde_json::Value {
        serde_json::json!({
            "experiment_id": self.experiment_id,
            "forward_model": {
                "compression_ratio": self.forward_config.compression_ratio,
                "mask_type": self.forward_config.mask_type,
                "sensor_noise": self.forward_config.sensor_noise,
                "resolution": self.forward_config.resolution,
                "frame_rate": self.forward_config.frame_rate,
            },
            "reconstruction": {
                "family": self.recon_family.as_str(),
                "num_stages": self.recon_params.num_stages,
                "num_features": self.recon_params.num_features,
                "num_blocks": self.recon_params.num_blocks,
                "learning_rate": self.recon_params.learning_rate,
                "use_physics_prior": self.recon_params.use_physics_prior,
                "activation": self.recon_params.activation,
            },
            "training": self.train_config,
            "uncertainty_quantification": {
                "scheme": self.uq_scheme.as_str(),
                "params": self.uq_params,
            },
        })
    }

    /// One-line description used in logs and prompts.
    pub fn short_label(&self) -> String {
        format!(
            "cr={} mask={} stages={} features={} blocks={} lr={} act={}",
            self.forward_config.compression_ratio,
            self.forward_config.mask_type,
            self.recon_params.num_stages,
            self.recon_params.num_features,
            self.recon_params.num_blocks,
            self.recon_params.learning_rate,
            self.recon_params.activation,
        )
    }
}

// ============================================================================
// Design Space
// ============================================================================

/// Closed numeric interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: f64,
    pub max: f64,
}

impl NumericRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Enumerated and bounded values every configuration field must be drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSpace {
    pub compression_ratios: Vec<u32>,
    pub mask_types: Vec<String>,
    pub num_stages: Vec<u32>,
    pub num_features: Vec<u32>,
    pub num_blocks: Vec<u32>,
    pub learning_rates: Vec<f64>,
    pub activations: Vec<String>,
    #[serde(default = "default_recon_families")]
    pub recon_families: Vec<ReconFamily>,
    #[serde(default = "default_uq_schemes")]
    pub uq_schemes: Vec<UqScheme>,
    #[serde(default = "default_sensor_noise")]
    pub sensor_noise: NumericRange,
}

fn default_recon_families() -> Vec<ReconFamily> {
    vec![ReconFamily::CiasCore]
}

fn default_uq_schemes() -> Vec<UqScheme> {
    vec![UqScheme::Disabled]
}

fn default_sensor_noise() -> NumericRange {
    NumericRange { min: 0.0, max: 0.1 }
}

impl Default for DesignSpace {
    fn default() -> Self {
        Self {
            compression_ratios: vec![8, 16, 24],
            mask_types: vec!["random".to_string(), "optimized".to_string()],
            num_stages: vec![5, 7, 9],
            num_features: vec![32, 64, 128],
            num_blocks: vec![2, 3, 4],
            learning_rates: vec![1e-4, 5e-5],
            activations: vec!["ReLU".to_string(), "LeakyReLU".to_string()],
            recon_families: default_recon_families(),
            uq_schemes: default_uq_schemes(),
            sensor_noise: default_sensor_noise(),
        }
    }
}

impl DesignSpace {
    /// Number of distinct points on the enumerated axes.
    pub fn size(&self) -> usize {
        [
            self.compression_ratios.len(),
            self.mask_types.len(),
            self.num_stages.len(),
            self.num_features.len(),
            self.num_blocks.len(),
            self.learning_rates.len(),
            self.activations.len(),
            self.recon_families.len(),
            self.uq_schemes.len(),
        ]
        .iter()
        .product()
    }

    /// Human-readable list of every field of `config` outside this space.
    /// Empty means the configuration is a member.
    pub fn violations(&self, config: &ExperimentConfig) -> Vec<String> {
        let mut out = Vec::new();
        let fc = &config.forward_config;
        let rp = &config.recon_params;

        if !self.compression_ratios.contains(&fc.compression_ratio) {
            out.push(format!(
                "compression_ratio {} not in {:?}",
                fc.compression_ratio, self.compression_ratios
            ));
        }
        if !self.mask_types.contains(&fc.mask_type) {
            out.push(format!("mask_type '{}' not in {:?}", fc.mask_type, self.mask_types));
        }
        if !self.sensor_noise.contains(fc.sensor_noise) {
            out.push(format!(
                "sensor_noise {} outside [{}, {}]",
                fc.sensor_noise, self.sensor_noise.min, self.sensor_noise.max
            ));
        }
        if !self.num_stages.contains(&rp.num_stages) {
            out.push(format!("num_stages {} not in {:?}", rp.num_stages, self.num_stages));
        }
        if !self.num_features.contains(&rp.num_features) {
            out.push(format!(
                "num_features {} not in {:?}",
                rp.num_features, self.num_features
            ));
        }
        if !self.num_blocks.contains(&rp.num_blocks) {
            out.push(format!("num_blocks {} not in {:?}", rp.num_blocks, self.num_blocks));
        }
        if !self
            .learning_rates
            .iter()
            .any(|lr| approx_eq(*lr, rp.learning_rate))
        {
            out.push(format!(
                "learning_rate {} not in {:?}",
                rp.learning_rate, self.learning_rates
            ));
        }
        if !self.activations.contains(&rp.activation) {
            out.push(format!(
                "activation '{}' not in {:?}",
                rp.activation, self.activations
            ));
        }
        if !self.recon_families.contains(&config.recon_family) {
            out.push(format!(
                "recon_family {} not allowed",
                config.recon_family.as_str()
            ));
        }
        if !self.uq_schemes.contains(&config.uq_scheme) {
            out.push(format!("uq_scheme {} not allowed", config.uq_scheme.as_str()));
        }
        out
    }
}

fn approx_eq(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(f64::MIN_POSITIVE);
    (a - b).abs() / scale < 1e-9
}

// ============================================================================
// Experiment Results
// ============================================================================

/// Experiment performance metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub psnr: f64,
    pub ssim: f64,
    #[serde(default)]
    pub coverage: f64,
    /// Milliseconds per reconstructed frame
    pub latency: f64,
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub training_time: f64,
    #[serde(default)]
    pub convergence_epoch: u32,
}

impl Metrics {
    /// Objective vector in "maximize all" form: quality, fidelity, negated latency.
    pub fn objectives(&self) -> [f64; 3] {
        [self.psnr, self.ssim, -self.latency]
    }
}

/// Experiment output files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default)]
    pub checkpoint_path: Option<String>,
    #[serde(default)]
    pub training_log_path: Option<String>,
    #[serde(default)]
    pub sample_reconstructions: Vec<String>,
    #[serde(default)]
    pub figure_scripts: Vec<String>,
    #[serde(default)]
    pub metrics_history: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Completed,
    Failed,
    TimedOut,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(format!("unknown experiment status: {other}")),
        }
    }
}

/// Outcome of one experiment. Failed experiments carry no metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub experiment_id: String,
    /// Cycle whose plan produced this experiment
    pub cycle: u32,
    pub config: ExperimentConfig,
    pub metrics: Option<Metrics>,
    #[serde(default)]
    pub artifacts: Artifacts,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExperimentResult {
    pub fn completed(
        config: ExperimentConfig,
        cycle: u32,
        metrics: Metrics,
        artifacts: Artifacts,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            experiment_id: config.experiment_id.clone(),
            cycle,
            config,
            metrics: Some(metrics),
            artifacts,
            status: ExperimentStatus::Completed,
            error_message: None,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        config: ExperimentConfig,
        cycle: u32,
        status: ExperimentStatus,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            experiment_id: config.experiment_id.clone(),
            cycle,
            config,
            metrics: None,
            artifacts: Artifacts::default(),
            status,
            error_message: Some(error.into()),
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.metrics.is_some()
    }
}

// ============================================================================
// Insights
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    /// No analysis has run yet
    Pending,
    Complete,
    InsufficientData,
    TimedOut,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParetoSummary {
    pub experiment_ids: Vec<String>,
    pub count: usize,
    #[serde(default)]
    pub verification: serde_json::Value,
}

/// Per-stratum front (e.g. `cr=16`), ranked by non-dominated sorting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumFront {
    pub stratum: String,
    pub experiment_ids: Vec<String>,
}

/// Snapshot produced by one analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub cycle: u32,
    pub status: InsightStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub pareto_front: ParetoSummary,
    #[serde(default)]
    pub strata: Vec<StratumFront>,
    #[serde(default)]
    pub trends: serde_json::Value,
    #[serde(default)]
    pub recommendations: serde_json::Value,
    #[serde(default)]
    pub total_experiments_analyzed: usize,
}

impl Insights {
    pub fn pending() -> Self {
        Self::with_status(0, InsightStatus::Pending, None, 0)
    }

    pub fn insufficient_data(cycle: u32, analyzed: usize) -> Self {
        Self::with_status(
            cycle,
            InsightStatus::InsufficientData,
            Some("Insufficient data".to_string()),
            analyzed,
        )
    }

    pub fn timed_out(cycle: u32) -> Self {
        Self::with_status(
            cycle,
            InsightStatus::TimedOut,
            Some("Analysis did not report before its deadline".to_string()),
            0,
        )
    }

    fn with_status(
        cycle: u32,
        status: InsightStatus,
        message: Option<String>,
        analyzed: usize,
    ) -> Self {
        Self {
            cycle,
            status,
            message,
            pareto_front: ParetoSummary::default(),
            strata: Vec::new(),
            trends: serde_json::Value::Null,
            recommendations: serde_json::Value::Null,
            total_experiments_analyzed: analyzed,
        }
    }

    /// `trends.key_findings` as plain strings, if the trend analysis produced any.
    pub fn key_findings(&self) -> Vec<String> {
        self.trends
            .get("key_findings")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .map(|item| match item.as_str() {
                        Some(s) => s.to_string(),
                        None => item.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ============================================================================
// Event System
// ============================================================================

/// Bus topics. Wire names are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    PlanRequested,
    PlanApproved,
    PlanRejected,
    ExperimentCompleted,
    StateUpdated,
    InsightGenerated,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::PlanRequested,
        Topic::PlanApproved,
        Topic::PlanRejected,
        Topic::ExperimentCompleted,
        Topic::StateUpdated,
        Topic::InsightGenerated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PlanRequested => "PLAN_REQUESTED",
            Topic::PlanApproved => "PLAN_APPROVED",
            Topic::PlanRejected => "PLAN_REJECTED",
            Topic::ExperimentCompleted => "EXPERIMENT_COMPLETED",
            Topic::StateUpdated => "STATE_UPDATED",
            Topic::InsightGenerated => "INSIGHT_GENERATED",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = EventDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventDecodeError::UnknownTopic(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequested {
    /// Maximum number of configurations the planner may propose
    pub budget: usize,
    pub design_space: DesignSpace,
    pub cycle: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanApproved {
    pub configs: Vec<ExperimentConfig>,
    #[serde(default)]
    pub cycle: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRejected {
    pub feedback: String,
    /// experiment_id -> reason the item was rejected
    #[serde(default)]
    pub critique: BTreeMap<String, String>,
    #[serde(default)]
    pub cycle: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentCompleted {
    pub result: ExperimentResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdated {
    pub trigger_analysis: bool,
    pub cycle: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightGenerated {
    pub insights: Insights,
    pub pareto_ids: Vec<String>,
    pub cycle: u32,
}

/// Typed payload, one variant per topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    PlanRequested(PlanRequested),
    PlanApproved(PlanApproved),
    PlanRejected(PlanRejected),
    ExperimentCompleted(ExperimentCompleted),
    StateUpdated(StateUpdated),
    InsightGenerated(InsightGenerated),
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            Self::PlanRequested(_) => Topic::PlanRequested,
            Self::PlanApproved(_) => Topic::PlanApproved,
            Self::PlanRejected(_) => Topic::PlanRejected,
            Self::ExperimentCompleted(_) => Topic::ExperimentCompleted,
            Self::StateUpdated(_) => Topic::StateUpdated,
            Self::InsightGenerated(_) => Topic::InsightGenerated,
        }
    }

    /// Decode an untyped payload for `topic`.
    pub fn decode(topic: Topic, payload: serde_json::Value) -> Result<Self, EventDecodeError> {
        let malformed = |source| EventDecodeError::MalformedPayload { topic, source };
        Ok(match topic {
            Topic::PlanRequested => {
                Self::PlanRequested(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::PlanApproved => {
                Self::PlanApproved(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::PlanRejected => {
                Self::PlanRejected(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::ExperimentCompleted => {
                Self::ExperimentCompleted(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::StateUpdated => {
                Self::StateUpdated(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::InsightGenerated => {
                Self::InsightGenerated(serde_json::from_value(payload).map_err(malformed)?)
            }
        })
    }
}

macro_rules! payload_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for EventPayload {
                fn from(value: $variant) -> Self {
                    EventPayload::$variant(value)
                }
            }
        )*
    };
}

payload_from!(
    PlanRequested,
    PlanApproved,
    PlanRejected,
    ExperimentCompleted,
    StateUpdated,
    InsightGenerated,
);

#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("malformed {topic} payload: {source}")]
    MalformedPayload {
        topic: Topic,
        #[source]
        source: serde_json::Error,
    },
}

/// Event envelope. Immutable once published; identity is `id`.
///
/// The topic is derived from the payload variant, so the two cannot disagree.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "WireEvent")]
pub struct Event {
    /// Unique event identifier (ULID)
    pub id: String,
    /// Agent name of the publisher
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: impl Into<EventPayload>, sender: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            sender: sender.into(),
            timestamp: Utc::now(),
            payload: payload.into(),
        }
    }

    /// Build an event from an untyped topic/payload pair, rejecting unknown
    /// topics and payloads that do not match the topic's schema.
    pub fn from_wire(
        topic: &str,
        payload: serde_json::Value,
        sender: impl Into<String>,
    ) -> Result<Self, EventDecodeError> {
        let topic = topic.parse::<Topic>()?;
        Ok(Self::new(EventPayload::decode(topic, payload)?, sender))
    }

    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Event", 5)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("topic", &self.topic())?;
        state.serialize_field("sender", &self.sender)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("payload", &self.payload)?;
        state.end()
    }
}

#[derive(Deserialize)]
struct WireEvent {
    id: String,
    topic: String,
    sender: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: serde_json::Value,
}

impl TryFrom<WireEvent> for Event {
    type Error = EventDecodeError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let topic = wire.topic.parse::<Topic>()?;
        Ok(Self {
            id: wire.id,
            sender: wire.sender,
            timestamp: wire.timestamp,
            payload: EventPayload::decode(topic, wire.payload)?,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
