//! Planner - turns `PLAN_REQUESTED` into a candidate batch
//!
//! Candidates come from the LLM when it is enabled and reachable, topped up by
//! a history-aware sampler: neighbours of the best experiment first, then
//! uniform exploration. Every candidate must be a member of the design space
//! and novel by configuration fingerprint, both against persisted history and
//! within the batch.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use shared_types::{
    DesignSpace, Event, EventPayload, ExperimentConfig, ForwardConfig, PlanApproved, PlanRejected,
    PlanRequested, ReconFamily, ReconParams, TrainConfig, UqScheme,
};

use crate::actors::event_bus::{EventBus, EventHandler, HandlerResult};
use crate::actors::reviewer::{ReviewVerdict, Reviewer};
use crate::llm::{chat_json, SharedBackend};
use crate::world_model::{
    AnalysisLink, LlmAnalysisRecord, TokenKind, WorldModel, WorldModelError, WorldModelSummary,
};

pub const PLANNER_SENDER: &str = "Planner";

const DEFAULT_SENSOR_NOISE: f64 = 0.01;
const DEFAULT_RESOLUTION: [u32; 2] = [256, 256];
const DEFAULT_FRAME_RATE: u32 = 30;
const MEMORY_QUERY: &str = "excellent quality ultra-fast speed";

#[derive(Debug, Clone, Default)]
pub struct PlannerSettings {
    /// Fixed sampler seed; entropy-seeded when `None`
    pub seed: Option<u64>,
    pub use_llm: bool,
}

/// Where a proposed batch goes before it is published.
#[derive(Clone)]
pub enum PlanRoute {
    /// Publish as `PLAN_APPROVED` directly
    Direct,
    /// Publish the reviewer's verdict
    Review(Arc<Reviewer>),
}

/// The searchable axes of a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub compression_ratio: u32,
    pub mask_type: String,
    pub num_stages: u32,
    pub num_features: u32,
    pub num_blocks: u32,
    pub learning_rate: f64,
    pub activation: String,
    #[serde(default)]
    pub recon_family: Option<ReconFamily>,
    #[serde(default)]
    pub uq_scheme: Option<UqScheme>,
}

impl Candidate {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            compression_ratio: config.forward_config.compression_ratio,
            mask_type: config.forward_config.mask_type.clone(),
            num_stages: config.recon_params.num_stages,
            num_features: config.recon_params.num_features,
            num_blocks: config.recon_params.num_blocks,
            learning_rate: config.recon_params.learning_rate,
            activation: config.recon_params.activation.clone(),
            recon_family: Some(config.recon_family),
            uq_scheme: Some(config.uq_scheme),
        }
    }

    /// Fresh configuration (new id, current timestamp) for these axes.
    pub fn into_config(self, space: &DesignSpace) -> ExperimentConfig {
        let sensor_noise = if space.sensor_noise.contains(DEFAULT_SENSOR_NOISE) {
            DEFAULT_SENSOR_NOISE
        } else {
            space.sensor_noise.min
        };
        ExperimentConfig {
            experiment_id: ExperimentConfig::new_id(),
            forward_config: ForwardConfig {
                compression_ratio: self.compression_ratio,
                mask_type: self.mask_type,
                sensor_noise,
                resolution: DEFAULT_RESOLUTION,
                frame_rate: DEFAULT_FRAME_RATE,
            },
            recon_family: self
                .recon_family
                .or_else(|| space.recon_families.first().copied())
                .unwrap_or(ReconFamily::CiasCore),
            recon_params: ReconParams {
                num_stages: self.num_stages,
                num_features: self.num_features,
                num_blocks: self.num_blocks,
                learning_rate: self.learning_rate,
                use_physics_prior: true,
                activation: self.activation,
            },
            uq_scheme: self
                .uq_scheme
                .or_else(|| space.uq_schemes.first().copied())
                .unwrap_or(UqScheme::Disabled),
            uq_params: Default::default(),
            train_config: TrainConfig::default(),
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Sampling
// ============================================================================

fn middle<T: Clone>(values: &[T]) -> Option<T> {
    values.get(values.len() / 2).cloned()
}

/// Seed batch: one configuration per compression ratio (at most three) with
/// mid-range architecture values.
pub fn baseline_configs(space: &DesignSpace) -> Vec<ExperimentConfig> {
    let (Some(mask_type), Some(num_stages), Some(num_features), Some(num_blocks)) = (
        space.mask_types.first().cloned(),
        middle(&space.num_stages),
        middle(&space.num_features),
        middle(&space.num_blocks),
    ) else {
        return Vec::new();
    };
    let (Some(learning_rate), Some(activation)) = (
        space.learning_rates.first().copied(),
        space.activations.first().cloned(),
    ) else {
        return Vec::new();
    };

    space
        .compression_ratios
        .iter()
        .take(3)
        .map(|&compression_ratio| {
            Candidate {
                compression_ratio,
                mask_type: mask_type.clone(),
                num_stages,
                num_features,
                num_blocks,
                learning_rate,
                activation: activation.clone(),
                recon_family: None,
                uq_scheme: None,
            }
            .into_config(space)
        })
        .collect()
}

fn adjacent<T: PartialEq + Clone>(values: &[T], current: &T) -> Vec<T> {
    let Some(i) = values.iter().position(|v| v == current) else {
        return values.to_vec();
    };
    let mut out = Vec::new();
    if i > 0 {
        out.push(values[i - 1].clone());
    }
    if let Some(next) = values.get(i + 1) {
        out.push(next.clone());
    }
    out
}

/// Candidates that differ from `best` on exactly one axis, by one step.
fn neighbours(best: &Candidate, space: &DesignSpace) -> Vec<Candidate> {
    let mut out = Vec::new();
    for v in adjacent(&space.compression_ratios, &best.compression_ratio) {
        out.push(Candidate { compression_ratio: v, ..best.clone() });
    }
    for v in adjacent(&space.mask_types, &best.mask_type) {
        out.push(Candidate { mask_type: v, ..best.clone() });
    }
    for v in adjacent(&space.num_stages, &best.num_stages) {
        out.push(Candidate { num_stages: v, ..best.clone() });
    }
    for v in adjacent(&space.num_features, &best.num_features) {
        out.push(Candidate { num_features: v, ..best.clone() });
    }
    for v in adjacent(&space.num_blocks, &best.num_blocks) {
        out.push(Candidate { num_blocks: v, ..best.clone() });
    }
    for v in adjacent(&space.learning_rates, &best.learning_rate) {
        out.push(Candidate { learning_rate: v, ..best.clone() });
    }
    for v in adjacent(&space.activations, &best.activation) {
        out.push(Candidate { activation: v, ..best.clone() });
    }
    out
}

fn random_candidate(rng: &mut StdRng, space: &DesignSpace) -> Option<Candidate> {
    Some(Candidate {
        compression_ratio: *space.compression_ratios.choose(rng)?,
        mask_type: space.mask_types.choose(rng)?.clone(),
        num_stages: *space.num_stages.choose(rng)?,
        num_features: *space.num_features.choose(rng)?,
        num_blocks: *space.num_blocks.choose(rng)?,
        learning_rate: *space.learning_rates.choose(rng)?,
        activation: space.activations.choose(rng)?.clone(),
        recon_family: Some(*space.recon_families.choose(rng)?),
        uq_scheme: Some(*space.uq_schemes.choose(rng)?),
    })
}

/// Push `config` if it is a design-space member with an unseen fingerprint.
fn admit(
    config: ExperimentConfig,
    space: &DesignSpace,
    known: &mut HashSet<String>,
    out: &mut Vec<ExperimentConfig>,
) -> bool {
    if !space.violations(&config).is_empty() {
        return false;
    }
    if !known.insert(config.fingerprint()) {
        return false;
    }
    out.push(config);
    true
}

/// Up to `count` novel members of `space`. Half the quota (rounded up) goes
/// to neighbours of `best`; the rest is drawn uniformly.
pub(crate) fn sample_configs(
    rng: &mut StdRng,
    space: &DesignSpace,
    best: Option<&Candidate>,
    known: &mut HashSet<String>,
    count: usize,
) -> Vec<ExperimentConfig> {
    let mut out = Vec::new();

    if let Some(best) = best {
        let quota = count.div_ceil(2);
        let mut near = neighbours(best, space);
        near.shuffle(rng);
        for candidate in near {
            if out.len() >= quota {
                break;
            }
            admit(candidate.into_config(space), space, known, &mut out);
        }
    }

    let max_attempts = count.saturating_mul(64);
    let mut attempts = 0;
    while out.len() < count && attempts < max_attempts {
        attempts += 1;
        let Some(candidate) = random_candidate(rng, space) else {
            break;
        };
        admit(candidate.into_config(space), space, known, &mut out);
    }
    out
}

// ============================================================================
// Planner
// ============================================================================

pub struct Planner {
    bus: EventBus,
    world_model: WorldModel,
    llm: SharedBackend,
    route: PlanRoute,
    use_llm: bool,
    rng: Mutex<StdRng>,
}

impl Planner {
    pub fn new(
        bus: EventBus,
        world_model: WorldModel,
        llm: SharedBackend,
        route: PlanRoute,
        settings: PlannerSettings,
    ) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            bus,
            world_model,
            llm,
            route,
            use_llm: settings.use_llm,
            rng: Mutex::new(rng),
        }
    }

    /// Build the reply to a plan request: approval, review verdict, or a
    /// rejection when nothing novel is left.
    pub async fn plan(&self, request: &PlanRequested) -> Result<EventPayload, WorldModelError> {
        let cycle = request.cycle;
        let space = &request.design_space;

        let (history, summary, memories) = self
            .world_model
            .blocking(|wm| {
                Ok((
                    wm.get_all_experiments()?,
                    wm.summarize()?,
                    wm.retrieve_relevant_experiments(MEMORY_QUERY, 5)?,
                ))
            })
            .await?;

        let mut known: HashSet<String> = history.iter().map(|r| r.config.fingerprint()).collect();
        let best = history
            .iter()
            .filter(|r| r.is_success())
            .filter_map(|r| r.metrics.as_ref().map(|m| (m.psnr, &r.config)))
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, config)| Candidate::from_config(config));

        let mut configs = Vec::new();
        if self.use_llm && request.budget > 0 {
            for candidate in self.propose_with_llm(request, &summary, &memories).await? {
                if configs.len() >= request.budget {
                    break;
                }
                admit(candidate.into_config(space), space, &mut known, &mut configs);
            }
        }

        let from_llm = configs.len();
        let remaining = request.budget.saturating_sub(configs.len());
        if remaining > 0 {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            configs.extend(sample_configs(&mut rng, space, best.as_ref(), &mut known, remaining));
        }

        tracing::info!(
            cycle,
            budget = request.budget,
            proposed = configs.len(),
            from_llm,
            history = history.len(),
            "Plan proposed"
        );

        if configs.is_empty() {
            return Ok(PlanRejected {
                feedback: "no novel configuration left in the design space".to_string(),
                critique: Default::default(),
                cycle,
            }
            .into());
        }

        match &self.route {
            PlanRoute::Direct => Ok(PlanApproved { configs, cycle }.into()),
            PlanRoute::Review(reviewer) => Ok(match reviewer.review(configs, request).await? {
                ReviewVerdict::Approved(configs) => PlanApproved { configs, cycle }.into(),
                ReviewVerdict::Rejected { feedback, critique } => PlanRejected {
                    feedback,
                    critique,
                    cycle,
                }
                .into(),
            }),
        }
    }

    async fn propose_with_llm(
        &self,
        request: &PlanRequested,
        summary: &WorldModelSummary,
        memories: &[String],
    ) -> Result<Vec<Candidate>, WorldModelError> {
        let system = "You are an experiment design expert for snapshot compressive imaging reconstruction.";
        let prompt = format!(
            "Propose up to {budget} new experiment configurations.\n\n\
             Design space (every value must come from these lists):\n{space}\n\n\
             Results so far:\n{summary}\n\n\
             Relevant past experiments:\n{memories}\n\n\
             Prefer configurations likely to improve PSNR and SSIM while keeping latency low. \
             Do not repeat past configurations.\n\n\
             Return JSON: {{\"configs\": [{{\"compression_ratio\": 16, \"mask_type\": \"random\", \
             \"num_stages\": 7, \"num_features\": 64, \"num_blocks\": 3, \"learning_rate\": 0.0001, \
             \"activation\": \"ReLU\"}}]}}",
            budget = request.budget,
            space = serde_json::to_string_pretty(&request.design_space)?,
            summary = serde_json::to_string_pretty(summary)?,
            memories = if memories.is_empty() {
                "(none yet)".to_string()
            } else {
                memories.join("\n")
            },
        );

        let reply = match chat_json(self.llm.as_ref(), system, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    cycle = request.cycle,
                    error = %e,
                    "LLM planning unavailable; using sampler"
                );
                return Ok(Vec::new());
            }
        };

        let parsed = reply.value.clone().unwrap_or(serde_json::Value::Null);
        let candidates: Vec<Candidate> = parsed
            .get("configs")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match serde_json::from_value(item.clone()) {
                        Ok(candidate) => Some(candidate),
                        Err(e) => {
                            tracing::debug!(error = %e, "Skipping malformed LLM candidate");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let cycle = request.cycle;
        let tokens = reply.response.tokens;
        let record = LlmAnalysisRecord {
            cycle,
            kind: "plan_proposal".to_string(),
            prompt,
            raw_response: reply.response.content,
            parsed,
            model: reply.response.model,
            tokens,
            links: Vec::<AnalysisLink>::new(),
        };
        self.world_model
            .blocking(move |wm| {
                wm.record_tokens(cycle, TokenKind::Plan, tokens)?;
                wm.save_llm_analysis(&record)?;
                Ok(())
            })
            .await?;

        Ok(candidates)
    }
}

#[async_trait]
impl EventHandler for Planner {
    fn name(&self) -> &str {
        PLANNER_SENDER
    }

    async fn handle(&self, event: Event) -> HandlerResult {
        let EventPayload::PlanRequested(request) = event.payload else {
            return Ok(());
        };

        let payload = match self.plan(&request).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(cycle = request.cycle, error = %e, "Planning failed");
                PlanRejected {
                    feedback: format!("planner failed: {e}"),
                    critique: Default::default(),
                    cycle: request.cycle,
                }
                .into()
            }
        };
        self.bus.publish(Event::new(payload, PLANNER_SENDER))?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
