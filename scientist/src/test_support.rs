//! Fixtures shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shared_types::{
    Artifacts, Event, ExperimentConfig, ExperimentResult, ForwardConfig, Metrics, ReconFamily,
    ReconParams, Topic, TrainConfig, UqScheme,
};

use crate::actors::event_bus::EventBus;
use crate::llm::{ChatMessage, ChatResponse, LlmBackend, LlmError, ResponseFormat};

/// A configuration inside the default design space when `cr` is one of
/// 8/16/24 and `stages` one of 5/7/9.
pub fn config_with(id: &str, cr: u32, stages: u32) -> ExperimentConfig {
    ExperimentConfig {
        experiment_id: id.to_string(),
        forward_config: ForwardConfig {
            compression_ratio: cr,
            mask_type: "random".to_string(),
            sensor_noise: 0.01,
            resolution: [256, 256],
            frame_rate: 30,
        },
        recon_family: ReconFamily::CiasCore,
        recon_params: ReconParams {
            num_stages: stages,
            num_features: 64,
            num_blocks: 3,
            learning_rate: 1e-4,
            use_physics_prior: true,
            activation: "ReLU".to_string(),
        },
        uq_scheme: UqScheme::Disabled,
        uq_params: Default::default(),
        train_config: TrainConfig::default(),
        created_at: Utc::now(),
    }
}

pub fn metrics(psnr: f64, ssim: f64, latency: f64) -> Metrics {
    Metrics {
        psnr,
        ssim,
        coverage: 0.9,
        latency,
        memory: 512.0,
        training_time: 60.0,
        convergence_epoch: 20,
    }
}

pub fn result_ok(config: ExperimentConfig, cycle: u32, metrics: Metrics) -> ExperimentResult {
    ExperimentResult::completed(config, cycle, metrics, Artifacts::default(), Utc::now())
}

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the bus history holds at least `count` events on `topic`.
pub async fn wait_for_topic(bus: &EventBus, topic: Topic, count: usize) -> Vec<Event> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let events = bus.history(Some(topic)).await.unwrap_or_default();
        if events.len() >= count || tokio::time::Instant::now() >= deadline {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Replays canned replies in order; `Unavailable` once exhausted.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// User prompts seen so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _format: ResponseFormat,
    ) -> Result<ChatResponse, LlmError> {
        if let Some(last) = messages.last() {
            self.prompts.lock().unwrap().push(last.content.clone());
        }
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(content)) => Ok(ChatResponse {
                content,
                model: "scripted".to_string(),
                tokens: 10,
                finish_reason: Some("stop".to_string()),
            }),
            Some(Err(e)) => Err(e),
            None => Err(LlmError::Unavailable("script exhausted".to_string())),
        }
    }
}
