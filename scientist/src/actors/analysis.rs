//! Analysis - Pareto front and LLM insights for a closed cycle
//!
//! Runs on `STATE_UPDATED{trigger_analysis: true}`. The front is computed over
//! successful experiments with the objective vector (psnr, ssim, -latency),
//! all maximized. Each LLM step has a fallback so a backend failure never
//! blocks the insight.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use shared_types::{
    Event, EventPayload, ExperimentResult, InsightGenerated, InsightStatus, Insights, Metrics,
    ParetoSummary, StratumFront,
};

use crate::actors::event_bus::{EventBus, EventHandler, HandlerResult};
use crate::llm::{chat_json, SharedBackend};
use crate::world_model::{
    AnalysisLink, FrontierEntry, LlmAnalysisRecord, TokenKind, WorldModel, WorldModelError,
};

pub const ANALYSIS_SENDER: &str = "Analysis";

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    /// Fewer successful experiments than this yields an insufficient-data insight
    pub min_experiments: usize,
    /// Frontier entries persisted per stratum
    pub pareto_top_k: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            min_experiments: 3,
            pareto_top_k: 5,
        }
    }
}

// ============================================================================
// Pareto
// ============================================================================

/// `a` dominates `b`: at least as good on every objective, strictly better on one.
pub fn dominates(a: &Metrics, b: &Metrics) -> bool {
    let (a, b) = (a.objectives(), b.objectives());
    a.iter().zip(b.iter()).all(|(x, y)| x >= y) && a.iter().zip(b.iter()).any(|(x, y)| x > y)
}

/// Ids of the non-dominated experiments, in input order.
pub fn pareto_front(experiments: &[(String, Metrics)]) -> Vec<String> {
    experiments
        .iter()
        .filter(|(_, m)| !experiments.iter().any(|(_, other)| dominates(other, m)))
        .map(|(id, _)| id.clone())
        .collect()
}

/// Non-dominated sorting rank per point (1 = on the front).
pub fn non_dominated_ranks(points: &[&Metrics]) -> Vec<u32> {
    let mut ranks = vec![0u32; points.len()];
    let mut remaining: Vec<usize> = (0..points.len()).collect();
    let mut rank = 1;
    while !remaining.is_empty() {
        let front: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| {
                !remaining
                    .iter()
                    .any(|&j| j != i && dominates(points[j], points[i]))
            })
            .collect();
        for &i in &front {
            ranks[i] = rank;
        }
        remaining.retain(|i| !front.contains(i));
        rank += 1;
    }
    ranks
}

/// Top-k ranked entries for one stratum: rank ascending, then psnr descending.
fn stratum_entries(stratum: &str, members: &[&ExperimentResult], top_k: usize) -> Vec<FrontierEntry> {
    let metrics: Vec<&Metrics> = members.iter().filter_map(|r| r.metrics.as_ref()).collect();
    let ranks = non_dominated_ranks(&metrics);
    let mut entries: Vec<FrontierEntry> = members
        .iter()
        .zip(metrics.iter())
        .zip(ranks)
        .map(|((result, m), rank)| FrontierEntry {
            experiment_id: result.experiment_id.clone(),
            rank,
            strata: stratum.to_string(),
            config: result.config.clone(),
            metrics: (*m).clone(),
        })
        .collect();
    entries.sort_by(|a, b| {
        a.rank.cmp(&b.rank).then_with(|| {
            b.metrics
                .psnr
                .partial_cmp(&a.metrics.psnr)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    entries.truncate(top_k);
    entries
}

// ============================================================================
// Agent
// ============================================================================

pub struct AnalysisAgent {
    bus: EventBus,
    world_model: WorldModel,
    llm: SharedBackend,
    settings: AnalysisSettings,
}

impl AnalysisAgent {
    pub fn new(
        bus: EventBus,
        world_model: WorldModel,
        llm: SharedBackend,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            bus,
            world_model,
            llm,
            settings,
        }
    }

    pub async fn analyze(&self, cycle: u32) -> Result<InsightGenerated, WorldModelError> {
        let all = self.world_model.blocking(|wm| wm.get_all_experiments()).await?;
        let successful: Vec<&ExperimentResult> = all
            .iter()
            .filter(|r| r.is_success() && r.metrics.is_some())
            .collect();

        if successful.len() < self.settings.min_experiments {
            tracing::info!(
                cycle,
                successful = successful.len(),
                required = self.settings.min_experiments,
                "Not enough successful experiments for a Pareto front"
            );
            return Ok(InsightGenerated {
                insights: Insights::insufficient_data(cycle, successful.len()),
                pareto_ids: Vec::new(),
                cycle,
            });
        }

        let points: Vec<(String, Metrics)> = successful
            .iter()
            .filter_map(|r| r.metrics.clone().map(|m| (r.experiment_id.clone(), m)))
            .collect();
        let pareto_ids = pareto_front(&points);

        // Strata: everything, then one per compression ratio
        let mut strata: BTreeMap<String, Vec<&ExperimentResult>> = BTreeMap::new();
        for result in &successful {
            strata.entry("all".to_string()).or_default().push(result);
            strata
                .entry(format!("cr={}", result.config.forward_config.compression_ratio))
                .or_default()
                .push(result);
        }
        let mut stratum_fronts = Vec::new();
        let mut frontier_updates = Vec::new();
        for (stratum, members) in &strata {
            let entries = stratum_entries(stratum, members, self.settings.pareto_top_k);
            stratum_fronts.push(StratumFront {
                stratum: stratum.clone(),
                experiment_ids: entries
                    .iter()
                    .filter(|e| e.rank == 1)
                    .map(|e| e.experiment_id.clone())
                    .collect(),
            });
            frontier_updates.push((stratum.clone(), entries));
        }

        let front_ids = pareto_ids.clone();
        self.world_model
            .blocking(move |wm| {
                for (stratum, entries) in &frontier_updates {
                    wm.update_pareto_frontiers(stratum, entries)?;
                }
                wm.save_pareto_front(cycle, &front_ids)
            })
            .await?;

        tracing::info!(
            cycle,
            analyzed = successful.len(),
            pareto = pareto_ids.len(),
            strata = stratum_fronts.len(),
            "Pareto front computed"
        );

        let verification = self.verify_pareto(cycle, &successful, &points, &pareto_ids).await?;
        let trends = self.analyze_trends(cycle, &successful).await?;
        let recommendations = self.recommend(cycle, &successful).await?;

        let best = points
            .iter()
            .max_by(|a, b| a.1.psnr.partial_cmp(&b.1.psnr).unwrap_or(std::cmp::Ordering::Equal));
        let summary = match best {
            Some((id, m)) => format!(
                "Cycle {cycle}: {} successful of {} experiments; Pareto front {:?}; best PSNR {:.2} dB ({id})",
                successful.len(),
                all.len(),
                pareto_ids,
                m.psnr
            ),
            None => format!("Cycle {cycle}: no successful experiments"),
        };
        self.world_model
            .blocking(move |wm| {
                wm.update_plan_summary(cycle, &summary)?;
                wm.update_global_summary(&summary)
            })
            .await?;

        let insights = Insights {
            cycle,
            status: InsightStatus::Complete,
            message: None,
            pareto_front: ParetoSummary {
                experiment_ids: pareto_ids.clone(),
                count: pareto_ids.len(),
                verification,
            },
            strata: stratum_fronts,
            trends,
            recommendations,
            total_experiments_analyzed: successful.len(),
        };
        Ok(InsightGenerated {
            insights,
            pareto_ids,
            cycle,
        })
    }

    async fn verify_pareto(
        &self,
        cycle: u32,
        successful: &[&ExperimentResult],
        points: &[(String, Metrics)],
        pareto_ids: &[String],
    ) -> Result<Value, WorldModelError> {
        let lines = points
            .iter()
            .filter(|(id, _)| pareto_ids.contains(id))
            .map(|(id, m)| {
                format!(
                    "- {id}: PSNR={:.2}dB, SSIM={:.4}, Latency={:.1}ms",
                    m.psnr, m.ssim, m.latency
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let (psnr, ssim, latency) = ranges(points);
        let prompt = format!(
            "Verify the reasonableness of this Pareto front.\n\n\
             Total experiments: {total}\n\
             Pareto front: {count} points\n\n\
             Pareto points:\n{lines}\n\n\
             Statistics:\n\
             - PSNR: {:.2} - {:.2} dB\n\
             - SSIM: {:.4} - {:.4}\n\
             - Latency: {:.1} - {:.1} ms\n\n\
             Assess whether the front is reasonable, any anomalies, the trade-off quality, \
             and improvement suggestions.\n\n\
             Return JSON: {{\"is_reasonable\": true, \"anomalies\": [], \"suggestions\": []}}",
            psnr.0,
            psnr.1,
            ssim.0,
            ssim.1,
            latency.0,
            latency.1,
            total = successful.len(),
            count = pareto_ids.len(),
        );
        let links = pareto_ids
            .iter()
            .map(|id| AnalysisLink {
                experiment_id: id.clone(),
                role: "pareto".to_string(),
            })
            .collect();
        self.ask(
            cycle,
            "pareto_verification",
            "You are an SCI domain expert",
            prompt,
            links,
            |e| json!({"is_reasonable": true, "error": e}),
        )
        .await
    }

    async fn analyze_trends(
        &self,
        cycle: u32,
        successful: &[&ExperimentResult],
    ) -> Result<Value, WorldModelError> {
        let points = metric_points(successful);
        let (psnr, _, _) = ranges(&points);
        let best = points
            .iter()
            .max_by(|a, b| a.1.psnr.partial_cmp(&b.1.psnr).unwrap_or(std::cmp::Ordering::Equal));
        let best_line = best
            .map(|(id, m)| format!("{id}: PSNR={:.2}, SSIM={:.4}", m.psnr, m.ssim))
            .unwrap_or_default();
        let prompt = format!(
            "Analyze the experiment trends.\n\n\
             Total experiments: {}\n\
             PSNR range: {:.2} - {:.2} dB\n\
             Best experiment: {best_line}\n\n\
             Report the key findings (main factors affecting performance), best configuration \
             patterns, performance bottlenecks and unexpected insights.\n\n\
             Return JSON: {{\"key_findings\": [], \"best_patterns\": {{}}, \"bottlenecks\": []}}",
            successful.len(),
            psnr.0,
            psnr.1,
        );
        let links = role_links(successful, "analyzed");
        self.ask(
            cycle,
            "trend_analysis",
            "You are a data analysis expert",
            prompt,
            links,
            |e| json!({"error": e}),
        )
        .await
    }

    async fn recommend(
        &self,
        cycle: u32,
        successful: &[&ExperimentResult],
    ) -> Result<Value, WorldModelError> {
        let best_psnr = successful
            .iter()
            .filter_map(|r| r.metrics.as_ref().map(|m| m.psnr))
            .fold(f64::NEG_INFINITY, f64::max);
        let prompt = format!(
            "Based on the analysis, provide experiment recommendations.\n\n\
             Current best PSNR: {best_psnr:.2} dB\n\
             Completed: {} experiments\n\n\
             Provide three specific configuration suggestions, an exploration strategy \
             (explore or exploit) and the expected improvements.\n\n\
             Return JSON: {{\"config_suggestions\": [], \"strategy\": \"\", \"expected_improvements\": {{}}}}",
            successful.len(),
        );
        let links = role_links(successful, "reference");
        self.ask(
            cycle,
            "recommendation",
            "You are an experiment design expert",
            prompt,
            links,
            |e| json!({"error": e}),
        )
        .await
    }

    /// One JSON-mode LLM step. Backend and parse failures return
    /// `fallback(error)`; successful replies are logged with their links and
    /// their tokens charged to the cycle's analysis budget.
    async fn ask(
        &self,
        cycle: u32,
        kind: &str,
        system: &str,
        prompt: String,
        links: Vec<AnalysisLink>,
        fallback: fn(String) -> Value,
    ) -> Result<Value, WorldModelError> {
        let reply = match chat_json(self.llm.as_ref(), system, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(cycle, kind, error = %e, "LLM analysis step failed; using fallback");
                return Ok(fallback(e.to_string()));
            }
        };

        let tokens = reply.response.tokens;
        let parsed = match reply.value {
            Some(value) => value,
            None => {
                tracing::warn!(cycle, kind, "LLM analysis reply was not JSON; using fallback");
                fallback(format!("unparsable response: {}", reply.response.content))
            }
        };
        let record = LlmAnalysisRecord {
            cycle,
            kind: kind.to_string(),
            prompt,
            raw_response: reply.response.content,
            parsed: parsed.clone(),
            model: reply.response.model,
            tokens,
            links,
        };
        self.world_model
            .blocking(move |wm| {
                wm.record_tokens(cycle, TokenKind::Analysis, tokens)?;
                wm.save_llm_analysis(&record)?;
                Ok(())
            })
            .await?;
        Ok(parsed)
    }
}

fn metric_points(results: &[&ExperimentResult]) -> Vec<(String, Metrics)> {
    results
        .iter()
        .filter_map(|r| r.metrics.clone().map(|m| (r.experiment_id.clone(), m)))
        .collect()
}

fn role_links(results: &[&ExperimentResult], role: &str) -> Vec<AnalysisLink> {
    results
        .iter()
        .map(|r| AnalysisLink {
            experiment_id: r.experiment_id.clone(),
            role: role.to_string(),
        })
        .collect()
}

/// (min, max) of psnr, ssim and latency.
fn ranges(points: &[(String, Metrics)]) -> ((f64, f64), (f64, f64), (f64, f64)) {
    let span = |f: fn(&Metrics) -> f64| {
        points.iter().map(|(_, m)| f(m)).fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), v| (lo.min(v), hi.max(v)),
        )
    };
    (span(|m| m.psnr), span(|m| m.ssim), span(|m| m.latency))
}

#[async_trait]
impl EventHandler for AnalysisAgent {
    fn name(&self) -> &str {
        ANALYSIS_SENDER
    }

    async fn handle(&self, event: Event) -> HandlerResult {
        let EventPayload::StateUpdated(update) = event.payload else {
            return Ok(());
        };
        if !update.trigger_analysis {
            return Ok(());
        }

        tracing::info!(
            cycle = update.cycle,
            reason = update.reason.as_deref().unwrap_or(""),
            "Analysis triggered"
        );
        let insight = self.analyze(update.cycle).await?;
        self.bus.publish(Event::new(insight, ANALYSIS_SENDER))?;
        Ok(())
    }
}
