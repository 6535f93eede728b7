//! Reviewer - accepts or rejects proposed batches
//!
//! Rule checks run first (design-space membership, duplicates within the batch,
//! duplicates against history, batch budget). An optional LLM critique may
//! then remove further items; it can never add or modify one. If the critique
//! fails the rule verdict stands.

use std::collections::{BTreeMap, HashMap, HashSet};

use shared_types::{DesignSpace, ExperimentConfig, PlanRequested};

use crate::llm::{chat_json, SharedBackend};
use crate::world_model::{AnalysisLink, LlmAnalysisRecord, TokenKind, WorldModel, WorldModelError};

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewVerdict {
    Approved(Vec<ExperimentConfig>),
    /// Every item was rejected; `critique` maps experiment id to reason
    Rejected {
        feedback: String,
        critique: BTreeMap<String, String>,
    },
}

/// Items that pass the rules, plus a reason for each item that did not.
pub fn check_rules(
    plan: Vec<ExperimentConfig>,
    space: &DesignSpace,
    budget: usize,
    history: &HashSet<String>,
) -> (Vec<ExperimentConfig>, BTreeMap<String, String>) {
    let mut accepted = Vec::new();
    let mut critique = BTreeMap::new();
    let mut in_plan: HashMap<String, String> = HashMap::new();

    for config in plan {
        let id = config.experiment_id.clone();
        let violations = space.violations(&config);
        if !violations.is_empty() {
            critique.insert(id, format!("outside design space: {}", violations.join("; ")));
            continue;
        }
        let fingerprint = config.fingerprint();
        if let Some(first) = in_plan.get(&fingerprint) {
            critique.insert(id, format!("duplicate of {first} in the same plan"));
            continue;
        }
        if history.contains(&fingerprint) {
            critique.insert(id, "duplicate of a persisted experiment".to_string());
            continue;
        }
        if accepted.len() >= budget {
            critique.insert(id, format!("exceeds plan budget of {budget}"));
            continue;
        }
        in_plan.insert(fingerprint, id);
        accepted.push(config);
    }
    (accepted, critique)
}

pub struct Reviewer {
    world_model: WorldModel,
    llm: SharedBackend,
    use_llm: bool,
}

impl Reviewer {
    pub fn new(world_model: WorldModel, llm: SharedBackend, use_llm: bool) -> Self {
        Self {
            world_model,
            llm,
            use_llm,
        }
    }

    pub async fn review(
        &self,
        plan: Vec<ExperimentConfig>,
        request: &PlanRequested,
    ) -> Result<ReviewVerdict, WorldModelError> {
        let proposed = plan.len();
        let history: HashSet<String> = self
            .world_model
            .blocking(|wm| wm.get_all_experiments())
            .await?
            .iter()
            .map(|r| r.config.fingerprint())
            .collect();

        let (mut accepted, mut critique) =
            check_rules(plan, &request.design_space, request.budget, &history);

        if self.use_llm && !accepted.is_empty() {
            for (id, reason) in self.critique(&accepted, request.cycle).await? {
                if accepted.iter().any(|c| c.experiment_id == id) {
                    accepted.retain(|c| c.experiment_id != id);
                    critique.insert(id, format!("reviewer critique: {reason}"));
                }
            }
        }

        tracing::info!(
            cycle = request.cycle,
            proposed,
            approved = accepted.len(),
            rejected = critique.len(),
            "Plan reviewed"
        );
        for (id, reason) in &critique {
            tracing::debug!(cycle = request.cycle, experiment_id = %id, reason = %reason, "Item rejected");
        }

        if accepted.is_empty() {
            return Ok(ReviewVerdict::Rejected {
                feedback: format!("all {proposed} proposed configurations were rejected"),
                critique,
            });
        }
        Ok(ReviewVerdict::Approved(accepted))
    }

    /// `(experiment_id, reason)` pairs the LLM wants removed. Empty on failure.
    async fn critique(
        &self,
        plan: &[ExperimentConfig],
        cycle: u32,
    ) -> Result<Vec<(String, String)>, WorldModelError> {
        let listing = plan
            .iter()
            .map(|c| format!("- {}: {}", c.experiment_id, c.short_label()))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Review this batch of experiment configurations before it is executed.\n\n\
             {listing}\n\n\
             Reject only configurations that are clearly wasteful or redundant with another item.\n\n\
             Return JSON: {{\"reject\": [{{\"experiment_id\": \"...\", \"reason\": \"...\"}}]}}"
        );

        let reply = match chat_json(self.llm.as_ref(), "You are a rigorous experiment reviewer", &prompt).await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(cycle, error = %e, "LLM review unavailable; keeping rule verdict");
                return Ok(Vec::new());
            }
        };

        let parsed = reply.value.clone().unwrap_or(serde_json::Value::Null);
        let removals: Vec<(String, String)> = parsed
            .get("reject")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let id = item.get("experiment_id")?.as_str()?.to_string();
                        let reason = item
                            .get("reason")
                            .and_then(|r| r.as_str())
                            .unwrap_or("no reason given")
                            .to_string();
                        Some((id, reason))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let tokens = reply.response.tokens;
        let record = LlmAnalysisRecord {
            cycle,
            kind: "plan_review".to_string(),
            prompt,
            raw_response: reply.response.content,
            parsed,
            model: reply.response.model,
            tokens,
            links: plan
                .iter()
                .map(|c| AnalysisLink {
                    experiment_id: c.experiment_id.clone(),
                    role: "reviewed".to_string(),
                })
                .collect(),
        };
        self.world_model
            .blocking(move |wm| {
                wm.record_tokens(cycle, TokenKind::Plan, tokens)?;
                wm.save_llm_analysis(&record)?;
                Ok(())
            })
            .await?;

        Ok(removals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::llm::{LlmError, OfflineBackend};
    use crate::test_support::{config_with, metrics, result_ok, ScriptedBackend};
    use crate::world_model::NarrativeThresholds;

    fn request(budget: usize) -> PlanRequested {
        PlanRequested {
            budget,
            design_space: DesignSpace::default(),
            cycle: 2,
        }
    }

    fn store() -> WorldModel {
        WorldModel::open(":memory:", NarrativeThresholds::default()).unwrap()
    }

    #[test]
    fn test_rules_flag_each_problem() {
        let space = DesignSpace::default();
        let history = HashSet::from([config_with("old", 24, 9).fingerprint()]);
        let plan = vec![
            config_with("ok", 8, 5),
            config_with("outside", 99, 5),
            config_with("twin", 8, 5),
            config_with("seen", 24, 9),
            config_with("ok2", 16, 7),
            config_with("over", 16, 9),
        ];

        let (accepted, critique) = check_rules(plan, &space, 2, &history);

        let ids: Vec<&str> = accepted.iter().map(|c| c.experiment_id.as_str()).collect();
        assert_eq!(ids, vec!["ok", "ok2"]);
        assert!(critique["outside"].starts_with("outside design space"));
        assert_eq!(critique["twin"], "duplicate of ok in the same plan");
        assert_eq!(critique["seen"], "duplicate of a persisted experiment");
        assert_eq!(critique["over"], "exceeds plan budget of 2");
    }

    #[tokio::test]
    async fn test_all_rejected_yields_rejection_with_critique() {
        let world_model = store();
        world_model
            .save_experiment(&result_ok(config_with("old", 8, 5), 0, metrics(30.0, 0.9, 40.0)))
            .unwrap();
        let reviewer = Reviewer::new(world_model, Arc::new(OfflineBackend), true);

        let verdict = reviewer
            .review(vec![config_with("again", 8, 5)], &request(3))
            .await
            .unwrap();

        match verdict {
            ReviewVerdict::Rejected { feedback, critique } => {
                assert_eq!(feedback, "all 1 proposed configurations were rejected");
                assert!(critique.contains_key("again"));
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_llm_critique_can_only_remove_items() {
        let reply = r#"{"reject": [
            {"experiment_id": "b", "reason": "redundant with a"},
            {"experiment_id": "unknown", "reason": "not in plan"}
        ]}"#;
        let world_model = store();
        let llm = Arc::new(ScriptedBackend::new(vec![Ok(reply.to_string())]));
        let reviewer = Reviewer::new(world_model.clone(), llm.clone(), true);

        let verdict = reviewer
            .review(vec![config_with("a", 8, 5), config_with("b", 16, 5)], &request(3))
            .await
            .unwrap();

        match verdict {
            ReviewVerdict::Approved(configs) => {
                assert_eq!(configs.len(), 1);
                assert_eq!(configs[0].experiment_id, "a");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
        assert_eq!(world_model.plan_tokens(2).unwrap().plan, 10);

        // One critique call listing every planned item
        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("- a: "));
        assert!(prompts[0].contains("- b: "));
    }

    #[tokio::test]
    async fn test_llm_failure_keeps_rule_verdict() {
        let reviewer = Reviewer::new(
            store(),
            Arc::new(ScriptedBackend::new(vec![Err(LlmError::Timeout(60))])),
            true,
        );
        let verdict = reviewer
            .review(vec![config_with("a", 8, 5), config_with("b", 16, 5)], &request(3))
            .await
            .unwrap();
        assert!(matches!(verdict, ReviewVerdict::Approved(ref c) if c.len() == 2));
    }
}
