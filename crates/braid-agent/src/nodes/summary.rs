use std::sync::Arc;

use tracing::{info, warn};

use braid_core::config::{ModelConfig, SummaryConfig, SummaryStrategy};
use braid_core::error::{BraidError, Result};
use braid_core::traits::LlmClient;
use braid_core::types::{Role, SessionState, Turn};

use super::llm::call_model;
use crate::graph::NodeContext;
use crate::state::{Delta, StateSnapshot};
use crate::tokens::estimate_history_tokens;

/// Scratch key holding the text of the latest summary.
pub const SUMMARY_KEY: &str = "summary";

const CREATE_PROMPT: &str = "Create a summary of the conversation above:";

/// Folds the oldest turns into a single summary turn once the history
/// grows past the configured turn or token budget.
///
/// Below the thresholds the node returns an empty delta, so nothing is
/// applied and the version stays put.
pub struct SummaryNode {
    config: SummaryConfig,
    model: Option<(Arc<dyn LlmClient>, ModelConfig)>,
}

impl SummaryNode {
    /// A summary node that condenses locally, without a model.
    pub fn heuristic(config: SummaryConfig) -> Self {
        Self {
            config,
            model: None,
        }
    }

    /// A summary node that asks `llm` for the summary when the configured
    /// strategy is `model`, falling back to the local heuristic on failure.
    pub fn with_model(config: SummaryConfig, llm: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self {
            config,
            model: Some((llm, model)),
        }
    }

    pub fn config(&self) -> &SummaryConfig {
        &self.config
    }

    pub fn needs_compaction(&self, state: &SessionState) -> bool {
        if !self.config.enabled {
            return false;
        }
        if state.turns.len() > self.config.max_turns {
            return true;
        }
        self.config.max_context_tokens > 0
            && estimate_history_tokens(&state.turns) > self.config.max_context_tokens
    }

    /// Number of leading turns to fold, or `None` when there is nothing to fold.
    ///
    /// The newest `keep_recent` turns and the latest user turn stay verbatim,
    /// and the boundary never separates tool results from their call.
    pub fn boundary(&self, state: &SessionState) -> Option<usize> {
        let turns = &state.turns;
        let mut through = turns.len().saturating_sub(self.config.keep_recent);
        if let Some(last_user) = state.last_user_index() {
            through = through.min(last_user);
        }
        while through > 0 && turns.get(through).is_some_and(|t| t.role == Role::Tool) {
            through -= 1;
        }
        match through {
            0 => None,
            1 if turns[0].summary => None,
            n => Some(n),
        }
    }

    pub async fn invoke(&self, ctx: &NodeContext, state: StateSnapshot) -> Result<Delta> {
        if !self.needs_compaction(&state) {
            return Ok(Delta::against(&state));
        }
        let Some(through) = self.boundary(&state) else {
            return Ok(Delta::against(&state));
        };

        let folded = &state.turns[..through];
        let (prior, fresh) = match folded.split_first() {
            Some((first, rest)) if first.summary => (Some(first.content.as_str()), rest),
            _ => (None, folded),
        };

        let text = match (&self.model, self.config.strategy) {
            (Some((llm, model)), SummaryStrategy::Model) => {
                match self.model_summary(ctx, &**llm, model, prior, fresh).await {
                    Ok(text) if !text.trim().is_empty() => text,
                    Ok(_) => {
                        warn!(node = %ctx.node, "Model returned an empty summary, condensing locally");
                        self.heuristic_summary(ctx, prior, fresh, 0)
                    }
                    Err(BraidError::Cancelled) => return Err(BraidError::Cancelled),
                    Err(e) => {
                        warn!(node = %ctx.node, error = %e, "Model summary failed, condensing locally");
                        self.heuristic_summary(ctx, prior, fresh, 0)
                    }
                }
            }
            _ => self.heuristic_summary(ctx, prior, fresh, self.config.max_chars_per_turn),
        };
        let text = text.trim().to_string();

        info!(
            session_id = %ctx.session_id,
            node = %ctx.node,
            compacted = through,
            remaining = state.turns.len() - through,
            "Compacting history"
        );

        Ok(Delta::against(&state)
            .compact(through, Turn::summary(text.clone()))
            .set_scratch(SUMMARY_KEY, serde_json::Value::String(text)))
    }

    async fn model_summary(
        &self,
        ctx: &NodeContext,
        llm: &dyn LlmClient,
        model: &ModelConfig,
        prior: Option<&str>,
        fresh: &[Turn],
    ) -> Result<String> {
        let mut request: Vec<Turn> = fresh.iter().map(flatten_for_summary).collect();
        let prompt = match prior {
            Some(summary) => format!(
                "This is a summary of the conversation to date: {}\n\n\
                 Extend the summary by taking into account the new messages above:",
                summary
            ),
            None => CREATE_PROMPT.to_string(),
        };
        request.push(Turn::user(prompt));

        let reply = call_model(ctx, llm, model, request, &[], false).await?;
        Ok(reply.text)
    }

    /// Fold turns into labelled lines. `max_chars` of 0 keeps every turn whole;
    /// the fallback after a failed model summary always does.
    fn heuristic_summary(
        &self,
        ctx: &NodeContext,
        prior: Option<&str>,
        fresh: &[Turn],
        max_chars: usize,
    ) -> String {
        let mut out = String::new();
        if let Some(summary) = prior {
            out.push_str(summary.trim());
            out.push('\n');
        }
        let mut shortened = 0;
        for turn in fresh {
            let flat = flatten_for_summary(turn);
            let label = match (turn.role, turn.tool_name.as_deref()) {
                (Role::Tool, Some(name)) => format!("tool {}", name),
                (role, _) => role.as_str().to_string(),
            };
            let (content, cut) = truncate(&flat.content, max_chars);
            if cut {
                shortened += 1;
            }
            out.push_str(&format!("{}: {}\n", label, content));
        }
        if shortened > 0 {
            warn!(
                session_id = %ctx.session_id,
                node = %ctx.node,
                shortened,
                max_chars,
                "Summary truncated long turns; their tails are dropped from history"
            );
        }
        out
    }
}

/// A plain-text rendering of a turn, so tool traffic survives summarization
/// without carrying call metadata into the request.
fn flatten_for_summary(turn: &Turn) -> Turn {
    match turn.role {
        Role::Tool => Turn::assistant(format!(
            "[{} result] {}",
            turn.tool_name.as_deref().unwrap_or("tool"),
            turn.content
        )),
        Role::Assistant if !turn.tool_calls.is_empty() => {
            let names: Vec<&str> = turn.tool_calls.iter().map(|c| c.name.as_str()).collect();
            let calls = format!("[called {}]", names.join(", "));
            if turn.content.trim().is_empty() {
                Turn::assistant(calls)
            } else {
                Turn::assistant(format!("{} {}", turn.content.trim(), calls))
            }
        }
        _ => {
            let mut flat = turn.clone();
            flat.tool_calls.clear();
            flat
        }
    }
}

/// Cut `text` to `max_chars`, reporting whether anything was dropped.
fn truncate(text: &str, max_chars: usize) -> (String, bool) {
    let text = text.trim();
    if max_chars == 0 || text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let cut: String = text.chars().take(max_chars).collect();
    (format!("{}...", cut), true)
}
