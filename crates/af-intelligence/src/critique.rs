//! Planner → Researcher → Synthesizer → Validator message loop.
//!
//! The validator either accepts a hypothesis (`FINAL`) or sends a `CRITIQUE`
//! back to the researcher. The loop is bounded by
//! [`CritiqueConfig::max_iterations`] validations and ends in
//! [`CritiqueOutcome::Exhausted`] when none passes.

use std::sync::Arc;

use af_core::config::CritiqueConfig;
use af_telemetry::metrics::{names, MetricsCollector};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::research::{Citation, ResearchError, Retriever};
use crate::validator::{ValidationInput, ValidationResult, Validator};

pub const PLANNER: &str = "planner";
pub const RESEARCHER: &str = "researcher";
pub const SYNTHESIZER: &str = "synthesizer";
pub const VALIDATOR: &str = "validator";

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Plan,
    Fact,
    Hypothesis,
    Critique,
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<Citation>>,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<String>>,
}

impl AgentMessage {
    pub fn new(kind: MessageType, from: &str, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            evidence: None,
            from: from.to_string(),
            to: None,
        }
    }

    pub fn to(mut self, recipient: &str) -> Self {
        self.to = Some(vec![recipient.to_string()]);
        self
    }

    pub fn with_evidence(mut self, evidence: Option<Vec<Citation>>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn evidence(&self) -> &[Citation] {
        self.evidence.as_deref().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Errors and outcome
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CritiqueError {
    #[error(transparent)]
    Research(#[from] ResearchError),
    #[error("synthesis failed: {0}")]
    Compose(String),
    #[error("critique loop cancelled during iteration {iteration}")]
    Cancelled { iteration: usize },
}

pub type Result<T> = std::result::Result<T, CritiqueError>;

#[derive(Debug, Clone, PartialEq)]
pub enum CritiqueOutcome {
    /// The validator accepted a hypothesis.
    Final {
        message: AgentMessage,
        iterations: usize,
        transcript: Vec<AgentMessage>,
    },
    /// Every hypothesis within the budget was rejected.
    Exhausted {
        last_hypothesis: AgentMessage,
        last_feedback: String,
        iterations: usize,
        transcript: Vec<AgentMessage>,
    },
}

impl CritiqueOutcome {
    pub fn is_final(&self) -> bool {
        matches!(self, CritiqueOutcome::Final { .. })
    }

    pub fn iterations(&self) -> usize {
        match self {
            CritiqueOutcome::Final { iterations, .. }
            | CritiqueOutcome::Exhausted { iterations, .. } => *iterations,
        }
    }

    pub fn transcript(&self) -> &[AgentMessage] {
        match self {
            CritiqueOutcome::Final { transcript, .. }
            | CritiqueOutcome::Exhausted { transcript, .. } => transcript,
        }
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct Planner;

impl Planner {
    pub fn plan(&self, goal: &str) -> AgentMessage {
        AgentMessage::new(MessageType::Plan, PLANNER, goal.trim()).to(RESEARCHER)
    }
}

pub struct Researcher {
    retriever: Arc<dyn Retriever>,
    top_k: usize,
}

impl Researcher {
    pub fn new(retriever: Arc<dyn Retriever>, top_k: usize) -> Self {
        Self {
            retriever,
            top_k: top_k.max(1),
        }
    }

    /// Handles a `PLAN` or a `CRITIQUE`. Critique feedback is appended to the
    /// retrieval query so the next pass can pull different evidence.
    pub async fn research(&self, goal: &str, incoming: &AgentMessage) -> Result<AgentMessage> {
        let query = match incoming.kind {
            MessageType::Critique => format!("{goal} {}", incoming.content),
            _ => goal.to_string(),
        };
        let documents = self.retriever.retrieve(&query).await?;
        let mut ranked = self.retriever.rank(documents, &query).await?;
        ranked.truncate(self.top_k);
        let citations = self.retriever.build_citations(&ranked);
        debug!(query = %query, citations = citations.len(), "evidence gathered");

        let content = citations
            .iter()
            .map(|c| c.title.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Ok(AgentMessage::new(MessageType::Fact, RESEARCHER, content)
            .with_evidence(Some(citations))
            .to(SYNTHESIZER))
    }
}

/// Turns evidence into hypothesis prose.
#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(&self, goal: &str, evidence: &[Citation]) -> Result<String>;
}

/// Stitches citation snippets together with `[n]` markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveComposer;

#[async_trait]
impl Composer for ExtractiveComposer {
    async fn compose(&self, goal: &str, evidence: &[Citation]) -> Result<String> {
        if evidence.is_empty() {
            return Ok(format!("{goal}: no supporting evidence was found."));
        }
        let body = evidence
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} [{}]", c.snippet.trim(), i + 1))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(format!("{goal}: {body}"))
    }
}

pub struct Synthesizer {
    composer: Arc<dyn Composer>,
}

impl Synthesizer {
    pub fn new(composer: Arc<dyn Composer>) -> Self {
        Self { composer }
    }

    pub async fn synthesize(&self, goal: &str, fact: &AgentMessage) -> Result<AgentMessage> {
        let content = self.composer.compose(goal, fact.evidence()).await?;
        if content.trim().is_empty() {
            return Err(CritiqueError::Compose("composer returned empty text".into()));
        }
        Ok(AgentMessage::new(MessageType::Hypothesis, SYNTHESIZER, content)
            .with_evidence(fact.evidence.clone())
            .to(VALIDATOR))
    }
}

pub struct ValidatorAgent {
    validator: Arc<Validator>,
    strategy: String,
    context_hints: Vec<String>,
}

impl ValidatorAgent {
    pub fn new(validator: Arc<Validator>, strategy: impl Into<String>) -> Self {
        Self {
            validator,
            strategy: strategy.into(),
            context_hints: Vec::new(),
        }
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.context_hints = hints;
        self
    }

    /// `FINAL` carries the hypothesis content and evidence unchanged.
    /// `CRITIQUE` carries the validator feedback back to the researcher.
    pub fn review(&self, goal: &str, hypothesis: &AgentMessage) -> (AgentMessage, ValidationResult) {
        let input = ValidationInput {
            hypothesis: hypothesis.content.clone(),
            citations: hypothesis.evidence().to_vec(),
            goal: goal.to_string(),
            context_hints: self.context_hints.clone(),
            strategy: self.strategy.clone(),
        };
        let result = self.validator.validate(&input);

        let message = if result.passed {
            AgentMessage::new(MessageType::Final, VALIDATOR, hypothesis.content.clone())
                .with_evidence(hypothesis.evidence.clone())
        } else {
            let feedback = result
                .feedback
                .clone()
                .unwrap_or_else(|| "Strengthen citations and align with the goal.".to_string());
            AgentMessage::new(MessageType::Critique, VALIDATOR, feedback).to(RESEARCHER)
        };
        (message, result)
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub struct CritiqueLoop {
    planner: Planner,
    researcher: Researcher,
    synthesizer: Synthesizer,
    validator: ValidatorAgent,
    max_iterations: usize,
    metrics: Arc<MetricsCollector>,
}

impl CritiqueLoop {
    pub fn new(
        researcher: Researcher,
        synthesizer: Synthesizer,
        validator: ValidatorAgent,
        config: &CritiqueConfig,
    ) -> Self {
        Self {
            planner: Planner,
            researcher,
            synthesizer,
            validator,
            max_iterations: config.max_iterations.max(1),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn run(&self, goal: &str, cancel: &CancellationToken) -> Result<CritiqueOutcome> {
        let mut transcript = Vec::new();
        let plan = self.planner.plan(goal);
        transcript.push(plan.clone());

        let mut incoming = plan;
        let mut last_hypothesis = None;
        let mut last_feedback = String::new();

        for iteration in 1..=self.max_iterations {
            let fact = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(iteration)),
                fact = self.researcher.research(goal, &incoming) => fact?,
            };
            transcript.push(fact.clone());

            let hypothesis = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(iteration)),
                hypothesis = self.synthesizer.synthesize(goal, &fact) => hypothesis?,
            };
            transcript.push(hypothesis.clone());

            if cancel.is_cancelled() {
                return Err(self.cancelled(iteration));
            }
            let (verdict, result) = self.validator.review(goal, &hypothesis);
            transcript.push(verdict.clone());

            if verdict.kind == MessageType::Final {
                info!(iteration, score = result.score, "hypothesis accepted");
                self.metrics
                    .increment_counter(names::CRITIQUE_RUNS, &[("outcome", "final")]);
                return Ok(CritiqueOutcome::Final {
                    message: verdict,
                    iterations: iteration,
                    transcript,
                });
            }

            info!(
                iteration,
                score = result.score,
                threshold = result.threshold,
                "hypothesis rejected"
            );
            last_feedback = verdict.content.clone();
            last_hypothesis = Some(hypothesis);
            incoming = verdict;
        }

        warn!(iterations = self.max_iterations, "critique loop did not converge");
        self.metrics
            .increment_counter(names::CRITIQUE_RUNS, &[("outcome", "exhausted")]);
        let last_hypothesis = last_hypothesis.unwrap_or_else(|| {
            AgentMessage::new(MessageType::Hypothesis, SYNTHESIZER, String::new())
        });
        Ok(CritiqueOutcome::Exhausted {
            last_hypothesis,
            last_feedback,
            iterations: self.max_iterations,
            transcript,
        })
    }

    fn cancelled(&self, iteration: usize) -> CritiqueError {
        self.metrics
            .increment_counter(names::CRITIQUE_RUNS, &[("outcome", "cancelled")]);
        CritiqueError::Cancelled { iteration }
    }
}
