//! Natural-language tool dispatch over a Capability Provider.
//!
//! A question is translated into one capability call, the capability is
//! invoked, and the returned data is turned into a Markdown recommendation.
//! The decision is then recorded back through the provider on a best-effort
//! basis.

use std::sync::{Arc, LazyLock};

use jsonschema::{Draft, Validator};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::plan::extract_json_payload;
use crate::io::capability::{
    CapabilityError, CapabilityProvider, DecisionRecord, LOG_DECISION_CAPABILITY,
};
use crate::io::generator::{GenerationError, GenerationRequest, Generator};
use crate::io::prompt::PromptBuilder;

const INTENT_SCHEMA: &str = include_str!("../schemas/intent.schema.json");

/// Agent name recorded with logged decisions.
pub const AGENT_NAME: &str = "agentflow";

/// Confidence recorded when the recommendation does not state one.
pub const DEFAULT_CONFIDENCE: f64 = 0.9;

static INTENT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(INTENT_SCHEMA).expect("intent schema is valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("intent schema compiles")
});

static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)confidence[^0-9\n]{0,40}(0(?:\.\d+)?|1(?:\.0+)?)\b").expect("confidence regex")
});

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("capability provider failed: {0}")]
    Capability(#[from] CapabilityError),
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("intent could not be parsed: {0}")]
    Intent(String),
    #[error("capability '{0}' may not be invoked from a question")]
    Refused(String),
    #[error("prompt could not be rendered: {0}")]
    Prompt(#[from] minijinja::Error),
}

/// The capability call chosen for a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub question: String,
    pub intent: Intent,
    pub data: Value,
    pub recommendation: String,
    pub confidence: f64,
    pub decision_logged: bool,
}

/// Parse generator output into an [`Intent`] (bare or fenced JSON).
pub fn parse_intent(raw: &str) -> Result<Intent, DispatchError> {
    let payload = extract_json_payload(raw);
    let value: Value =
        serde_json::from_str(payload).map_err(|err| DispatchError::Intent(err.to_string()))?;
    let errors: Vec<String> = INTENT_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(DispatchError::Intent(errors.join("; ")));
    }
    let mut intent: Intent =
        serde_json::from_value(value).map_err(|err| DispatchError::Intent(err.to_string()))?;
    intent.tool_name = intent.tool_name.trim().to_string();
    Ok(intent)
}

/// Confidence score stated in a recommendation, if any.
pub fn parse_confidence(text: &str) -> Option<f64> {
    CONFIDENCE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|value| (0.0..=1.0).contains(value))
}

#[derive(Clone)]
pub struct ToolDispatcher {
    provider: Arc<dyn CapabilityProvider>,
    generator: Arc<dyn Generator>,
    prompts: PromptBuilder,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("prompts", &self.prompts)
            .finish_non_exhaustive()
    }
}

impl ToolDispatcher {
    pub fn new(
        provider: Arc<dyn CapabilityProvider>,
        generator: Arc<dyn Generator>,
        prompts: PromptBuilder,
    ) -> Self {
        Self {
            provider,
            generator,
            prompts,
        }
    }

    #[instrument(skip_all)]
    pub async fn ask(&self, question: &str) -> Result<DispatchOutcome, DispatchError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(DispatchError::EmptyQuestion);
        }

        let tools: Vec<String> = self
            .provider
            .list_capabilities()
            .await?
            .into_iter()
            .filter(|name| name != LOG_DECISION_CAPABILITY)
            .collect();

        let intent_text = self
            .generator
            .generate(&GenerationRequest {
                label: "intent".to_string(),
                prompt: self.prompts.intent(question, &tools)?,
                temperature: 0.0,
                expect_json: true,
            })
            .await?;
        let intent = parse_intent(&intent_text)?;
        if intent.tool_name == LOG_DECISION_CAPABILITY {
            warn!(tool = %intent.tool_name, "refusing write-only capability");
            return Err(DispatchError::Refused(intent.tool_name));
        }
        info!(tool = %intent.tool_name, "invoking capability");

        let data = self
            .provider
            .invoke(&intent.tool_name, &intent.parameters)
            .await?;
        let rendered_data =
            serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string());

        let recommendation = self
            .generator
            .generate(&GenerationRequest {
                label: "recommendation".to_string(),
                prompt: self
                    .prompts
                    .recommendation(question, &rendered_data, &intent.explanation)?,
                temperature: 0.0,
                expect_json: false,
            })
            .await?;
        let confidence = parse_confidence(&recommendation).unwrap_or(DEFAULT_CONFIDENCE);

        let record = DecisionRecord {
            agent_name: AGENT_NAME.to_string(),
            input_question: question.to_string(),
            recommendation: recommendation.clone(),
            confidence,
            evidence: data.clone(),
        };
        let decision_logged = match self.provider.log_decision(&record).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "failed to record decision");
                false
            }
        };

        Ok(DispatchOutcome {
            question: question.to_string(),
            intent,
            data,
            recommendation,
            confidence,
            decision_logged,
        })
    }
}
