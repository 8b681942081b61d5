//! Prompt builder for stage and dispatch generation requests.

use std::sync::LazyLock;

use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::classifier::APPROVAL_MARKER;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const RESEARCHER_TEMPLATE: &str = include_str!("prompts/researcher.md");
const EXECUTOR_TEMPLATE: &str = include_str!("prompts/executor.md");
const VALIDATOR_TEMPLATE: &str = include_str!("prompts/validator.md");
const INTENT_TEMPLATE: &str = include_str!("prompts/intent.md");
const RECOMMENDATION_TEMPLATE: &str = include_str!("prompts/recommendation.md");

const TRUNCATION_NOTICE: &str = "\n[truncated]";

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    for (name, source) in [
        ("planner", PLANNER_TEMPLATE),
        ("researcher", RESEARCHER_TEMPLATE),
        ("executor", EXECUTOR_TEMPLATE),
        ("validator", VALIDATOR_TEMPLATE),
        ("intent", INTENT_TEMPLATE),
        ("recommendation", RECOMMENDATION_TEMPLATE),
    ] {
        env.add_template(name, source)
            .expect("bundled prompt template should be valid");
    }
    env
});

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex")
});

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Drop droppable sections (first to last) until the prompt fits, then cut
/// the longest remaining section.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    while total_len(sections) > budget {
        let Some(idx) = sections.iter().position(|s| !s.required) else {
            break;
        };
        let dropped = sections.remove(idx);
        debug!(
            section = dropped.key,
            bytes_dropped = dropped.content.len(),
            "dropped section for budget"
        );
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(longest) = sections.iter_mut().max_by_key(|s| s.content.len()) else {
        return;
    };
    let before_len = longest.content.len();
    let allowed = before_len.saturating_sub(total - budget);
    if allowed > TRUNCATION_NOTICE.len() {
        let cut = floor_char_boundary(&longest.content, allowed - TRUNCATION_NOTICE.len());
        longest.content.truncate(cut);
        longest.content.push_str(TRUNCATION_NOTICE);
    } else {
        let cut = floor_char_boundary(&longest.content, allowed);
        longest.content.truncate(cut);
    }
    debug!(
        section = longest.key,
        before_len,
        after_len = longest.content.len(),
        "truncated section for budget"
    );
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut idx = index;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn planner(&self, goal: &str) -> Result<String, minijinja::Error> {
        self.build("planner", context! { goal => goal.trim() })
    }

    pub fn researcher(&self, goal: &str, plan: &[String]) -> Result<String, minijinja::Error> {
        self.build(
            "researcher",
            context! { goal => goal.trim(), plan => plan },
        )
    }

    pub fn executor(
        &self,
        goal: &str,
        plan: &[String],
        research_notes: &str,
    ) -> Result<String, minijinja::Error> {
        self.build(
            "executor",
            context! {
                goal => goal.trim(),
                plan => plan,
                research_notes => research_notes.trim(),
            },
        )
    }

    pub fn validator(
        &self,
        goal: &str,
        draft_output: &str,
        retry_count: u32,
        max_retries: u32,
    ) -> Result<String, minijinja::Error> {
        self.build(
            "validator",
            context! {
                goal => goal.trim(),
                draft_output => draft_output.trim(),
                retry_count => retry_count,
                max_retries => max_retries,
                approval_marker => APPROVAL_MARKER,
            },
        )
    }

    pub fn intent(&self, question: &str, tools: &[String]) -> Result<String, minijinja::Error> {
        self.build(
            "intent",
            context! { question => question.trim(), tools => tools },
        )
    }

    pub fn recommendation(
        &self,
        question: &str,
        data: &str,
        explanation: &str,
    ) -> Result<String, minijinja::Error> {
        self.build(
            "recommendation",
            context! {
                question => question.trim(),
                data => data,
                explanation => Some(explanation.trim()).filter(|s| !s.is_empty()),
            },
        )
    }

    fn build(&self, template: &str, ctx: minijinja::Value) -> Result<String, minijinja::Error> {
        let rendered = ENGINE.get_template(template)?.render(ctx)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Vec<String> {
        vec![
            "Survey customers".to_string(),
            "Design tiers".to_string(),
            "Price rewards".to_string(),
        ]
    }

    #[test]
    fn executor_sections_are_ordered() {
        let prompt = PromptBuilder::new(10_000)
            .executor("Design a loyalty program", &plan(), "customers like points")
            .expect("render");

        let contract = prompt.find("### Executor Contract").expect("contract");
        let goal = prompt.find("### Goal").expect("goal");
        let plan_pos = prompt.find("### Plan").expect("plan");
        let research = prompt.find("### Research Findings").expect("research");
        assert!(contract < goal);
        assert!(goal < plan_pos);
        assert!(plan_pos < research);
        assert!(prompt.contains("Survey customers, Design tiers, Price rewards"));
        assert!(!prompt.contains("section:"), "markers are stripped");
    }

    #[test]
    fn validator_prompt_names_markers_and_retry_budget() {
        let prompt = PromptBuilder::new(10_000)
            .validator("goal", "draft", 2, 3)
            .expect("render");
        assert!(prompt.contains("start your response with APPROVED."));
        assert!(prompt.contains("FEEDBACK:"));
        assert!(prompt.contains("Max retries allowed is 3. Current retry count: 2."));
        assert!(prompt.contains("<draft>\ndraft\n</draft>"));
    }

    #[test]
    fn oversized_research_is_truncated_not_dropped() {
        let notes = "é".repeat(5_000);
        let prompt = PromptBuilder::new(2_000)
            .executor("goal", &plan(), &notes)
            .expect("render");
        assert!(prompt.len() <= 2_000 + "\n\n".len() * 3);
        assert!(prompt.contains("### Research Findings"));
        assert!(prompt.contains("[truncated]"));
        assert!(prompt.contains("### Goal"));
    }

    #[test]
    fn droppable_sections_go_first() {
        let prompt = PromptBuilder::new(10_000)
            .recommendation("q", "{}", "picked the pipeline tool")
            .expect("render");
        assert!(prompt.contains("### Data Selection Reasoning"));

        let data = "x".repeat(600);
        let tight = PromptBuilder::new(700)
            .recommendation("q", &data, &"because ".repeat(40))
            .expect("render");
        assert!(!tight.contains("### Data Selection Reasoning"));
        assert!(tight.contains("### Tool Data"));
    }

    #[test]
    fn empty_explanation_omits_reasoning() {
        let prompt = PromptBuilder::new(10_000)
            .recommendation("q", "{}", "  ")
            .expect("render");
        assert!(!prompt.contains("Data Selection Reasoning"));
    }
}
