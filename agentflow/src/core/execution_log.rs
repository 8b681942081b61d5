//! Append-only record of stage executions for reporting surfaces.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::state_update::StateDelta;
use crate::core::types::{StageName, StateField};

/// Marker appended to display values cut to the log limit.
pub const TRUNCATION_MARKER: &str = "...";

/// Default display limit, in characters, for long text fields.
pub const DEFAULT_DISPLAY_CHARS: usize = 200;

/// One stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// 1-indexed position in the log.
    pub seq: u32,
    /// 1-indexed Planner..Validator cycle this entry belongs to.
    pub cycle: u32,
    pub stage: StageName,
    /// Only the fields the stage produced.
    pub state_delta: BTreeMap<StateField, Value>,
    /// Fields whose display value was shortened.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncated: Vec<StateField>,
}

/// Ordered, append-only execution log owned by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
    display_chars: usize,
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new(DEFAULT_DISPLAY_CHARS)
    }
}

impl ExecutionLog {
    pub fn new(display_chars: usize) -> Self {
        Self {
            entries: Vec::new(),
            display_chars,
        }
    }

    /// Record `delta` as the next entry and return it.
    ///
    /// Long text values are shortened in the log copy only; the delta itself is
    /// not modified.
    pub fn append(&mut self, delta: &StateDelta, cycle: u32) -> &LogEntry {
        let mut state_delta = delta.to_fields();
        let mut truncated = Vec::new();
        for (field, value) in &mut state_delta {
            if truncate_for_display(*field, value, self.display_chars) {
                truncated.push(*field);
            }
        }
        let seq = u32::try_from(self.entries.len()).unwrap_or(u32::MAX).saturating_add(1);
        self.entries.push(LogEntry {
            seq,
            cycle,
            stage: delta.stage(),
            state_delta,
            truncated,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

/// Shorten long text fields in place. Returns true if anything was cut.
fn truncate_for_display(field: StateField, value: &mut Value, limit: usize) -> bool {
    match field {
        StateField::ResearchNotes | StateField::DraftOutput => truncate_string(value, limit),
        StateField::ValidationFeedback => value
            .get_mut("text")
            .is_some_and(|text| truncate_string(text, limit)),
        _ => false,
    }
}

fn truncate_string(value: &mut Value, limit: usize) -> bool {
    let Value::String(text) = value else {
        return false;
    };
    if text.chars().count() <= limit {
        return false;
    }
    let mut shortened: String = text.chars().take(limit).collect();
    shortened.push_str(TRUNCATION_MARKER);
    *text = shortened;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ValidationFeedback, Verdict};

    #[test]
    fn entries_are_numbered_in_append_order() {
        let mut log = ExecutionLog::default();
        log.append(
            &StateDelta::Planner {
                plan: vec!["a".to_string()],
                current_step: 0,
            },
            1,
        );
        log.append(
            &StateDelta::Researcher {
                research_notes: "notes".to_string(),
            },
            1,
        );

        let stages: Vec<(u32, StageName)> =
            log.entries().iter().map(|e| (e.seq, e.stage)).collect();
        assert_eq!(
            stages,
            vec![(1, StageName::Planner), (2, StageName::Researcher)]
        );
    }

    #[test]
    fn long_text_is_truncated_and_marked() {
        let mut log = ExecutionLog::new(10);
        let draft = "x".repeat(25);
        let entry = log
            .append(
                &StateDelta::Executor {
                    draft_output: draft.clone(),
                },
                1,
            )
            .clone();

        let shown = entry.state_delta[&StateField::DraftOutput]
            .as_str()
            .expect("string");
        assert_eq!(shown, format!("{}{}", "x".repeat(10), TRUNCATION_MARKER));
        assert_eq!(entry.truncated, vec![StateField::DraftOutput]);
    }

    #[test]
    fn feedback_text_is_truncated_but_verdict_kept() {
        let mut log = ExecutionLog::new(5);
        let entry = log
            .append(
                &StateDelta::Validator {
                    validation_feedback: ValidationFeedback {
                        verdict: Verdict::Feedback,
                        text: "FEEDBACK: too short".to_string(),
                    },
                    retry_count: 1,
                },
                1,
            )
            .clone();

        let feedback = &entry.state_delta[&StateField::ValidationFeedback];
        assert_eq!(feedback["verdict"], "feedback");
        assert_eq!(feedback["text"], "FEEDB...");
        assert_eq!(entry.state_delta[&StateField::RetryCount], 1);
    }

    #[test]
    fn plan_and_short_text_are_untouched() {
        let mut log = ExecutionLog::new(5);
        let entry = log
            .append(
                &StateDelta::Planner {
                    plan: vec!["a long plan step".to_string()],
                    current_step: 0,
                },
                2,
            )
            .clone();
        assert!(entry.truncated.is_empty());
        assert_eq!(entry.cycle, 2);
        assert_eq!(
            entry.state_delta[&StateField::Plan],
            serde_json::json!(["a long plan step"])
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut log = ExecutionLog::new(3);
        let entry = log
            .append(
                &StateDelta::Researcher {
                    research_notes: "ééééé".to_string(),
                },
                1,
            )
            .clone();
        assert_eq!(entry.state_delta[&StateField::ResearchNotes], "ééé...");
    }

    #[test]
    fn entry_serializes_delta_keys_by_field_name() {
        let mut log = ExecutionLog::default();
        let entry = log
            .append(
                &StateDelta::Researcher {
                    research_notes: "n".to_string(),
                },
                1,
            )
            .clone();
        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json["stage"], "researcher");
        assert_eq!(json["state_delta"]["research_notes"], "n");
        assert!(json.get("truncated").is_none());
    }
}
