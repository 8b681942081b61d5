//! Test-only helpers: a scripted generation backend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::io::generator::{GenerationError, GenerationRequest, Generator};

type Reply = Result<String, GenerationError>;

#[derive(Debug, Default)]
struct Script {
    queued: HashMap<String, VecDeque<Reply>>,
    fallback: HashMap<String, Reply>,
    delays: HashMap<String, Duration>,
    calls: Vec<GenerationRequest>,
}

/// Generator that replies from per-label scripts.
///
/// Queued replies are consumed first; afterwards the label's `always` reply
/// is repeated. A label with neither fails with `GenerationError::Empty`.
/// Every request is recorded.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    script: Arc<Mutex<Script>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one reply for `label`.
    pub fn then(self, label: &str, text: &str) -> Self {
        self.push(label, Ok(text.to_string()))
    }

    /// Queue one failure for `label`.
    pub fn then_fail(self, label: &str, err: GenerationError) -> Self {
        self.push(label, Err(err))
    }

    /// Reply with `text` whenever `label` has nothing queued.
    pub fn always(self, label: &str, text: &str) -> Self {
        self.lock()
            .fallback
            .insert(label.to_string(), Ok(text.to_string()));
        self
    }

    /// Fail whenever `label` has nothing queued.
    pub fn always_fail(self, label: &str, err: GenerationError) -> Self {
        self.lock().fallback.insert(label.to_string(), Err(err));
        self
    }

    /// Sleep before replying to `label`.
    pub fn with_delay(self, label: &str, delay: Duration) -> Self {
        self.lock().delays.insert(label.to_string(), delay);
        self
    }

    /// All requests received so far, oldest first.
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, label: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.label == label)
            .count()
    }

    fn push(self, label: &str, reply: Reply) -> Self {
        self.lock()
            .queued
            .entry(label.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("script lock")
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let (reply, delay) = {
            let mut script = self.lock();
            script.calls.push(request.clone());
            let queued = script
                .queued
                .get_mut(&request.label)
                .and_then(VecDeque::pop_front);
            let reply = queued
                .or_else(|| script.fallback.get(&request.label).cloned())
                .unwrap_or_else(|| {
                    Err(GenerationError::Empty(format!(
                        "no scripted reply for '{}'",
                        request.label
                    )))
                });
            (reply, script.delays.get(&request.label).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}
