//! Capability Provider clients: named data-retrieval tools invoked with
//! parameters and returning structured JSON.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Write-only capability that records decisions; never chosen by dispatch.
pub const LOG_DECISION_CAPABILITY: &str = "log_agent_decision";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("capability '{0}' not found")]
    NotFound(String),
    #[error("capability provider unreachable: {0}")]
    Transport(String),
    #[error("capability provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed capability response: {0}")]
    Malformed(String),
}

/// A decision recorded back to the provider after a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub agent_name: String,
    pub input_question: String,
    pub recommendation: String,
    pub confidence: f64,
    pub evidence: Value,
}

#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn list_capabilities(&self) -> Result<Vec<String>, CapabilityError>;

    async fn invoke(
        &self,
        name: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Value, CapabilityError>;

    async fn log_decision(&self, record: &DecisionRecord) -> Result<(), CapabilityError>;
}

#[derive(Debug, Deserialize)]
struct CapabilityList {
    capabilities: Vec<String>,
}

/// HTTP provider: `GET /capabilities`, `GET /tools/{name}?..`, `POST /log`.
#[derive(Debug, Clone)]
pub struct HttpCapabilityProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCapabilityProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CapabilityError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn read_json(
        response: reqwest::Response,
        name: Option<&str>,
    ) -> Result<Value, CapabilityError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND
            && let Some(name) = name
        {
            return Err(CapabilityError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| CapabilityError::Malformed(e.to_string()))
    }
}

fn transport(err: reqwest::Error) -> CapabilityError {
    CapabilityError::Transport(err.to_string())
}

/// Query-string form of tool parameters: strings as-is, other scalars as JSON text.
fn query_pairs(parameters: &Map<String, Value>) -> Vec<(String, String)> {
    parameters
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

#[async_trait]
impl CapabilityProvider for HttpCapabilityProvider {
    #[instrument(skip_all, fields(base_url = %self.base_url))]
    async fn list_capabilities(&self) -> Result<Vec<String>, CapabilityError> {
        let response = self
            .client
            .get(format!("{}/capabilities", self.base_url))
            .send()
            .await
            .map_err(transport)?;
        let body = Self::read_json(response, None).await?;
        let list: CapabilityList =
            serde_json::from_value(body).map_err(|e| CapabilityError::Malformed(e.to_string()))?;
        debug!(count = list.capabilities.len(), "capabilities listed");
        Ok(list.capabilities)
    }

    #[instrument(skip_all, fields(base_url = %self.base_url, capability = name))]
    async fn invoke(
        &self,
        name: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let response = self
            .client
            .get(format!("{}/tools/{name}", self.base_url))
            .query(&query_pairs(parameters))
            .send()
            .await
            .map_err(transport)?;
        Self::read_json(response, Some(name)).await
    }

    #[instrument(skip_all, fields(base_url = %self.base_url))]
    async fn log_decision(&self, record: &DecisionRecord) -> Result<(), CapabilityError> {
        let response = self
            .client
            .post(format!("{}/log", self.base_url))
            .json(record)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "decision log rejected");
            return Err(CapabilityError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

type Handler = Arc<dyn Fn(&Map<String, Value>) -> Value + Send + Sync>;

/// In-memory provider backed by closures.
#[derive(Clone, Default)]
pub struct StaticCapabilityProvider {
    handlers: BTreeMap<String, Handler>,
    decisions: Arc<Mutex<Vec<DecisionRecord>>>,
}

impl std::fmt::Debug for StaticCapabilityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCapabilityProvider")
            .field("capabilities", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StaticCapabilityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capability<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Value + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Decisions recorded through `log_decision`, oldest first.
    pub fn decisions(&self) -> Vec<DecisionRecord> {
        self.decisions
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CapabilityProvider for StaticCapabilityProvider {
    async fn list_capabilities(&self) -> Result<Vec<String>, CapabilityError> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.push(LOG_DECISION_CAPABILITY.to_string());
        Ok(names)
    }

    async fn invoke(
        &self,
        name: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))?;
        Ok(handler(parameters))
    }

    async fn log_decision(&self, record: &DecisionRecord) -> Result<(), CapabilityError> {
        let mut guard = self
            .decisions
            .lock()
            .map_err(|_| CapabilityError::Transport("decision log poisoned".to_string()))?;
        guard.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use serde_json::json;

    use super::*;

    fn provider(url: &str) -> HttpCapabilityProvider {
        HttpCapabilityProvider::new(url, Duration::from_secs(5)).expect("client")
    }

    #[tokio::test]
    async fn lists_capabilities() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/capabilities")
            .with_status(200)
            .with_body(r#"{"capabilities":["get_pipeline","log_agent_decision"]}"#)
            .create_async()
            .await;

        let names = provider(&server.url())
            .list_capabilities()
            .await
            .expect("list");
        mock.assert_async().await;
        assert_eq!(names, vec!["get_pipeline", "log_agent_decision"]);
    }

    #[tokio::test]
    async fn invokes_with_query_parameters() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/tools/get_pipeline")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("region".into(), "EMEA".into()),
                Matcher::UrlEncoded("limit".into(), "5".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"deals":[{"name":"Acme","value":1000}]}"#)
            .create_async()
            .await;

        let mut params = Map::new();
        params.insert("region".to_string(), json!("EMEA"));
        params.insert("limit".to_string(), json!(5));
        let data = provider(&server.url())
            .invoke("get_pipeline", &params)
            .await
            .expect("invoke");
        mock.assert_async().await;
        assert_eq!(data["deals"][0]["name"], "Acme");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/tools/nope")
            .with_status(404)
            .create_async()
            .await;

        let err = provider(&server.url())
            .invoke("nope", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::NotFound("nope".to_string()));
    }

    #[tokio::test]
    async fn posts_decision_record() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/log")
            .match_body(Matcher::PartialJson(json!({"agent_name": "agentflow"})))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let record = DecisionRecord {
            agent_name: "agentflow".to_string(),
            input_question: "q".to_string(),
            recommendation: "r".to_string(),
            confidence: 0.9,
            evidence: json!({}),
        };
        provider(&server.url())
            .log_decision(&record)
            .await
            .expect("log");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn static_provider_dispatches_to_handlers() {
        let provider = StaticCapabilityProvider::new()
            .with_capability("echo", |params| Value::Object(params.clone()));
        let mut params = Map::new();
        params.insert("a".to_string(), json!(1));
        assert_eq!(
            provider.invoke("echo", &params).await.expect("invoke"),
            json!({"a": 1})
        );
        assert!(matches!(
            provider.invoke("missing", &params).await,
            Err(CapabilityError::NotFound(_))
        ));
        let names = provider.list_capabilities().await.expect("list");
        assert!(names.contains(&LOG_DECISION_CAPABILITY.to_string()));
    }
}
