use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use data_model::{ExecutionId, FunctionId, ResourceSpec};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub execution_id: ExecutionId,
    pub function_id: FunctionId,
    pub code_url: String,
    /// Envelope the handler must stay within for this call.
    #[serde(default)]
    pub resources: ResourceSpec,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub logs: String,
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invocation timed out")]
    Timeout,
}

/// How the dispatcher talks to a leased instance. `timeout` bounds the whole
/// exchange; crossing it must come back as [`InvokeError::Timeout`] so the
/// caller can tell a hung handler from an unreachable instance.
#[async_trait]
pub trait InstanceClient: Send + Sync + 'static {
    async fn invoke(
        &self,
        endpoint: &str,
        request: InvokeRequest,
        timeout: Duration,
    ) -> Result<InvokeResponse, InvokeError>;
}

/// POSTs invocations to the instance's `/invoke` endpoint.
pub struct HttpInstanceClient {
    client: reqwest::Client,
}

impl HttpInstanceClient {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
        })
    }
}

#[async_trait]
impl InstanceClient for HttpInstanceClient {
    async fn invoke(
        &self,
        endpoint: &str,
        request: InvokeRequest,
        timeout: Duration,
    ) -> Result<InvokeResponse, InvokeError> {
        let response = self
            .client
            .post(format!("{endpoint}/invoke"))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(InvokeError::Transport(format!(
                "instance answered {}",
                response.status()
            )));
        }
        response.json::<InvokeResponse>().await.map_err(classify)
    }
}

fn classify(err: reqwest::Error) -> InvokeError {
    if err.is_timeout() {
        InvokeError::Timeout
    } else {
        InvokeError::Transport(err.to_string())
    }
}

/// Succeeds every invocation with its own input as output. Backs local
/// development against the memory driver, where there is no process to call.
pub struct EchoClient;

#[async_trait]
impl InstanceClient for EchoClient {
    async fn invoke(
        &self,
        _endpoint: &str,
        request: InvokeRequest,
        _timeout: Duration,
    ) -> Result<InvokeResponse, InvokeError> {
        Ok(InvokeResponse {
            success: true,
            output: request.input,
            logs: String::new(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum StubResult {
    Success(serde_json::Value),
    FunctionError(String),
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct StubCall {
    pub delay: Duration,
    pub result: StubResult,
}

impl StubCall {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            delay: Duration::ZERO,
            result: StubResult::Success(output),
        }
    }

    pub fn function_error(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            result: StubResult::FunctionError(message.to_string()),
        }
    }

    pub fn transport(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            result: StubResult::Transport(message.to_string()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub function_id: FunctionId,
    pub execution_id: ExecutionId,
    pub endpoint: String,
}

/// Scriptable client for tests. Unscripted invocations echo their input;
/// scripted ones are consumed in order per function. Records every call and
/// tracks peak in-flight concurrency.
pub struct StubInstanceClient {
    scripts: DashMap<FunctionId, VecDeque<StubCall>>,
    calls: Mutex<Vec<RecordedCall>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl StubInstanceClient {
    pub fn new() -> Self {
        Self {
            scripts: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, function_id: &FunctionId, calls: Vec<StubCall>) {
        self.scripts
            .entry(function_id.clone())
            .or_default()
            .extend(calls);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, function_id: &FunctionId) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.function_id == *function_id)
            .cloned()
            .collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Default for StubInstanceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceClient for StubInstanceClient {
    async fn invoke(
        &self,
        endpoint: &str,
        request: InvokeRequest,
        timeout: Duration,
    ) -> Result<InvokeResponse, InvokeError> {
        self.calls.lock().unwrap().push(RecordedCall {
            function_id: request.function_id.clone(),
            execution_id: request.execution_id.clone(),
            endpoint: endpoint.to_string(),
        });
        let call = self
            .scripts
            .get_mut(&request.function_id)
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(|| StubCall::success(request.input.clone()));

        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let outcome = if call.delay >= timeout {
            tokio::time::sleep(timeout).await;
            Err(InvokeError::Timeout)
        } else {
            tokio::time::sleep(call.delay).await;
            match call.result {
                StubResult::Success(output) => Ok(InvokeResponse {
                    success: true,
                    output,
                    logs: String::new(),
                }),
                StubResult::FunctionError(message) => Ok(InvokeResponse {
                    success: false,
                    output: serde_json::json!({ "error": message }),
                    logs: message,
                }),
                StubResult::Transport(message) => Err(InvokeError::Transport(message)),
            }
        };
        self.current.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_function;
    use serde_json::json;

    use super::*;

    fn request(function_id: &FunctionId) -> InvokeRequest {
        InvokeRequest {
            execution_id: ExecutionId::default(),
            function_id: function_id.clone(),
            code_url: "sha256/abc".to_string(),
            resources: ResourceSpec::default(),
            input: json!({"n": 1}),
        }
    }

    #[tokio::test]
    async fn unscripted_calls_echo_their_input() {
        let client = StubInstanceClient::new();
        let function = mock_function("fn_a", 2, false);
        let response = client
            .invoke("mem://i1", request(&function.id), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.output, json!({"n": 1}));
        assert_eq!(client.calls_for(&function.id).len(), 1);
    }

    #[tokio::test]
    async fn scripted_calls_are_consumed_in_order() {
        let client = StubInstanceClient::new();
        let function = mock_function("fn_a", 2, false);
        client.script(
            &function.id,
            vec![
                StubCall::function_error("boom"),
                StubCall::transport("connection reset"),
            ],
        );

        let first = client
            .invoke("mem://i1", request(&function.id), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!first.success);
        assert_eq!(first.logs, "boom");

        let second = client
            .invoke("mem://i1", request(&function.id), Duration::from_secs(1))
            .await;
        assert!(matches!(second, Err(InvokeError::Transport(_))));

        // Script exhausted, back to echoing.
        let third = client
            .invoke("mem://i1", request(&function.id), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(third.success);
    }

    #[tokio::test(start_paused = true)]
    async fn delays_past_the_timeout_surface_as_timeouts() {
        let client = StubInstanceClient::new();
        let function = mock_function("fn_a", 2, false);
        client.script(
            &function.id,
            vec![StubCall::success(json!(1)).with_delay(Duration::from_secs(10))],
        );
        let result = client
            .invoke("mem://i1", request(&function.id), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(InvokeError::Timeout)));
    }
}
