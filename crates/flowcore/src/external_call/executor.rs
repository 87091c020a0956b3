//! Call executors, one per external call type

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::debug;

use crate::model::{ExternalCallType, WorkflowExternalCall};

/// Header carrying the call's idempotency key to the receiver
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Errors from executing an external call
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    /// The request could not be sent or the response not read
    #[error("request failed: {0}")]
    Request(String),

    /// The destination answered with a non-success status
    #[error("destination returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The HTTP client gave up waiting on the destination
    #[error("transport timed out: {0}")]
    TransportTimeout(String),

    #[error("cancelled")]
    Cancelled,

    /// Destination is failing; the call was not attempted
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("no executor registered for call type {0}")]
    NoExecutor(ExternalCallType),

    /// The stored call cannot be turned into a request
    #[error("invalid call: {0}")]
    Invalid(String),
}

impl ExecutorError {
    /// Whether the call should be recorded as `TimedOut` rather than `Failed`
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::TransportTimeout(_) | Self::Cancelled
        )
    }

    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::TransportTimeout(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Performs one external call type
#[async_trait]
pub trait CallExecutor: Send + Sync {
    /// Perform the call and return the response payload
    async fn execute(&self, call: &WorkflowExternalCall) -> Result<Value, ExecutorError>;
}

/// HTTP executor sending the idempotency key as a header
#[derive(Debug, Clone, Default)]
pub struct HttpCallExecutor {
    client: Client,
}

impl HttpCallExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CallExecutor for HttpCallExecutor {
    async fn execute(&self, call: &WorkflowExternalCall) -> Result<Value, ExecutorError> {
        let method = Method::from_bytes(call.method.to_uppercase().as_bytes())
            .map_err(|_| ExecutorError::Invalid(format!("unknown HTTP method {}", call.method)))?;

        let mut request = self
            .client
            .request(method, &call.endpoint)
            .header(IDEMPOTENCY_KEY_HEADER, &call.idempotency_key);
        for (name, value) in &call.headers {
            request = request.header(name, value);
        }
        if let Some(payload) = &call.request_payload {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(ExecutorError::from_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(ExecutorError::from_transport)?;

        if !status.is_success() {
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = serde_json::from_str(&body).unwrap_or(Value::String(body));
        Ok(json!({ "StatusCode": status.as_u16(), "Body": body }))
    }
}

/// Stand-in for third-party API, email and notification integrations
///
/// Accepts every call and echoes its identity, so workflows using these
/// call types run end to end until a real integration is registered.
#[derive(Debug, Clone)]
pub struct PlaceholderExecutor {
    call_type: ExternalCallType,
}

impl PlaceholderExecutor {
    pub fn new(call_type: ExternalCallType) -> Self {
        Self { call_type }
    }
}

#[async_trait]
impl CallExecutor for PlaceholderExecutor {
    async fn execute(&self, call: &WorkflowExternalCall) -> Result<Value, ExecutorError> {
        debug!(
            call_id = %call.id,
            call_type = %self.call_type,
            endpoint = %call.endpoint,
            "placeholder executor accepted call"
        );
        Ok(json!({
            "Accepted": true,
            "CallType": self.call_type.as_str(),
            "Endpoint": call.endpoint,
            "IdempotencyKey": call.idempotency_key,
        }))
    }
}

/// Executors keyed by call type, built once at startup
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<ExternalCallType, Arc<dyn CallExecutor>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ExecutorRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// HTTP executor plus placeholders for the remaining call types
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ExternalCallType::HttpRequest, Arc::new(HttpCallExecutor::new()));
        for call_type in [
            ExternalCallType::ThirdPartyApi,
            ExternalCallType::EmailService,
            ExternalCallType::NotificationService,
        ] {
            registry.register(call_type, Arc::new(PlaceholderExecutor::new(call_type)));
        }
        registry
    }

    /// Register (or replace) the executor for a call type
    pub fn register(&mut self, call_type: ExternalCallType, executor: Arc<dyn CallExecutor>) {
        self.executors.insert(call_type, executor);
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_executor(mut self, call_type: ExternalCallType, executor: Arc<dyn CallExecutor>) -> Self {
        self.register(call_type, executor);
        self
    }

    pub fn get(&self, call_type: ExternalCallType) -> Result<Arc<dyn CallExecutor>, ExecutorError> {
        self.executors
            .get(&call_type)
            .cloned()
            .ok_or(ExecutorError::NoExecutor(call_type))
    }

    /// Every call type has an executor
    pub fn is_complete(&self) -> bool {
        ExternalCallType::ALL
            .iter()
            .all(|t| self.executors.contains_key(t))
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("call_types", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn call(call_type: ExternalCallType) -> WorkflowExternalCall {
        WorkflowExternalCall {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            activity_id: "notify".into(),
            call_type,
            endpoint: "mailto:ops@example.com".into(),
            method: "SEND".into(),
            request_payload: None,
            headers: HashMap::new(),
            idempotency_key: "abc".into(),
            status: crate::model::ExternalCallStatus::Started,
            attempt_count: 1,
            response_payload: None,
            error_message: None,
            duration_ms: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_defaults_cover_every_call_type() {
        let registry = ExecutorRegistry::with_defaults();
        assert!(registry.is_complete());
        assert!(ExecutorRegistry::new().get(ExternalCallType::HttpRequest).is_err());
    }

    #[tokio::test]
    async fn test_placeholder_echoes_identity() {
        let executor = PlaceholderExecutor::new(ExternalCallType::EmailService);
        let response = executor.execute(&call(ExternalCallType::EmailService)).await.unwrap();
        assert_eq!(response["Accepted"], json!(true));
        assert_eq!(response["CallType"], json!("email_service"));
        assert_eq!(response["IdempotencyKey"], json!("abc"));
    }

    #[tokio::test]
    async fn test_http_rejects_unparseable_method() {
        let mut call = call(ExternalCallType::HttpRequest);
        call.method = "NOT A METHOD".into();
        let err = HttpCallExecutor::new().execute(&call).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_http_client_timeout_is_a_timeout() {
        // Accepts the connection and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let client = Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let mut call = call(ExternalCallType::HttpRequest);
        call.method = "GET".into();
        call.endpoint = format!("http://{addr}/slow");

        let err = HttpCallExecutor::with_client(client).execute(&call).await.unwrap_err();
        assert!(matches!(err, ExecutorError::TransportTimeout(_)), "{err:?}");
        assert!(err.is_timeout());
        server.abort();
    }

    #[test]
    fn test_timeout_classification() {
        assert!(ExecutorError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(ExecutorError::Cancelled.is_timeout());
        assert!(ExecutorError::TransportTimeout("read".into()).is_timeout());
        assert!(!ExecutorError::Request("refused".into()).is_timeout());
    }
}
