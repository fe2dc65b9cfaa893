//! Pre-execution check asking a remote model whether an action matches the
//! user's request.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::actions::ActionParams;
use crate::error::ErrorKind;
use crate::pool::{ConnectionPool, RequestError};
use crate::transport::HttpRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationRequest {
    pub user_request: String,
    pub action: String,
    pub description: String,
    pub params: ActionParams,
}

impl ValidationRequest {
    pub fn new(user_request: impl Into<String>, params: &ActionParams) -> Self {
        Self {
            user_request: user_request.into(),
            action: params.kind().as_str().to_string(),
            description: params.describe(),
            params: params.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    #[serde(alias = "ok")]
    pub valid: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ValidationVerdict {
    pub fn approve() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("validator request failed: {0}")]
    Request(#[from] RequestError),
    #[error("validator returned a malformed verdict: {0}")]
    Malformed(String),
}

impl ValidatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidatorError::Request(err) => err.kind(),
            ValidatorError::Malformed(_) => ErrorKind::MalformedVerdict,
        }
    }
}

#[async_trait]
pub trait ActionValidator: Send + Sync {
    async fn validate(&self, request: &ValidationRequest)
        -> Result<ValidationVerdict, ValidatorError>;
}

/// Validator reached over HTTP through the shared connection pool.
pub struct RemoteValidator {
    pool: ConnectionPool,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl RemoteValidator {
    pub fn new(pool: ConnectionPool, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            url: url.into(),
            api_key: None,
            timeout,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait]
impl ActionValidator for RemoteValidator {
    async fn validate(
        &self,
        request: &ValidationRequest,
    ) -> Result<ValidationVerdict, ValidatorError> {
        let mut http = HttpRequest::post_json(&self.url, request)
            .map_err(|err| ValidatorError::Malformed(err.to_string()))?
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            http = http.header("authorization", format!("Bearer {key}"));
        }
        let resp = self.pool.fetch(&http).await?;
        let verdict: ValidationVerdict = resp.json().map_err(|err| {
            warn!(url = %self.url, error = %err, "unparsable validator verdict");
            ValidatorError::Malformed(err.to_string())
        })?;
        debug!(
            action = %request.action,
            valid = verdict.valid,
            suggestions = verdict.suggestions.len(),
            "validator verdict"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{CreateParams, ModifyParams};
    use crate::config::PoolConfig;
    use crate::transport::{HttpResponse, HttpTransport, TransportError};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Canned {
        body: &'static str,
        seen: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpTransport for Canned {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().push(request.clone());
            Ok(HttpResponse::new(200).with_body(self.body))
        }
    }

    fn validator(body: &'static str) -> (Arc<Canned>, RemoteValidator) {
        let transport = Arc::new(Canned {
            body,
            seen: Mutex::new(Vec::new()),
        });
        let pool = ConnectionPool::new(
            PoolConfig {
                min_size: 0,
                max_size: 1,
                ..PoolConfig::default()
            },
            transport.clone(),
        );
        let validator = RemoteValidator::new(pool, "http://validator.invalid/check", Duration::from_secs(1))
            .with_api_key("secret");
        (transport, validator)
    }

    fn params() -> ActionParams {
        ActionParams::Create(CreateParams {
            title: "Trip".into(),
            text: String::new(),
            tags: vec![],
            fields: Default::default(),
        })
    }

    #[tokio::test]
    async fn posts_request_and_reads_ok_alias() {
        let (transport, validator) =
            validator(r#"{"ok": false, "reason": "wrong note", "suggestions": ["use Travel"]}"#);
        let verdict = validator
            .validate(&ValidationRequest::new("plan my trip", &params()))
            .await
            .unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.suggestions, vec!["use Travel"]);

        let seen = transport.seen.lock();
        let body: serde_json::Value =
            serde_json::from_slice(seen[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["action"], "create");
        assert_eq!(body["params"]["title"], "Trip");
        assert!(seen[0]
            .headers
            .iter()
            .any(|(k, v)| k == "authorization" && v == "Bearer secret"));
    }

    #[tokio::test]
    async fn malformed_verdicts_are_reported() {
        let (_transport, validator) = validator("not json");
        let err = validator
            .validate(&ValidationRequest::new(
                "tidy",
                &ActionParams::Modify(ModifyParams {
                    title: "Note".into(),
                    tags_to_add: vec!["x".into()],
                    ..ModifyParams::default()
                }),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedVerdict);
    }
}
