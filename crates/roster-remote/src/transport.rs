use std::time::Duration;

use roster_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("http status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl TransportError {
    /// Server errors, timeouts, rate limits and connection failures are worth retrying;
    /// other client errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { code, .. } => *code >= 500 || *code == 408 || *code == 429,
            Self::Transport(_) => true,
            Self::Decode(_) => false,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { code: 404, .. })
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Status { code: 409, .. })
    }
}

/// Per-entity-type request/response access to the remote store.
pub trait EntityTransport {
    /// # Errors
    /// Returns [`TransportError`] when the request fails or the body is not a JSON list.
    fn list(&self, entity: &str, filter: &[(&str, &str)]) -> Result<Vec<Value>, TransportError>;

    /// `Ok(None)` when the entity does not exist.
    ///
    /// # Errors
    /// Returns [`TransportError`] for any failure other than 404.
    fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, TransportError>;

    /// # Errors
    /// Returns [`TransportError`] when the request fails.
    fn create(&self, entity: &str, body: &Value) -> Result<Value, TransportError>;

    /// # Errors
    /// Returns [`TransportError`] when the request fails.
    fn update(&self, entity: &str, id: &str, body: &Value) -> Result<Value, TransportError>;

    /// # Errors
    /// Returns [`TransportError`] when the request fails.
    fn delete(&self, entity: &str, id: &str) -> Result<(), TransportError>;
}

/// Connection settings for the remote entity API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { base_url: None, api_key: None, timeout_secs: 30, retry: RetryPolicy::default() }
    }
}

/// Blocking HTTP transport: `{base}/entities/{Entity}[/{id}]`.
pub struct UreqTransport {
    agent: ureq::Agent,
    base_url: String,
    api_key: Option<String>,
}

impl UreqTransport {
    #[must_use]
    pub fn new(base_url: &str, api_key: Option<String>, timeout_secs: u64) -> Self {
        let timeout = Duration::from_secs(timeout_secs.max(1));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self { agent, base_url: base_url.trim_end_matches('/').to_string(), api_key }
    }

    pub(crate) fn entity_url(&self, entity: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => {
                format!("{}/entities/{}/{}", self.base_url, encode_segment(entity), encode_segment(id))
            }
            None => format!("{}/entities/{}", self.base_url, encode_segment(entity)),
        }
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let request = self.agent.request(method, url).set("accept", "application/json");
        match self.api_key.as_deref() {
            Some(key) => request.set("authorization", &format!("Bearer {key}")),
            None => request,
        }
    }

    fn send(request: ureq::Request, body: Option<&Value>) -> Result<Option<Value>, TransportError> {
        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        match result {
            Ok(response) => {
                let text = response
                    .into_string()
                    .map_err(|err| TransportError::Transport(err.to_string()))?;
                if text.trim().is_empty() {
                    return Ok(None);
                }
                serde_json::from_str(&text)
                    .map(Some)
                    .map_err(|err| TransportError::Decode(err.to_string()))
            }
            Err(ureq::Error::Status(code, response)) => Err(TransportError::Status {
                code,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(err)) => Err(TransportError::Transport(err.to_string())),
        }
    }
}

fn encode_segment(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn into_list(value: Option<Value>) -> Result<Vec<Value>, TransportError> {
    match value {
        Some(Value::Array(items)) => Ok(items),
        Some(Value::Object(mut object)) => match object.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(TransportError::Decode("list response has no items array".to_string())),
        },
        None => Ok(Vec::new()),
        Some(other) => Err(TransportError::Decode(format!("expected a JSON list, got {other}"))),
    }
}

impl EntityTransport for UreqTransport {
    fn list(&self, entity: &str, filter: &[(&str, &str)]) -> Result<Vec<Value>, TransportError> {
        let mut request = self.request("GET", &self.entity_url(entity, None));
        for (key, value) in filter {
            request = request.query(key, value);
        }
        into_list(Self::send(request, None)?)
    }

    fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, TransportError> {
        match Self::send(self.request("GET", &self.entity_url(entity, Some(id))), None) {
            Ok(value) => Ok(value),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn create(&self, entity: &str, body: &Value) -> Result<Value, TransportError> {
        let created = Self::send(self.request("POST", &self.entity_url(entity, None)), Some(body))?;
        Ok(created.unwrap_or_else(|| body.clone()))
    }

    fn update(&self, entity: &str, id: &str, body: &Value) -> Result<Value, TransportError> {
        let updated =
            Self::send(self.request("PUT", &self.entity_url(entity, Some(id))), Some(body))?;
        Ok(updated.unwrap_or(Value::Null))
    }

    fn delete(&self, entity: &str, id: &str) -> Result<(), TransportError> {
        Self::send(self.request("DELETE", &self.entity_url(entity, Some(id))), None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn entity_urls_escape_path_segments() {
        let transport = UreqTransport::new("https://api.example.com/v1/", None, 5);
        assert_eq!(
            transport.entity_url("MileageEntry", None),
            "https://api.example.com/v1/entities/MileageEntry"
        );
        assert_eq!(
            transport.entity_url("Employee", Some("emp 1/a")),
            "https://api.example.com/v1/entities/Employee/emp%201%2Fa"
        );
    }

    #[test]
    fn retryable_statuses() {
        let status = |code| TransportError::Status { code, body: String::new() };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(408).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(status(404).is_not_found());
        assert!(status(409).is_conflict());
        assert!(!status(409).is_retryable());
        assert!(TransportError::Transport("reset".into()).is_retryable());
        assert!(!TransportError::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn list_bodies_accept_arrays_and_item_envelopes() -> Result<(), TransportError> {
        assert_eq!(into_list(Some(json!([{"id": "a"}])))?.len(), 1);
        assert_eq!(into_list(Some(json!({"items": [{"id": "a"}, {"id": "b"}]})))?.len(), 2);
        assert!(into_list(None)?.is_empty());
        assert!(into_list(Some(json!("nope"))).is_err());
        Ok(())
    }

    #[test]
    fn remote_config_defaults_fill_missing_keys() -> Result<(), serde_json::Error> {
        let config: RemoteConfig = serde_json::from_value(json!({"base_url": "https://x"}))?;
        assert_eq!(config.base_url.as_deref(), Some("https://x"));
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.retry, RetryPolicy::default());
        Ok(())
    }
}
