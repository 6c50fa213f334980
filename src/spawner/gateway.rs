use crate::workflow::Thinking;
use serde::Deserialize;
use serde_json::json;
use std::thread;
use std::time::Duration;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_POLL_ATTEMPTS: usize = 5;
const SESSION_POLL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("gateway rejected spawn: status `{status}`")]
    Rejected { status: String },
    #[error("gateway response was malformed: {reason}")]
    Malformed { reason: String },
}

/// One worker-spawn request to the external call-agent endpoint.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub idempotency_key: String,
    pub agent_id: String,
    pub session_key: String,
    pub message: String,
    pub timeout_secs: u64,
    pub thinking: Thinking,
}

/// The external service that launches workers. The trait is the seam the
/// tests substitute; production uses [`HttpGateway`].
pub trait Gateway: Send + Sync {
    /// Submits the spawn request; returns the accepted gateway run id.
    fn call_agent(&self, request: &SpawnRequest) -> Result<String, GatewayError>;

    /// Resolves the session UUID for an accepted run, if known yet.
    fn session_for_run(&self, gateway_run_id: &str) -> Option<String>;
}

/// Polls the gateway for the real session id, falling back to the accepted
/// run id when the retry budget runs out.
pub fn resolve_session_id(gateway: &dyn Gateway, accepted_run_id: &str) -> String {
    for attempt in 0..SESSION_POLL_ATTEMPTS {
        if let Some(session_id) = gateway.session_for_run(accepted_run_id) {
            return session_id;
        }
        if attempt + 1 < SESSION_POLL_ATTEMPTS {
            thread::sleep(SESSION_POLL_DELAY);
        }
    }
    accepted_run_id.to_string()
}

#[derive(Debug, Deserialize)]
struct CallAgentResponse {
    status: String,
    #[serde(default, alias = "runId")]
    run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(default, alias = "sessionId")]
    session_id: Option<String>,
}

pub struct HttpGateway {
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }
}

impl Gateway for HttpGateway {
    fn call_agent(&self, request: &SpawnRequest) -> Result<String, GatewayError> {
        let url = format!("{}/agents/call", self.base_url);
        let response = ureq::post(&url)
            .timeout(CALL_TIMEOUT)
            .send_json(json!({
                "idempotencyKey": request.idempotency_key,
                "agentId": request.agent_id,
                "sessionKey": request.session_key,
                "message": request.message,
                "timeout": request.timeout_secs,
                "thinking": request.thinking.as_str(),
            }))
            .map_err(|err| GatewayError::Request {
                url: url.clone(),
                reason: err.to_string(),
            })?;

        let body: CallAgentResponse =
            response.into_json().map_err(|err| GatewayError::Malformed {
                reason: err.to_string(),
            })?;
        if body.status != "accepted" {
            return Err(GatewayError::Rejected {
                status: body.status,
            });
        }
        body.run_id.ok_or_else(|| GatewayError::Malformed {
            reason: "accepted response carried no runId".to_string(),
        })
    }

    fn session_for_run(&self, gateway_run_id: &str) -> Option<String> {
        let url = format!("{}/sessions/{gateway_run_id}", self.base_url);
        let response = ureq::get(&url).timeout(CALL_TIMEOUT).call().ok()?;
        let body: SessionResponse = response.into_json().ok()?;
        body.session_id.filter(|session_id| !session_id.is_empty())
    }
}
