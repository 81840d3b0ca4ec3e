//! vSphere Web Services (VI/JSON) HTTP client with session-based authentication.
//!
//! Communicates with vCenter via `https://{host}:{port}/sdk/vim25/{release}/...`.
//! Property reads are `GET {type}/{moid}/{property}`, method calls are
//! `POST {type}/{moid}/{method}` with a JSON body holding the parameters.

use crate::error::{CloneError, CloneErrorKind, CloneResult};
use crate::types::{MoRef, TaskInfo, TaskState, VsphereConfig};

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const SESSION_HEADER: &str = "vmware-api-session-id";
const TASK_POLL: Duration = Duration::from_secs(1);

/// Well-known managers from `ServiceInstance.content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContent {
    pub root_folder: MoRef,
    pub session_manager: MoRef,
    pub search_index: MoRef,
    #[serde(default)]
    pub event_manager: Option<MoRef>,
    #[serde(default)]
    pub guest_operations_manager: Option<MoRef>,
    #[serde(default)]
    pub about: crate::types::ProductInfo,
}

/// vSphere VI/JSON client.
pub struct VsphereClient {
    client: Client,
    base_url: String,
    session_id: Option<String>,
    content: Option<ServiceContent>,
    config: VsphereConfig,
}

impl VsphereClient {
    /// Build a new client from config (does NOT create a session yet).
    pub fn new(config: &VsphereConfig) -> CloneResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CloneError::connection(format!("Failed to build HTTP client: {e}")))?;

        let base_url = format!(
            "https://{}:{}/sdk/vim25/{}",
            config.host, config.port, config.release
        );

        Ok(Self {
            client,
            base_url,
            session_id: None,
            content: None,
            config: config.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_connected(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn config(&self) -> &VsphereConfig {
        &self.config
    }

    /// Service content fetched during `login()`.
    pub fn content(&self) -> CloneResult<&ServiceContent> {
        self.content
            .as_ref()
            .ok_or_else(|| CloneError::auth("Not logged in, no service content"))
    }

    // ── Session management ──────────────────────────────────────────

    /// Fetch the service content and log in through the session manager.
    pub async fn login(&mut self) -> CloneResult<String> {
        let url = format!("{}/ServiceInstance/ServiceInstance/content", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let resp = Self::check_status(resp).await?;
        let content: ServiceContent = Self::parse_response(resp).await?;

        let url = format!(
            "{}/SessionManager/{}/Login",
            self.base_url, content.session_manager.value
        );
        let body = serde_json::json!({
            "userName": self.config.username,
            "password": self.config.password,
        });
        let resp = self.client.post(&url).json(&body).send().await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(CloneError::auth("Invalid credentials"));
        }
        let resp = Self::check_status(resp).await?;

        let session_id = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CloneError::parse("Login response carried no session header"))?;

        log::debug!(
            "Logged in to {} ({} {})",
            self.config.host,
            content.about.full_name,
            content.about.version
        );
        self.session_id = Some(session_id.clone());
        self.content = Some(content);
        Ok(session_id)
    }

    /// Terminate the current session.
    pub async fn logout(&mut self) -> CloneResult<()> {
        if let (Some(sid), Some(content)) = (self.session_id.as_deref(), self.content.as_ref()) {
            let url = format!(
                "{}/SessionManager/{}/Logout",
                self.base_url, content.session_manager.value
            );
            let _ = self.client.post(&url).header(SESSION_HEADER, sid).send().await;
        }
        self.session_id = None;
        Ok(())
    }

    // ── Object access ───────────────────────────────────────────────

    fn require_session(&self) -> CloneResult<&str> {
        self.session_id
            .as_deref()
            .ok_or_else(|| CloneError::auth("Not logged in, no active session"))
    }

    /// Read one property of a managed object. A `null` property maps to
    /// `None` when `T` is an `Option`.
    pub async fn get_property<T: DeserializeOwned>(
        &self,
        obj: &MoRef,
        property: &str,
    ) -> CloneResult<T> {
        let sid = self.require_session()?;
        let url = format!("{}/{}/{}/{}", self.base_url, obj.kind, obj.value, property);
        let resp = self.client.get(&url).header(SESSION_HEADER, sid).send().await?;
        let resp = Self::check_status(resp).await?;
        Self::parse_response(resp).await
    }

    /// Invoke a method on a managed object.
    pub async fn invoke<B: Serialize, T: DeserializeOwned>(
        &self,
        obj: &MoRef,
        method: &str,
        body: &B,
    ) -> CloneResult<T> {
        let sid = self.require_session()?;
        let url = format!("{}/{}/{}/{}", self.base_url, obj.kind, obj.value, method);
        log::debug!("POST {}/{}/{}", obj.kind, obj.value, method);
        let resp = self
            .client
            .post(&url)
            .header(SESSION_HEADER, sid)
            .json(body)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Self::parse_response(resp).await
    }

    /// Invoke a method that takes no parameters and returns nothing useful.
    pub async fn invoke_empty(&self, obj: &MoRef, method: &str) -> CloneResult<()> {
        let _: Value = self.invoke(obj, method, &serde_json::json!({})).await?;
        Ok(())
    }

    /// Wait for a task to reach a terminal state and return its result.
    pub async fn wait_for_task(&self, task: &MoRef) -> CloneResult<Option<Value>> {
        loop {
            let info: TaskInfo = self.get_property(task, "info").await?;
            match info.state {
                TaskState::Success => return Ok(info.result),
                TaskState::Error => {
                    let (fault, msg) = info
                        .error
                        .map(|e| {
                            (
                                e.fault.as_ref().and_then(fault_name).unwrap_or_default(),
                                e.localized_message.unwrap_or_default(),
                            )
                        })
                        .unwrap_or_default();
                    return Err(CloneError::task(format!("Task {} failed: {fault} {msg}", task.value)));
                }
                TaskState::Queued | TaskState::Running => {
                    tokio::time::sleep(TASK_POLL).await;
                }
            }
        }
    }

    /// Plain GET of a guest file transfer URL.
    pub async fn download(&self, url: &str) -> CloneResult<Vec<u8>> {
        let resp = self.client.get(url).send().await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn check_status(resp: Response) -> CloneResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let code = status.as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(map_fault(code, &body))
    }

    async fn parse_response<T: DeserializeOwned>(resp: Response) -> CloneResult<T> {
        let text = resp.text().await.map_err(|e| {
            CloneError::parse(format!("Failed to read response body: {e}"))
        })?;

        if text.is_empty() {
            // void methods answer 204 with no body
            return serde_json::from_str("null").map_err(|e| {
                CloneError::parse(format!("Cannot deserialise empty response: {e}"))
            });
        }

        serde_json::from_str(&text).map_err(|e| {
            CloneError::parse(format!("JSON parse error: {e}, body: {}", truncate(&text, 500)))
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn fault_name(fault: &Value) -> Option<String> {
    fault.get("_typeName").and_then(Value::as_str).map(str::to_string)
}

/// Map an error response (status + VI/JSON fault body) to a crate error.
pub(crate) fn map_fault(status: u16, body: &str) -> CloneError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let name = parsed.as_ref().and_then(fault_name);
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("faultMessage"))
        .and_then(Value::as_array)
        .and_then(|msgs| msgs.first())
        .and_then(|m| m.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| truncate(body, 300).to_string());

    match name.as_deref() {
        Some("InvalidLogin") | Some("NotAuthenticated") => {
            CloneError::auth(format!("{}: {message}", name.as_deref().unwrap_or_default()))
        }
        Some("InvalidGuestLogin") | Some("GuestPermissionDenied") => CloneError::guest_auth(
            format!("{}: {message}", name.as_deref().unwrap_or_default()),
        ),
        Some("ManagedObjectNotFound") => CloneError::not_found(format!("Managed object not found: {message}")),
        Some(other) => CloneError::api(status, format!("{other}: {message}")),
        None => match status {
            401 => CloneError::auth(format!("Session expired or invalid: {message}")),
            404 => CloneError::not_found(format!("Resource not found: {message}")),
            _ => CloneError::new(CloneErrorKind::ApiError(status), format!("API error {status}: {message}")),
        },
    }
}
