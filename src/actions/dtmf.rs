//! DTMF key presses.
//!
//! Digits are either pressed server-side through the telephony control
//! plane or played in-band as tone bursts on the outbound audio.

use crate::actions::{Action, ActionConfig, ActionInput, ActionOutput};
use crate::audio::{AudioEncoding, dtmf};
use crate::config::{AudioConfig, DtmfConfig};
use crate::error::{Result, VoxlineError};
use crate::output::OutputSender;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

pub const ACTION_NAME: &str = "send_dtmf";

const INVALID_BUTTONS: &str = "Invalid DTMF buttons, can only accept 0-9";

#[allow(clippy::expect_used)]
static BUTTONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("hardcoded DTMF pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtmfParameters {
    pub buttons: String,
}

impl DtmfParameters {
    pub fn is_valid(&self) -> bool {
        BUTTONS.is_match(&self.buttons)
    }
}

/// Telephony control plane able to press digits on a live call.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn send_dtmf(&self, call_id: &str, digits: &str) -> Result<()>;
}

/// Records requests; optionally fails them.
#[derive(Debug, Clone, Default)]
pub struct MockSignalingClient {
    calls: Arc<Mutex<Vec<(String, String)>>>,
    should_fail: bool,
}

impl MockSignalingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// `(call_id, digits)` pairs received so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SignalingClient for MockSignalingClient {
    async fn send_dtmf(&self, call_id: &str, digits: &str) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((call_id.to_string(), digits.to_string()));
        }
        if self.should_fail {
            return Err(VoxlineError::Signaling {
                message: "mock signaling failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Plays tone bursts on the outbound audio.
#[derive(Clone)]
pub struct InBandTones {
    output: OutputSender,
    sampling_rate: u32,
    encoding: AudioEncoding,
    tone_ms: u32,
    inter_digit: Duration,
}

impl InBandTones {
    pub fn new(output: OutputSender, audio: &AudioConfig, dtmf: &DtmfConfig) -> Self {
        Self {
            output,
            sampling_rate: audio.sampling_rate,
            encoding: audio.encoding,
            tone_ms: dtmf.tone_ms,
            inter_digit: Duration::from_millis(dtmf.inter_digit_ms),
        }
    }

    /// Emits one tone per digit, in order, pausing between tones.
    async fn play(&self, digits: &str) -> Result<()> {
        for (i, digit) in digits.chars().enumerate() {
            if i > 0 && !self.inter_digit.is_zero() {
                tokio::time::sleep(self.inter_digit).await;
            }
            let tone =
                dtmf::generate_with_duration(digit, self.sampling_rate, self.encoding, self.tone_ms)
                    .ok_or_else(|| VoxlineError::Other(format!("no tone for '{}'", digit)))?;
            self.output.send_unscoped(tone)?;
        }
        Ok(())
    }
}

pub enum DtmfDelivery {
    Signaling(Arc<dyn SignalingClient>),
    InBand(InBandTones),
}

pub struct DtmfAction {
    config: ActionConfig,
    delivery: DtmfDelivery,
}

impl DtmfAction {
    pub fn new(delivery: DtmfDelivery) -> Self {
        Self {
            config: ActionConfig::new(
                ACTION_NAME,
                "Presses keypad buttons on the call, for example to navigate a phone menu.",
            ),
            delivery,
        }
    }

    pub fn with_config(mut self, config: ActionConfig) -> Self {
        self.config = config;
        self
    }

    async fn press(&self, buttons: &str, call_id: Option<&str>) -> Result<()> {
        match &self.delivery {
            DtmfDelivery::Signaling(client) => {
                let call_id = call_id.ok_or_else(|| VoxlineError::Signaling {
                    message: "no active call to press digits on".to_string(),
                })?;
                client.send_dtmf(call_id, buttons).await
            }
            DtmfDelivery::InBand(tones) => tones.play(buttons).await,
        }
    }
}

#[async_trait]
impl Action for DtmfAction {
    fn config(&self) -> &ActionConfig {
        &self.config
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "buttons": {
                    "type": "string",
                    "pattern": "^[0-9]+$",
                    "description": "Digits to press, in order"
                }
            },
            "required": ["buttons"]
        })
    }

    async fn run(&self, input: ActionInput) -> ActionOutput {
        let params: DtmfParameters = match serde_json::from_value(input.params) {
            Ok(params) => params,
            Err(_) => return ActionOutput::failure(INVALID_BUTTONS),
        };
        if !params.is_valid() {
            return ActionOutput::failure(INVALID_BUTTONS);
        }

        match self.press(&params.buttons, input.call_id.as_deref()).await {
            Ok(()) => ActionOutput::success(format!("Pressed {}", params.buttons)),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %input.conversation_id,
                    error = %e,
                    "DTMF press failed"
                );
                ActionOutput::failure(format!("Failed to press DTMF buttons: {}", e))
            }
        }
    }
}

/// Presses digits via `PUT {base_url}/v1/calls/{call_id}/dtmf`.
#[cfg(feature = "http")]
pub struct HttpSignalingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[cfg(feature = "http")]
impl HttpSignalingClient {
    /// Fails with [`VoxlineError::MissingCredential`] when no API key is set.
    pub fn new(config: &crate::config::TelephonyConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VoxlineError::MissingCredential {
                name: "telephony.api_key".to_string(),
            })?;
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(crate::defaults::TELEPHONY_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(crate::defaults::SIGNALING_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl SignalingClient for HttpSignalingClient {
    async fn send_dtmf(&self, call_id: &str, digits: &str) -> Result<()> {
        let response = self
            .client
            .put(format!("{}/v1/calls/{}/dtmf", self.base_url, call_id))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "digits": digits }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoxlineError::Signaling {
                message: format!("HTTP {} pressing digits on call {}", status, call_id),
            });
        }
        tracing::debug!(call_id, digits, "digits pressed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(buttons: &str, call_id: Option<&str>) -> ActionInput {
        ActionInput {
            action_config: ActionConfig::new(ACTION_NAME, ""),
            conversation_id: "conv".to_string(),
            params: serde_json::json!({ "buttons": buttons }),
            call_id: call_id.map(str::to_string),
        }
    }

    #[test]
    fn test_button_validation() {
        for valid in ["0", "1234", "0099887766"] {
            assert!(DtmfParameters { buttons: valid.to_string() }.is_valid(), "{}", valid);
        }
        for invalid in ["", "****", "12#", "1 2", "١٢"] {
            assert!(!DtmfParameters { buttons: invalid.to_string() }.is_valid(), "{}", invalid);
        }
    }

    #[tokio::test]
    async fn test_signaling_presses_digits_on_call() {
        let client = MockSignalingClient::new();
        let action = DtmfAction::new(DtmfDelivery::Signaling(Arc::new(client.clone())));

        let output = action.run(input("1234", Some("call-9"))).await;

        assert!(output.success, "{}", output.message);
        assert_eq!(client.calls(), vec![("call-9".to_string(), "1234".to_string())]);
    }

    #[tokio::test]
    async fn test_invalid_buttons_fail_without_external_call() {
        let client = MockSignalingClient::new();
        let action = DtmfAction::new(DtmfDelivery::Signaling(Arc::new(client.clone())));

        let output = action.run(input("****", Some("call-9"))).await;

        assert!(!output.success);
        assert_eq!(output.message, "Invalid DTMF buttons, can only accept 0-9");
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_buttons_param_fails() {
        let action = DtmfAction::new(DtmfDelivery::Signaling(Arc::new(MockSignalingClient::new())));
        let mut bad = input("1", Some("call"));
        bad.params = serde_json::json!({ "digits": "1" });
        let output = action.run(bad).await;
        assert!(!output.success);
        assert_eq!(output.message, INVALID_BUTTONS);
    }

    #[tokio::test]
    async fn test_signaling_failure_and_missing_call_are_reported() {
        let failing = DtmfAction::new(DtmfDelivery::Signaling(Arc::new(
            MockSignalingClient::new().with_failure(),
        )));
        assert!(!failing.run(input("1", Some("call"))).await.success);

        let client = MockSignalingClient::new();
        let no_call = DtmfAction::new(DtmfDelivery::Signaling(Arc::new(client.clone())));
        let output = no_call.run(input("1", None)).await;
        assert!(!output.success);
        assert!(client.calls().is_empty());
    }

    #[test]
    fn test_schema_requires_buttons() {
        let action = DtmfAction::new(DtmfDelivery::Signaling(Arc::new(MockSignalingClient::new())));
        let definition = action.function_definition();
        assert_eq!(definition.name, ACTION_NAME);
        assert_eq!(definition.parameters["required"][0], "buttons");
    }

    #[cfg(feature = "http")]
    mod http {
        use super::*;
        use crate::config::TelephonyConfig;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        async fn serve_status(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let handle = tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request).to_string();
                    if n == 0 || (text.contains("\r\n\r\n") && text.ends_with('}')) {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    status
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                String::from_utf8_lossy(&request).to_string()
            });
            (format!("http://{}", addr), handle)
        }

        fn telephony(base_url: &str) -> TelephonyConfig {
            TelephonyConfig {
                base_url: Some(base_url.to_string()),
                api_key: Some("secret".to_string()),
                ..TelephonyConfig::default()
            }
        }

        #[tokio::test]
        async fn test_http_client_puts_digits() {
            let (url, server) = serve_status("200 OK").await;
            let client = HttpSignalingClient::new(&telephony(&url)).unwrap();
            client.send_dtmf("uuid-1", "1234").await.unwrap();

            let request = server.await.unwrap();
            assert!(request.starts_with("PUT /v1/calls/uuid-1/dtmf"));
            assert!(request.contains("\"digits\":\"1234\""));
        }

        #[tokio::test]
        async fn test_http_client_rejects_error_status() {
            let (url, _server) = serve_status("404 Not Found").await;
            let client = HttpSignalingClient::new(&telephony(&url)).unwrap();
            assert!(matches!(
                client.send_dtmf("gone", "1").await,
                Err(VoxlineError::Signaling { .. })
            ));
        }

        #[test]
        fn test_http_client_requires_api_key() {
            let config = TelephonyConfig::default();
            assert!(matches!(
                HttpSignalingClient::new(&config),
                Err(VoxlineError::MissingCredential { .. })
            ));
        }
    }
}
