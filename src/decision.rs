//! Decision Service Client
//!
//! HTTP client for an OpenAI-compatible chat completions endpoint, plus the
//! strict parser that turns its free-text answer into a trading decision.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::DecisionError;
use crate::types::Action;

/// One completion request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// External text-completion service
#[async_trait]
pub trait DecisionService: Send + Sync {
    /// Returns the raw completion text
    async fn complete(&self, request: &CompletionRequest) -> Result<String, DecisionError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions client
pub struct ChatCompletionsClient {
    /// API base URL, e.g. `https://api.openai.com/v1`
    base_url: String,
    api_key: Option<String>,
    /// HTTP client with connection pooling
    http_client: Client,
    /// Request timeout
    timeout: Duration,
}

impl ChatCompletionsClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, DecisionError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| DecisionError::Transport(format!("failed to create HTTP client: {}", e)))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        info!("Decision client initialized: url={}, timeout={}s", base_url, timeout.as_secs());

        Ok(Self {
            base_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            http_client,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl DecisionService for ChatCompletionsClient {
    /// POST /chat/completions with a system and a user message
    async fn complete(&self, request: &CompletionRequest) -> Result<String, DecisionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &request.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
        };

        debug!("Requesting decision: model={}, prompt_len={}", request.model, request.prompt.len());

        let mut builder = self.http_client.post(&url).json(&body).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DecisionError::Timeout(self.timeout)
            } else if e.is_connect() {
                DecisionError::Transport(format!("failed to connect to {}: {}", url, e))
            } else {
                DecisionError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Decision service returned error: status={}, body={}", status, error_text);
            return Err(DecisionError::Status {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| DecisionError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        debug!("Decision service answered with {} chars", content.len());
        Ok(content)
    }
}

/// Parsed decision with optional hints
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decision {
    /// `Action::None` means hold
    pub action: Option<Action>,
    pub leverage: Option<u32>,
    /// Share of the quote balance, in percent
    pub size_percent: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub rationale: Option<String>,
}

impl Decision {
    pub fn action(&self) -> Action {
        self.action.unwrap_or(Action::None)
    }
}

/// Parse a completion into a decision.
///
/// Accepts either a bare `BUY` / `SELL` / `HOLD` answer or `KEY: value` lines
/// with an `ACTION` key and optional `LEVERAGE`, `SIZE`, `TAKE_PROFIT`,
/// `STOP_LOSS` and `REASON` keys. Anything else is `None`.
pub fn parse_decision(text: &str) -> Option<Decision> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(action) = parse_action(text) {
        return Some(Decision {
            action: Some(action),
            ..Decision::default()
        });
    }

    let mut decision = Decision::default();
    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*', '#', ' ']);
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().trim_matches('*').trim().to_uppercase().replace([' ', '-'], "_");
        let value = value.trim().trim_matches('*').trim();

        match key.as_str() {
            "ACTION" | "DECISION" => {
                let action = parse_action(value)?;
                // Conflicting action lines are rejected outright
                if decision.action.map_or(false, |seen| seen != action) {
                    return None;
                }
                decision.action = Some(action);
            }
            "LEVERAGE" => decision.leverage = parse_leverage(value),
            "SIZE" | "SIZE_PERCENT" | "POSITION_SIZE" => decision.size_percent = parse_number(value),
            "TAKE_PROFIT" | "TP" => decision.take_profit = parse_number(value),
            "STOP_LOSS" | "SL" => decision.stop_loss = parse_number(value),
            "REASON" | "RATIONALE" => decision.rationale = Some(value.to_string()),
            _ => {}
        }
    }

    decision.action?;
    Some(decision)
}

fn parse_action(raw: &str) -> Option<Action> {
    let word = raw.trim().trim_matches(|c: char| !c.is_ascii_alphabetic());
    match word.to_uppercase().as_str() {
        "BUY" => Some(Action::Buy),
        "SELL" => Some(Action::Sell),
        "HOLD" => Some(Action::None),
        _ => None,
    }
}

/// Leading number of a value such as `12.5`, `12.5%` or `$2,100`
fn parse_number(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('$')
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    cleaned.parse::<Decimal>().ok().filter(|value| *value > Decimal::ZERO)
}

fn parse_leverage(raw: &str) -> Option<u32> {
    parse_number(raw.trim().trim_start_matches(['x', 'X']))
        .and_then(|value| value.trunc().to_u32())
        .filter(|value| *value > 0)
}

/// Clamp a requested leverage into `[1, max_leverage]`
pub fn clamp_leverage(requested: u32, max_leverage: u32) -> u32 {
    requested.clamp(1, max_leverage.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dec(value: i64) -> Decimal {
        Decimal::from(value)
    }

    #[test]
    fn test_parse_bare_words() {
        assert_eq!(parse_decision("BUY").unwrap().action(), Action::Buy);
        assert_eq!(parse_decision("  sell.\n").unwrap().action(), Action::Sell);
        assert_eq!(parse_decision("Hold").unwrap().action(), Action::None);
    }

    #[test]
    fn test_parse_structured_response() {
        let text = "ACTION: BUY\nLEVERAGE: 3x\nSIZE: 15%\nTAKE_PROFIT: 2,100\nSTOP_LOSS: $1950.5\nREASON: higher timeframe uptrend";
        let decision = parse_decision(text).unwrap();

        assert_eq!(decision.action(), Action::Buy);
        assert_eq!(decision.leverage, Some(3));
        assert_eq!(decision.size_percent, Some(dec(15)));
        assert_eq!(decision.take_profit, Some(dec(2100)));
        assert_eq!(decision.stop_loss, Some("1950.5".parse().unwrap()));
        assert_eq!(decision.rationale.as_deref(), Some("higher timeframe uptrend"));
    }

    #[test]
    fn test_parse_markdown_decoration() {
        let decision = parse_decision("**Action:** SELL\n- Stop loss: 90").unwrap();
        assert_eq!(decision.action(), Action::Sell);
        assert_eq!(decision.stop_loss, Some(dec(90)));
    }

    #[test]
    fn test_parse_rejects_unrecognized() {
        assert_eq!(parse_decision(""), None);
        assert_eq!(parse_decision("   "), None);
        assert_eq!(parse_decision("I think the market looks bullish"), None);
        assert_eq!(parse_decision("ACTION: MOON"), None);
        assert_eq!(parse_decision("LEVERAGE: 5"), None);
        assert_eq!(parse_decision("ACTION: BUY\nACTION: SELL"), None);
    }

    #[test]
    fn test_bad_hints_are_dropped() {
        let decision = parse_decision("ACTION: BUY\nLEVERAGE: lots\nSIZE: -5").unwrap();
        assert_eq!(decision.action(), Action::Buy);
        assert_eq!(decision.leverage, None);
        assert_eq!(decision.size_percent, None);
    }

    #[test]
    fn test_clamp_leverage() {
        assert_eq!(clamp_leverage(50, 5), 5);
        assert_eq!(clamp_leverage(0, 5), 1);
        assert_eq!(clamp_leverage(3, 5), 3);
        assert_eq!(clamp_leverage(3, 0), 1);
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "You are a trader".to_string(),
            prompt: "BTC/USDT at 100".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: 64,
        }
    }

    #[tokio::test]
    async fn test_client_returns_completion_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "temperature": 0.0,
                "max_tokens": 64
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "ACTION: HOLD"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatCompletionsClient::new(
            &format!("{}/v1/", server.uri()),
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();

        let text = client.complete(&request()).await.unwrap();
        assert_eq!(text, "ACTION: HOLD");
    }

    #[tokio::test]
    async fn test_client_maps_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = ChatCompletionsClient::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = client.complete(&request()).await.unwrap_err();

        assert_eq!(
            err,
            DecisionError::Status {
                status: 503,
                body: "overloaded".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_client_rejects_malformed_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = ChatCompletionsClient::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, DecisionError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_client_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = ChatCompletionsClient::new(&server.uri(), None, Duration::from_millis(200)).unwrap();
        let err = client.complete(&request()).await.unwrap_err();
        assert_eq!(err, DecisionError::Timeout(Duration::from_millis(200)));
    }
}
