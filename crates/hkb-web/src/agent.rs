//! Thin façade over a hosted conversational agent runtime: prompt in,
//! cleaned text out.

use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

static THINKING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<thinking>.*?</thinking>\s*").expect("static regex"));
static RESPONSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<response>(.*?)</response>").expect("static regex"));

/// Pull the prompt out of either `{"prompt": ...}` or the SDK-wrapped
/// `{"input": {"prompt": ...}}` payload shape.
pub fn extract_prompt(payload: &Value) -> Option<String> {
    payload
        .get("input")
        .and_then(|input| input.get("prompt"))
        .or_else(|| payload.get("prompt"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|prompt| !prompt.is_empty())
}

/// Strip model scaffolding from a raw completion: `<thinking>` blocks, the
/// `<response>` wrapper, and one pair of surrounding quotes when the entire
/// text is quoted.
pub fn clean_agent_response(raw: &str) -> String {
    let without_thinking = THINKING.replace_all(raw, "");
    let unwrapped = RESPONSE.replace_all(&without_thinking, "$1");
    let trimmed = unwrapped.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn invoke(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Posts the SDK payload shape to a hosted runtime endpoint and returns the
/// raw completion text.
pub struct HttpAgentRuntime {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAgentRuntime {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn invoke(&self, prompt: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "input": { "prompt": prompt } }))
            .send()
            .await
            .context("sending agent request")?
            .error_for_status()
            .context("agent runtime returned an error status")?;
        response.text().await.context("reading agent response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_is_found_in_both_payload_shapes() {
        let direct = json!({ "prompt": "hello" });
        assert_eq!(extract_prompt(&direct).as_deref(), Some("hello"));

        let wrapped = json!({ "input": { "prompt": "hello" } });
        assert_eq!(extract_prompt(&wrapped).as_deref(), Some("hello"));

        assert!(extract_prompt(&json!({})).is_none());
        assert!(extract_prompt(&json!({ "prompt": "" })).is_none());
        assert!(extract_prompt(&json!({ "prompt": 42 })).is_none());
    }

    #[test]
    fn thinking_blocks_are_stripped_and_response_unwrapped() {
        let raw = "<thinking>let me\nreason</thinking>  <response>Take your medication daily.</response>";
        assert_eq!(clean_agent_response(raw), "Take your medication daily.");
    }

    #[test]
    fn multiple_thinking_blocks_are_removed() {
        let raw = "<thinking>a</thinking>first <thinking>b</thinking>second";
        assert_eq!(clean_agent_response(raw), "first second");
    }

    #[test]
    fn fully_quoted_responses_lose_one_quote_pair() {
        assert_eq!(clean_agent_response("\"quoted answer\""), "quoted answer");
        assert_eq!(
            clean_agent_response("say \"hello\" politely"),
            "say \"hello\" politely"
        );
        assert_eq!(clean_agent_response("\"\""), "");
    }

    #[test]
    fn plain_text_passes_through_trimmed() {
        assert_eq!(clean_agent_response("  plain answer \n"), "plain answer");
    }
}
