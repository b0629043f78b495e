use std::time::Duration;

use hubsnap_core::traits::Enricher;
use hubsnap_core::unit::Fields;
use hubsnap_core::AppError;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SYSTEM_PROMPT: &str = "You are a data classification assistant. For each entity in \
the provided JSON array, determine its modality (e.g. text, vision, audio, multimodal) and \
lifecycle (e.g. base, finetune, deprecated). Respond ONLY with a JSON array of objects, one per \
input entity in the same order, each with the keys \"modality\" and \"lifecycle\". Do not include \
explanations.";

/// OpenAI-compatible LLM client classifying batches of scraped
/// entities.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
#[derive(Clone)]
pub struct OpenAiEnricher {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    system_prompt: String,
}

impl OpenAiEnricher {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let prompt = self.system_prompt.clone();
        Ok(Self::build(&self.api_key, &self.model, &self.base_url, timeout)?
            .with_system_prompt(prompt))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl Enricher for OpenAiEnricher {
    async fn enrich(&self, batch: &[Fields]) -> Result<Vec<Fields>, AppError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: serde_json::to_string_pretty(batch)?,
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else {
                    AppError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();

            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status_code, body));

            return Err(AppError::Llm {
                message,
                status_code,
                retryable: status_code == 429 || status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Http(format!("Failed to parse LLM response: {}", e)))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| AppError::Llm {
                message: "Empty response from LLM".into(),
                status_code: 200,
                retryable: false,
            })?;

        let additions: Vec<Fields> = serde_json::from_str(content).map_err(|e| AppError::Llm {
            message: format!("LLM returned invalid JSON: {}. Raw: {}", e, content),
            status_code: 200,
            retryable: false,
        })?;

        merge_enrichment(batch, additions)
    }
}

/// Overlay the classifier's fields onto the original records, in order.
/// The classifier never overrides a field the scrape already produced.
fn merge_enrichment(batch: &[Fields], additions: Vec<Fields>) -> Result<Vec<Fields>, AppError> {
    if additions.len() != batch.len() {
        return Err(AppError::Llm {
            message: format!(
                "classifier returned {} records for a batch of {}",
                additions.len(),
                batch.len()
            ),
            status_code: 200,
            retryable: false,
        });
    }
    let mut enriched = Vec::with_capacity(batch.len());
    for (row, addition) in batch.iter().zip(additions) {
        let mut merged = row.clone();
        for (key, value) in addition {
            merged.entry(key).or_insert(value);
        }
        enriched.push(merged);
    }
    Ok(enriched)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn row(name: &str) -> Fields {
        let mut f = Fields::new();
        f.insert("name".into(), Value::String(name.into()));
        f
    }

    #[test]
    fn enrichment_merges_in_order_without_overriding() {
        let mut addition = Fields::new();
        addition.insert("modality".into(), Value::String("text".into()));
        addition.insert("name".into(), Value::String("renamed".into()));

        let merged = merge_enrichment(&[row("bert")], vec![addition]).unwrap();
        assert_eq!(merged[0]["modality"], "text");
        assert_eq!(merged[0]["name"], "bert");
    }

    #[test]
    fn batch_length_mismatch_is_rejected() {
        let err = merge_enrichment(&[row("bert"), row("gpt")], vec![Fields::new()]).unwrap_err();
        assert!(matches!(err, AppError::Llm { retryable: false, .. }));
    }
}
