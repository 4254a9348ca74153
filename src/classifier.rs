//! External classifier collaborator. The gateway client speaks to an
//! inference gateway and defensively normalizes whatever JSON the model
//! returns; the trait keeps the enrichment pipeline testable without a
//! network.

use crate::coerce::{field_f64, field_non_empty};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One classification answer. Optional fields left `None` by the model must
/// not overwrite existing values downstream.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierVerdict {
    pub confidence: f32,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub source: String,
    pub model: Option<String>,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn enrich(
        &self,
        name: &str,
        images: &[String],
        metadata: Option<&Value>,
    ) -> Result<ClassifierVerdict, ClassifierError>;
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub function_name: Option<String>,
    pub model: Option<String>,
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("CLASSIFIER_GATEWAY_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            api_key: std::env::var("CLASSIFIER_API_KEY").ok(),
            function_name: std::env::var("CLASSIFIER_FUNCTION").ok(),
            model: std::env::var("CLASSIFIER_MODEL").ok(),
        }
    }
}

const SYSTEM_PROMPT: &str = r#"
You are a product classification agent. Given a product name, photo URLs and
source metadata, respond with a JSON object containing `confidence` (0..1),
`name`, `brand`, `category`, `subcategory`, `url` and `description`. Omit any
field you cannot determine. Output JSON only.
"#;

pub struct GatewayClassifier {
    http: Client,
    config: ClassifierConfig,
}

impl GatewayClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }
}

#[async_trait]
impl Classifier for GatewayClassifier {
    async fn enrich(
        &self,
        name: &str,
        images: &[String],
        metadata: Option<&Value>,
    ) -> Result<ClassifierVerdict, ClassifierError> {
        let gateway = self.config.gateway_url.trim();
        if gateway.is_empty() {
            return Err(ClassifierError::MissingGateway);
        }

        let function_name = self
            .config
            .function_name
            .as_deref()
            .unwrap_or("product_classification");
        let payload = json!({
            "name": name,
            "images": images,
            "metadata": metadata,
        });
        let body = InferenceRequest {
            function_name: function_name.to_string(),
            model_name: self.config.model.clone(),
            input: InferenceInput {
                messages: vec![
                    InferenceMessage {
                        role: "system".into(),
                        content: SYSTEM_PROMPT.into(),
                    },
                    InferenceMessage {
                        role: "user".into(),
                        content: payload.to_string(),
                    },
                ],
            },
        };

        let mut request = self.http.post(format!("{gateway}/inference")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ClassifierError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ClassifierError::Http(format!("HTTP {}", response.status())));
        }

        let payload: InferenceResponse = response
            .json()
            .await
            .map_err(|err| ClassifierError::InvalidResponse(err.to_string()))?;
        let text = payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .map(|item| item.text)
            .ok_or_else(|| ClassifierError::InvalidResponse("missing text".into()))?;

        let cleaned = strip_markdown_fence(&text);
        let value: Value = serde_json::from_str(&cleaned)
            .map_err(|err| ClassifierError::InvalidResponse(err.to_string()))?;
        Ok(verdict_from_value(
            &value,
            self.config.model.as_deref(),
        ))
    }
}

fn verdict_from_value(value: &Value, model: Option<&str>) -> ClassifierVerdict {
    ClassifierVerdict {
        confidence: field_f64(value, "confidence").clamp(0.0, 1.0) as f32,
        name: field_non_empty(value, "name"),
        brand: field_non_empty(value, "brand"),
        category: field_non_empty(value, "category"),
        subcategory: field_non_empty(value, "subcategory"),
        url: field_non_empty(value, "url"),
        description: field_non_empty(value, "description"),
        source: field_non_empty(value, "source").unwrap_or_else(|| "gateway".into()),
        model: field_non_empty(value, "model").or_else(|| model.map(str::to_string)),
    }
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

#[derive(Debug, Serialize)]
struct InferenceRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: InferenceInput,
}

#[derive(Debug, Serialize)]
struct InferenceInput {
    messages: Vec<InferenceMessage>,
}

#[derive(Debug, Serialize)]
struct InferenceMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    content: Vec<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verdict_normalizes_sparse_model_output() {
        let value = json!({
            "confidence": "0.82",
            "name": "Leather Wallet",
            "brand": "",
            "category": "Accessories",
        });
        let verdict = verdict_from_value(&value, Some("demo-model"));
        assert!((verdict.confidence - 0.82).abs() < 1e-6);
        assert_eq!(verdict.name.as_deref(), Some("Leather Wallet"));
        assert_eq!(verdict.brand, None);
        assert_eq!(verdict.model.as_deref(), Some("demo-model"));
        assert_eq!(verdict.source, "gateway");
    }

    #[test]
    fn confidence_is_clamped_to_unit_interval() {
        let verdict = verdict_from_value(&json!({"confidence": 7.0}), None);
        assert_eq!(verdict.confidence, 1.0);
        let verdict = verdict_from_value(&json!({"confidence": -1.0}), None);
        assert_eq!(verdict.confidence, 0.0);
    }

    #[test]
    fn fenced_model_output_is_unwrapped() {
        let fenced = "```json\n{\"confidence\": 0.4}\n```";
        assert_eq!(strip_markdown_fence(fenced), "{\"confidence\": 0.4}");
        assert_eq!(strip_markdown_fence("{\"a\":1}"), "{\"a\":1}");
    }
}
