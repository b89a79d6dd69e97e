use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::settings::ClassifierSettings;

use super::{AnalysisError, AnalysisResult};

const ANALYSIS_PROMPT: &str = r#"You must only accept real photographic images of trees or plants. Automatically reject any uploaded image that is animated, illustrated, cartoon-style, computer-generated, AI-generated, digitally drawn, or not representing a real-life physical plant. If the image is rejected, set "isHealthy" to false, "issueName" to "Invalid Image", "description" to "The uploaded image is not a real photograph of a plant. Please upload a clear, real-life photo.", and provide an empty array for "recommendations".

If the image is a valid photograph of a plant, analyze it. Identify any visible signs of nutritional deficiencies or diseases. Provide the name of the issue and a detailed description. For the "recommendations", provide a list of very short, actionable bullet points. Each point must be a concise, direct instruction (e.g., "Apply a nitrogen-rich fertilizer," "Water twice a week," "Move to a sunnier location"). Do not include lengthy explanations or extra information in the recommendations. If the plant appears healthy, state that clearly and provide general care tips in the same concise, point-wise format. Structure your response in the requested JSON format."#;

/// One request, one validated diagnosis. No internal retry; a failed call
/// ends the cycle that issued it.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn analyze(&self, image_bytes: &[u8]) -> Result<AnalysisResult, AnalysisError>;
}

pub struct GeminiClassifier {
    client: reqwest::Client,
    settings: ClassifierSettings,
}

impl GeminiClassifier {
    pub fn new(settings: ClassifierSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .context("failed to build classifier HTTP client")?;

        Ok(Self { client, settings })
    }

    fn build_request(&self, image_bytes: &[u8]) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                parts: vec![
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: "image/jpeg".into(),
                            data: BASE64.encode(image_bytes),
                        },
                    },
                    Part::Text {
                        text: ANALYSIS_PROMPT.into(),
                    },
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                response_schema: response_schema(),
            },
        }
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    async fn analyze(&self, image_bytes: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.settings.base_url, self.settings.model,
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.settings.api_key)
            .json(&self.build_request(image_bytes))
            .send()
            .await
            .map_err(|err| {
                error!("classifier request failed: {err}");
                AnalysisError::Provider
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("classifier returned {status}: {body}");
            return Err(AnalysisError::Provider);
        }

        let reply: GenerateContentResponse = response.json().await.map_err(|err| {
            error!("classifier response envelope unreadable: {err}");
            AnalysisError::Provider
        })?;

        let text = reply
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content.parts.into_iter().find_map(|part| part.text))
            .filter(|text| !text.trim().is_empty())
            .ok_or(AnalysisError::EmptyResponse)?;

        let value: Value = serde_json::from_str(text.trim()).map_err(|err| {
            AnalysisError::MalformedResponse(format!("reply is not valid JSON: {err}"))
        })?;

        validate_result(&value)
    }
}

/// Field-by-field validation of the classifier's reply. The response schema
/// declared in the request is not trusted; every field is re-checked here
/// before an [`AnalysisResult`] is constructed.
fn validate_result(value: &Value) -> Result<AnalysisResult, AnalysisError> {
    let object = value
        .as_object()
        .ok_or_else(|| malformed("reply is not a JSON object"))?;

    let is_healthy = object
        .get("isHealthy")
        .and_then(Value::as_bool)
        .ok_or_else(|| malformed("isHealthy is missing or not a boolean"))?;

    let issue_name = object
        .get("issueName")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("issueName is missing or not a string"))?;
    if issue_name.is_empty() {
        return Err(malformed("issueName is empty"));
    }

    let description = object
        .get("description")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("description is missing or not a string"))?;
    if description.is_empty() {
        return Err(malformed("description is empty"));
    }

    let recommendations = object
        .get("recommendations")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("recommendations is missing or not an array"))?
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed("recommendations contains a non-string entry"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let result = AnalysisResult {
        is_healthy,
        issue_name: issue_name.to_string(),
        description: description.to_string(),
        recommendations,
    };

    // Only a rejected image is allowed to come back without recommendations.
    if result.recommendations.is_empty() && !result.is_rejected_image() {
        return Err(malformed("recommendations is empty for a non-rejected image"));
    }

    Ok(result)
}

fn malformed(detail: &str) -> AnalysisError {
    AnalysisError::MalformedResponse(detail.to_string())
}

fn response_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "isHealthy": {
                "type": "BOOLEAN",
                "description": "Is the plant healthy?"
            },
            "issueName": {
                "type": "STRING",
                "description": "Name of the deficiency, disease, or \"Healthy Plant\"."
            },
            "description": {
                "type": "STRING",
                "description": "A detailed description of the findings."
            },
            "recommendations": {
                "type": "ARRAY",
                "items": { "type": "STRING" },
                "description": "A list of recommended actions or care tips."
            }
        },
        "required": ["isHealthy", "issueName", "description", "recommendations"]
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text {
        text: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    response_schema: Value,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Default)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Deserialize, Default)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}
