//! [`AnnotationClient`] backed by the OpenAI Responses API with strict
//! structured outputs.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::client::AnnotationClient;
use crate::error::ServiceError;
use crate::taxonomy::Taxonomy;

pub const RESPONSES_URL: &str = "https://api.openai.com/v1/responses";
pub const DEFAULT_MODEL: &str = "gpt-5";

/// Shape the model is constrained to return.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModelReply {
    pub annotations: Vec<ModelAnnotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModelAnnotation {
    /// Exact substring of the chunk.
    pub text: String,
    /// Taxonomy category.
    #[serde(rename = "type")]
    pub category: String,
    pub subtype: String,
    /// 0-based char index into the chunk, inclusive.
    pub start: u64,
    /// 0-based char index into the chunk, exclusive.
    pub end: u64,
    /// Between 0 and 1.
    pub confidence: f64,
}

/// JSON Schema for [`ModelReply`], tightened for strict mode: subschemas
/// inlined, no extra properties, no `format` hints.
pub fn response_schema() -> Result<Value, serde_json::Error> {
    let generator = SchemaSettings::draft07()
        .with(|s| {
            s.inline_subschemas = true;
            s.meta_schema = None;
        })
        .into_generator();
    let mut schema = serde_json::to_value(generator.into_root_schema_for::<ModelReply>())?;
    tighten_schema(&mut schema);
    Ok(schema)
}

fn tighten_schema(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            map.remove("format");
            let is_object = map.get("type").and_then(Value::as_str) == Some("object")
                || map.contains_key("properties");
            if is_object && !map.contains_key("additionalProperties") {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
            }
            if let Some(Value::Object(props)) = map.get_mut("properties") {
                props.values_mut().for_each(tighten_schema);
            }
            if let Some(items) = map.get_mut("items") {
                tighten_schema(items);
            }
            for key in ["definitions", "$defs", "allOf", "anyOf", "oneOf"] {
                match map.get_mut(key) {
                    Some(Value::Object(obj)) => obj.values_mut().for_each(tighten_schema),
                    Some(Value::Array(arr)) => arr.iter_mut().for_each(tighten_schema),
                    _ => {}
                }
            }
        }
        Value::Array(arr) => arr.iter_mut().for_each(tighten_schema),
        _ => {}
    }
}

pub struct OpenAiClient {
    http: Client,
    api_key: String,
    model: String,
    endpoint: String,
    source: String,
    schema: Value,
}

impl OpenAiClient {
    /// `request_timeout` bounds one HTTP exchange; the retry layer applies its
    /// own per-attempt timeout on top.
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .gzip(true)
            .connect_timeout(Duration::from_secs(15))
            .timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ServiceError::fatal(format!("HTTP client build failed: {e}")))?;
        let schema = response_schema()
            .map_err(|e| ServiceError::fatal(format!("response schema generation failed: {e}")))?;
        let model = model.into();
        Ok(Self {
            http,
            api_key: api_key.into(),
            source: format!("openai:{model}"),
            model,
            endpoint: RESPONSES_URL.to_string(),
            schema,
        })
    }

    /// Points the client at another Responses-compatible endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, chunk_text: &str, taxonomy: &Taxonomy) -> Value {
        json!({
            "model": self.model,
            "input": [
                {
                    "role": "system",
                    "content": [{ "type": "input_text", "text": system_prompt(taxonomy) }]
                },
                {
                    "role": "user",
                    "content": [{ "type": "input_text", "text": format!("TEXT:\n{chunk_text}") }]
                }
            ],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": "medieval_annotations",
                    "schema": self.schema,
                    "strict": true
                }
            }
        })
    }
}

fn system_prompt(taxonomy: &Taxonomy) -> String {
    format!(
        "You are a philologist annotating medieval Spanish and Catalan prose.\n\
         Mark every passage that fits one of these categories and subtypes:\n\
         {}\n\n\
         Rules:\n\
         - text: the EXACT substring of the given text, no normalisation.\n\
         - type and subtype: only the names listed above.\n\
         - start and end: 0-based character indices into the given text, end exclusive.\n\
         - confidence: a number between 0 and 1.\n\
         Return JSON matching the provided schema and nothing else.",
        taxonomy.describe()
    )
}

#[async_trait]
impl AnnotationClient for OpenAiClient {
    fn source(&self) -> &str {
        &self.source
    }

    async fn submit(&self, chunk_text: &str, taxonomy: &Taxonomy) -> Result<Value, ServiceError> {
        let body = self.request_body(chunk_text, taxonomy);

        let started = Instant::now();
        debug!(model = %self.model, "➡️ sending annotation request");
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let retry_after = retry_after(resp.headers());
        let text = resp.text().await.map_err(transport_error)?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            warn!(%status, elapsed_ms, "⚠️ annotation service returned an error");
            return Err(status_error(status, retry_after, &text));
        }

        let envelope: Value = serde_json::from_str(&text).map_err(|e| {
            ServiceError::invalid_response(format!("response is not JSON: {e}"), Some(text.clone()))
        })?;
        info!(elapsed_ms, "✅ received structured response");
        structured_payload(envelope)
    }
}

/// Pulls the model's JSON out of a Responses envelope. Envelopes without an
/// `output_text` pass through untouched for the parser to inspect.
fn structured_payload(envelope: Value) -> Result<Value, ServiceError> {
    let contents = envelope
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten();

    for content in contents {
        match content.get("type").and_then(Value::as_str) {
            Some("output_text") => {
                let Some(text) = content.get("text").and_then(Value::as_str) else {
                    continue;
                };
                return serde_json::from_str(text).map_err(|e| {
                    ServiceError::invalid_response(
                        format!("model output is not JSON: {e}"),
                        Some(text.to_string()),
                    )
                });
            }
            Some("refusal") => {
                let reason = content
                    .get("refusal")
                    .and_then(Value::as_str)
                    .unwrap_or("no reason given");
                return Err(ServiceError::invalid_response(
                    format!("model refused: {reason}"),
                    None,
                ));
            }
            _ => {}
        }
    }
    Ok(envelope)
}

fn transport_error(err: reqwest::Error) -> ServiceError {
    if err.is_builder() {
        ServiceError::fatal(format!("malformed request: {err}"))
    } else if err.is_timeout() {
        ServiceError::transient(format!("request timed out: {err}"))
    } else {
        ServiceError::transient(format!("HTTP error: {err}"))
    }
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ServiceError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()?
            .pointer(&format!("/error/{name}"))?
            .as_str()
            .map(str::to_string)
    };
    let detail = field("message").unwrap_or_else(|| body.chars().take(200).collect());
    let message = format!("HTTP {}: {detail}", status.as_u16());
    // an exhausted quota also arrives as 429 but waiting will not help
    let quota_exhausted = [field("code"), field("type")]
        .iter()
        .flatten()
        .any(|v| v == "insufficient_quota");

    if quota_exhausted {
        ServiceError::fatal(message)
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ServiceError::rate_limited(message, retry_after)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ServiceError::transient(message)
    } else {
        ServiceError::fatal(message)
    }
}

/// `retry-after-ms` wins over `retry-after`. HTTP-date values and values too
/// large for a `Duration` are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| headers.get(name)?.to_str().ok()?.trim().parse::<f64>().ok();
    let ms = header("retry-after-ms").and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok());
    if ms.is_some() {
        return ms;
    }
    header("retry-after").and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;
    use crate::error::ServiceErrorKind;

    #[test]
    fn schema_is_strict_and_inlined() {
        let schema = response_schema().unwrap();
        assert_eq!(schema["additionalProperties"], false);
        let item = &schema["properties"]["annotations"]["items"];
        assert_eq!(item["additionalProperties"], false);
        assert!(item["properties"].get("type").is_some());
        assert!(item["properties"]["start"].get("format").is_none());
        let required: Vec<&str> = item["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        for field in ["text", "type", "subtype", "start", "end", "confidence"] {
            assert!(required.contains(&field), "{field} not required");
        }
        assert!(schema.get("$schema").is_none());
    }

    #[test]
    fn statuses_map_to_error_kinds() {
        let kind = |code: u16| {
            status_error(StatusCode::from_u16(code).unwrap(), None, "{}").kind
        };
        assert_eq!(kind(429), ServiceErrorKind::RateLimited);
        assert_eq!(kind(500), ServiceErrorKind::Transient);
        assert_eq!(kind(503), ServiceErrorKind::Transient);
        assert_eq!(kind(408), ServiceErrorKind::Transient);
        assert_eq!(kind(401), ServiceErrorKind::Fatal);
        assert_eq!(kind(402), ServiceErrorKind::Fatal);
        assert_eq!(kind(403), ServiceErrorKind::Fatal);
        assert_eq!(kind(400), ServiceErrorKind::Fatal);

        let quota = r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#;
        let err = status_error(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(1)), quota);
        assert_eq!(err.kind, ServiceErrorKind::Fatal);
        assert_eq!(err.message, "HTTP 429: You exceeded your current quota");

        let window = r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#;
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, None, window).kind,
            ServiceErrorKind::RateLimited
        );
    }

    #[test]
    fn error_message_comes_from_body() {
        let err = status_error(
            StatusCode::UNAUTHORIZED,
            None,
            r#"{"error":{"message":"Incorrect API key provided"}}"#,
        );
        assert_eq!(err.message, "HTTP 401: Incorrect API key provided");
    }

    #[test]
    fn retry_after_prefers_milliseconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));
        headers.insert("retry-after-ms", HeaderValue::from_static("350"));
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(350)));

        let mut dated = HeaderMap::new();
        dated.insert(
            "retry-after",
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&dated), None);
    }

    #[test]
    fn oversized_retry_after_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("1e300"));
        assert_eq!(retry_after(&headers), None);

        headers.insert("retry-after-ms", HeaderValue::from_static("1e300"));
        headers.insert("retry-after", HeaderValue::from_static("3"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));

        let mut negative = HeaderMap::new();
        negative.insert("retry-after", HeaderValue::from_static("-1"));
        assert_eq!(retry_after(&negative), None);
    }

    #[test]
    fn output_text_is_decoded() {
        let envelope = json!({
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "{\"annotations\": []}"}
                ]}
            ]
        });
        assert_eq!(structured_payload(envelope).unwrap(), json!({"annotations": []}));
    }

    #[test]
    fn undecodable_output_keeps_body() {
        let envelope = json!({
            "output": [{"content": [{"type": "output_text", "text": "[{\"text\": \"Dios\""}]}]
        });
        let err = structured_payload(envelope).unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::InvalidResponse);
        assert_eq!(err.body.as_deref(), Some("[{\"text\": \"Dios\""));
    }

    #[test]
    fn refusal_is_invalid_response() {
        let envelope = json!({
            "output": [{"content": [{"type": "refusal", "refusal": "cannot help"}]}]
        });
        let err = structured_payload(envelope).unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::InvalidResponse);
        assert!(err.message.contains("cannot help"));
    }

    #[test]
    fn prompt_lists_taxonomy() {
        let prompt = system_prompt(&Taxonomy::medieval());
        assert!(prompt.contains("- Lexis:"));
        assert!(prompt.contains("authority"));
    }
}
