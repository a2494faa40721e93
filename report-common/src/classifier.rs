//! # Classifier
//!
//! Adapter around an external vision model that labels a report photo with a `Category`.
//! Adapters never retry: a failed classification is returned to the caller as is.
use std::time;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::report::{Category, Classification, ImagePayload};

/// Enumeration of errors that can occur while classifying an image.
#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error("image payload is empty")]
    EmptyImage,
    #[error("classification request timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("classification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("classifier responded with {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("classifier returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("classifier is misconfigured: {0}")]
    Configuration(String),
}

/// Labels an image with one of the fixed report categories.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &ImagePayload) -> Result<Classification, ClassificationError>;
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    image: String,
    categories: Vec<&'a str>,
}

/// What the model answers with. `category` is free-form: anything outside the closed set maps to
/// `Category::Other`.
#[derive(Deserialize)]
struct ClassifyResponse {
    category: String,
    confidence: f64,
    #[serde(default)]
    description: String,
}

impl TryFrom<ClassifyResponse> for Classification {
    type Error = ClassificationError;

    fn try_from(response: ClassifyResponse) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&response.confidence) {
            return Err(ClassificationError::InvalidResponse(format!(
                "confidence {} is outside [0, 1]",
                response.confidence
            )));
        }

        Ok(Classification {
            category: Category::normalize(&response.category),
            confidence: response.confidence,
            description: response.description,
        })
    }
}

/// A `Classifier` calling a vision model over HTTP.
///
/// The model receives `{"image": <data URI or URL>, "categories": [...]}` and must answer with
/// `{"category": <label>, "confidence": <0..1>, "description": <text>}`.
pub struct HttpClassifier {
    endpoint: reqwest::Url,
    client: reqwest::Client,
    timeout: time::Duration,
}

impl HttpClassifier {
    pub fn new(
        endpoint: reqwest::Url,
        api_key: Option<&str>,
        timeout: time::Duration,
    ) -> Result<Self, ClassificationError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(key) = api_key {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| ClassificationError::Configuration("invalid api key".to_owned()))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Report Enricher")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            endpoint,
            client,
            timeout,
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, image: &ImagePayload) -> Result<Classification, ClassificationError> {
        if image.is_empty() {
            return Err(ClassificationError::EmptyImage);
        }

        let request = ClassifyRequest {
            image: image.to_model_input(),
            categories: Category::ALL.iter().map(Category::as_str).collect(),
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ClassificationError::Timeout(self.timeout)
                } else {
                    ClassificationError::Request(error)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassificationError::Status { status, body });
        }

        let parsed: ClassifyResponse = response
            .json()
            .await
            .map_err(|error| ClassificationError::InvalidResponse(error.to_string()))?;

        debug!(
            category = %parsed.category,
            confidence = parsed.confidence,
            "classifier responded"
        );

        parsed.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use httpmock::prelude::*;
    use serde_json::json;

    fn classifier(server: &MockServer, timeout: time::Duration) -> HttpClassifier {
        HttpClassifier::new(
            server.url("/classify").parse().unwrap(),
            Some("secret"),
            timeout,
        )
        .unwrap()
    }

    fn image() -> ImagePayload {
        ImagePayload::Bytes(Bytes::from_static(b"\xff\xd8\xff"))
    }

    #[tokio::test]
    async fn test_classify_known_category() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/classify")
                    .header("authorization", "Bearer secret")
                    .json_body_partial(r#"{"image": "data:image/jpeg;base64,/9j/"}"#);
                then.status(200).json_body(json!({
                    "category": "burning_garbage",
                    "confidence": 0.93,
                    "description": "smoke rising from a pile of waste"
                }));
            })
            .await;

        let classification = classifier(&server, time::Duration::from_secs(5))
            .classify(&image())
            .await
            .expect("classification failed");

        mock.assert_async().await;
        assert_eq!(classification.category, Category::BurningGarbage);
        assert_eq!(classification.confidence, 0.93);
        assert_eq!(
            classification.description,
            "smoke rising from a pile of waste"
        );
    }

    #[tokio::test]
    async fn test_unknown_category_maps_to_other() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/classify");
                then.status(200)
                    .json_body(json!({"category": "graffiti", "confidence": 0.77}));
            })
            .await;

        let classification = classifier(&server, time::Duration::from_secs(5))
            .classify(&image())
            .await
            .expect("classification failed");

        assert_eq!(classification.category, Category::Other);
        assert_eq!(classification.confidence, 0.77);
        assert_eq!(classification.description, "");
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/classify");
                then.status(200)
                    .json_body(json!({"category": "dead_animal", "confidence": 1.5}));
            })
            .await;

        let error = classifier(&server, time::Duration::from_secs(5))
            .classify(&image())
            .await
            .expect_err("confidence is out of range");

        assert!(matches!(error, ClassificationError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_error_status_is_surfaced() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/classify");
                then.status(503).body("overloaded");
            })
            .await;

        let error = classifier(&server, time::Duration::from_secs(5))
            .classify(&image())
            .await
            .expect_err("classifier is unavailable");

        // Exactly one call: the adapter does not retry.
        mock.assert_hits_async(1).await;
        match error {
            ClassificationError::Status { status, body } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_slow_classifier_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/classify");
                then.status(200)
                    .delay(time::Duration::from_millis(500))
                    .json_body(json!({"category": "other", "confidence": 0.1}));
            })
            .await;

        let error = classifier(&server, time::Duration::from_millis(50))
            .classify(&image())
            .await
            .expect_err("classifier is too slow");

        assert!(matches!(error, ClassificationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_empty_image_is_rejected_without_a_call() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/classify");
                then.status(200);
            })
            .await;

        let error = classifier(&server, time::Duration::from_secs(5))
            .classify(&ImagePayload::Bytes(Bytes::new()))
            .await
            .expect_err("image is empty");

        assert!(matches!(error, ClassificationError::EmptyImage));
        mock.assert_hits_async(0).await;
    }
}
