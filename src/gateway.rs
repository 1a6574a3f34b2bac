//! Remote poster gateway.
//!
//! Wraps the Facebook Graph API behind the [`PosterGateway`] trait so the
//! scheduler and evaluator can be driven against a mock in tests. Every call
//! is bounded by the configured request timeout; failures are classified into
//! the retryable/fatal taxonomy the loops act on.

use crate::config::FacebookConfig;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur when talking to the remote poster API
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Rate limited by the remote API")]
    RateLimited,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Remote object not found: {0}")]
    NotFound(String),

    #[error("Graph API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected response shape: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether the operation may succeed if simply retried later.
    ///
    /// `Unauthorized` requires operator action and `NotFound` means the
    /// target is gone; everything else is worth another tick.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, GatewayError::Unauthorized(_) | GatewayError::NotFound(_))
    }
}

/// Response from a successful photo post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostPhotoResponse {
    /// Id of the photo object (comments attach here)
    pub photo_id: String,
    /// Id of the page post wrapping the photo (reactions live here)
    pub post_id: String,
}

/// One media entry in an album listing
#[derive(Debug, Clone)]
pub struct AlbumMedia {
    pub id: String,
    pub caption: Option<String>,
}

/// Remote social-media posting API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PosterGateway: Send + Sync {
    /// Post an image with a caption; to the page feed when `album_id` is
    /// `None`, into the given album otherwise. Returns photo and post ids.
    async fn post_image(
        &self,
        image: Vec<u8>,
        filename: String,
        caption: &str,
        album_id: Option<String>,
    ) -> Result<PostPhotoResponse, GatewayError>;

    /// Attach a comment to a post or photo. At least one of `image` and
    /// `text` must be provided. Returns the comment id.
    async fn post_comment(
        &self,
        object_id: &str,
        image: Option<(Vec<u8>, String)>,
        text: Option<String>,
    ) -> Result<String, GatewayError>;

    /// Total reaction count for a post
    async fn reaction_count(&self, post_id: &str) -> Result<u64, GatewayError>;

    /// List media already present in an album
    async fn list_album_media(&self, album_id: &str) -> Result<Vec<AlbumMedia>, GatewayError>;
}

/// Graph API error envelope
#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphPostPhotoResponse {
    id: String,
    post_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphCommentResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphReactionsResponse {
    reactions: GraphReactionsField,
}

#[derive(Debug, Deserialize)]
struct GraphReactionsField {
    summary: GraphReactionsSummary,
}

#[derive(Debug, Deserialize)]
struct GraphReactionsSummary {
    total_count: u64,
}

#[derive(Debug, Deserialize)]
struct GraphAlbumPhotosResponse {
    #[serde(default)]
    data: Vec<GraphAlbumPhoto>,
}

#[derive(Debug, Deserialize)]
struct GraphAlbumPhoto {
    id: String,
    name: Option<String>,
}

/// Facebook Graph API gateway
pub struct FacebookGateway {
    client: reqwest::Client,
    base_url: String,
    page_id: String,
    access_token: String,
}

impl FacebookGateway {
    /// Create a gateway from the facebook config section
    pub fn new(config: &FacebookConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;

        info!(
            page_id = %config.page_id,
            base_url = %config.base_url,
            "Facebook gateway initialized"
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_id: config.page_id.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn url(&self, object_id: &str, connection: Option<&str>) -> String {
        match connection {
            Some(connection) => format!("{}/{}/{}", self.base_url, object_id, connection),
            None => format!("{}/{}", self.base_url, object_id),
        }
    }

    /// Map a non-success response to the gateway error taxonomy
    async fn classify_error(response: reqwest::Response) -> GatewayError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::TOO_MANY_REQUESTS => GatewayError::RateLimited,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Unauthorized(body),
            StatusCode::NOT_FOUND => GatewayError::NotFound(body),
            _ => match serde_json::from_str::<GraphErrorEnvelope>(&body) {
                Ok(envelope) => classify_graph_error(envelope.error),
                Err(_) => GatewayError::InvalidResponse(format!("{status}: {body}")),
            },
        }
    }

    async fn parse_success<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        if !response.status().is_success() {
            return Err(Self::classify_error(response).await);
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

/// Map Graph API error codes onto the taxonomy.
///
/// 190 is an invalid/expired token; 4, 17, 32 and 613 are the documented
/// throttling codes; 100 is an unknown object.
fn classify_graph_error(error: GraphError) -> GatewayError {
    match error.code {
        190 => GatewayError::Unauthorized(error.message),
        4 | 17 | 32 | 613 => GatewayError::RateLimited,
        100 => GatewayError::NotFound(error.message),
        code => GatewayError::Api {
            code,
            message: error.message,
        },
    }
}

#[async_trait]
impl PosterGateway for FacebookGateway {
    #[instrument(skip(self, image, caption), fields(filename = %filename, album = ?album_id, size_bytes = image.len()))]
    async fn post_image(
        &self,
        image: Vec<u8>,
        filename: String,
        caption: &str,
        album_id: Option<String>,
    ) -> Result<PostPhotoResponse, GatewayError> {
        let target = album_id.as_deref().unwrap_or(&self.page_id);

        let form = Form::new()
            .part(
                "source",
                Part::bytes(image)
                    .file_name(filename)
                    .mime_str("image/jpeg")
                    .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?,
            )
            .text("message", caption.to_string());

        debug!(target = %target, "Posting photo");

        let response = self
            .client
            .post(self.url(target, Some("photos")))
            .query(&[("access_token", self.access_token.as_str()), ("format", "json")])
            .multipart(form)
            .send()
            .await?;

        let parsed: GraphPostPhotoResponse = Self::parse_success(response).await?;

        // Album photos do not carry a wrapping page post; fall back to the
        // photo id so reactions can still be queried against something.
        let post_id = parsed.post_id.unwrap_or_else(|| parsed.id.clone());

        info!(photo_id = %parsed.id, post_id = %post_id, "Photo posted");

        Ok(PostPhotoResponse {
            photo_id: parsed.id,
            post_id,
        })
    }

    #[instrument(skip(self, image, text))]
    async fn post_comment(
        &self,
        object_id: &str,
        image: Option<(Vec<u8>, String)>,
        text: Option<String>,
    ) -> Result<String, GatewayError> {
        if image.is_none() && text.is_none() {
            return Err(GatewayError::InvalidResponse(
                "a comment needs an image or a message".to_string(),
            ));
        }

        let mut form = Form::new();
        if let Some((bytes, filename)) = image {
            form = form.part(
                "source",
                Part::bytes(bytes)
                    .file_name(filename)
                    .mime_str("image/jpeg")
                    .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?,
            );
        }
        // An empty message string makes the Graph API reject the request
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            form = form.text("message", text);
        }

        let response = self
            .client
            .post(self.url(object_id, Some("comments")))
            .query(&[("access_token", self.access_token.as_str()), ("format", "json")])
            .multipart(form)
            .send()
            .await?;

        let parsed: GraphCommentResponse = Self::parse_success(response).await?;
        debug!(comment_id = %parsed.id, "Comment posted");
        Ok(parsed.id)
    }

    #[instrument(skip(self))]
    async fn reaction_count(&self, post_id: &str) -> Result<u64, GatewayError> {
        let response = self
            .client
            .get(self.url(post_id, None))
            .query(&[
                ("access_token", self.access_token.as_str()),
                ("format", "json"),
                ("fields", "reactions.summary(total_count)"),
            ])
            .send()
            .await?;

        let parsed: GraphReactionsResponse = Self::parse_success(response).await?;
        Ok(parsed.reactions.summary.total_count)
    }

    #[instrument(skip(self))]
    async fn list_album_media(&self, album_id: &str) -> Result<Vec<AlbumMedia>, GatewayError> {
        let response = self
            .client
            .get(self.url(album_id, Some("photos")))
            .query(&[
                ("access_token", self.access_token.as_str()),
                ("format", "json"),
                ("fields", "id,name"),
            ])
            .send()
            .await?;

        let parsed: GraphAlbumPhotosResponse = Self::parse_success(response).await?;
        if parsed.data.is_empty() {
            warn!(album_id = %album_id, "Album listing returned no media");
        }

        Ok(parsed
            .data
            .into_iter()
            .map(|photo| AlbumMedia {
                id: photo.id,
                caption: photo.name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn gateway_for(server: &MockServer) -> FacebookGateway {
        FacebookGateway::new(&FacebookConfig {
            page_id: "page-1".to_string(),
            access_token: "token".to_string(),
            base_url: server.uri(),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_post_image_to_page_feed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page-1/photos"))
            .and(query_param("access_token", "token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "photo-9",
                "post_id": "page-1_post-9"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = gateway_for(&server).await;
        let response = gateway
            .post_image(vec![0xff, 0xd8], "1.jpg".to_string(), "caption", None)
            .await
            .unwrap();

        assert_eq!(
            response,
            PostPhotoResponse {
                photo_id: "photo-9".to_string(),
                post_id: "page-1_post-9".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_post_image_to_album_without_post_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/album-7/photos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "photo-3" })))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server).await;
        let response = gateway
            .post_image(
                vec![1, 2, 3],
                "3.jpg".to_string(),
                "best of",
                Some("album-7".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(response.photo_id, "photo-3");
        assert_eq!(response.post_id, "photo-3");
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page-1/photos"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": 4, "message": "Application request limit reached", "type": "OAuthException" }
            })))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server).await;
        let error = gateway
            .post_image(vec![], "1.jpg".to_string(), "caption", None)
            .await
            .unwrap_err();

        assert!(matches!(error, GatewayError::RateLimited));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_expired_token_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page-1/photos"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": 190, "message": "Error validating access token", "type": "OAuthException" }
            })))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server).await;
        let error = gateway
            .post_image(vec![], "1.jpg".to_string(), "caption", None)
            .await
            .unwrap_err();

        assert!(matches!(error, GatewayError::Unauthorized(_)));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_reaction_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/post-5"))
            .and(query_param("fields", "reactions.summary(total_count)"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "reactions": { "data": [], "summary": { "total_count": 42 } }
            })))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server).await;
        assert_eq!(gateway.reaction_count("post-5").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_list_album_media() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/album-7/photos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "id": "photo-1", "name": "Original post: post-1" },
                    { "id": "photo-2" }
                ]
            })))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server).await;
        let media = gateway.list_album_media("album-7").await.unwrap();
        assert_eq!(media.len(), 2);
        assert_eq!(media[0].caption.as_deref(), Some("Original post: post-1"));
        assert!(media[1].caption.is_none());
    }

    #[tokio::test]
    async fn test_unknown_object_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": 100, "message": "Unsupported get request", "type": "GraphMethodException" }
            })))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server).await;
        let error = gateway.reaction_count("gone").await.unwrap_err();
        assert!(matches!(error, GatewayError::NotFound(_)));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_comment_requires_image_or_text() {
        let server = MockServer::start().await;
        let gateway = gateway_for(&server).await;
        assert!(gateway.post_comment("post-1", None, None).await.is_err());
    }
}
