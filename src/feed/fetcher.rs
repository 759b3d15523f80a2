use async_trait::async_trait;
use encoding_rs::Encoding;
use futures::StreamExt;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while downloading a feed document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// 2xx response whose body is empty or whitespace
    #[error("Response body is empty")]
    EmptyBody,
}

/// Source of raw feed documents.
///
/// The refresh pipeline only needs "URL in, full body out".
#[async_trait]
pub trait Transport: Send + Sync {
    /// Return the complete response body as text.
    ///
    /// # Errors
    /// Any failure, including an empty body, is an error: there is no
    /// partial-content result.
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// [`Transport`] over `reqwest`.
///
/// - Each attempt is bounded by the request timeout
/// - HTTP 429, 5xx and truncated bodies are retried with exponential backoff, up to 3 retries
/// - Response bodies are limited to 10MB to prevent memory exhaustion
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
    retry_base_delay: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        // PERF-019: Connection pooling and keepalive across a cycle's feeds
        let client = reqwest::Client::builder()
            .user_agent(concat!("feedkeeper/", env!("CARGO_PKG_VERSION")))
            .redirect(create_redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_client(client, timeout))
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            retry_base_delay: Duration::from_secs(1),
        }
    }

    /// First backoff delay; later retries double it (1s, 2s, 4s by default).
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        self.retry_base_delay * 2u32.pow(retry_count)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::with_client(reqwest::Client::new(), DEFAULT_REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let mut retry_count = 0;

        let (bytes, content_type) = loop {
            let response = tokio::time::timeout(self.timeout, self.client.get(url).send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            // EDGE-004: Handle rate limiting with exponential backoff
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::RateLimited(MAX_RETRIES));
                }

                let delay = self.backoff(retry_count);
                tracing::warn!(
                    url = %url,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if response.status().is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::HttpStatus(response.status().as_u16()));
                }

                let delay = self.backoff(retry_count);
                tracing::warn!(
                    url = %url,
                    status = %response.status(),
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Server error, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // EDGE-002: 4xx errors fail immediately
            if !response.status().is_success() {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);

            let body = tokio::time::timeout(self.timeout, read_limited_bytes(response, MAX_FEED_SIZE))
                .await
                .map_err(|_| FetchError::Timeout)?;
            match body {
                Ok(bytes) => break (bytes, content_type),
                Err(FetchError::IncompleteResponse { expected, received }) => {
                    // EDGE-005: Handle incomplete downloads with retry and exponential backoff
                    if retry_count >= MAX_RETRIES {
                        return Err(FetchError::IncompleteResponse { expected, received });
                    }

                    let delay = self.backoff(retry_count);
                    tracing::debug!(
                        url = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        let text = decode_body(&bytes, content_type.as_deref());
        if text.trim().is_empty() {
            return Err(FetchError::EmptyBody);
        }

        tracing::debug!(url = %url, bytes = bytes.len(), retries = retry_count, "Fetched feed");
        Ok(text)
    }
}

/// Decode a feed body to text.
///
/// The encoding is taken from the `Content-Type` charset, then from the XML
/// declaration, and defaults to UTF-8. A byte-order mark overrides both.
/// Malformed sequences become U+FFFD.
fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset_from_content_type)
        .or_else(|| declared_xml_encoding(bytes))
        .unwrap_or(encoding_rs::UTF_8);

    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        tracing::debug!(encoding = used.name(), "Feed body had malformed byte sequences");
    }
    text.into_owned()
}

fn charset_from_content_type(content_type: &str) -> Option<&'static Encoding> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        Encoding::for_label(value.trim().trim_matches('"').as_bytes())
    })
}

/// `encoding="…"` from a leading `<?xml …?>` declaration.
///
/// A declaration readable as ASCII cannot be UTF-16, so UTF-16 labels are ignored.
fn declared_xml_encoding(bytes: &[u8]) -> Option<&'static Encoding> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace())?;
    let prolog = bytes[start..].strip_prefix(b"<?xml")?;
    let end = prolog.windows(2).position(|w| w == b"?>")?;
    let declaration = std::str::from_utf8(&prolog[..end]).ok()?;

    let after_key = &declaration[declaration.find("encoding")? + "encoding".len()..];
    let after_eq = after_key.trim_start().strip_prefix('=')?.trim_start();
    let quote = after_eq.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &after_eq[1..];
    let label = &value[..value.find(quote)?];

    Encoding::for_label(label.as_bytes())
        .filter(|encoding| *encoding != encoding_rs::UTF_16LE && *encoding != encoding_rs::UTF_16BE)
}

fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 5 {
            return attempt.error("Too many redirects (max 5)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following feed redirect"
        );
        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // EDGE-005: Fewer bytes than Content-Length means the transfer was cut short
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
