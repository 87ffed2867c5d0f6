//! HTTP Client Pool: one shared pool keyed by host, with UA
//! rotation, bounded outbound concurrency, and retry-with-backoff.
//!
//! Grounded in the teacher's `updater/native/request.rs` (a `governor`-keyed
//! rate limiter plus a bounce-on-429 retry loop against one hardcoded host),
//! generalized from a single host and `reqwest::blocking` to an arbitrary
//! per-[`crate::rule::Rule`] host on the async `reqwest::Client`, the way the
//! teacher's own `src/epub.rs` already calls `reqwest::Client` async.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use rand::Rng;
use reqwest::{Client, StatusCode};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{EngineError, Result};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

const MAX_ATTEMPTS: u32 = 3;
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

struct Inner {
    client: Client,
    semaphore: Semaphore,
    per_host_limiter: DefaultKeyedRateLimiter<String>,
}

/// Cheap to clone: every field is `Arc`-backed or cloned by reference
/// internally (matches the rest of the crate's "handles, not singletons"
/// policy — handles, not singletons).
#[derive(Clone)]
pub struct HttpClientPool {
    inner: Arc<Inner>,
}

impl HttpClientPool {
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|_| Client::new());

        let per_host_limiter = RateLimiter::keyed(
            Quota::per_second(NonZeroU32::new(4).unwrap_or(NonZeroU32::MIN))
                .allow_burst(NonZeroU32::new(2).unwrap_or(NonZeroU32::MIN)),
        );

        Self {
            inner: Arc::new(Inner {
                client,
                semaphore: Semaphore::new(concurrency.max(1)),
                per_host_limiter,
            }),
        }
    }

    /// Fetches `url` and decodes the body with `encoding` (falling back to
    /// UTF-8, then a `<meta charset>` sniff), applying the full retry and
    /// scheme-fallback policy.
    pub async fn get_text(&self, url: &str, encoding: Option<&str>) -> Result<String> {
        let bytes = self.fetch(Method::Get, url, None).await?;
        Ok(decode_body(&bytes, encoding))
    }

    pub async fn post_text(&self, url: &str, body: Option<&str>, encoding: Option<&str>) -> Result<String> {
        let bytes = self.fetch(Method::Post, url, body).await?;
        Ok(decode_body(&bytes, encoding))
    }

    pub async fn get_bytes(&self, url: &str) -> Result<bytes::Bytes> {
        self.fetch(Method::Get, url, None).await
    }

    async fn fetch(&self, method: Method, url: &str, body: Option<&str>) -> Result<bytes::Bytes> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_default();

        let mut attempt: u32 = 0;
        let mut last_status: Option<u16> = None;
        let mut timeout = Duration::from_secs(20);
        let mut current_url = url.to_owned();
        let mut swapped_scheme_once = false;

        loop {
            attempt += 1;
            let _permit = self.inner.semaphore.acquire().await;
            while self.inner.per_host_limiter.check_key(&host).is_err() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            let outcome = self.send_once(method, &current_url, body, timeout).await;

            match outcome {
                Ok(response) => return Ok(response),
                Err(Retryable::ExhaustScheme) if !swapped_scheme_once => {
                    swapped_scheme_once = true;
                    current_url = swap_scheme(&current_url);
                    continue;
                }
                Err(Retryable::Status(status)) => {
                    last_status = Some(status.as_u16());
                    if !should_retry_status(status) || attempt >= MAX_ATTEMPTS {
                        if status.as_u16() == 403
                            || status.as_u16() == 429
                            || (520..=522).contains(&status.as_u16())
                        {
                            return Err(EngineError::SourceBlocked {
                                url: url.to_owned(),
                                status: status.as_u16(),
                            });
                        }
                        return Err(EngineError::Network {
                            url: url.to_owned(),
                            last_status,
                            attempts: attempt,
                        });
                    }
                    self.backoff_for_status(status, attempt).await;
                }
                Err(Retryable::Network) | Err(Retryable::ExhaustScheme) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(EngineError::Network {
                            url: url.to_owned(),
                            last_status,
                            attempts: attempt,
                        });
                    }
                    timeout = timeout.mul_f64(1.5);
                    self.backoff(attempt, 1.0).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&str>,
        timeout: Duration,
    ) -> std::result::Result<bytes::Bytes, Retryable> {
        let user_agent = pick_user_agent();
        let mut builder = match method {
            Method::Get => self.inner.client.get(url),
            Method::Post => self.inner.client.post(url),
        };
        builder = builder
            .timeout(timeout)
            .header("User-Agent", user_agent)
            .header("Accept", "text/html,*/*;q=0.8")
            .header("Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8");
        if let Some(body) = body {
            builder = builder.body(body.to_owned());
        }

        let response = builder.send().await.map_err(classify_send_error)?;
        let status = response.status();
        if status.is_success() {
            response.bytes().await.map_err(|_| Retryable::Network)
        } else {
            Err(Retryable::Status(status))
        }
    }

    async fn backoff_for_status(&self, status: StatusCode, attempt: u32) {
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.backoff(attempt, 1.0).await;
        } else if status.is_server_error() || (520..=522).contains(&status.as_u16()) {
            self.backoff(attempt, 5.0).await;
        } else {
            self.backoff(attempt, 1.0).await;
        }
    }

    async fn backoff(&self, attempt: u32, base_secs: f64) {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.5);
        let secs = base_secs * 2f64.powi(attempt as i32 - 1) * (1.0 + jitter);
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}

enum Retryable {
    Network,
    Status(StatusCode),
    /// Connection-level failure that looks like a scheme mismatch (e.g.
    /// "protocol not supported" or a handshake failure) — tried once with
    /// the other scheme once, never by rewriting source strings.
    ExhaustScheme,
}

fn classify_send_error(err: reqwest::Error) -> Retryable {
    if err.is_connect() {
        Retryable::ExhaustScheme
    } else {
        Retryable::Network
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || (520..=522).contains(&status.as_u16())
}

fn swap_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("http://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("https://{rest}")
    } else {
        url.to_owned()
    }
}

fn pick_user_agent() -> &'static str {
    let idx = rand::thread_rng().gen_range(0..USER_AGENTS.len());
    USER_AGENTS[idx]
}

/// Decodes a response body with the rule's encoding (GBK, Big5, etc., via
/// `encoding_rs`), falling back to a `<meta charset>` sniff, then lossy
/// UTF-8.
fn decode_body(bytes: &[u8], encoding: Option<&str>) -> String {
    if let Some(enc) = encoding {
        if let Some(encoding) = encoding_rs::Encoding::for_label(enc.as_bytes()) {
            return encoding.decode(bytes).0.into_owned();
        }
    }
    if let Some(sniffed) = sniff_meta_charset(bytes) {
        if let Some(encoding) = encoding_rs::Encoding::for_label(sniffed.as_bytes()) {
            return encoding.decode(bytes).0.into_owned();
        }
    }
    String::from_utf8_lossy(bytes).into_owned()
}

fn sniff_meta_charset(bytes: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(2048)]);
    let re = regex::Regex::new(r#"(?i)charset\s*=\s*["']?([a-zA-Z0-9_-]+)"#).ok()?;
    re.captures(&head).map(|c| c[1].to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_scheme_flips_http_and_https() {
        assert_eq!(swap_scheme("https://a.example.com/x"), "http://a.example.com/x");
        assert_eq!(swap_scheme("http://a.example.com/x"), "https://a.example.com/x");
    }

    #[test]
    fn should_retry_status_covers_429_5xx_and_cloudflare() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(should_retry_status(StatusCode::from_u16(521).unwrap()));
        assert!(!should_retry_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn decode_body_defaults_to_utf8() {
        let text = decode_body("héllo".as_bytes(), Some("UTF-8"));
        assert_eq!(text, "héllo");
    }

    #[test]
    fn decode_body_honors_gbk_encoding() {
        let (bytes, _, had_errors) = encoding_rs::GBK.encode("你好");
        assert!(!had_errors);
        assert_eq!(decode_body(&bytes, Some("GBK")), "你好");
    }

    #[test]
    fn sniff_meta_charset_finds_declared_charset() {
        let html = br#"<html><head><meta charset="utf-8"></head></html>"#;
        assert_eq!(sniff_meta_charset(html).as_deref(), Some("utf-8"));
    }

    #[tokio::test(start_paused = true)]
    async fn get_text_succeeds_on_first_attempt() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/book/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let pool = HttpClientPool::new(5);
        let text = pool.get_text(&format!("{}/book/1", server.uri()), Some("UTF-8")).await.unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_retries_a_server_error_then_succeeds() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
            .mount(&server)
            .await;

        let pool = HttpClientPool::new(5);
        let text = pool.get_text(&format!("{}/flaky", server.uri()), None).await.unwrap();
        assert_eq!(text, "recovered");
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_maps_429_to_source_blocked_after_exhausting_retries() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let pool = HttpClientPool::new(5);
        let err = pool.get_text(&format!("{}/limited", server.uri()), None).await.unwrap_err();
        assert!(matches!(err, EngineError::SourceBlocked { status: 429, .. }));
    }
}
