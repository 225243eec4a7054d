use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::Stream;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::time::sleep;

use crate::config::Settings;
use crate::errors::{AssetError, Result};
use crate::models::Server;
use crate::services::CacheManager;

const API_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
const JITTER_MS: u64 = 250;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..=JITTER_MS);
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

pub(crate) enum Attempt<T> {
    Success(T),
    NotFound,
    Retryable(AssetError),
    Fatal(AssetError),
}

/// Shared retry loop: attempts = retries + 1, capped exponential backoff
/// plus jitter between retryable failures. `Ok(None)` reports a tolerated
/// 404; fatal outcomes and exhausted retries surface the final error.
pub(crate) async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let attempts = policy.attempts();
    let mut tries = 0u32;
    loop {
        match attempt().await {
            Attempt::Success(value) => return Ok(Some(value)),
            Attempt::NotFound => return Ok(None),
            Attempt::Fatal(err) => return Err(err),
            Attempt::Retryable(err) => {
                tries += 1;
                if tries >= attempts {
                    return Err(err);
                }
                let delay = policy.delay_for(tries - 1);
                tracing::debug!(
                    "retrying in {}ms [attempt {}/{}]: {}",
                    delay.as_millis(),
                    tries,
                    attempts,
                    err
                );
                sleep(delay).await;
            }
        }
    }
}

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// A lazy, finite, non-restartable sequence of byte chunks. The underlying
/// connection is closed exactly once when the stream is exhausted or
/// dropped, whichever comes first.
pub struct DownloadStream {
    inner: ChunkStream,
    total: Option<u64>,
}

impl DownloadStream {
    pub(crate) fn from_chunks(chunks: Vec<Vec<u8>>, total: Option<u64>) -> Self {
        let items: Vec<Result<Vec<u8>>> = chunks.into_iter().map(Ok).collect();
        Self {
            inner: Box::pin(futures_util::stream::iter(items)),
            total,
        }
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.inner.next().await.transpose()
    }
}

pub enum DownloadOpen {
    Stream(DownloadStream),
    NotFound,
}

/// HTTP client over the remote content-delivery API. All network I/O in the
/// crate funnels through here so retry and backoff policy stay out of the
/// callers.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    api_base: String,
    asset_base: String,
    server: Server,
    cache: Option<CacheManager>,
    json_ttl: Duration,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(settings: &Settings, cache: Option<CacheManager>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            asset_base: settings.asset_base.trim_end_matches('/').to_string(),
            server: settings.server,
            cache,
            json_ttl: settings.json_ttl(),
            retry: RetryPolicy {
                retries: settings.retries,
                backoff_base: settings.backoff_base(),
            },
        }
    }

    pub fn server(&self) -> Server {
        self.server
    }

    pub fn character_roster_url(&self) -> String {
        format!("{}/live2d/characters", self.api_base)
    }

    pub fn character_detail_url(&self, id: u32) -> String {
        format!("{}/live2d/characters/{}", self.api_base, id)
    }

    pub fn asset_index_url(&self) -> String {
        format!("{}/live2d/assets/index", self.api_base)
    }

    pub fn costume_index_url(&self) -> String {
        format!("{}/live2d/costumes", self.api_base)
    }

    pub fn build_metadata_url(&self, bundle: &str) -> String {
        format!("{}/live2d/costumes/{}/build", self.api_base, bundle)
    }

    pub fn costume_icon_url(&self, id: u32) -> String {
        format!("{}/{}/icons/{}.png", self.asset_base, self.server.slug(), id)
    }

    /// Deterministic CDN location of one bundled asset file.
    pub fn asset_url(&self, bundle: &str, file: &str) -> String {
        format!(
            "{}/{}/{}_rip/{}",
            self.asset_base,
            self.server.slug(),
            bundle,
            urlencoding::encode(file)
        )
    }

    /// GET a JSON document, reading through the TTL cache when a cache key
    /// is supplied and caching is enabled.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        cache_key: Option<&str>,
    ) -> Result<T> {
        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            if let Some(hit) = cache.read_expiring_json::<T>(key, self.json_ttl)? {
                tracing::debug!("api json cache hit key={}", key);
                return Ok(hit);
            }
        }

        let response = self.send_required(url, API_TIMEOUT).await?;
        let value = response
            .json::<serde_json::Value>()
            .await
            .map_err(AssetError::Network)?;
        let typed: T = serde_json::from_value(value.clone())?;

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            cache.write_expiring_json(key, &value)?;
        }
        Ok(typed)
    }

    /// GET a small binary document (costume icons). Cached entries never
    /// expire; the remote treats them as immutable.
    pub async fn get_bytes(&self, url: &str, cache_key: Option<&str>) -> Result<Vec<u8>> {
        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            if let Some(hit) = cache.read_bytes(key)? {
                tracing::debug!("api bytes cache hit key={}", key);
                return Ok(hit);
            }
        }

        let response = self.send_required(url, API_TIMEOUT).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(AssetError::Network)?
            .to_vec();

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            cache.write_bytes(key, &bytes)?;
        }
        Ok(bytes)
    }

    /// Open a streaming download. A 404 becomes `NotFound` when the caller
    /// allows it (no retry) and a hard error otherwise.
    pub async fn open_download(&self, url: &str, allow_not_found: bool) -> Result<DownloadOpen> {
        let Some(response) = self
            .send_with_retry(url, allow_not_found, DOWNLOAD_TIMEOUT)
            .await?
        else {
            return Ok(DownloadOpen::NotFound);
        };

        let total = response.content_length();
        let inner = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(AssetError::Network));
        Ok(DownloadOpen::Stream(DownloadStream {
            inner: Box::pin(inner),
            total,
        }))
    }

    async fn send_required(&self, url: &str, timeout: Duration) -> Result<reqwest::Response> {
        match self.send_with_retry(url, false, timeout).await? {
            Some(response) => Ok(response),
            // unreachable: allow_not_found is false above
            None => Err(AssetError::NotFound(url.to_string())),
        }
    }

    async fn send_with_retry(
        &self,
        url: &str,
        allow_not_found: bool,
        timeout: Duration,
    ) -> Result<Option<reqwest::Response>> {
        run_with_retry(&self.retry, || async {
            let result = self.client.get(url).timeout(timeout).send().await;
            classify_response(result, url, allow_not_found)
        })
        .await
    }
}

fn classify_response(
    result: reqwest::Result<reqwest::Response>,
    url: &str,
    allow_not_found: bool,
) -> Attempt<reqwest::Response> {
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            if err.is_timeout() || err.is_connect() {
                return Attempt::Retryable(AssetError::Network(err));
            }
            return Attempt::Fatal(AssetError::Network(err));
        }
    };

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        if allow_not_found {
            return Attempt::NotFound;
        }
        return Attempt::Fatal(AssetError::HttpStatus {
            status: 404,
            url: url.to_string(),
        });
    }

    if status.is_success() {
        // CDN edge nodes sometimes answer 200 with an HTML error page.
        if is_html(&response) {
            return Attempt::Retryable(AssetError::Http(format!(
                "disguised HTML error page from {url}"
            )));
        }
        return Attempt::Success(response);
    }

    let err = AssetError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    };
    if is_retryable_status(status.as_u16()) {
        Attempt::Retryable(err)
    } else {
        Attempt::Fatal(err)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_html(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_start().starts_with("text/html"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("l2d-api-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn test_settings(base: &str, retries: u32) -> Settings {
        Settings {
            api_base: base.to_string(),
            asset_base: base.to_string(),
            retries,
            backoff_base_ms: 1,
            ..Settings::default()
        }
    }

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            backoff_base: Duration::from_millis(1),
        }
    }

    #[test]
    fn retryable_status_set_matches_policy() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [400, 401, 403, 404, 418] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }

    #[tokio::test]
    async fn two_rate_limits_then_success_takes_three_attempts() {
        let calls = AtomicUsize::new(0);
        let result = run_with_retry(&fast_policy(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Attempt::Retryable(AssetError::HttpStatus {
                        status: 429,
                        url: "x".to_string(),
                    })
                } else {
                    Attempt::Success(n)
                }
            }
        })
        .await
        .expect("should succeed");
        assert_eq!(result, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_server_errors_exhaust_all_attempts() {
        let calls = AtomicUsize::new(0);
        let err = run_with_retry::<(), _, _>(&fast_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Attempt::Retryable(AssetError::HttpStatus {
                    status: 500,
                    url: "x".to_string(),
                })
            }
        })
        .await
        .expect_err("should exhaust");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.http_status(), Some(500));
    }

    #[tokio::test]
    async fn not_found_short_circuits_without_retry() {
        let calls = AtomicUsize::new(0);
        let result = run_with_retry::<(), _, _>(&fast_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Attempt::NotFound }
        })
        .await
        .expect("tolerated absence");
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn asset_url_uses_server_and_rip_suffix() {
        let client = ApiClient::new(
            &Settings {
                asset_base: "https://assets.live2d-models.net".to_string(),
                ..Settings::default()
            },
            None,
        );
        assert_eq!(
            client.asset_url("036_general", "angry01.mtn"),
            "https://assets.live2d-models.net/jp/036_general_rip/angry01.mtn"
        );
    }

    #[tokio::test]
    async fn optional_404_returns_not_found_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/jp/036_general_rip/missing.mtn");
                then.status(404);
            })
            .await;

        let client = ApiClient::new(&test_settings(&server.base_url(), 3), None);
        let opened = client
            .open_download(&server.url("/jp/036_general_rip/missing.mtn"), true)
            .await
            .expect("tolerated 404");
        assert!(matches!(opened, DownloadOpen::NotFound));
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn required_404_raises_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/gone");
                then.status(404);
            })
            .await;

        let client = ApiClient::new(&test_settings(&server.base_url(), 3), None);
        let err = client
            .open_download(&server.url("/gone"), false)
            .await
            .expect_err("hard 404");
        assert_eq!(err.http_status(), Some(404));
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn persistent_500_uses_retries_plus_one_requests() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/broken");
                then.status(500);
            })
            .await;

        let client = ApiClient::new(&test_settings(&server.base_url(), 3), None);
        let err = client
            .open_download(&server.url("/broken"), false)
            .await
            .expect_err("exhausted");
        assert_eq!(err.http_status(), Some(500));
        assert_eq!(mock.hits_async().await, 4);
    }

    #[tokio::test]
    async fn html_200_is_treated_as_an_error_page() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/edge");
                then.status(200)
                    .header("content-type", "text/html; charset=utf-8")
                    .body("<html>maintenance</html>");
            })
            .await;

        let client = ApiClient::new(&test_settings(&server.base_url(), 1), None);
        let err = client
            .open_download(&server.url("/edge"), false)
            .await
            .expect_err("html page is not data");
        assert!(matches!(err, AssetError::Http(_)));
        assert_eq!(mock.hits_async().await, 2);
    }

    #[tokio::test]
    async fn open_download_streams_full_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/jp/036_general_rip/angry01.mtn");
                then.status(200).body(b"motion-bytes");
            })
            .await;

        let client = ApiClient::new(&test_settings(&server.base_url(), 0), None);
        let opened = client
            .open_download(&server.url("/jp/036_general_rip/angry01.mtn"), false)
            .await
            .expect("open");
        let DownloadOpen::Stream(mut stream) = opened else {
            panic!("expected stream");
        };
        assert_eq!(stream.total_bytes(), Some(12));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.expect("chunk") {
            data.extend_from_slice(&chunk);
        }
        assert_eq!(data, b"motion-bytes");
    }

    #[tokio::test]
    async fn get_json_writes_through_the_ttl_cache() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/live2d/costumes");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"[{"name":"036_1","id":9001,"event":false}]"#);
            })
            .await;

        let cache = CacheManager::new(temp_dir()).expect("cache");
        let client = ApiClient::new(&test_settings(&server.base_url(), 0), Some(cache));

        let first: serde_json::Value = client
            .get_json(&client.costume_index_url(), Some("costume_index"))
            .await
            .expect("first fetch");
        let second: serde_json::Value = client
            .get_json(&client.costume_index_url(), Some("costume_index"))
            .await
            .expect("cached fetch");

        assert_eq!(first, second);
        assert_eq!(mock.hits_async().await, 1);
    }
}
