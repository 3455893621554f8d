//! Remote diary service client.
//!
//! The export pipeline only talks to the service through [`DiaryService`], so
//! it can run against the real HTTP API ([`HttpDiaryClient`]) or an in-memory
//! fake in tests.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AuthError, FetchError};
use crate::images::{DEFAULT_EXTENSION, normalize_extension};
use crate::model::{
    DiariesResponse, DiaryId, DiaryIndex, DiaryRecord, DiarySummary, ImageData, ImageId,
    LoginResponse, Scope, SyncResponse, UserId,
};

/// Identifies the client to the service.
pub const CLIENT_USER_AGENT: &str = "OhApp/3.6.12 Platform/Android";

pub const DEFAULT_API_BASE: &str = "https://nideriji.cn";
pub const DEFAULT_IMAGE_BASE: &str = "https://f.nideriji.cn";

/// Authenticated session, shared read-only by every worker of a run.
#[derive(Clone)]
pub struct Session {
    pub token: String,
    pub user_id: Option<UserId>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Operations the exporter needs from the diary service.
pub trait DiaryService: Sync {
    fn authenticate(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    fn list_diaries(&self, session: &Session, scope: Scope) -> Result<DiaryIndex, FetchError>;

    fn fetch_diary_detail(
        &self,
        session: &Session,
        author: UserId,
        id: &DiaryId,
    ) -> Result<DiaryRecord, FetchError>;

    fn fetch_image(
        &self,
        session: &Session,
        author: UserId,
        id: ImageId,
    ) -> Result<ImageData, FetchError>;
}

// ── Politeness ────────────────────────────────────────────────────────────────

/// Enforces a minimum interval between request starts across all workers.
pub struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Block until the next request may start.
    pub fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        // Holding the lock while sleeping serialises request starts.
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

/// Retry policy for transient fetch failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying transient failures with doubling backoff.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, FetchError>,
    ) -> Result<T, FetchError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    debug!(%what, attempt, error = %e, "retrying after transient failure");
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ── HTTP implementation ───────────────────────────────────────────────────────

/// Endpoints and transport settings for [`HttpDiaryClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: Url,
    pub image_base: Url,
    pub timeout: Duration,
    pub request_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: Url::parse(DEFAULT_API_BASE).expect("default api base is a valid URL"),
            image_base: Url::parse(DEFAULT_IMAGE_BASE).expect("default image base is a valid URL"),
            timeout: Duration::from_secs(15),
            request_interval: Duration::from_millis(100),
        }
    }
}

/// Client for the nideriji HTTP API.
pub struct HttpDiaryClient {
    config: ClientConfig,
    client: Client,
    throttle: Throttle,
}

impl HttpDiaryClient {
    pub fn new(config: ClientConfig) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;
        let throttle = Throttle::new(config.request_interval);
        Ok(Self {
            config,
            client,
            throttle,
        })
    }

    fn api_url(&self, path: &str) -> String {
        join(&self.config.api_base, path)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, FetchError> {
        self.throttle.wait();
        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(response)
    }

    fn post_json<T: DeserializeOwned>(
        &self,
        session: Option<&Session>,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let mut request = self.client.post(self.api_url(path)).form(form);
        if let Some(s) = session {
            request = request.header("auth", format!("token {}", s.token));
        }
        let body = self.send(request)?.text()?;
        serde_json::from_str(&body).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

fn join(base: &Url, path: &str) -> String {
    format!("{}{}", base.as_str().trim_end_matches('/'), path)
}

impl DiaryService for HttpDiaryClient {
    fn authenticate(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        info!("logging in");
        let response: LoginResponse = self
            .post_json(None, "/api/login/", &[("email", email), ("password", password)])
            .map_err(|e| match e {
                FetchError::Transport(inner) => AuthError::Transport(inner),
                FetchError::Malformed(m) => AuthError::Malformed(m),
                other => AuthError::Rejected(other.to_string()),
            })?;

        if response.error != 0 {
            return Err(AuthError::Rejected(format!("error code {}", response.error)));
        }
        let token = response
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Rejected("no token in response".into()))?;

        info!(user_id = ?response.userid.map(|u| u.0), "logged in");
        Ok(Session {
            token,
            user_id: response.userid,
        })
    }

    fn list_diaries(&self, session: &Session, scope: Scope) -> Result<DiaryIndex, FetchError> {
        let response: SyncResponse = self.post_json(
            Some(session),
            "/api/v2/sync/",
            &[
                ("user_config_ts", "0"),
                ("diaries_ts", "0"),
                ("readmark_ts", "0"),
                ("images_ts", "0"),
            ],
        )?;
        if response.error != 0 {
            return Err(FetchError::Api {
                code: response.error,
            });
        }
        index_from_sync(response, scope, session.user_id)
    }

    fn fetch_diary_detail(
        &self,
        session: &Session,
        author: UserId,
        id: &DiaryId,
    ) -> Result<DiaryRecord, FetchError> {
        let path = format!("/api/diary/all_by_ids/{}/", author);
        let response: DiariesResponse =
            self.post_json(Some(session), &path, &[("diary_ids", id.as_str())])?;
        if response.error != 0 {
            return Err(FetchError::Api {
                code: response.error,
            });
        }
        let wire = response
            .diaries
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::Malformed(format!("diary {} missing from response", id)))?;
        DiaryRecord::from_wire(wire, author).map_err(|e| FetchError::Malformed(e.to_string()))
    }

    fn fetch_image(
        &self,
        session: &Session,
        author: UserId,
        id: ImageId,
    ) -> Result<ImageData, FetchError> {
        let url = format!(
            "{}/api/image/{}/{}/",
            self.config.image_base.as_str().trim_end_matches('/'),
            author,
            id
        );
        let request = self
            .client
            .get(url)
            .header("auth", format!("token {}", session.token));
        let response = self.send(request)?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let bytes = response.bytes()?.to_vec();
        let extension = image_extension(&content_type, &bytes)?;
        Ok(ImageData { bytes, extension })
    }
}

/// Turn a sync payload into the index for one account.
pub fn index_from_sync(
    response: SyncResponse,
    scope: Scope,
    own_id: Option<UserId>,
) -> Result<DiaryIndex, FetchError> {
    let config = response.user_config;
    let (wire_summaries, images, author) = match scope {
        Scope::Myself => (
            response.diaries,
            response.images,
            config.as_ref().and_then(|c| c.userid).or(own_id),
        ),
        Scope::Partner => (
            response.diaries_paired,
            response.images_paired,
            config
                .as_ref()
                .and_then(|c| c.paired_user_config.as_ref())
                .and_then(|p| p.userid),
        ),
    };
    let author = author
        .ok_or_else(|| FetchError::Malformed(format!("no user id for {:?} account", scope)))?;

    let mut summaries = Vec::with_capacity(wire_summaries.len());
    for wire in wire_summaries {
        match DiarySummary::try_from(wire) {
            Ok(s) => summaries.push(s),
            Err(e) => warn!(error = %e, "dropping diary from index"),
        }
    }

    Ok(DiaryIndex {
        author,
        summaries,
        image_ids: images.into_iter().map(|i| i.image_id).collect(),
    })
}

/// Pick the file extension for an image from its content type or magic
/// bytes, defaulting to JPEG. Always one of [`crate::images::KNOWN_EXTENSIONS`].
/// Fails when the payload is clearly not an image.
pub fn image_extension(content_type: &str, bytes: &[u8]) -> Result<&'static str, FetchError> {
    let declared = if content_type.contains("jpeg") || content_type.contains("jpg") {
        Some("jpg")
    } else if content_type.contains("png") {
        Some("png")
    } else if content_type.contains("gif") {
        Some("gif")
    } else if content_type.contains("webp") {
        Some("webp")
    } else if content_type.contains("heic") || content_type.contains("heif") {
        Some("heic")
    } else if content_type.contains("avif") {
        Some("avif")
    } else if content_type.contains("tiff") {
        Some("tif")
    } else {
        None
    };
    if let Some(ext) = declared {
        return Ok(ext);
    }

    let sniffed = infer::get(bytes).filter(|t| t.matcher_type() == infer::MatcherType::Image);
    match sniffed {
        Some(t) => Ok(normalize_extension(t.extension())),
        None if content_type.is_empty()
            || content_type.starts_with("image/")
            || content_type.starts_with("application/octet-stream") =>
        {
            Ok(DEFAULT_EXTENSION)
        }
        None => Err(FetchError::NotAnImage {
            content_type: content_type.to_string(),
        }),
    }
}
