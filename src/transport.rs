use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    cookie::{CookieStore, Jar},
    multipart::{Form, Part},
    Client, Method, Url,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::credentials::{Credential, CredentialStore};
use crate::error::{ApiError, TransportError};
use crate::refresh::{RefreshCoordinator, SessionBackend};
use crate::session::SessionSignal;
use crate::types::AuthResponse;

pub const REFRESH_PATH: &str = "/users/refresh-token";

#[derive(Debug, Clone)]
pub struct FileUpload {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct MultipartBody {
    pub fields: Vec<(String, String)>,
    pub file: Option<FileUpload>,
}

impl MultipartBody {
    fn into_form(self) -> Result<Form, TransportError> {
        let mut form = Form::new();
        for (name, value) in self.fields {
            form = form.text(name, value);
        }
        if let Some(file) = self.file {
            let part = Part::bytes(file.bytes.to_vec())
                .file_name(file.file_name)
                .mime_str(&file.mime)?;
            form = form.part(file.field, part);
        }
        Ok(form)
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(MultipartBody),
}

/// A request as issued by callers, before any header is attached. Cloneable
/// so it can be replayed after a credential refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub authenticated: bool,
    pub is_refresh: bool,
    pub retried: bool,
    pub(crate) sent_with: Option<Credential>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            authenticated: true,
            is_refresh: false,
            retried: false,
            sent_with: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Flattens a serializable object into query pairs. Null fields are skipped.
    pub fn query<P: Serialize + ?Sized>(mut self, params: &P) -> Result<Self, ApiError> {
        match serde_json::to_value(params)? {
            Value::Object(map) => {
                for (name, value) in map {
                    match value {
                        Value::Null => {}
                        Value::String(s) => self.query.push((name, s)),
                        other => self.query.push((name, other.to_string())),
                    }
                }
                Ok(self)
            }
            Value::Null => Ok(self),
            other => Err(TransportError::InvalidRequest(format!(
                "query parameters must be an object, got {other}"
            ))
            .into()),
        }
    }

    pub fn multipart(mut self, body: MultipartBody) -> Self {
        self.body = RequestBody::Multipart(body);
        self
    }

    /// Login and registration: no credential required, and a 401 is a plain
    /// rejection rather than an expired session.
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    fn for_refresh(mut self) -> Self {
        self.authenticated = false;
        self.is_refresh = true;
        self
    }

    /// Credential attached the last time this request was dispatched.
    pub fn sent_with(&self) -> Option<&Credential> {
        self.sent_with.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the body. An empty body decodes as JSON `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        if self.body.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A request with every outbound header resolved, ready for the network.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl PreparedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError>;

    /// Value of a script-readable cookie set by the API origin.
    fn cookie(&self, name: &str) -> Option<String>;
}

pub struct ReqwestBackend {
    client: Client,
    jar: Arc<Jar>,
    // Cookies are matched by path, so the jar is read at the API root.
    cookie_url: Url,
}

impl ReqwestBackend {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let cookie_url = Url::parse(&config.api_root())
            .map_err(|e| TransportError::InvalidRequest(format!("invalid api url: {e}")))?;
        let jar = Arc::new(Jar::default());
        let client = Client::builder().cookie_provider(jar.clone()).build()?;

        Ok(Self {
            client,
            jar,
            cookie_url,
        })
    }

    pub fn jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    pub fn cookie_url(&self) -> &Url {
        &self.cookie_url
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self.client.request(request.method, &request.url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(body) => builder.multipart(body.into_form()?),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        Ok(ApiResponse { status, body })
    }

    fn cookie(&self, name: &str) -> Option<String> {
        let header = self.jar.cookies(&self.cookie_url)?;
        let raw = header.to_str().ok()?;

        raw.split(';').find_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            (key.trim() == name && !value.is_empty()).then(|| value.trim().to_string())
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub xsrf_cookie: String,
    pub xsrf_header: String,
}

impl TransportSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.api_root(),
            timeout: config.request_timeout(),
            xsrf_cookie: config.xsrf_cookie.clone(),
            xsrf_header: config.xsrf_header.clone(),
        }
    }
}

struct TransportInner {
    backend: Arc<dyn HttpBackend>,
    credentials: Arc<CredentialStore>,
    session: Arc<SessionSignal>,
    refresh: RefreshCoordinator,
    settings: TransportSettings,
}

/// Sends API requests with standard headers, and routes 401s through the
/// refresh coordinator.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<TransportInner>,
}

impl TransportClient {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        credentials: Arc<CredentialStore>,
        session: Arc<SessionSignal>,
        settings: TransportSettings,
    ) -> Self {
        let refresh = RefreshCoordinator::new(credentials.clone(), session.clone());
        Self {
            inner: Arc::new(TransportInner {
                backend,
                credentials,
                session,
                refresh,
                settings,
            }),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.inner.credentials
    }

    pub fn session(&self) -> &Arc<SessionSignal> {
        &self.inner.session
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.inner.refresh
    }

    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.dispatch(&mut request).await?;

        if response.status != 401 || request.is_refresh || !request.authenticated {
            return into_result(response);
        }

        if request.retried {
            self.inner
                .session
                .expire("request rejected after credential refresh");
            return into_result(response);
        }

        debug!(path = %request.path, "unauthorized, handing to refresh coordinator");
        self.inner.refresh.on_unauthorized(self, request).await
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        self.send(request).await?.json()
    }

    /// Exchanges the refresh cookie for a new credential and installs it.
    /// Shares the coordinator with 401 handling, so it never races another
    /// refresh and a failure ends the session.
    pub async fn refresh_credential(&self) -> Result<Credential, ApiError> {
        self.inner.refresh.refresh(self).await
    }

    async fn dispatch(&self, request: &mut ApiRequest) -> Result<ApiResponse, ApiError> {
        let credential = self.inner.credentials.get();
        if request.authenticated && credential.is_none() {
            debug!(path = %request.path, "no credential, request not sent");
            return Err(ApiError::NotAuthenticated);
        }

        let prepared = self.prepare(request, credential.as_ref());
        request.sent_with = credential;

        let timeout = self.inner.settings.timeout;
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.inner.backend.execute(prepared)).await;

        match outcome {
            Ok(Ok(response)) => {
                debug!(
                    method = %request.method,
                    path = %request.path,
                    status = response.status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request completed"
                );
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!(method = %request.method, path = %request.path, error = %e, "request failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(method = %request.method, path = %request.path, ?timeout, "request timed out");
                Err(TransportError::Timeout(timeout).into())
            }
        }
    }

    fn prepare(&self, request: &ApiRequest, credential: Option<&Credential>) -> PreparedRequest {
        let settings = &self.inner.settings;
        let mut headers = Vec::with_capacity(3);

        // Multipart bodies carry their own boundary content type.
        if !matches!(request.body, RequestBody::Multipart(_)) {
            headers.push(("content-type".to_string(), "application/json".to_string()));
        }
        if let Some(token) = self.inner.backend.cookie(&settings.xsrf_cookie) {
            headers.push((settings.xsrf_header.clone(), token));
        }
        if let Some(credential) = credential {
            headers.push(("authorization".to_string(), credential.bearer()));
        }

        PreparedRequest {
            method: request.method.clone(),
            url: format!("{}{}", settings.base_url, request.path),
            query: request.query.clone(),
            headers,
            body: request.body.clone(),
        }
    }
}

#[async_trait]
impl SessionBackend for TransportClient {
    async fn refresh(&self) -> Result<Credential, ApiError> {
        let mut request = ApiRequest::post(REFRESH_PATH).for_refresh();
        let response = into_result(self.dispatch(&mut request).await?)?;
        let auth: AuthResponse = response.json()?;
        Ok(Credential::new(auth.token))
    }

    async fn replay(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        request.retried = true;
        let response = self.dispatch(&mut request).await?;
        if response.status == 401 {
            self.inner
                .session
                .expire("request rejected after credential refresh");
        }
        into_result(response)
    }
}

fn into_result(response: ApiResponse) -> Result<ApiResponse, ApiError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ApiError::from_status(response.status, &response.body))
    }
}
