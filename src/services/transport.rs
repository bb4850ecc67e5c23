// HTTP seam for the login handshake.
//
// The authentication client only talks to `AuthTransport`, so tests can script
// responses without a network and the real client stays a thin reqwest wrapper.

use indexmap::IndexMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::models::Secret;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone)]
pub enum RequestBody {
    Empty,
    /// `application/x-www-form-urlencoded`; values may be credentials
    Form(Vec<(String, Secret)>),
    Text(String),
}

#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post(url: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Value of a form field, for assertions in tests and fakes
    pub fn form_value(&self, name: &str) -> Option<&str> {
        match &self.body {
            RequestBody::Form(fields) => fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.expose()),
            _ => None,
        }
    }
}

// Only method and URL: bodies may hold passwords
impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: IndexMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: IndexMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// Network-level failure. HTTP error statuses are *not* transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("could not connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
}

pub trait AuthTransport {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}

/// [`AuthTransport`] backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// The login servers are slow; the per-request timeout should be generous.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request {
                url: String::new(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }

    /// The underlying client, for sharing its connection pool
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl AuthTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url.clone();

        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => {
                let pairs: Vec<(&str, &str)> = fields
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.expose()))
                    .collect();
                builder.form(&pairs)
            }
            RequestBody::Text(text) => builder.body(text.clone()),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&url, e))?;

        tracing::debug!("{} {} -> HTTP {}", method_name(request.method), url, status);

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn method_name(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Post => "POST",
    }
}

fn classify_reqwest_error(url: &str, error: reqwest::Error) -> TransportError {
    let url = url.to_string();
    if error.is_timeout() {
        TransportError::Timeout { url }
    } else if error.is_connect() {
        TransportError::Connect {
            url,
            message: error.to_string(),
        }
    } else {
        TransportError::Request {
            url,
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_debug_hides_body() {
        let request = HttpRequest::post(
            "https://example.invalid/login",
            RequestBody::Form(vec![("password".to_string(), Secret::new("hunter2"))]),
        );

        let debug = format!("{:?}", request);
        assert!(debug.contains("example.invalid"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(request.form_value("password"), Some("hunter2"));
        assert_eq!(request.form_value("missing"), None);
    }

    #[test]
    fn test_response_headers_case_insensitive() {
        let response = HttpResponse::new(200, "").with_header("X-Patch-Unique-Id", "abc");
        assert_eq!(response.header("x-patch-unique-id"), Some("abc"));
        assert_eq!(response.header("X-PATCH-UNIQUE-ID"), Some("abc"));
        assert!(response.is_success());
        assert!(!HttpResponse::new(503, "").is_success());
        assert!(HttpResponse::new(503, "").is_server_error());
    }
}
