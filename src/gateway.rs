//! Request gateway
//!
//! The core never talks to the network directly: every call goes through a
//! [`RequestGateway`], which executes one HTTP request, replays cookies and
//! decodes the body according to a hint. [`ReqwestGateway`] is the default
//! implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Desktop browser user agent, the web endpoints reject unknown clients
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_11_3) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/48.0.2564.109 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// How the response body should be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decode {
    Text,
    Json,
    Binary,
}

/// Decoded response body
#[derive(Debug, Clone)]
pub enum Body {
    Text(String),
    Json(serde_json::Value),
    Binary(Bytes),
}

#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub decode: Decode,
    pub timeout: Option<Duration>,
}

impl GatewayRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            body: None,
            decode: Decode::Text,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn decode(mut self, decode: Decode) -> Self {
        self.decode = decode;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Value of a query parameter, if present
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    /// Header name (lowercase) -> all values, in arrival order
    pub headers: HashMap<String, Vec<String>>,
    pub body: Body,
}

impl GatewayResponse {
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Append a header value, keeping earlier values of the same name
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header_values("content-type").first().map(String::as_str)
    }

    pub fn into_text(self) -> ClientResult<String> {
        match self.body {
            Body::Text(text) => Ok(text),
            Body::Json(value) => Ok(value.to_string()),
            Body::Binary(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| ClientError::protocol_with("response body is not UTF-8", e)),
        }
    }

    pub fn into_json(self) -> ClientResult<serde_json::Value> {
        match self.body {
            Body::Json(value) => Ok(value),
            Body::Text(text) => serde_json::from_str(&text)
                .map_err(|e| ClientError::protocol_with("response body is not JSON", e)),
            Body::Binary(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ClientError::protocol_with("response body is not JSON", e)),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self.body {
            Body::Binary(bytes) => bytes,
            Body::Text(text) => Bytes::from(text),
            Body::Json(value) => Bytes::from(value.to_string()),
        }
    }
}

/// Executes HTTP requests on behalf of the client
#[async_trait]
pub trait RequestGateway: Send + Sync {
    async fn execute(&self, request: GatewayRequest) -> ClientResult<GatewayResponse>;
}

/// Default gateway backed by reqwest with a persistent cookie store
#[derive(Clone)]
pub struct ReqwestGateway {
    http: Client,
}

impl ReqwestGateway {
    pub fn new(user_agent: &str) -> ClientResult<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .cookie_store(true)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl RequestGateway for ReqwestGateway {
    async fn execute(&self, request: GatewayRequest) -> ClientResult<GatewayResponse> {
        debug!("{:?} {}", request.method, request.url);

        let mut builder = match request.method {
            Method::Get => self.http.get(&request.url),
            Method::Post => self.http.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();

        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_ascii_lowercase())
                    .or_default()
                    .push(value.to_string());
            }
        }

        let body = match request.decode {
            Decode::Binary => Body::Binary(response.bytes().await?),
            Decode::Text => Body::Text(response.text().await?),
            // The server labels JSON as text/plain, decode from the raw text
            Decode::Json => {
                let text = response.text().await?;
                Body::Json(
                    serde_json::from_str(&text)
                        .map_err(|e| ClientError::protocol_with("invalid JSON body", e))?,
                )
            }
        };

        Ok(GatewayResponse {
            status,
            headers,
            body,
        })
    }
}
