//! Blocking `ureq` transport driven from async code.
//!
//! Every request runs on tokio's blocking pool so several calls can be in
//! flight at once. Nothing here retries.

use std::time::Duration;

use anyhow::Context as _;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde_json::Value;
use ureq::Agent;

use crate::error::OperatorError;

const BODY_EXCERPT_LIMIT: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Clone, Debug)]
pub enum Body {
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::Patch, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn basic_auth(self, user: &str, password: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        self.header("Authorization", format!("Basic {encoded}"))
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    pub fn form<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Some(Body::Form(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        ));
        self
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub method: Method,
    pub url: String,
    pub status: u16,
    pub location: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn error_for_status(self) -> Result<Self, OperatorError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(OperatorError::HttpStatus {
            method: self.method.as_str(),
            url: self.url,
            status: self.status,
            body: excerpt(&self.body),
        })
    }

    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_str(&self.body).with_context(|| {
            format!(
                "{} {} returned an unexpected body: {}",
                self.method.as_str(),
                self.url,
                excerpt(&self.body)
            )
        })
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(BODY_EXCERPT_LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[derive(Clone)]
pub struct HttpClient {
    agent: Agent,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: config.into(),
        }
    }

    /// Send `request` and return the response whatever its status.
    pub async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let agent = self.agent.clone();
        tracing::debug!(method = request.method.as_str(), url = %request.url, "http request");
        let response = tokio::task::spawn_blocking(move || send_blocking(&agent, request))
            .await
            .context("http worker stopped unexpectedly")??;
        tracing::debug!(
            method = response.method.as_str(),
            url = %response.url,
            status = response.status,
            "http response"
        );
        Ok(response)
    }

    /// Send `request` and fail on any non-2xx status.
    pub async fn send_ok(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        Ok(self.send(request).await?.error_for_status()?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, token: &str) -> anyhow::Result<T> {
        self.send_ok(HttpRequest::get(url).bearer(token))
            .await?
            .json()
    }
}

fn send_blocking(agent: &Agent, request: HttpRequest) -> Result<HttpResponse, OperatorError> {
    let HttpRequest {
        method,
        url,
        headers,
        body,
    } = request;
    let transport_error = |err: ureq::Error| OperatorError::HttpTransport {
        method: method.as_str(),
        url: url.clone(),
        reason: err.to_string(),
    };

    let result = match method {
        Method::Get => with_headers(agent.get(&url), &headers).call(),
        Method::Delete => with_headers(agent.delete(&url), &headers).call(),
        Method::Post | Method::Put | Method::Patch => {
            let builder = match method {
                Method::Post => agent.post(&url),
                Method::Put => agent.put(&url),
                _ => agent.patch(&url),
            };
            let builder = with_headers(builder, &headers);
            match &body {
                Some(Body::Json(value)) => builder.send_json(value),
                Some(Body::Form(pairs)) => builder.send_form(
                    pairs
                        .iter()
                        .map(|(key, value)| (key.as_str(), value.as_str())),
                ),
                None => builder.send_empty(),
            }
        }
    };
    let mut response = result.map_err(transport_error)?;

    let status = response.status().as_u16();
    let location = response
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let text = response
        .body_mut()
        .read_to_string()
        .map_err(transport_error)?;
    Ok(HttpResponse {
        method,
        url,
        status,
        location,
        body: text,
    })
}

fn with_headers<B>(
    mut builder: ureq::RequestBuilder<B>,
    headers: &[(String, String)],
) -> ureq::RequestBuilder<B> {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            method: Method::Get,
            url: "https://api.example.com/v3/apps".to_string(),
            status,
            location: None,
            body: body.to_string(),
        }
    }

    #[test]
    fn non_success_status_maps_to_typed_error() {
        let err = response(404, "not found").error_for_status().unwrap_err();
        assert_eq!(
            err.to_string(),
            "GET https://api.example.com/v3/apps failed with status 404: not found"
        );
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(BODY_EXCERPT_LIMIT + 50);
        let err = response(500, &body).error_for_status().unwrap_err();
        match err {
            OperatorError::HttpStatus { body, .. } => {
                assert_eq!(body.len(), BODY_EXCERPT_LIMIT + 3);
                assert!(body.ends_with("..."));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn json_errors_mention_the_endpoint() {
        let err = response(200, "<html>").json::<Value>().unwrap_err();
        assert!(err.to_string().contains("/v3/apps returned an unexpected body"));
    }

    #[test]
    fn basic_auth_header_is_base64_encoded() {
        let request = HttpRequest::post("https://uaa.example.com/oauth/token")
            .basic_auth("client", "secret");
        assert_eq!(
            request.headers,
            vec![(
                "Authorization".to_string(),
                "Basic Y2xpZW50OnNlY3JldA==".to_string()
            )]
        );
    }
}
