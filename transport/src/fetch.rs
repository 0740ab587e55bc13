//! HTTP access to the API from the relay document.

use std::time::Duration;

use crossframe_types::{ApiRequest, Failure, HttpMethod, ResponseBody, encode_query};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::page::{ApiFetcher, FetchFut, FetchedResponse};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Legacy user agents report 204 as 1223.
const IE_NO_CONTENT: u16 = 1223;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// URL and body for `request` against `api_base`.
///
/// GET carries the encoded parameters in the query string and has no body;
/// POST sends them as a form body.
#[must_use]
pub fn request_target(api_base: &str, request: &ApiRequest) -> (String, String) {
    let mut url = format!("{}{}", api_base.trim_end_matches('/'), request.api);
    let data = encode_query(&request.params);
    match request.method {
        HttpMethod::Get => {
            if !data.is_empty() {
                url.push('?');
                url.push_str(&data);
            }
            (url, String::new())
        }
        HttpMethod::Post => (url, data),
    }
}

/// Map the status a user agent reports to the one callers see.
#[must_use]
pub fn normalize_status(status: u16) -> u16 {
    if status == IE_NO_CONTENT { 204 } else { status }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    api_base: String,
}

impl HttpFetcher {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.into(),
        })
    }

    async fn send(&self, request: &ApiRequest) -> Result<FetchedResponse, Failure> {
        let (url, data) = request_target(&self.api_base, request);
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self
                .client
                .post(&url)
                .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
                .body(data),
        };

        let response = builder.send().await.map_err(|e| {
            tracing::warn!("request to {url} failed: {e}");
            Failure::network(e.to_string())
        })?;

        let status = normalize_status(response.status().as_u16());
        let status_text = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_string();
        let headers = headers_json(response.headers());

        let text = response
            .text()
            .await
            .map_err(|e| Failure::network(e.to_string()))?;
        let body = if status == 200 {
            ResponseBody::from_text(text, request.format)
                .map_err(|e| Failure::network(format!("parse error: {e}")))?
        } else {
            // Error pages are often not in the requested format.
            ResponseBody::from_text(text.clone(), request.format)
                .unwrap_or(ResponseBody::Text(text))
        };

        Ok(FetchedResponse {
            status: i64::from(status),
            status_text,
            body,
            headers,
        })
    }
}

impl ApiFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, request: &'a ApiRequest) -> FetchFut<'a> {
        Box::pin(self.send(request))
    }
}

fn headers_json(headers: &HeaderMap) -> Value {
    let map: Map<String, Value> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::from(v)))
        })
        .collect();
    Value::Object(map)
}
