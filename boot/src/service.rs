//! Token endpoints.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crossframe_transport::FetchError;
use crossframe_types::{Failure, encode_query};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use url::Url;

pub type TokenFut<'a> = Pin<Box<dyn Future<Output = Result<String, Failure>> + Send + 'a>>;

/// Where fresh tokens come from. Both calls yield the raw query-string response.
pub trait TokenService: Send + Sync {
    /// Trade a refresh token for a new access token.
    fn exchange<'a>(&'a self, appkey: &'a str, refresh_token: &'a str) -> TokenFut<'a>;

    /// Ask for a token without user interaction.
    fn request_new<'a>(&'a self, appkey: &'a str) -> TokenFut<'a>;
}

#[derive(Debug, Clone)]
pub struct HttpTokenService {
    client: reqwest::Client,
    exchange: Url,
    query: Url,
}

impl HttpTokenService {
    pub fn new(exchange: Url, query: Url, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            exchange,
            query,
        })
    }

    async fn get_text(&self, base: &Url, params: Map<String, Value>) -> Result<String, Failure> {
        let mut url = base.clone();
        url.set_query(Some(&encode_query(&params)));

        let response = self.client.get(url).send().await.map_err(|e| {
            tracing::warn!("token request to {base} failed: {e}");
            Failure::network(e.to_string())
        })?;
        let status = response.status();
        if status != StatusCode::OK {
            let reason = status.canonical_reason().unwrap_or_default();
            return Err(Failure::from_remote(i64::from(status.as_u16()), reason));
        }
        response
            .text()
            .await
            .map_err(|e| Failure::network(e.to_string()))
    }
}

impl TokenService for HttpTokenService {
    fn exchange<'a>(&'a self, appkey: &'a str, refresh_token: &'a str) -> TokenFut<'a> {
        let params = query(&[
            ("grant_type", "refresh_token"),
            ("client_id", appkey),
            ("refresh_token", refresh_token),
        ]);
        Box::pin(self.get_text(&self.exchange, params))
    }

    fn request_new<'a>(&'a self, appkey: &'a str) -> TokenFut<'a> {
        let params = query(&[
            ("response_type", "token"),
            ("client_id", appkey),
            ("scope", "all"),
            ("state", "1"),
        ]);
        Box::pin(self.get_text(&self.query, params))
    }
}

fn query(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), Value::from(*value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn service(server: &MockServer) -> HttpTokenService {
        let base = Url::parse(&server.uri()).unwrap();
        HttpTokenService::new(
            base.join("/oauth2/access_token").unwrap(),
            base.join("/oauth2/query_token").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn exchange_sends_refresh_grant() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth2/access_token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(query_param("client_id", "801000"))
            .and(query_param("refresh_token", "r1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("access_token=abc"))
            .mount(&server)
            .await;

        let text = service(&server).exchange("801000", "r1").await.unwrap();
        assert_eq!(text, "access_token=abc");
    }

    #[tokio::test]
    async fn request_new_queries_silently() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth2/query_token"))
            .and(query_param("response_type", "token"))
            .and(query_param("state", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("error=not_login"))
            .mount(&server)
            .await;

        let text = service(&server).request_new("801000").await.unwrap();
        assert_eq!(text, "error=not_login");
    }

    #[tokio::test]
    async fn missing_endpoint_is_remote_failure() {
        let server = MockServer::start().await;
        let failure = service(&server).request_new("1").await.unwrap_err();
        assert_eq!(failure.pair(), (404, "Not Found"));
    }
}
