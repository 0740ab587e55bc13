//! Wire envelopes exchanged between the host page and the relay document.
//!
//! Host → relay: `{"id": n, "data": [apiPath, params, format, method]}`.
//! Relay → host: `{"id": n, "data": [status, statusText, body, headers, formatHint]}`,
//! or the two-element `[-1, reason]` form when the relay refuses a call.
//!
//! Both are JSON-encoded strings because some `postMessage` implementations only
//! carry strings.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::failure::Failure;
use crate::ids::CorrelationId;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported http method {0:?}")]
    Method(String),
}

/// Representation the caller wants the API body in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResponseFormat {
    #[default]
    Json,
    Xml,
    /// XML transferred as text because XML documents cannot cross the channel.
    XmlText,
    Text,
}

impl ResponseFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
            Self::XmlText => "xmltext",
            Self::Text => "text",
        }
    }

    /// Case-insensitive parse; unrecognized names fall back to plain text.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "xml" => Self::Xml,
            "xmltext" => Self::XmlText,
            _ => Self::Text,
        }
    }

    /// Formats an API call may request; anything else is coerced to JSON.
    #[must_use]
    pub fn for_api_call(name: &str) -> Self {
        match Self::parse(name) {
            Self::Xml => Self::Xml,
            _ => Self::Json,
        }
    }
}

impl fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl HttpMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }

    pub fn parse(name: &str) -> Result<Self, EnvelopeError> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            _ => Err(EnvelopeError::Method(name.to_string())),
        }
    }
}

/// A call against the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub api: String,
    pub params: Map<String, Value>,
    pub format: ResponseFormat,
    pub method: HttpMethod,
}

impl ApiRequest {
    #[must_use]
    pub fn get(api: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            params: Map::new(),
            format: ResponseFormat::Json,
            method: HttpMethod::Get,
        }
    }

    #[must_use]
    pub fn post(api: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(api)
        }
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }
}

/// API body after transport decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Json(Value),
    /// XML document text. Bodies tagged `"xml"` or `"xmltext"` land here
    /// unvalidated; callers parse them with the XML reader of their choice.
    Xml(String),
    Text(String),
}

impl ResponseBody {
    /// Decode a body as delivered by the relay, guided by the format hint.
    #[must_use]
    pub fn from_wire(body: Value, hint: Option<ResponseFormat>) -> Self {
        match hint {
            Some(ResponseFormat::Xml | ResponseFormat::XmlText) => Self::Xml(value_text(body)),
            Some(ResponseFormat::Text) => Self::Text(value_text(body)),
            Some(ResponseFormat::Json) | None => Self::Json(body),
        }
    }

    /// Decode raw response text into the requested representation.
    pub fn from_text(text: String, format: ResponseFormat) -> Result<Self, serde_json::Error> {
        match format {
            ResponseFormat::Json => serde_json::from_str(&text).map(Self::Json),
            ResponseFormat::Xml | ResponseFormat::XmlText => Ok(Self::Xml(text)),
            ResponseFormat::Text => Ok(Self::Text(text)),
        }
    }

    /// The body as it travels inside a response envelope.
    #[must_use]
    pub fn into_wire(self) -> Value {
        match self {
            Self::Json(value) => value,
            Self::Xml(text) | Self::Text(text) => Value::String(text),
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// An API reply: `(body, headers)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiReply {
    pub body: ResponseBody,
    pub headers: Value,
}

/// Host → relay call envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub id: CorrelationId,
    pub data: (String, Map<String, Value>, String, String),
}

impl CallEnvelope {
    #[must_use]
    pub fn new(id: CorrelationId, request: &ApiRequest) -> Self {
        Self {
            id,
            data: (
                request.api.clone(),
                request.params.clone(),
                request.format.as_str().to_string(),
                request.method.as_str().to_string(),
            ),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    #[must_use]
    pub fn api(&self) -> &str {
        &self.data.0
    }

    /// The call this envelope carries. The format string is kept verbatim so the relay
    /// can tell `xml` apart before rewriting it.
    pub fn request(&self) -> Result<ApiRequest, EnvelopeError> {
        let (api, params, format, method) = &self.data;
        Ok(ApiRequest {
            api: api.clone(),
            params: params.clone(),
            format: ResponseFormat::parse(format),
            method: HttpMethod::parse(method)?,
        })
    }
}

/// Relay → host response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: CorrelationId,
    pub data: Vec<Value>,
}

impl ResponseEnvelope {
    /// Echo a completed HTTP exchange.
    #[must_use]
    pub fn completed(
        id: CorrelationId,
        status: i64,
        status_text: &str,
        body: Value,
        headers: Value,
        hint: ResponseFormat,
    ) -> Self {
        Self {
            id,
            data: vec![
                Value::from(status),
                Value::from(status_text),
                body,
                headers,
                Value::from(hint.as_str()),
            ],
        }
    }

    /// The relay's refusal form `[status, reason]`.
    #[must_use]
    pub fn refused(id: CorrelationId, status: i64, reason: &str) -> Self {
        Self {
            id,
            data: vec![Value::from(status), Value::from(reason)],
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    #[must_use]
    pub fn status(&self) -> Option<i64> {
        self.data.first().and_then(Value::as_i64)
    }

    /// Status 200 resolves with `(body, headers)`; anything else rejects with
    /// `(status, statusText)`, keeping the body and headers when the relay
    /// echoed them.
    pub fn into_outcome(self) -> Result<ApiReply, Failure> {
        let Some(status) = self.status() else {
            return Err(Failure::from_remote(-1, "malformed response envelope"));
        };
        let echoed = self.data.len() > 2;
        let mut data = self.data.into_iter();
        let _ = data.next();
        let status_text = data.next().map(value_text).unwrap_or_default();
        let body = data.next().unwrap_or(Value::Null);
        let headers = data.next().unwrap_or(Value::Null);
        let hint = data
            .next()
            .and_then(|v| v.as_str().map(ResponseFormat::parse));
        let reply = ApiReply {
            body: ResponseBody::from_wire(body, hint),
            headers,
        };
        match status {
            200 => Ok(reply),
            _ if echoed => Err(Failure::from_remote(status, status_text).with_response(reply)),
            _ => Err(Failure::from_remote(status, status_text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::failure::FailureKind;

    #[test]
    fn call_envelope_wire_shape() {
        let request = ApiRequest::get("/statuses/home_timeline").param("reqnum", 20);
        let envelope = CallEnvelope::new(CorrelationId::new(1), &request);
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"id": 1, "data": ["/statuses/home_timeline", {"reqnum": 20}, "json", "GET"]})
        );
    }

    #[test]
    fn call_envelope_keeps_format_verbatim() {
        let envelope =
            CallEnvelope::parse(r#"{"id":4,"data":["/a",{},"XML","post"]}"#).unwrap();
        let request = envelope.request().unwrap();
        assert_eq!(request.format, ResponseFormat::Xml);
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(envelope.data.2, "XML");
    }

    #[test]
    fn call_envelope_rejects_unknown_method() {
        let envelope = CallEnvelope::parse(r#"{"id":4,"data":["/a",{},"json","PATCH"]}"#).unwrap();
        assert!(matches!(envelope.request(), Err(EnvelopeError::Method(_))));
    }

    #[test]
    fn success_response_resolves_with_body_and_headers() {
        let envelope =
            ResponseEnvelope::parse(r#"{"id":1,"data":[200,"OK",{"foo":1},{}]}"#).unwrap();
        let reply = envelope.into_outcome().unwrap();
        assert_eq!(reply.body, ResponseBody::Json(json!({"foo": 1})));
        assert_eq!(reply.headers, json!({}));
    }

    #[test]
    fn xmltext_body_is_reparsed_as_xml() {
        let envelope = ResponseEnvelope::completed(
            CorrelationId::new(2),
            200,
            "OK",
            json!("<root/>"),
            json!(""),
            ResponseFormat::XmlText,
        );
        let reply = envelope.into_outcome().unwrap();
        assert_eq!(reply.body, ResponseBody::Xml("<root/>".to_string()));
    }

    #[test]
    fn refusal_rejects_with_status_and_reason() {
        let envelope =
            ResponseEnvelope::refused(CorrelationId::new(3), -1, "interface can not be empty");
        let failure = envelope.into_outcome().unwrap_err();
        assert_eq!(failure.pair(), (-1, "interface can not be empty"));
        assert!(failure.response().is_none());
    }

    #[test]
    fn allow_list_refusal_is_call_not_allowed() {
        let envelope = ResponseEnvelope::refused(
            CorrelationId::new(1),
            -1,
            "interface \"/x\" is not supported",
        );
        let failure = envelope.into_outcome().unwrap_err();
        assert_eq!(failure.kind(), FailureKind::CallNotAllowed);
    }

    #[test]
    fn error_status_keeps_echoed_body_and_headers() {
        let envelope = ResponseEnvelope::completed(
            CorrelationId::new(5),
            403,
            "Forbidden",
            json!({"ret": 3, "msg": "check sign error"}),
            json!({"x-trace": "abc"}),
            ResponseFormat::Json,
        );
        let failure = envelope.into_outcome().unwrap_err();
        assert_eq!(failure.pair(), (403, "Forbidden"));
        assert_eq!(failure.kind(), FailureKind::RemoteApiError);
        let response = failure.response().unwrap();
        assert_eq!(
            response.body,
            ResponseBody::Json(json!({"ret": 3, "msg": "check sign error"}))
        );
        assert_eq!(response.headers["x-trace"], json!("abc"));
    }

    #[test]
    fn missing_status_is_malformed() {
        let envelope = ResponseEnvelope::parse(r#"{"id":3,"data":[]}"#).unwrap();
        assert_eq!(
            envelope.into_outcome().unwrap_err().reason(),
            "malformed response envelope"
        );
    }

    #[test]
    fn api_call_formats_coerce_to_json() {
        assert_eq!(ResponseFormat::for_api_call("XML"), ResponseFormat::Xml);
        assert_eq!(ResponseFormat::for_api_call("text"), ResponseFormat::Json);
        assert_eq!(ResponseFormat::for_api_call("yaml"), ResponseFormat::Json);
    }
}
