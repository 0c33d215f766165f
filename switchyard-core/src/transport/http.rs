//! HTTP mapping of requests.
//!
//! | Verb | Method | Arguments |
//! |------|--------|-----------|
//! | query | `GET` | one `input` query parameter per argument, each JSON |
//! | mutate | `POST` | JSON array body |
//! | dispatch | `POST` with a bare `dispatch` query parameter | JSON array body |
//! | upload | `PUT` | raw body as the first argument, the rest as `input` parameters |
//!
//! Paths live under `/proxy/`, one URL segment per path key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::context::RequestKind;
use crate::invokers::Invokers;
use crate::request::RequestDescriptor;

/// Query parameter carrying one JSON-encoded argument.
pub const QUERY_PARAM: &str = "input";

/// Bare query parameter marking a `POST` as a dispatch.
pub const DISPATCH_PARAM: &str = "dispatch";

/// Path prefix of every request URL.
pub const PATH_PREFIX: &str = "/proxy/";

const JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing HTTP call for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCall {
    pub method: Method,
    pub url: String,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<&'static str>,
}

/// A request decoded from an incoming HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct WireCall {
    pub kind: RequestKind,
    pub request: RequestDescriptor,
}

/// Why an incoming HTTP call could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status} {message}")]
pub struct WireError {
    /// 400, 404 or 405.
    pub status: u16,
    pub message: String,
}

impl WireError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            message: "Not found".into(),
        }
    }

    pub fn method_not_allowed() -> Self {
        Self {
            status: 405,
            message: "Method not allowed".into(),
        }
    }
}

/// What a server answers for an incoming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

/// Encode `request` as an HTTP call. Queries become `GET`, everything else
/// `POST`. Dispatches carry the [`DISPATCH_PARAM`] marker.
pub fn to_http(request: &RequestDescriptor, kind: RequestKind, origin: &str) -> HttpCall {
    let url = path_url(request, origin);
    let body = || Some(Value::Array(request.args().to_vec()).to_string().into_bytes());
    match kind {
        RequestKind::Query => HttpCall {
            method: Method::Get,
            url: with_query(url, request.args()),
            body: None,
            content_type: None,
        },
        RequestKind::Mutate => HttpCall {
            method: Method::Post,
            url,
            body: body(),
            content_type: Some(JSON),
        },
        RequestKind::Dispatch => HttpCall {
            method: Method::Post,
            url: format!("{url}?{DISPATCH_PARAM}"),
            body: body(),
            content_type: Some(JSON),
        },
    }
}

/// Encode a binary upload: `bytes` travel as the body, the request's
/// arguments as query parameters.
pub fn to_http_upload(request: &RequestDescriptor, bytes: Vec<u8>, origin: &str) -> HttpCall {
    HttpCall {
        method: Method::Put,
        url: with_query(path_url(request, origin), request.args()),
        body: Some(bytes),
        content_type: Some(OCTET_STREAM),
    }
}

fn path_url(request: &RequestDescriptor, origin: &str) -> String {
    let segments: Vec<String> = request
        .path()
        .iter()
        .map(|key| urlencoding::encode(key.as_str()).into_owned())
        .collect();
    format!("{origin}{PATH_PREFIX}{}", segments.join("/"))
}

fn with_query(url: String, args: &[Value]) -> String {
    if args.is_empty() {
        return url;
    }
    let query: Vec<String> = args
        .iter()
        .map(|arg| format!("{QUERY_PARAM}={}", urlencoding::encode(&arg.to_string())))
        .collect();
    format!("{url}?{}", query.join("&"))
}

/// Decode an incoming HTTP call. `url` may be absolute or origin-relative.
pub fn from_http(method: &str, url: &str, body: &[u8]) -> Result<WireCall, WireError> {
    let url = parse_url(url)?;
    let path = decode_path(&url)?;

    let (kind, args) = match method.to_ascii_uppercase().as_str() {
        "GET" => (RequestKind::Query, query_args(&url)?),
        "POST" => {
            let args: Vec<Value> = serde_json::from_slice(body)
                .map_err(|err| WireError::bad_request(err.to_string()))?;
            let dispatch = url.query_pairs().any(|(name, _)| name == DISPATCH_PARAM);
            let kind = if dispatch {
                RequestKind::Dispatch
            } else {
                RequestKind::Mutate
            };
            (kind, args)
        }
        "PUT" => {
            let mut args = vec![serde_json::to_value(body)
                .map_err(|err| WireError::bad_request(err.to_string()))?];
            args.extend(query_args(&url)?);
            (RequestKind::Mutate, args)
        }
        _ => return Err(WireError::method_not_allowed()),
    };

    Ok(WireCall {
        kind,
        request: RequestDescriptor::new(path, args),
    })
}

fn parse_url(raw: &str) -> Result<Url, WireError> {
    let base = Url::parse("http://localhost/").map_err(|err| WireError::bad_request(err.to_string()))?;
    base.join(raw)
        .map_err(|err| WireError::bad_request(err.to_string()))
}

fn decode_path(url: &Url) -> Result<Vec<String>, WireError> {
    let rest = url
        .path()
        .strip_prefix(PATH_PREFIX)
        .ok_or_else(WireError::not_found)?;
    if rest.is_empty() {
        return Err(WireError::not_found());
    }
    rest.split('/')
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .map_err(|err| WireError::bad_request(err.to_string()))
        })
        .collect()
}

fn query_args(url: &Url) -> Result<Vec<Value>, WireError> {
    url.query_pairs()
        .filter(|(name, _)| name == QUERY_PARAM)
        .map(|(_, raw)| {
            if raw == "undefined" {
                return Ok(Value::Null);
            }
            serde_json::from_str(&raw).map_err(|err| WireError::bad_request(err.to_string()))
        })
        .collect()
}

/// Serve one decoded call.
///
/// Paths without a handler answer 404 before anything runs, except for
/// dispatches, which tolerate having no listeners. Handler failures answer
/// 500 with the error message.
pub async fn respond(invokers: &Invokers, call: Result<WireCall, WireError>) -> HttpResponse {
    let call = match call {
        Ok(call) => call,
        Err(err) => return text_response(err.status, err.message),
    };
    if call.kind != RequestKind::Dispatch && !invokers.has_handler(&call.request) {
        return text_response(404, "Not found");
    }

    let result = match call.kind {
        RequestKind::Query => invokers.query_value(&call.request).await,
        RequestKind::Mutate => invokers.mutate_value(&call.request).await,
        RequestKind::Dispatch => invokers.dispatch(&call.request).await.map(|()| Value::Null),
    };

    match result {
        Ok(value) => HttpResponse {
            status: 200,
            content_type: Some(JSON),
            body: value.to_string().into_bytes(),
        },
        Err(err) => {
            warn!(path = %call.request.dotted_path(), error = %err, "handler failed");
            text_response(500, err.to_string())
        }
    }
}

fn text_response(status: u16, message: impl Into<String>) -> HttpResponse {
    HttpResponse {
        status,
        content_type: Some("text/plain"),
        body: message.into().into_bytes(),
    }
}
