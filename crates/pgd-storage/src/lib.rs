//! Remote spreadsheet fetcher: one HTTP GET per sheet, JSON body to raw rows.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pgd_core::{RawRecordSet, SheetId};
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "pgd-storage";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("remote sheet error: {0}")]
    Remote(String),
    #[error("http status {0}")]
    Http(u16),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

impl FetchError {
    /// Transport failures may succeed on a manual retry; everything else waits for
    /// TTL expiry or an explicit reload. No retry is ever attempted automatically.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Transport(_) | FetchError::Aborted(_) => RetryDisposition::Retryable,
            FetchError::Remote(_) | FetchError::Http(_) | FetchError::Decode(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return FetchError::Http(status.as_u16());
        }
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connect"
        } else {
            "request"
        };
        // reqwest includes the full URL in its Display output; the URL is a secret.
        FetchError::Transport(format!("{kind}: {}", err.without_url()))
    }
}

/// Anything that can produce the raw rows of a sheet.
#[async_trait]
pub trait SheetSource: Send + Sync {
    async fn fetch(&self, sheet: SheetId) -> Result<RawRecordSet, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSheetFetcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpSheetFetcher {
    pub fn new(base_url: &str, config: HttpClientConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).context("parsing sheets endpoint url")?;
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, base_url })
    }

    fn sheet_url(&self, sheet: SheetId) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair("sheet", sheet.as_str());
        url
    }
}

#[async_trait]
impl SheetSource for HttpSheetFetcher {
    async fn fetch(&self, sheet: SheetId) -> Result<RawRecordSet, FetchError> {
        let span = info_span!("sheet_fetch", sheet = %sheet);
        async {
            let resp = self.client.get(self.sheet_url(sheet)).send().await?;
            let status = resp.status();
            if status != StatusCode::OK {
                return Err(FetchError::Http(status.as_u16()));
            }
            let body = resp.bytes().await?;
            let rows = parse_sheet_body(&body)?;
            debug!(rows = rows.len(), bytes = body.len(), "sheet body parsed");
            Ok(rows)
        }
        .instrument(span)
        .await
    }
}

/// Interprets a 200 response body.
///
/// An array of objects is the row set. An object carrying `error` is a remote
/// failure. `[]`, `{}`, `null` and an empty body are a valid, empty sheet.
pub fn parse_sheet_body(body: &[u8]) -> Result<RawRecordSet, FetchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(format!("invalid JSON: {e}")))?;

    match value {
        JsonValue::Null => Ok(Vec::new()),
        JsonValue::Object(obj) => match obj.get("error") {
            Some(JsonValue::String(message)) => Err(FetchError::Remote(message.clone())),
            Some(other) => Err(FetchError::Remote(other.to_string())),
            None if obj.is_empty() => Ok(Vec::new()),
            None => Err(FetchError::Decode(
                "expected an array of rows or an error object".to_string(),
            )),
        },
        JsonValue::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| match item {
                JsonValue::Object(row) => Ok(row),
                other => Err(FetchError::Decode(format!(
                    "row {idx} is not an object: {other}"
                ))),
            })
            .collect(),
        other => Err(FetchError::Decode(format!("unexpected top-level value: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, http::StatusCode as AxumStatus, routing::get, Json, Router};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    #[test]
    fn array_of_objects_becomes_rows_in_order() {
        let rows = parse_sheet_body("[{\"واحد \":\"فروش\",\"کد\":7},{\"واحد \":null}]".as_bytes())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].keys().collect::<Vec<_>>(), vec!["واحد ", "کد"]);
        assert!(rows[1]["واحد "].is_null());
    }

    #[test]
    fn empty_payloads_are_empty_sheets_not_errors() {
        for body in ["", "  \n", "[]", "{}", "null"] {
            assert_eq!(parse_sheet_body(body.as_bytes()).unwrap(), Vec::new(), "{body:?}");
        }
    }

    #[test]
    fn error_object_is_a_remote_error() {
        let err = parse_sheet_body(br#"{"error":"Sheet not found"}"#).unwrap_err();
        assert_eq!(err, FetchError::Remote("Sheet not found".into()));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn scalar_rows_and_garbage_are_decode_errors() {
        assert!(matches!(parse_sheet_body(b"[1,2]"), Err(FetchError::Decode(_))));
        assert!(matches!(parse_sheet_body(b"<html>"), Err(FetchError::Decode(_))));
        assert!(matches!(parse_sheet_body(br#"{"rows":[]}"#), Err(FetchError::Decode(_))));
    }

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/exec")
    }

    async fn sheet_handler(Query(q): Query<HashMap<String, String>>) -> (AxumStatus, Json<JsonValue>) {
        match q.get("sheet").map(String::as_str) {
            Some("personnel") => (
                AxumStatus::OK,
                Json(serde_json::json!([{"واحد":"فروش ","جنسیت":" مرد"}])),
            ),
            Some("employment") => (AxumStatus::OK, Json(serde_json::json!([]))),
            Some("monthlylist") => (
                AxumStatus::OK,
                Json(serde_json::json!({"error":"quota exceeded"})),
            ),
            _ => (AxumStatus::INTERNAL_SERVER_ERROR, Json(JsonValue::Null)),
        }
    }

    #[tokio::test]
    async fn http_fetcher_maps_each_response_kind() {
        let base = serve(Router::new().route("/exec", get(sheet_handler))).await;
        let fetcher = HttpSheetFetcher::new(&base, HttpClientConfig::default()).unwrap();

        let rows = fetcher.fetch(SheetId::Personnel).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["جنسیت"], " مرد");

        assert!(fetcher.fetch(SheetId::Employment).await.unwrap().is_empty());
        assert_eq!(
            fetcher.fetch(SheetId::MonthlyList).await.unwrap_err(),
            FetchError::Remote("quota exceeded".into())
        );
    }

    #[tokio::test]
    async fn non_200_status_is_an_http_error() {
        let base = serve(Router::new().route(
            "/exec",
            get(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;
        let fetcher = HttpSheetFetcher::new(&base, HttpClientConfig::default()).unwrap();
        let err = fetcher.fetch(SheetId::Personnel).await.unwrap_err();
        assert_eq!(err, FetchError::Http(500));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn slow_endpoint_is_a_retryable_transport_error() {
        let base = serve(Router::new().route(
            "/exec",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "[]"
            }),
        ))
        .await;
        let fetcher = HttpSheetFetcher::new(
            &base,
            HttpClientConfig {
                timeout: Duration::from_millis(100),
                user_agent: Some("pgd-test".into()),
            },
        )
        .unwrap();
        let err = fetcher.fetch(SheetId::Employment).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(ref m) if m.starts_with("timeout")), "{err:?}");
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert!(!err.to_string().contains("/exec"));
    }

    #[test]
    fn sheet_url_carries_the_sheet_query_parameter() {
        let fetcher =
            HttpSheetFetcher::new("https://example.test/macros/exec", HttpClientConfig::default())
                .unwrap();
        assert_eq!(
            fetcher.sheet_url(SheetId::MonthlyList).as_str(),
            "https://example.test/macros/exec?sheet=monthlylist"
        );
    }
}
