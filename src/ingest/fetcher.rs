//! Feed Fetcher
//!
//! Retrieves a source's payload over HTTP and decodes it as delimited text.
//! The first column of every row is the candidate address; any further
//! columns are carried along untouched.

use crate::domain::ports::{FeedFetcher, FeedRows, RawRow};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the HTTP feed fetcher
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Whole-request timeout, connect included
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Field delimiter
    pub delimiter: u8,
    /// Lines starting with this byte are skipped
    pub comment: Option<u8>,
    /// Whether the first row is a header to skip
    pub has_headers: bool,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            delimiter: b',',
            comment: Some(b'#'),
            has_headers: false,
            user_agent: format!("{}/{}", crate::NAME, crate::VERSION),
        }
    }
}

// =============================================================================
// HTTP Fetcher
// =============================================================================

/// `FeedFetcher` backed by reqwest and the csv decoder
pub struct HttpFeedFetcher {
    config: FetcherConfig,
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    fn map_transport(&self, url: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::FetchTimeout {
                url: url.to_string(),
                timeout: self.config.request_timeout,
            }
        } else {
            Error::Fetch(e)
        }
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<FeedRows> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_transport(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::FetchStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_transport(url, e))?;
        debug!(url = %url, bytes = body.len(), "Fetched feed payload");

        Ok(decode_rows(&self.config, Cursor::new(body)))
    }
}

/// Decode a delimited payload into a lazy row sequence
///
/// Blank lines and comment lines are skipped; rows may have any number of
/// fields. Fields are decoded lossily, so bytes that are not UTF-8 surface
/// as an unparseable field on their own row. Only read failures end the
/// sequence with an error.
pub fn decode_rows<R>(config: &FetcherConfig, payload: R) -> FeedRows
where
    R: std::io::Read + Send + 'static,
{
    let reader = csv::ReaderBuilder::new()
        .has_headers(config.has_headers)
        .delimiter(config.delimiter)
        .comment(config.comment)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(payload);

    Box::new(reader.into_byte_records().map(|record| {
        let record = record?;
        let line = record.position().map_or(0, |p| p.line());
        Ok(RawRow {
            line,
            fields: record
                .iter()
                .map(|field| String::from_utf8_lossy(field).into_owned())
                .collect(),
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;

    const FEED: &str = "# generated hourly\n1.2.3.4,botnet\n\nbad-addr\n  5.6.7.8  \n2001:db8::1;x\n";

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn feed_server() -> Router {
        Router::new()
            .route("/feed.csv", get(|| async { FEED }))
            .route("/gone", get(|| async { (StatusCode::NOT_FOUND, "gone") }))
            .route("/flaky", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "later") }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "1.2.3.4\n"
                }),
            )
    }

    fn fields(rows: FeedRows) -> Vec<Vec<String>> {
        rows.map(|r| r.unwrap().fields).collect()
    }

    #[tokio::test]
    async fn test_fetch_decodes_rows() {
        let addr = serve(feed_server()).await;
        let fetcher = HttpFeedFetcher::new(FetcherConfig::default()).unwrap();

        let rows = fetcher.fetch(&format!("http://{}/feed.csv", addr)).await.unwrap();
        assert_eq!(
            fields(rows),
            vec![
                vec!["1.2.3.4".to_string(), "botnet".to_string()],
                vec!["bad-addr".to_string()],
                vec!["5.6.7.8".to_string()],
                vec!["2001:db8::1;x".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_http_errors() {
        let addr = serve(feed_server()).await;
        let fetcher = HttpFeedFetcher::new(FetcherConfig::default()).unwrap();

        let err = fetcher.fetch(&format!("http://{}/gone", addr)).await.err().unwrap();
        assert_matches!(err, Error::FetchStatus { status: 404, .. });
        assert!(!err.is_retryable());

        let err = fetcher.fetch(&format!("http://{}/flaky", addr)).await.err().unwrap();
        assert_matches!(err, Error::FetchStatus { status: 503, .. });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let addr = serve(feed_server()).await;
        let fetcher = HttpFeedFetcher::new(FetcherConfig {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap();

        let err = fetcher.fetch(&format!("http://{}/slow", addr)).await.err().unwrap();
        assert_matches!(err, Error::FetchTimeout { .. });
        assert!(err.is_transient());
    }

    #[test]
    fn test_decode_custom_delimiter() {
        let config = FetcherConfig {
            delimiter: b';',
            comment: None,
            ..Default::default()
        };
        let rows = decode_rows(&config, Cursor::new("10.0.0.1;a\n#10.0.0.2;b\n".as_bytes().to_vec()));
        assert_eq!(
            fields(rows),
            vec![
                vec!["10.0.0.1".to_string(), "a".to_string()],
                vec!["#10.0.0.2".to_string(), "b".to_string()],
            ]
        );
    }

    #[test]
    fn test_decode_reports_line_numbers() {
        let rows: Vec<RawRow> = decode_rows(
            &FetcherConfig::default(),
            Cursor::new(b"1.1.1.1\n2.2.2.2\n".to_vec()),
        )
        .map(|r| r.unwrap())
        .collect();
        assert_eq!(rows.iter().map(|r| r.line).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_decode_keeps_rows_around_invalid_utf8() {
        let rows: Vec<RawRow> = decode_rows(
            &FetcherConfig::default(),
            Cursor::new(b"1.2.3.4\n\xff\xfe\n5.6.7.8\n".to_vec()),
        )
        .map(|r| r.unwrap())
        .collect();

        assert_eq!(rows.iter().map(|r| r.line).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(rows[0].address_field(), "1.2.3.4");
        assert_eq!(rows[1].address_field(), "\u{FFFD}\u{FFFD}");
        assert_eq!(rows[2].address_field(), "5.6.7.8");
    }
}
