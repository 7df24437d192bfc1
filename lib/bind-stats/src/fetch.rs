use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::{blocking::Client, StatusCode};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

use crate::{
    error::{CycleError, MalformedStatistics, SourceUnavailable},
    tree::StatsNode,
};

/// Default timeout for fetching the statistics document.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A statistics fetch error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum FetchError {
    /// The HTTP client could not be constructed.
    #[snafu(display("failed to build HTTP client: {}", source))]
    BuildClient {
        /// Source of the error.
        source: reqwest::Error,
    },

    /// The request did not complete.
    #[snafu(display("request to {} failed: {}", url, source))]
    Request {
        /// Requested URL.
        url: String,

        /// Source of the error.
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[snafu(display("request to {} returned status {}", url, status))]
    Status {
        /// Requested URL.
        url: String,

        /// Response status.
        status: StatusCode,
    },

    /// The statistics document could not be read from disk.
    #[snafu(display("failed to read statistics file '{}': {}", path.display(), source))]
    ReadFile {
        /// Path of the file.
        path: PathBuf,

        /// Source of the error.
        source: io::Error,
    },
}

/// A source of raw statistics documents.
pub trait StatsSource {
    /// Returns a human-readable description of where documents come from.
    fn describe(&self) -> String;

    /// Retrieves the current statistics document.
    ///
    /// # Errors
    ///
    /// If the document cannot be retrieved, an error is returned.
    fn fetch(&self) -> Result<String, FetchError>;
}

impl<S: StatsSource + ?Sized> StatsSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn fetch(&self) -> Result<String, FetchError> {
        (**self).fetch()
    }
}

/// Fetches statistics from BIND's HTTP statistics channel.
pub struct HttpStatsSource {
    client: Client,
    url: String,
}

impl HttpStatsSource {
    /// Creates a new `HttpStatsSource` for `http://<host>:<port><path>`.
    ///
    /// Requests that do not complete within `timeout` fail.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be constructed, an error is returned.
    pub fn new(host: &str, port: u16, path: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context(BuildClient)?;

        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        // IPv6 literals must be bracketed inside a URL authority.
        let url = if host.contains(':') && !host.starts_with('[') {
            format!("http://[{}]:{}{}", host, port, path)
        } else {
            format!("http://{}:{}{}", host, port, path)
        };

        Ok(Self { client, url })
    }

    /// Returns the URL that is requested.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl StatsSource for HttpStatsSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn fetch(&self) -> Result<String, FetchError> {
        debug!(url = %self.url, "Requesting statistics document.");

        let response = self.client.get(&self.url).send().context(Request { url: self.url.as_str() })?;
        let status = response.status();
        if !status.is_success() {
            return Status {
                url: self.url.as_str(),
                status,
            }
            .fail();
        }

        response.text().context(Request { url: self.url.as_str() })
    }
}

/// Reads statistics documents from a file on disk.
///
/// The file is re-read on every fetch, so it can be refreshed out-of-band (for example, by a cron job saving the
/// statistics channel's output).
pub struct FileStatsSource {
    path: PathBuf,
}

impl FileStatsSource {
    /// Creates a new `FileStatsSource`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl StatsSource for FileStatsSource {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    fn fetch(&self) -> Result<String, FetchError> {
        debug!(path = %self.path.display(), "Reading statistics document.");
        fs::read_to_string(&self.path).context(ReadFile { path: self.path.as_path() })
    }
}

/// Retrieves and parses statistics documents.
pub struct StatsFetcher<S> {
    source: S,
}

impl<S: StatsSource> StatsFetcher<S> {
    /// Creates a new `StatsFetcher` over the given source.
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Returns the underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetches the current statistics document and parses it into a tree.
    ///
    /// # Errors
    ///
    /// If the document cannot be retrieved, `CycleError::SourceUnavailable` is returned. If it cannot be parsed,
    /// `CycleError::MalformedStatistics` is returned.
    pub fn fetch_tree(&self) -> Result<StatsNode, CycleError> {
        let document = self.source.fetch().context(SourceUnavailable)?;
        debug!(document_len = document.len(), "Retrieved statistics document.");

        StatsNode::parse(&document).context(MalformedStatistics)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead as _, BufReader, Write as _},
        net::TcpListener,
        thread,
    };

    use super::*;

    const DOCUMENT: &str = r#"<statistics version="3.11"><server/></statistics>"#;

    // Serves a single HTTP response and returns the request line that was received.
    fn serve_once(status_line: &'static str, body: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("should bind listener");
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("should accept connection");
            let mut reader = BufReader::new(stream);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).expect("should read request line");
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("should read header line");
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }

            let mut stream = reader.into_inner();
            write!(
                stream,
                "{}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            )
            .expect("should write response");

            request_line
        });

        (port, handle)
    }

    #[test]
    fn http_source_fetches_document() {
        let (port, server) = serve_once("HTTP/1.1 200 OK", DOCUMENT);

        let source = HttpStatsSource::new("127.0.0.1", port, "xml/v3", DEFAULT_FETCH_TIMEOUT).unwrap();
        assert_eq!(source.url(), format!("http://127.0.0.1:{}/xml/v3", port));

        let fetcher = StatsFetcher::new(source);
        let tree = fetcher.fetch_tree().expect("should fetch tree");
        assert_eq!(tree.name(), "statistics");

        assert!(server.join().unwrap().starts_with("GET /xml/v3 HTTP/1.1"));
    }

    #[test]
    fn http_url_brackets_ipv6_hosts() {
        let source = HttpStatsSource::new("::1", 8053, "/", DEFAULT_FETCH_TIMEOUT).unwrap();
        assert_eq!(source.url(), "http://[::1]:8053/");

        let source = HttpStatsSource::new("ns1.example.com", 8053, "xml/v3", DEFAULT_FETCH_TIMEOUT).unwrap();
        assert_eq!(source.url(), "http://ns1.example.com:8053/xml/v3");
    }

    #[test]
    fn http_source_fetches_over_ipv6_loopback() {
        let Ok(listener) = TcpListener::bind("[::1]:0") else {
            // No IPv6 loopback on this host.
            return;
        };
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("should accept connection");
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("should read request line");
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                DOCUMENT.len(),
                DOCUMENT
            )
            .expect("should write response");
        });

        let source = HttpStatsSource::new("::1", port, "/", DEFAULT_FETCH_TIMEOUT).unwrap();
        let tree = StatsFetcher::new(source).fetch_tree().expect("should fetch tree");
        assert_eq!(tree.name(), "statistics");

        server.join().unwrap();
    }

    #[test]
    fn http_error_status_is_source_unavailable() {
        let (port, server) = serve_once("HTTP/1.1 503 Service Unavailable", "busy");

        let fetcher = StatsFetcher::new(HttpStatsSource::new("127.0.0.1", port, "/", DEFAULT_FETCH_TIMEOUT).unwrap());
        let err = fetcher.fetch_tree().unwrap_err();
        assert!(matches!(
            err,
            CycleError::SourceUnavailable {
                source: FetchError::Status { status, .. }
            } if status == StatusCode::SERVICE_UNAVAILABLE
        ));

        server.join().unwrap();
    }

    #[test]
    fn unreachable_endpoint_is_source_unavailable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("should bind listener");
            listener.local_addr().unwrap().port()
        };

        let source = HttpStatsSource::new("127.0.0.1", port, "/", Duration::from_secs(1)).unwrap();
        let err = StatsFetcher::new(source).fetch_tree().unwrap_err();
        assert_eq!(err.kind(), "source_unavailable");
    }

    #[test]
    fn file_source() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        file.write_all(DOCUMENT.as_bytes()).unwrap();

        let fetcher = StatsFetcher::new(FileStatsSource::new(file.path()));
        assert!(fetcher.source().describe().starts_with("file://"));
        let tree = fetcher.fetch_tree().expect("should fetch tree");
        assert_eq!(tree.attribute("version"), Some("3.11"));
    }

    #[test]
    fn missing_file_is_source_unavailable() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let fetcher = StatsFetcher::new(FileStatsSource::new(dir.path().join("stats.xml")));

        let err = fetcher.fetch_tree().unwrap_err();
        assert!(matches!(
            err,
            CycleError::SourceUnavailable {
                source: FetchError::ReadFile { .. }
            }
        ));
    }

    #[test]
    fn unparseable_document_is_malformed() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        file.write_all(b"<statistics>").unwrap();

        let err = StatsFetcher::new(FileStatsSource::new(file.path())).fetch_tree().unwrap_err();
        assert_eq!(err.kind(), "malformed_statistics");
    }
}
