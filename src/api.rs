// API client module: a small blocking HTTP client for the Drive-style
// remote index and media endpoints. Every outbound request passes through
// an ordered list of request decorators (auth header first) and, when
// --auto-retry is active, the exponential-backoff wrapper in `execute`.

use std::io::{self, Read};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::backoff::RetryPolicy;
use crate::error::{EntryKind, Error};
use crate::transfer::{ChunkAck, DownloadTransport, UploadTransport};

/// MIME type the remote index uses to mark folders.
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/drive/v2";
const DEFAULT_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v2";

/// Applied in order to every request before it is sent.
pub type RequestDecorator = Box<dyn Fn(RequestBuilder) -> RequestBuilder>;

/// One entry of the remote index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Stringified byte count; absent for folders.
    #[serde(default)]
    pub file_size: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub modified_date: Option<String>,
    #[serde(default)]
    pub last_modifying_user_name: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl FileMeta {
    pub fn file_size_bytes(&self) -> Option<u64> {
        self.file_size.as_deref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    items: Vec<FileMeta>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Blocking client for the remote storage API.
pub struct ApiClient {
    http: Client,
    base_url: String,
    upload_url: String,
    decorators: Vec<RequestDecorator>,
    retry: Option<RetryPolicy>,
}

impl ApiClient {
    pub fn new(
        base_url: String,
        upload_url: String,
        access_token: &str,
        retry: Option<RetryPolicy>,
    ) -> Result<Self, Error> {
        // 308 is part of the resumable protocol, not a redirect to follow.
        let http = Client::builder()
            .user_agent(concat!("drivepipe/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let bearer = format!("Bearer {access_token}");
        let decorators: Vec<RequestDecorator> =
            vec![Box::new(move |rb| rb.header(AUTHORIZATION, bearer.clone()))];

        Ok(ApiClient {
            http,
            base_url,
            upload_url,
            decorators,
            retry,
        })
    }

    /// Create a client configured from `DRIVEPIPE_API_URL` /
    /// `DRIVEPIPE_UPLOAD_URL`, falling back to the production endpoints.
    pub fn from_env(access_token: &str, retry: Option<RetryPolicy>) -> Result<Self, Error> {
        let base = std::env::var("DRIVEPIPE_API_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let upload =
            std::env::var("DRIVEPIPE_UPLOAD_URL").unwrap_or_else(|_| DEFAULT_UPLOAD_URL.into());
        Self::new(base, upload, access_token, retry)
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.is_some()
    }

    fn decorate(&self, rb: RequestBuilder) -> RequestBuilder {
        self.decorators.iter().fold(rb, |rb, d| d(rb))
    }

    /// Sends the request once, no retry regardless of policy.
    pub fn execute_once<F>(&self, build: F) -> Result<Response, Error>
    where
        F: Fn() -> RequestBuilder,
    {
        Ok(self.decorate(build()).send()?)
    }

    /// Sends the request, retrying I/O failures and retryable statuses
    /// (5xx, 429) per the policy when one is active. Returns the response
    /// for any other status; callers interpret it.
    pub fn execute<F>(&self, build: F) -> Result<Response, Error>
    where
        F: Fn() -> RequestBuilder,
    {
        let Some(policy) = &self.retry else {
            return self.execute_once(build);
        };

        let mut backoff = policy.start();
        let mut attempts: u32 = 1;
        loop {
            let failure = match self.decorate(build()).send() {
                Ok(resp) if retryable_status(resp.status()) => format!("HTTP {}", resp.status()),
                Ok(resp) => return Ok(resp),
                Err(e) => e.to_string(),
            };
            match backoff.next_interval() {
                Some(wait) => {
                    tracing::debug!(attempts, ?wait, %failure, "attempt failed, backing off");
                    std::thread::sleep(wait);
                    attempts += 1;
                }
                None => {
                    return Err(Error::RetriesExhausted {
                        attempts,
                        elapsed: backoff.elapsed(),
                        last: failure,
                    })
                }
            }
        }
    }

    /// Runs a remote index query, resolving pagination into one result set.
    pub fn query(&self, q: &str) -> Result<Vec<FileMeta>, Error> {
        let url = format!("{}/files", self.base_url);
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = page_token.clone();
            let resp = self.execute(|| {
                let mut rb = self
                    .http
                    .get(&url)
                    .query(&[("q", q), ("maxResults", "1000")]);
                if let Some(t) = &token {
                    rb = rb.query(&[("pageToken", t.as_str())]);
                }
                rb
            })?;
            let page: FileList = expect_success(resp)?.json()?;
            items.extend(page.items);
            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }
        tracing::debug!(q, n = items.len(), "query resolved");
        Ok(items)
    }

    /// All non-trashed, non-folder entries in scope.
    pub fn list_files(&self, parent: Option<&str>) -> Result<Vec<FileMeta>, Error> {
        self.query(&listing_query(parent))
    }

    /// Resolves a file name to its unique non-trashed entry in scope.
    pub fn find_file(&self, name: &str, parent: Option<&str>) -> Result<FileMeta, Error> {
        let matches = self.query(&file_query(name, parent))?;
        resolve_single(matches, EntryKind::File, name)
    }

    /// Resolves a folder name to its unique non-trashed folder id.
    pub fn find_folder(&self, name: &str) -> Result<String, Error> {
        let matches = self.query(&folder_query(name))?;
        resolve_single(matches, EntryKind::Folder, name).map(|f| f.id)
    }

    /// Moves a remote entry to the trash.
    pub fn trash(&self, id: &str) -> Result<(), Error> {
        let url = format!("{}/files/{}/trash", self.base_url, id);
        let resp = self.execute(|| self.http.post(&url))?;
        expect_success(resp)?;
        Ok(())
    }
}

/// Enforces the "exactly one match" contract of a name lookup.
pub fn resolve_single(
    mut matches: Vec<FileMeta>,
    kind: EntryKind,
    name: &str,
) -> Result<FileMeta, Error> {
    match matches.len() {
        0 => Err(Error::NotFound {
            kind,
            name: name.into(),
        }),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::AmbiguousMatch {
            kind,
            name: name.into(),
        }),
    }
}

fn query_escape(name: &str) -> String {
    name.replace('\\', "\\\\").replace('\'', "\\'")
}

fn listing_query(parent: Option<&str>) -> String {
    format!(
        "'{}' in parents and mimeType!='{}' and trashed=false",
        parent.unwrap_or("root"),
        FOLDER_MIME
    )
}

fn file_query(name: &str, parent: Option<&str>) -> String {
    format!(
        "title='{}' and '{}' in parents and mimeType!='{}' and trashed=false",
        query_escape(name),
        parent.unwrap_or("root"),
        FOLDER_MIME
    )
}

fn folder_query(name: &str) -> String {
    format!(
        "title='{}' and mimeType='{}' and trashed=false",
        query_escape(name),
        FOLDER_MIME
    )
}

fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn expect_success(resp: Response) -> Result<Response, Error> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(api_error(resp))
    }
}

fn api_error(resp: Response) -> Error {
    let status = resp.status().as_u16();
    let body = resp.text().unwrap_or_default();
    let detail: String = body.trim().chars().take(200).collect();
    Error::Api { status, detail }
}

// ---------------------------------------------------------------------------
// Transport implementations for the chunked engine
// ---------------------------------------------------------------------------

/// Metadata describing the remote object an upload creates.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub title: String,
    pub mime_type: String,
    pub parent: Option<String>,
}

/// Resumable-upload transport over the API client.
pub struct HttpUploadTransport<'a> {
    client: &'a ApiClient,
    request: UploadRequest,
}

impl<'a> HttpUploadTransport<'a> {
    pub fn new(client: &'a ApiClient, request: UploadRequest) -> Self {
        HttpUploadTransport { client, request }
    }
}

impl UploadTransport for HttpUploadTransport<'_> {
    fn initiate(&mut self) -> Result<String, Error> {
        let mut meta = serde_json::json!({
            "title": self.request.title,
            "mimeType": self.request.mime_type,
        });
        if let Some(id) = &self.request.parent {
            meta["parents"] = serde_json::json!([{ "id": id }]);
        }

        let url = format!("{}/files?uploadType=resumable", self.client.upload_url);
        let resp = self.client.execute(|| self.client.http.post(&url).json(&meta))?;
        let resp = expect_success(resp)?;
        resp.headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| Error::Protocol("upload initiation returned no session URI".into()))
    }

    fn send_chunk(
        &mut self,
        session_uri: &str,
        offset: u64,
        data: &[u8],
        total: Option<u64>,
        retryable: bool,
    ) -> Result<ChunkAck, Error> {
        let range = content_range(offset, data.len(), total);
        let build = || {
            let mut rb = self
                .client
                .http
                .put(session_uri)
                .header(CONTENT_RANGE, range.clone())
                .body(data.to_vec());
            if !retryable {
                // Gzip-compressing a streamed body has horrible throughput;
                // force identity for that transfer mode.
                rb = rb.header(CONTENT_ENCODING, "identity");
            }
            rb
        };

        let result = if retryable {
            self.client.execute(build)
        } else {
            self.client.execute_once(build)
        };
        let resp = match result {
            Ok(r) => r,
            Err(e) if !retryable && self.client.retry_enabled() => {
                return Err(Error::StreamNotRetryable(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        match resp.status().as_u16() {
            308 => Ok(ChunkAck::Incomplete),
            200 | 201 => Ok(ChunkAck::Complete),
            s if (500..600).contains(&s) && !retryable && self.client.retry_enabled() => {
                Err(Error::StreamNotRetryable(format!("HTTP {s}")))
            }
            _ => Err(api_error(resp)),
        }
    }
}

/// Ranged-download transport over the API client.
pub struct HttpDownloadTransport<'a> {
    client: &'a ApiClient,
    url: String,
    total: Option<u64>,
}

impl<'a> HttpDownloadTransport<'a> {
    pub fn new(client: &'a ApiClient, url: String, total: Option<u64>) -> Self {
        HttpDownloadTransport { client, url, total }
    }
}

impl DownloadTransport for HttpDownloadTransport<'_> {
    fn total_len(&self) -> Option<u64> {
        self.total
    }

    fn read_range(&mut self, offset: u64, len: u64, buf: &mut Vec<u8>) -> Result<usize, Error> {
        buf.clear();
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        let resp = self
            .client
            .execute(|| self.client.http.get(&self.url).header(RANGE, range.clone()))?;

        match resp.status().as_u16() {
            // Server ignored the range and sent the whole media; discard
            // the prefix so the chunk still starts at `offset`.
            200 => {
                let mut resp = resp;
                io::copy(&mut resp.by_ref().take(offset), &mut io::sink())?;
                resp.take(len).read_to_end(buf)?;
                Ok(buf.len())
            }
            206 => {
                resp.take(len).read_to_end(buf)?;
                Ok(buf.len())
            }
            // Ranged past the end of the media: nothing left.
            416 => Ok(0),
            _ => Err(api_error(resp)),
        }
    }
}

fn content_range(offset: u64, len: usize, total: Option<u64>) -> String {
    match (len, total) {
        (0, Some(t)) => format!("bytes */{t}"),
        (0, None) => "bytes */*".into(),
        (n, Some(t)) => format!("bytes {offset}-{}/{t}", offset + n as u64 - 1),
        (n, None) => format!("bytes {offset}-{}/*", offset + n as u64 - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    /// Serves every request with `200 OK` and the whole body, the way a
    /// server that ignores Range headers would.
    fn serve_full_body(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let mut reader = BufReader::new(stream);
                loop {
                    // Drain one request's headers, then answer.
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 {
                        break;
                    }
                    while line != "\r\n" {
                        line.clear();
                        if reader.read_line(&mut line).unwrap_or(0) == 0 {
                            return;
                        }
                    }
                    let head =
                        format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
                    let stream = reader.get_mut();
                    if stream.write_all(head.as_bytes()).is_err()
                        || stream.write_all(body).is_err()
                    {
                        return;
                    }
                }
            }
        });
        format!("http://{addr}")
    }

    fn meta(id: &str) -> FileMeta {
        FileMeta {
            id: id.into(),
            title: "report.pdf".into(),
            mime_type: Some("application/pdf".into()),
            file_size: Some("1024".into()),
            md5_checksum: None,
            modified_date: None,
            last_modifying_user_name: None,
            download_url: None,
        }
    }

    #[test]
    fn zero_matches_is_not_found() {
        let err = resolve_single(vec![], EntryKind::File, "report.pdf").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn one_match_resolves_to_that_entry() {
        let got = resolve_single(vec![meta("a")], EntryKind::File, "report.pdf").unwrap();
        assert_eq!(got.id, "a");
        // Idempotent: the same single match resolves the same way again.
        let again = resolve_single(vec![meta("a")], EntryKind::File, "report.pdf").unwrap();
        assert_eq!(again.id, "a");
    }

    #[test]
    fn two_matches_is_ambiguous() {
        let err =
            resolve_single(vec![meta("a"), meta("b")], EntryKind::File, "report.pdf").unwrap_err();
        assert!(matches!(err, Error::AmbiguousMatch { .. }));
    }

    #[test]
    fn file_query_scopes_name_parent_type_and_trash() {
        let q = file_query("report.pdf", Some("folder-1"));
        assert_eq!(
            q,
            "title='report.pdf' and 'folder-1' in parents and \
             mimeType!='application/vnd.google-apps.folder' and trashed=false"
        );
        assert!(file_query("x", None).contains("'root' in parents"));
    }

    #[test]
    fn folder_query_filters_on_folder_mime() {
        let q = folder_query("backups");
        assert!(q.contains("mimeType='application/vnd.google-apps.folder'"));
        assert!(q.contains("trashed=false"));
    }

    #[test]
    fn query_escape_handles_quotes() {
        assert_eq!(query_escape("it's"), "it\\'s");
        assert_eq!(query_escape(r"a\b"), r"a\\b");
    }

    #[test]
    fn content_range_shapes() {
        assert_eq!(content_range(0, 10, Some(25)), "bytes 0-9/25");
        assert_eq!(content_range(10, 10, None), "bytes 10-19/*");
        assert_eq!(content_range(20, 0, Some(20)), "bytes */20");
    }

    #[test]
    fn file_meta_parses_drive_shape() {
        let json = r#"{
            "id": "f1",
            "title": "notes.txt",
            "mimeType": "text/plain",
            "fileSize": "4096",
            "md5Checksum": "d41d8cd98f00b204e9800998ecf8427e",
            "modifiedDate": "2014-03-01T10:00:00.000Z",
            "lastModifyingUserName": "martin",
            "downloadUrl": "https://example.invalid/media/f1"
        }"#;
        let f: FileMeta = serde_json::from_str(json).unwrap();
        assert_eq!(f.file_size_bytes(), Some(4096));
        assert_eq!(f.last_modifying_user_name.as_deref(), Some("martin"));
    }

    #[test]
    fn folder_meta_has_no_size() {
        let json = r#"{"id": "d1", "title": "backups", "mimeType": "application/vnd.google-apps.folder"}"#;
        let f: FileMeta = serde_json::from_str(json).unwrap();
        assert_eq!(f.file_size_bytes(), None);
    }

    #[test]
    fn full_body_response_is_consumed_at_the_requested_offset() {
        let base = serve_full_body(b"HELLOWORLD");
        let client = ApiClient::new(base.clone(), base.clone(), "t", None).unwrap();
        let mut transport =
            HttpDownloadTransport::new(&client, format!("{base}/media"), Some(10));

        let mut buf = Vec::new();
        assert_eq!(transport.read_range(4, 4, &mut buf).unwrap(), 4);
        assert_eq!(buf, b"OWOR");

        // Past the end of the media the discarded prefix is all there is,
        // so the read comes back empty and the engine can terminate.
        assert_eq!(transport.read_range(10, 4, &mut buf).unwrap(), 0);
    }

    #[test]
    fn exhausted_retries_report_attempts_and_elapsed() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed: Duration::from_millis(25),
            multiplier: 2.0,
            randomization_factor: 0.0,
        };
        // Closed port: every attempt fails at the connection level.
        let client = ApiClient::new(
            "http://127.0.0.1:9".into(),
            "http://127.0.0.1:9".into(),
            "t",
            Some(policy),
        )
        .unwrap();

        match client.query("trashed=false").unwrap_err() {
            Error::RetriesExhausted {
                attempts, elapsed, ..
            } => {
                assert!(attempts > 1, "only {attempts} attempt(s) made");
                // No attempt is scheduled past the budget ceiling.
                assert!(elapsed >= policy.max_elapsed);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn retryable_statuses_are_5xx_and_429() {
        assert!(retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
        assert!(!retryable_status(StatusCode::OK));
    }
}
