//! Tabular-store access, HTTP fetch utilities, media staging, and image-host
//! upload for Deal Post Press.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dealpress_core::DealRow;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealpress-storage";

// ---------------------------------------------------------------------------
// HTTP fetching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_body_bytes: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_body_bytes: 5_000_000,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response for {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

/// Shared outbound HTTP client with retry/backoff and a response-size cap.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// GET a URL, following redirects, retrying retryable failures, and
    /// refusing bodies beyond the configured cap.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        debug!(url, "fetching");

        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = self.read_capped(resp, &final_url).await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes(url).await
    }

    /// POST a JSON body with extra headers and parse a JSON reply. Retries
    /// follow the same disposition rules as `fetch_bytes`.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        headers: &[(&str, &str)],
    ) -> Result<serde_json::Value, FetchError> {
        let mut attempt = 0;
        loop {
            let mut req = self.client.post(url).json(body);
            for (name, value) in headers {
                req = req.header(*name, *value);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.json::<serde_json::Value>().await?);
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    async fn read_capped(
        &self,
        mut resp: reqwest::Response,
        url: &str,
    ) -> Result<Vec<u8>, FetchError> {
        if let Some(length) = resp.content_length() {
            if length > self.max_body_bytes as u64 {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_body_bytes,
                });
            }
        }

        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// Tabular store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned status {status} for {context}")]
    HttpStatus { status: u16, context: String },
    #[error("unexpected store response: {0}")]
    Shape(String),
    #[error("invalid range {0}")]
    Range(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert a 1-based column position to A1 letters (1 -> A, 27 -> AA).
pub fn column_letter(mut position: usize) -> String {
    debug_assert!(position >= 1);
    let mut letters = Vec::new();
    while position > 0 {
        let rem = (position - 1) % 26;
        letters.push(b'A' + rem as u8);
        position = (position - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Parse A1 letters back to a 1-based column position.
pub fn column_position(letters: &str) -> Option<usize> {
    if letters.is_empty() {
        return None;
    }
    let mut position = 0usize;
    for c in letters.chars() {
        if !c.is_ascii_uppercase() {
            return None;
        }
        position = position * 26 + (c as usize - 'A' as usize + 1);
    }
    Some(position)
}

/// Parse a bare A1 cell like `D2` into (column, row), both 1-based.
fn parse_a1_cell(cell: &str) -> Option<(usize, usize)> {
    let split = cell.find(|c: char| c.is_ascii_digit())?;
    let col = column_position(&cell[..split])?;
    let row: usize = cell[split..].parse().ok()?;
    if row == 0 {
        return None;
    }
    Some((col, row))
}

/// Parse `D2:D11` (or a single cell `D2`) into (column, first_row, last_row).
/// Only single-column ranges are supported, which is all the writer emits.
pub fn parse_a1_range(range: &str) -> Result<(usize, usize, usize), StoreError> {
    let bad = || StoreError::Range(range.to_string());
    match range.split_once(':') {
        None => {
            let (col, row) = parse_a1_cell(range).ok_or_else(bad)?;
            Ok((col, row, row))
        }
        Some((start, end)) => {
            let (col_a, row_a) = parse_a1_cell(start).ok_or_else(bad)?;
            let (col_b, row_b) = parse_a1_cell(end).ok_or_else(bad)?;
            if col_a != col_b || row_b < row_a {
                return Err(bad());
            }
            Ok((col_a, row_a, row_b))
        }
    }
}

/// The tabular store the pipeline reads rows from and writes results into.
/// Rows and columns are 1-based sheet coordinates; row 1 is the header.
#[async_trait]
pub trait DealTable: Send + Sync {
    /// The full cell grid, header row included. Trailing empty cells may be
    /// omitted by the backend.
    async fn values(&self) -> Result<Vec<Vec<String>>, StoreError>;

    async fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), StoreError>;

    /// Write one column of values into a single-column A1 range.
    async fn update_range(&self, range: &str, values: Vec<String>) -> Result<(), StoreError>;

    /// Header row, trailing blanks trimmed.
    async fn header(&self) -> Result<Vec<String>, StoreError> {
        let grid = self.values().await?;
        let mut header = grid.into_iter().next().unwrap_or_default();
        while header.last().map(|c| c.trim().is_empty()).unwrap_or(false) {
            header.pop();
        }
        Ok(header)
    }

    /// Data rows mapped through the header into `DealRow`s. Position 1 is the
    /// first data row (sheet row 2).
    async fn records(&self) -> Result<Vec<DealRow>, StoreError> {
        let grid = self.values().await?;
        let mut iter = grid.into_iter();
        let header: Vec<String> = iter.next().unwrap_or_default();

        let mut records = Vec::new();
        for (index, row) in iter.enumerate() {
            let mut fields = HashMap::new();
            for (name, value) in header.iter().zip(row.into_iter()) {
                if !name.trim().is_empty() {
                    fields.insert(name.trim().to_string(), value);
                }
            }
            records.push(DealRow::new(index + 1, fields));
        }
        Ok(records)
    }
}

/// REST adapter for a Sheets-v4-shaped values API. Token issuance is outside
/// this system; the adapter just sends the bearer token it was given.
pub struct SheetsApiTable {
    client: reqwest::Client,
    base: String,
    sheet_id: String,
    sheet_name: String,
    token: String,
}

impl SheetsApiTable {
    pub const DEFAULT_BASE: &'static str = "https://sheets.googleapis.com/v4/spreadsheets";

    pub fn new(
        base: impl Into<String>,
        sheet_id: impl Into<String>,
        sheet_name: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building sheets client")?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
            sheet_id: sheet_id.into(),
            sheet_name: sheet_name.into(),
            token: token.into(),
        })
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/{}/values/{}!{}",
            self.base, self.sheet_id, self.sheet_name, range
        )
    }

    async fn put_values(&self, range: &str, values: Vec<Vec<String>>) -> Result<(), StoreError> {
        let url = format!("{}?valueInputOption=RAW", self.values_url(range));
        let body = serde_json::json!({ "values": values });
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                context: format!("update {range}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DealTable for SheetsApiTable {
    async fn values(&self) -> Result<Vec<Vec<String>>, StoreError> {
        let url = format!(
            "{}/{}/values/{}",
            self.base, self.sheet_id, self.sheet_name
        );
        let resp = self.client.get(&url).bearer_auth(&self.token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                context: "read values".to_string(),
            });
        }

        let body: serde_json::Value = resp.json().await?;
        let rows = body
            .get("values")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut grid = Vec::with_capacity(rows.len());
        for row in rows {
            let cells = row
                .as_array()
                .ok_or_else(|| StoreError::Shape("row is not an array".to_string()))?
                .iter()
                .map(|cell| match cell {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            grid.push(cells);
        }
        Ok(grid)
    }

    async fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), StoreError> {
        let range = format!("{}{}", column_letter(col), row);
        self.put_values(&range, vec![vec![value.to_string()]]).await
    }

    async fn update_range(&self, range: &str, values: Vec<String>) -> Result<(), StoreError> {
        parse_a1_range(range)?;
        self.put_values(range, values.into_iter().map(|v| vec![v]).collect())
            .await
    }
}

/// In-memory table for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryTable {
    grid: Mutex<Vec<Vec<String>>>,
}

impl MemoryTable {
    pub fn new(grid: Vec<Vec<String>>) -> Self {
        Self {
            grid: Mutex::new(grid),
        }
    }

    pub fn from_rows<S: Into<String> + Clone>(header: &[S], rows: &[&[S]]) -> Self {
        let mut grid = vec![header.iter().cloned().map(Into::into).collect::<Vec<_>>()];
        for row in rows {
            grid.push(row.iter().cloned().map(Into::into).collect());
        }
        Self::new(grid)
    }

    pub async fn snapshot(&self) -> Vec<Vec<String>> {
        self.grid.lock().await.clone()
    }

    pub async fn cell(&self, row: usize, col: usize) -> String {
        let grid = self.grid.lock().await;
        grid.get(row - 1)
            .and_then(|r| r.get(col - 1))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DealTable for MemoryTable {
    async fn values(&self) -> Result<Vec<Vec<String>>, StoreError> {
        Ok(self.grid.lock().await.clone())
    }

    async fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), StoreError> {
        let mut grid = self.grid.lock().await;
        while grid.len() < row {
            grid.push(Vec::new());
        }
        let cells = &mut grid[row - 1];
        while cells.len() < col {
            cells.push(String::new());
        }
        cells[col - 1] = value.to_string();
        Ok(())
    }

    async fn update_range(&self, range: &str, values: Vec<String>) -> Result<(), StoreError> {
        let (col, first_row, last_row) = parse_a1_range(range)?;
        if values.len() != last_row - first_row + 1 {
            return Err(StoreError::Range(format!(
                "{range} expects {} values, got {}",
                last_row - first_row + 1,
                values.len()
            )));
        }
        let mut grid = self.grid.lock().await;
        for (offset, value) in values.into_iter().enumerate() {
            let row = first_row + offset;
            while grid.len() < row {
                grid.push(Vec::new());
            }
            let cells = &mut grid[row - 1];
            while cells.len() < col {
                cells.push(String::new());
            }
            cells[col - 1] = value;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Schema manager
// ---------------------------------------------------------------------------

/// Append-only view of the header row. `ensure` returns the 1-based position
/// of a column, appending a new header cell when the column does not exist.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    header: Vec<String>,
}

impl SchemaManager {
    pub async fn load(table: &dyn DealTable) -> Result<Self, StoreError> {
        Ok(Self {
            header: table.header().await?,
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.header
            .iter()
            .position(|c| c.trim() == name)
            .map(|idx| idx + 1)
    }

    pub async fn ensure(
        &mut self,
        table: &dyn DealTable,
        name: &str,
    ) -> Result<usize, StoreError> {
        if let Some(position) = self.position(name) {
            return Ok(position);
        }
        let position = self.header.len() + 1;
        table.update_cell(1, position, name).await?;
        self.header.push(name.to_string());
        debug!(column = name, position, "appended schema column");
        Ok(position)
    }

    pub async fn ensure_all(
        &mut self,
        table: &dyn DealTable,
        names: &[&str],
    ) -> Result<HashMap<String, usize>, StoreError> {
        let mut positions = HashMap::new();
        for name in names {
            let position = self.ensure(table, name).await?;
            positions.insert((*name).to_string(), position);
        }
        Ok(positions)
    }
}

// ---------------------------------------------------------------------------
// Media staging
// ---------------------------------------------------------------------------

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Scratch directory for downloaded product shots and composed outputs.
/// Files are written atomically and removed per-row once published.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local filename for a download: `{row}_{url basename}`, falling back to
    /// a URL-hash stem when the URL has no usable basename.
    pub fn download_name(row_position: usize, url: &str) -> String {
        let basename = url::Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(String::from))
            })
            .unwrap_or_default();

        let sanitized: String = basename
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        if sanitized.is_empty() || !sanitized.contains('.') {
            let hash = sha256_hex(url.as_bytes());
            format!("{row_position}_img_{}.jpg", &hash[..12])
        } else {
            format!("{row_position}_{sanitized}")
        }
    }

    /// Store bytes under `name` using a temp-file write and atomic rename.
    pub async fn store_bytes(&self, name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating media directory {}", self.root.display()))?;

        let final_path = self.root.join(name);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp media file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp media file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp media file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &final_path).await {
            Ok(()) => Ok(final_path),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp media {} -> {}",
                        temp_path.display(),
                        final_path.display()
                    )
                })
            }
        }
    }

    /// Best-effort removal of a staged file.
    pub async fn remove(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove staged media");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Image host
// ---------------------------------------------------------------------------

/// Publishes a local image and returns its public URL.
#[async_trait]
pub trait ImageHost: Send + Sync {
    async fn publish(&self, path: &Path) -> Result<String, StoreError>;
}

/// freeimage-style upload endpoint: multipart `source` field, JSON reply with
/// the public URL at `image.url`.
pub struct MultipartImageHost {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl MultipartImageHost {
    pub const DEFAULT_ENDPOINT: &'static str = "https://freeimage.host/api/1/upload";

    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building image host client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }
}

pub fn hosted_url_from_response(body: &serde_json::Value) -> Option<String> {
    body.get("image")
        .and_then(|image| image.get("url"))
        .and_then(|url| url.as_str())
        .map(|url| url.to_string())
}

#[async_trait]
impl ImageHost for MultipartImageHost {
    async fn publish(&self, path: &Path) -> Result<String, StoreError> {
        let bytes = fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.jpg".to_string());

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .text("format", "json")
            .part("source", part);

        let resp = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                context: "image upload".to_string(),
            });
        }

        let body: serde_json::Value = resp.json().await?;
        hosted_url_from_response(&body)
            .ok_or_else(|| StoreError::Shape("upload reply missing image.url".to_string()))
    }
}
