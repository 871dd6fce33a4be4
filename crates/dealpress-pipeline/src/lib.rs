//! Run orchestration: schema setup, per-row enrichment and composition,
//! caption generation, and the end-of-run batch write-back.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealpress_caption::{
    CaptionConfig, CaptionEngine, CategoryRules, GeminiClient, GenerativeConfig, TextGenerator,
    DEFAULT_GENERATIVE_MODEL,
};
use dealpress_core::{
    columns, normalize_color, BadgeShape, ComposeRequest, DealRow, PromoCode, PromoInfo,
};
use dealpress_enrich::{
    resolve_promo_code, CatalogClient, ProductEnricher, ProductSource, PromoScraper,
    BROWSER_USER_AGENT,
};
use dealpress_image::{Composer, ImageComposer};
use dealpress_storage::{
    column_letter, DealTable, HttpClientConfig, HttpFetcher, ImageHost, MediaStore,
    MultipartImageHost, SchemaManager, SheetsApiTable,
};
use serde::Serialize;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealpress-pipeline";

/// Written into a still-needed output cell when its row fails.
pub const ERROR_SENTINEL: &str = "ERROR";

const MARKETING_BADGE_FILE: &str = "black_friday.png";
const LINK_BADGE_FILE: &str = "link.png";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sheet_id: String,
    pub sheet_name: String,
    pub sheets_api_base: String,
    pub sheets_api_token: String,
    pub app_api_key: String,
    pub image_host_api_key: String,
    pub image_host_endpoint: String,
    pub catalog_api_endpoint: Option<String>,
    pub catalog_access_key: Option<String>,
    pub catalog_secret_key: Option<String>,
    pub catalog_partner_tag: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub promo_scraper_enabled: bool,
    pub promo_enabled: bool,
    pub promo_default_message: String,
    pub promo_expired_message: String,
    pub work_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub max_download_bytes: usize,
    pub port: u16,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            sheet_id: std::env::var("SHEET_ID").unwrap_or_default(),
            sheet_name: std::env::var("SHEET_NAME").unwrap_or_else(|_| "Sheet1".to_string()),
            sheets_api_base: std::env::var("SHEETS_API_BASE")
                .unwrap_or_else(|_| SheetsApiTable::DEFAULT_BASE.to_string()),
            sheets_api_token: std::env::var("SHEETS_API_TOKEN").unwrap_or_default(),
            app_api_key: std::env::var("APP_API_KEY").unwrap_or_default(),
            image_host_api_key: std::env::var("IMAGE_HOST_API_KEY").unwrap_or_default(),
            image_host_endpoint: std::env::var("IMAGE_HOST_ENDPOINT")
                .unwrap_or_else(|_| MultipartImageHost::DEFAULT_ENDPOINT.to_string()),
            catalog_api_endpoint: std::env::var("CATALOG_API_ENDPOINT").ok(),
            catalog_access_key: std::env::var("CATALOG_ACCESS_KEY").ok(),
            catalog_secret_key: std::env::var("CATALOG_SECRET_KEY").ok(),
            catalog_partner_tag: std::env::var("CATALOG_PARTNER_TAG").ok(),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| DEFAULT_GENERATIVE_MODEL.to_string()),
            promo_scraper_enabled: std::env::var("PROMO_SCRAPER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            promo_enabled: std::env::var("PROMO_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            promo_default_message: std::env::var("PROMO_DEFAULT_MESSAGE")
                .unwrap_or_else(|_| dealpress_caption::DEFAULT_PROMO_MESSAGE.to_string()),
            promo_expired_message: std::env::var("PROMO_EXPIRED_MESSAGE")
                .unwrap_or_else(|_| dealpress_caption::EXPIRED_PROMO_MESSAGE.to_string()),
            work_dir: std::env::var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("images")),
            assets_dir: std::env::var("ASSETS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("assets")),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_download_bytes: std::env::var("MAX_DOWNLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5_000_000),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

/// Reject image URLs that point into private address space. Empty values
/// pass (enrichment may fill them later); hostnames that do not resolve
/// also pass, the download step will surface those.
pub async fn validate_image_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Ok(());
    }
    let parsed = Url::parse(url).context("invalid image url")?;
    if !parsed.scheme().starts_with("http") {
        bail!("image url must be http(s), got scheme {:?}", parsed.scheme());
    }
    let Some(host) = parsed.host_str() else {
        return Ok(());
    };
    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs = match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => addrs,
        Err(error) => {
            warn!(host, %error, "image host did not resolve");
            return Ok(());
        }
    };
    for addr in addrs {
        if is_restricted_address(&addr.ip()) {
            bail!("image url host {host} resolves to a restricted address");
        }
    }
    Ok(())
}

fn is_restricted_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Fetches product-image bytes. The HTTP implementation carries the browser
/// User-Agent and the download byte cap from the run config.
#[async_trait]
pub trait ImageDownloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

struct HttpImageDownloader {
    http: HttpFetcher,
}

#[async_trait]
impl ImageDownloader for HttpImageDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .fetch_bytes(url)
            .await
            .context("downloading product image")?;
        Ok(response.body)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct RowNeeds {
    edit: bool,
    pin: bool,
    caption: bool,
    comment: bool,
}

impl RowNeeds {
    fn from_row(row: &DealRow) -> Self {
        Self {
            edit: row.is_blank(columns::EDITED_IMAGE),
            pin: row.is_blank(columns::PINTREST_EDITED),
            caption: row.is_blank(columns::CAPTION_WITH_HASHTAG),
            comment: row.is_blank(columns::COMMENTS),
        }
    }

    fn any(&self) -> bool {
        self.edit || self.pin || self.caption || self.comment
    }
}

/// Mutable per-row state. Starts from the row's own cells so a failure
/// mid-row leaves the echo values at whatever had been resolved by then.
struct RowWork {
    name: String,
    image_url: String,
    price: String,
    regular: String,
    edit: String,
    pin: String,
    caption: String,
    comment: String,
    local: Option<PathBuf>,
    edit_output: Option<PathBuf>,
    pin_output: Option<PathBuf>,
}

impl RowWork {
    fn from_row(row: &DealRow) -> Self {
        Self {
            name: row.get(columns::PRODUCT_TITLE).to_string(),
            image_url: row.get(columns::IMAGEURL).to_string(),
            price: row.get(columns::PRICE).to_string(),
            regular: row.get(columns::REG).to_string(),
            edit: row.get(columns::EDITED_IMAGE).to_string(),
            pin: row.get(columns::PINTREST_EDITED).to_string(),
            caption: row.get(columns::CAPTION_WITH_HASHTAG).to_string(),
            comment: row.get(columns::COMMENTS).to_string(),
            local: None,
            edit_output: None,
            pin_output: None,
        }
    }
}

/// One buffer per write-back column, filled in row order across the run.
#[derive(Default)]
struct RunBuffers {
    edit: Vec<String>,
    pin: Vec<String>,
    caption: Vec<String>,
    comment: Vec<String>,
    name: Vec<String>,
    image_url: Vec<String>,
    price: Vec<String>,
    regular: Vec<String>,
}

fn existing_or_error(value: &str) -> String {
    if value.is_empty() {
        ERROR_SENTINEL.to_string()
    } else {
        value.to_string()
    }
}

impl RunBuffers {
    fn push_skip(&mut self, row: &DealRow) {
        self.edit.push(row.get(columns::EDITED_IMAGE).to_string());
        self.pin.push(row.get(columns::PINTREST_EDITED).to_string());
        self.caption
            .push(row.get(columns::CAPTION_WITH_HASHTAG).to_string());
        self.comment.push(row.get(columns::COMMENTS).to_string());
        self.name.push(row.get(columns::PRODUCT_TITLE).to_string());
        self.image_url.push(row.get(columns::IMAGEURL).to_string());
        self.price.push(row.get(columns::PRICE).to_string());
        self.regular.push(row.get(columns::REG).to_string());
    }

    fn push_done(&mut self, work: &RowWork) {
        self.edit.push(work.edit.clone());
        self.pin.push(work.pin.clone());
        self.caption.push(work.caption.clone());
        self.comment.push(work.comment.clone());
        self.name.push(work.name.clone());
        self.image_url.push(work.image_url.clone());
        self.price.push(work.price.clone());
        self.regular.push(work.regular.clone());
    }

    fn push_error(&mut self, row: &DealRow, work: &RowWork) {
        self.edit
            .push(existing_or_error(row.get(columns::EDITED_IMAGE)));
        self.pin
            .push(existing_or_error(row.get(columns::PINTREST_EDITED)));
        self.caption
            .push(existing_or_error(row.get(columns::CAPTION_WITH_HASHTAG)));
        self.comment
            .push(existing_or_error(row.get(columns::COMMENTS)));
        self.name.push(work.name.clone());
        self.image_url.push(work.image_url.clone());
        self.price.push(work.price.clone());
        self.regular.push(work.regular.clone());
    }

    fn columns(&self) -> [(&'static str, &Vec<String>); 8] {
        [
            (columns::EDITED_IMAGE, &self.edit),
            (columns::PINTREST_EDITED, &self.pin),
            (columns::CAPTION_WITH_HASHTAG, &self.caption),
            (columns::COMMENTS, &self.comment),
            (columns::PRODUCT_TITLE, &self.name),
            (columns::IMAGEURL, &self.image_url),
            (columns::PRICE, &self.price),
            (columns::REG, &self.regular),
        ]
    }
}

/// The per-run engine. Constructed once from config; every external seam is
/// a trait object so tests can swap in scripted implementations.
pub struct DealPipeline {
    config: PipelineConfig,
    table: Arc<dyn DealTable>,
    source: Arc<dyn ProductSource>,
    downloader: Arc<dyn ImageDownloader>,
    composer: Arc<dyn Composer>,
    captions: CaptionEngine,
    host: Option<Arc<dyn ImageHost>>,
    media: MediaStore,
}

impl DealPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(BROWSER_USER_AGENT.to_string()),
            max_body_bytes: config.max_download_bytes,
            ..Default::default()
        })?;

        let table: Arc<dyn DealTable> = Arc::new(SheetsApiTable::new(
            config.sheets_api_base.clone(),
            config.sheet_id.clone(),
            config.sheet_name.clone(),
            config.sheets_api_token.clone(),
            Duration::from_secs(config.http_timeout_secs),
        )?);

        let catalog = CatalogClient::from_parts(
            config.catalog_api_endpoint.clone(),
            config.catalog_access_key.clone(),
            config.catalog_secret_key.clone(),
            config.catalog_partner_tag.clone(),
        );
        let source: Arc<dyn ProductSource> = Arc::new(ProductEnricher::new(
            http.clone(),
            catalog,
            PromoScraper::new(config.promo_scraper_enabled),
        ));

        let rules = if config.assets_dir.join("category_keywords.yaml").exists()
            && config.assets_dir.join("category_hashtags.yaml").exists()
        {
            CategoryRules::from_dir(&config.assets_dir)?
        } else {
            CategoryRules::bundled()?
        };
        let generator: Arc<dyn TextGenerator> = Arc::new(GeminiClient::new(
            http.clone(),
            GenerativeConfig {
                model: config.gemini_model.clone(),
                api_key: config.gemini_api_key.clone(),
                ..GenerativeConfig::default()
            },
        ));
        let captions = CaptionEngine::new(
            CaptionConfig {
                promo_enabled: config.promo_enabled,
                promo_default_message: config.promo_default_message.clone(),
                promo_expired_message: config.promo_expired_message.clone(),
            },
            rules,
            generator,
        );

        let host: Option<Arc<dyn ImageHost>> = if config.image_host_api_key.is_empty() {
            None
        } else {
            Some(Arc::new(MultipartImageHost::new(
                config.image_host_endpoint.clone(),
                config.image_host_api_key.clone(),
                Duration::from_secs(config.http_timeout_secs),
            )?))
        };

        let media = MediaStore::new(config.work_dir.clone());

        Ok(Self {
            config,
            table,
            source,
            downloader: Arc::new(HttpImageDownloader { http }),
            composer: Arc::new(ImageComposer::new()?),
            captions,
            host,
            media,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn with_table(mut self, table: Arc<dyn DealTable>) -> Self {
        self.table = table;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn ProductSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn ImageDownloader>) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn with_composer(mut self, composer: Arc<dyn Composer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_caption_engine(mut self, captions: CaptionEngine) -> Self {
        self.captions = captions;
        self
    }

    pub fn with_image_host(mut self, host: Option<Arc<dyn ImageHost>>) -> Self {
        self.host = host;
        self
    }

    pub async fn run_once(&self) -> Result<RunReport> {
        self.run_with_id(Uuid::new_v4()).await
    }

    /// Like [`run_once`](Self::run_once) with a caller-chosen run id, so a
    /// trigger endpoint can hand the id out before the run finishes.
    pub async fn run_with_id(&self, run_id: Uuid) -> Result<RunReport> {
        let started_at = Utc::now();
        info!(%run_id, "deal run started");

        let mut schema = SchemaManager::load(self.table.as_ref()).await?;
        schema
            .ensure_all(self.table.as_ref(), &columns::WRITEBACK_COLUMNS)
            .await
            .context("ensuring write-back columns")?;

        let records = self.table.records().await?;
        let mut buffers = RunBuffers::default();
        let mut processed = 0usize;
        let mut skipped = 0usize;
        let mut errored = 0usize;
        let mut notes = Vec::new();

        for row in &records {
            let needs = RowNeeds::from_row(row);
            if !needs.any() {
                buffers.push_skip(row);
                skipped += 1;
                continue;
            }

            let mut work = RowWork::from_row(row);
            let outcome = self.process_row(row, needs, &mut work).await;

            for path in [&work.local, &work.edit_output, &work.pin_output]
                .into_iter()
                .flatten()
            {
                self.media.remove(path).await;
            }

            match outcome {
                Ok(()) => {
                    buffers.push_done(&work);
                    processed += 1;
                }
                Err(error) => {
                    warn!(row = row.sheet_row(), %error, "row failed");
                    notes.push(format!("row {}: {error:#}", row.sheet_row()));
                    buffers.push_error(row, &work);
                    errored += 1;
                }
            }
        }

        if !records.is_empty() {
            self.write_back(&schema, &buffers).await?;
        }

        let finished_at = Utc::now();
        let report = RunReport {
            run_id,
            started_at,
            finished_at,
            rows: records.len(),
            processed,
            skipped,
            errored,
            notes,
        };
        self.persist_report(&report).await?;
        info!(
            rows = report.rows,
            processed,
            skipped,
            errored,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "deal run finished"
        );
        Ok(report)
    }

    async fn process_row(&self, row: &DealRow, needs: RowNeeds, work: &mut RowWork) -> Result<()> {
        let link = row.get(columns::DEAL_URL);
        let badge_shape = BadgeShape::parse(row.get(columns::BADGE));
        let raw_color = match row.get(columns::COLOR) {
            "" => row.get(columns::BADGE_COLOR),
            value => value,
        };
        let badge_color = normalize_color(raw_color);

        let mut promo: Option<PromoInfo> = None;
        let mut promo_code: Option<PromoCode> = None;

        if !link.is_empty() {
            let resolved = self.source.resolve(link).await;
            if work.name.is_empty() {
                work.name = resolved.name;
            }
            if work.image_url.is_empty() {
                work.image_url = resolved.image_url;
            }
            if work.price.is_empty() {
                work.price = resolved.price;
            }
            if work.regular.is_empty() {
                work.regular = resolved.regular_price;
            }
            promo = Some(resolved.promo);
            promo_code = Some(resolved.promo_code);
        }

        let manual_code = row.get(columns::PROMO_CODE);
        if !manual_code.is_empty() {
            promo_code = Some(resolve_promo_code(
                manual_code,
                promo_code.unwrap_or_else(PromoCode::none),
            ));
        }

        validate_image_url(&work.image_url).await?;

        if (needs.edit || needs.pin) && !work.image_url.is_empty() {
            match self
                .stage_product_image(&work.image_url, row.sheet_row())
                .await
            {
                Ok(path) => work.local = Some(path),
                Err(error) => {
                    warn!(row = row.sheet_row(), %error, "image download failed");
                }
            }
        }

        if needs.edit {
            if let Some(local) = work.local.clone() {
                let request = self.compose_request(&local, work, badge_shape, &badge_color, true);
                let output = self
                    .composer
                    .compose(&request)
                    .context("composing deal card")?;
                work.edit = self.publish_or_local(&output).await;
                work.edit_output = Some(output);
            }
        }

        if needs.pin {
            if let Some(local) = work.local.clone() {
                let request = self.compose_request(&local, work, badge_shape, &badge_color, false);
                let output = self
                    .composer
                    .compose(&request)
                    .context("composing pinterest card")?;
                work.pin = self.publish_or_local(&output).await;
                work.pin_output = Some(output);
            }
        }

        if needs.caption {
            work.caption = self
                .captions
                .caption(&work.name, link, promo.as_ref(), promo_code.as_ref())
                .await;
        }
        if needs.comment {
            work.comment = self.captions.first_comment(&work.name).await;
        }
        Ok(())
    }

    async fn stage_product_image(&self, url: &str, sheet_row: usize) -> Result<PathBuf> {
        let bytes = self.downloader.download(url).await?;
        let name = MediaStore::download_name(sheet_row, url);
        self.media.store_bytes(&name, &bytes).await
    }

    fn compose_request(
        &self,
        product_image: &Path,
        work: &RowWork,
        badge_shape: BadgeShape,
        badge_color: &str,
        include_link: bool,
    ) -> ComposeRequest {
        let mut request = ComposeRequest::new(product_image, work.price.as_str());
        request.regular_price = work.regular.clone();
        request.badge_color = badge_color.to_string();
        request.badge_shape = badge_shape;
        request.marketing_badge = Some(self.config.assets_dir.join(MARKETING_BADGE_FILE));
        request.link_badge = include_link.then(|| self.config.assets_dir.join(LINK_BADGE_FILE));
        request
    }

    async fn publish_or_local(&self, output: &Path) -> String {
        let Some(host) = &self.host else {
            info!("image host key not configured, keeping local path");
            return output.display().to_string();
        };
        match host.publish(output).await {
            Ok(url) => url,
            Err(error) => {
                warn!(%error, "image upload failed, keeping local path");
                output.display().to_string()
            }
        }
    }

    async fn write_back(&self, schema: &SchemaManager, buffers: &RunBuffers) -> Result<()> {
        for (column, values) in buffers.columns() {
            let position = schema
                .position(column)
                .with_context(|| format!("column {column} vanished from the header"))?;
            let letter = column_letter(position);
            let range = format!("{letter}2:{letter}{}", values.len() + 1);
            self.table
                .update_range(&range, values.clone())
                .await
                .with_context(|| format!("writing {column} values"))?;
        }
        Ok(())
    }

    async fn persist_report(&self, report: &RunReport) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .with_context(|| format!("creating {}", self.config.work_dir.display()))?;
        let path = self
            .config
            .work_dir
            .join(format!("run_{}.json", report.run_id));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Build the pipeline from environment config and run it once.
pub async fn run_from_env() -> Result<RunReport> {
    let config = PipelineConfig::from_env();
    let pipeline = DealPipeline::new(config)?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealpress_core::ProductData;
    use dealpress_image::ComposeError;
    use dealpress_storage::{MemoryTable, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const HEADER: [&str; 12] = [
        "DEAL_URL",
        "PRODUCT_TITLE",
        "IMAGEURL",
        "PRICE",
        "REG",
        "BADGE",
        "COLOR",
        "PROMO_CODE",
        "EDITED_IMAGE",
        "PINTREST_EDITED",
        "CAPTION_WITH_HASHTAG",
        "COMMENTS",
    ];

    // Column positions in the HEADER fixture, 1-based.
    const COL_TITLE: usize = 2;
    const COL_IMAGEURL: usize = 3;
    const COL_PRICE: usize = 4;
    const COL_REG: usize = 5;
    const COL_EDIT: usize = 9;
    const COL_PIN: usize = 10;
    const COL_CAPTION: usize = 11;
    const COL_COMMENT: usize = 12;

    struct OfflineGenerator;

    #[async_trait]
    impl TextGenerator for OfflineGenerator {
        async fn generate(&self, _prompt: &str) -> Option<String> {
            None
        }
    }

    struct FakeSource {
        data: ProductData,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(data: ProductData) -> Self {
            Self {
                data,
                calls: AtomicUsize::new(0),
            }
        }

        fn empty() -> Self {
            Self::new(ProductData::default())
        }
    }

    #[async_trait]
    impl ProductSource for FakeSource {
        async fn resolve(&self, _url: &str) -> ProductData {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.data.clone()
        }
    }

    struct FakeDownloader {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeDownloader {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl ImageDownloader for FakeDownloader {
        async fn download(&self, _url: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("connection refused");
            }
            Ok(vec![0xFF, 0xD8, 0xFF])
        }
    }

    /// Records requests; writes a stub output file; fails for any product
    /// image whose path contains the marker.
    struct FakeComposer {
        requests: Mutex<Vec<ComposeRequest>>,
        fail_marker: Option<String>,
    }

    impl FakeComposer {
        fn ok() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                fail_marker: None,
            }
        }

        fn failing_on(marker: &str) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                fail_marker: Some(marker.to_string()),
            }
        }
    }

    impl Composer for FakeComposer {
        fn compose(&self, request: &ComposeRequest) -> Result<PathBuf, ComposeError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(marker) = &self.fail_marker {
                if request
                    .product_image
                    .to_string_lossy()
                    .contains(marker.as_str())
                {
                    return Err(ComposeError::Color("forced failure".to_string()));
                }
            }
            let output = match &request.output {
                Some(path) => path.clone(),
                None => dealpress_image::default_output_path(&request.product_image),
            };
            std::fs::write(&output, b"jpg").expect("write stub output");
            Ok(output)
        }
    }

    struct FakeHost {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeHost {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl ImageHost for FakeHost {
        async fn publish(&self, path: &Path) -> Result<String, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Shape("upload rejected".to_string()));
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(format!("https://hosted.example/{name}"))
        }
    }

    fn test_config(work: &TempDir) -> PipelineConfig {
        PipelineConfig {
            sheet_id: String::new(),
            sheet_name: "Sheet1".to_string(),
            sheets_api_base: SheetsApiTable::DEFAULT_BASE.to_string(),
            sheets_api_token: String::new(),
            app_api_key: String::new(),
            image_host_api_key: String::new(),
            image_host_endpoint: MultipartImageHost::DEFAULT_ENDPOINT.to_string(),
            catalog_api_endpoint: None,
            catalog_access_key: None,
            catalog_secret_key: None,
            catalog_partner_tag: None,
            gemini_api_key: None,
            gemini_model: DEFAULT_GENERATIVE_MODEL.to_string(),
            promo_scraper_enabled: false,
            promo_enabled: true,
            promo_default_message: dealpress_caption::DEFAULT_PROMO_MESSAGE.to_string(),
            promo_expired_message: dealpress_caption::EXPIRED_PROMO_MESSAGE.to_string(),
            work_dir: work.path().join("images"),
            assets_dir: work.path().join("assets"),
            http_timeout_secs: 20,
            max_download_bytes: 5_000_000,
            port: 8000,
        }
    }

    fn offline_captions() -> CaptionEngine {
        CaptionEngine::new(
            CaptionConfig::default(),
            CategoryRules::bundled().expect("bundled rules"),
            Arc::new(OfflineGenerator),
        )
    }

    fn pipeline_with(
        work: &TempDir,
        table: Arc<MemoryTable>,
        source: Arc<FakeSource>,
        downloader: Arc<FakeDownloader>,
        composer: Arc<FakeComposer>,
        host: Option<Arc<FakeHost>>,
    ) -> DealPipeline {
        let host = host.map(|h| h as Arc<dyn ImageHost>);
        DealPipeline::new(test_config(work))
            .expect("pipeline")
            .with_table(table)
            .with_source(source)
            .with_downloader(downloader)
            .with_composer(composer)
            .with_caption_engine(offline_captions())
            .with_image_host(host)
    }

    #[tokio::test]
    async fn fully_populated_row_is_untouched() {
        let work = TempDir::new().expect("tempdir");
        let table = Arc::new(MemoryTable::from_rows(
            &HEADER,
            &[&[
                "https://deals.example/p/1",
                "Widget",
                "https://203.0.113.9/shot.jpg",
                "$5.00",
                "$9.00",
                "circle",
                "red",
                "",
                "https://img.example/edit.jpg",
                "https://img.example/pin.jpg",
                "existing caption",
                "existing comment",
            ]],
        ));
        let source = Arc::new(FakeSource::empty());
        let downloader = Arc::new(FakeDownloader::ok());
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            source.clone(),
            downloader.clone(),
            Arc::new(FakeComposer::ok()),
            None,
        );

        let report = pipeline.run_once().await.expect("run");
        assert_eq!(report.rows, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(report.errored, 0);

        // No network work at all for a complete row.
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);

        // Values echoed verbatim.
        assert_eq!(
            table.cell(2, COL_EDIT).await,
            "https://img.example/edit.jpg"
        );
        assert_eq!(table.cell(2, COL_CAPTION).await, "existing caption");
        assert_eq!(table.cell(2, COL_TITLE).await, "Widget");
        assert_eq!(table.cell(2, COL_PRICE).await, "$5.00");
    }

    #[tokio::test]
    async fn blank_outputs_are_generated_and_written_back() {
        let work = TempDir::new().expect("tempdir");
        let table = Arc::new(MemoryTable::from_rows(
            &HEADER,
            &[&[
                "https://deals.example/p/1",
                "Widget",
                "https://203.0.113.9/shot.jpg",
                "$5.00",
                "",
                "",
                "",
                "",
                "",
                "",
                "",
                "",
            ]],
        ));
        let enriched = ProductData {
            regular_price: "$9.00".to_string(),
            promo: PromoInfo::with_text("Save 44% Today!"),
            ..ProductData::default()
        };
        let source = Arc::new(FakeSource::new(enriched));
        let host = Arc::new(FakeHost::ok());
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            source.clone(),
            Arc::new(FakeDownloader::ok()),
            Arc::new(FakeComposer::ok()),
            Some(host.clone()),
        );

        let report = pipeline.run_once().await.expect("run");
        assert_eq!(report.processed, 1);
        assert_eq!(report.errored, 0);

        // Sheet row 2 downloads as 2_shot.jpg; both cards render to the
        // default output beside it and upload under that name.
        let hosted = "https://hosted.example/2_shot_final.jpg";
        assert_eq!(table.cell(2, COL_EDIT).await, hosted);
        assert_eq!(table.cell(2, COL_PIN).await, hosted);
        assert_eq!(host.calls.load(Ordering::SeqCst), 2);

        let caption = table.cell(2, COL_CAPTION).await;
        assert!(caption.starts_with("(Ad)(#CommissionEarned)\n"));
        assert!(caption.contains("✨ Save 44% Today! ✨"));
        assert!(caption.contains("👉 https://deals.example/p/1"));

        let comment = table.cell(2, COL_COMMENT).await;
        assert!(!comment.is_empty());

        // Row-supplied values win; the cascade only filled the blank REG.
        assert_eq!(table.cell(2, COL_TITLE).await, "Widget");
        assert_eq!(table.cell(2, COL_PRICE).await, "$5.00");
        assert_eq!(table.cell(2, COL_REG).await, "$9.00");
    }

    #[tokio::test]
    async fn row_values_always_beat_cascade_values() {
        let work = TempDir::new().expect("tempdir");
        let table = Arc::new(MemoryTable::from_rows(
            &HEADER,
            &[&[
                "https://deals.example/p/1",
                "Row Title",
                "",
                "$9.99",
                "",
                "",
                "",
                "",
                "x",
                "x",
                "",
                "x",
            ]],
        ));
        let enriched = ProductData {
            name: "Cascade Title".to_string(),
            price: "$5.00".to_string(),
            regular_price: "$20.00".to_string(),
            ..ProductData::default()
        };
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            Arc::new(FakeSource::new(enriched)),
            Arc::new(FakeDownloader::ok()),
            Arc::new(FakeComposer::ok()),
            None,
        );

        pipeline.run_once().await.expect("run");
        assert_eq!(table.cell(2, COL_TITLE).await, "Row Title");
        assert_eq!(table.cell(2, COL_PRICE).await, "$9.99");
        assert_eq!(table.cell(2, COL_REG).await, "$20.00");
    }

    #[tokio::test]
    async fn manual_promo_code_overrides_scraped_code() {
        let work = TempDir::new().expect("tempdir");
        // No deal link at all: the override still produces a code block.
        let table = Arc::new(MemoryTable::from_rows(
            &HEADER,
            &[&[
                "",
                "Desk Lamp",
                "",
                "$5.00",
                "",
                "",
                "",
                "DEAL15",
                "x",
                "x",
                "",
                "x",
            ]],
        ));
        let source = Arc::new(FakeSource::empty());
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            source.clone(),
            Arc::new(FakeDownloader::ok()),
            Arc::new(FakeComposer::ok()),
            None,
        );

        pipeline.run_once().await.expect("run");
        let caption = table.cell(2, COL_CAPTION).await;
        assert!(caption.contains("💥 Code: DEAL15\n⏳ Code may expire anytime"));
        // Blank link: no cascade call and no promo line.
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert!(!caption.contains('✨'));
    }

    #[tokio::test]
    async fn composer_failure_errors_only_its_row() {
        let work = TempDir::new().expect("tempdir");
        let table = Arc::new(MemoryTable::from_rows(
            &HEADER,
            &[
                &[
                    "",
                    "First",
                    "https://203.0.113.9/a.jpg",
                    "$1.00",
                    "",
                    "",
                    "",
                    "",
                    "",
                    "filled-pin",
                    "filled-caption",
                    "filled-comment",
                ],
                &[
                    "",
                    "Second",
                    "https://203.0.113.9/b.jpg",
                    "$2.00",
                    "",
                    "",
                    "",
                    "",
                    "",
                    "filled-pin",
                    "filled-caption",
                    "filled-comment",
                ],
            ],
        ));
        // Sheet row 2 stages its download as 2_a.jpg; fail that compose only.
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            Arc::new(FakeSource::empty()),
            Arc::new(FakeDownloader::ok()),
            Arc::new(FakeComposer::failing_on("2_a")),
            None,
        );

        let report = pipeline.run_once().await.expect("run");
        assert_eq!(report.errored, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(report.notes.len(), 1);
        assert!(report.notes[0].starts_with("row 2:"));

        // The failed row gets the sentinel only in its still-needed field.
        assert_eq!(table.cell(2, COL_EDIT).await, "ERROR");
        assert_eq!(table.cell(2, COL_PIN).await, "filled-pin");
        assert_eq!(table.cell(2, COL_CAPTION).await, "filled-caption");

        // The next row processed normally: no host key, so the local
        // composed path is the stored value.
        let row3_edit = table.cell(3, COL_EDIT).await;
        assert!(row3_edit.ends_with("3_b_final.jpg"));
    }

    #[tokio::test]
    async fn download_failure_leaves_image_outputs_untouched() {
        let work = TempDir::new().expect("tempdir");
        let table = Arc::new(MemoryTable::from_rows(
            &HEADER,
            &[&[
                "",
                "Desk Lamp",
                "https://203.0.113.9/gone.jpg",
                "$5.00",
                "",
                "",
                "",
                "",
                "",
                "",
                "",
                "x",
            ]],
        ));
        let composer = Arc::new(FakeComposer::ok());
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            Arc::new(FakeSource::empty()),
            Arc::new(FakeDownloader::failing()),
            composer.clone(),
            None,
        );

        let report = pipeline.run_once().await.expect("run");
        // Not a row error: the caption still gets generated.
        assert_eq!(report.processed, 1);
        assert_eq!(report.errored, 0);
        assert_eq!(table.cell(2, COL_EDIT).await, "");
        assert_eq!(table.cell(2, COL_PIN).await, "");
        assert!(!table.cell(2, COL_CAPTION).await.is_empty());
        assert!(composer.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn private_image_url_fails_the_row() {
        let work = TempDir::new().expect("tempdir");
        let table = Arc::new(MemoryTable::from_rows(
            &HEADER,
            &[&[
                "",
                "Desk Lamp",
                "http://127.0.0.1/internal.png",
                "$5.00",
                "",
                "",
                "",
                "",
                "",
                "",
                "",
                "",
            ]],
        ));
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            Arc::new(FakeSource::empty()),
            Arc::new(FakeDownloader::ok()),
            Arc::new(FakeComposer::ok()),
            None,
        );

        let report = pipeline.run_once().await.expect("run");
        assert_eq!(report.errored, 1);
        assert_eq!(table.cell(2, COL_EDIT).await, "ERROR");
        assert_eq!(table.cell(2, COL_PIN).await, "ERROR");
        assert_eq!(table.cell(2, COL_CAPTION).await, "ERROR");
        assert_eq!(table.cell(2, COL_COMMENT).await, "ERROR");
        // Echo buffers keep the value that failed validation.
        assert_eq!(
            table.cell(2, COL_IMAGEURL).await,
            "http://127.0.0.1/internal.png"
        );
    }

    #[tokio::test]
    async fn upload_failure_falls_back_to_the_local_path() {
        let work = TempDir::new().expect("tempdir");
        let table = Arc::new(MemoryTable::from_rows(
            &HEADER,
            &[&[
                "",
                "Desk Lamp",
                "https://203.0.113.9/shot.jpg",
                "$5.00",
                "",
                "",
                "",
                "",
                "",
                "x",
                "x",
                "x",
            ]],
        ));
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            Arc::new(FakeSource::empty()),
            Arc::new(FakeDownloader::ok()),
            Arc::new(FakeComposer::ok()),
            Some(Arc::new(FakeHost::failing())),
        );

        let report = pipeline.run_once().await.expect("run");
        assert_eq!(report.processed, 1);
        assert!(table.cell(2, COL_EDIT).await.ends_with("2_shot_final.jpg"));
    }

    #[tokio::test]
    async fn compose_requests_carry_badges_and_overlays() {
        let work = TempDir::new().expect("tempdir");
        let table = Arc::new(MemoryTable::from_rows(
            &HEADER,
            &[&[
                "",
                "Desk Lamp",
                "https://203.0.113.9/shot.jpg",
                "$5.00",
                "$9.00",
                "square",
                "blue",
                "",
                "",
                "",
                "x",
                "x",
            ]],
        ));
        let composer = Arc::new(FakeComposer::ok());
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            Arc::new(FakeSource::empty()),
            Arc::new(FakeDownloader::ok()),
            composer.clone(),
            None,
        );

        pipeline.run_once().await.expect("run");
        let requests = composer.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);

        // Deal card first (with the link overlay), pinterest card second.
        assert_eq!(requests[0].badge_shape, BadgeShape::Square);
        assert_eq!(requests[0].badge_color, "#3895D3");
        assert_eq!(requests[0].regular_price, "$9.00");
        assert!(requests[0]
            .marketing_badge
            .as_deref()
            .expect("marketing badge path")
            .ends_with("black_friday.png"));
        assert!(requests[0]
            .link_badge
            .as_deref()
            .expect("link badge path")
            .ends_with("link.png"));
        assert_eq!(requests[1].link_badge, None);
    }

    #[tokio::test]
    async fn missing_output_columns_are_appended_before_writing() {
        let work = TempDir::new().expect("tempdir");
        let table = Arc::new(MemoryTable::from_rows(
            &["DEAL_URL", "PRODUCT_TITLE", "IMAGEURL", "PRICE", "REG"],
            &[&["", "Desk Lamp", "", "$5.00", ""]],
        ));
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            Arc::new(FakeSource::empty()),
            Arc::new(FakeDownloader::ok()),
            Arc::new(FakeComposer::ok()),
            None,
        );

        pipeline.run_once().await.expect("run");
        let header = table.snapshot().await[0].clone();
        assert_eq!(
            header,
            vec![
                "DEAL_URL",
                "PRODUCT_TITLE",
                "IMAGEURL",
                "PRICE",
                "REG",
                "EDITED_IMAGE",
                "PINTREST_EDITED",
                "CAPTION_WITH_HASHTAG",
                "COMMENTS",
            ]
        );
        // Caption landed in the appended column (H = position 8).
        assert!(table
            .cell(2, 8)
            .await
            .starts_with("(Ad)(#CommissionEarned)"));
        assert!(!table.cell(2, 9).await.is_empty());
    }

    #[tokio::test]
    async fn staged_media_is_removed_after_each_row() {
        let work = TempDir::new().expect("tempdir");
        let table = Arc::new(MemoryTable::from_rows(
            &HEADER,
            &[&[
                "",
                "Desk Lamp",
                "https://203.0.113.9/shot.jpg",
                "$5.00",
                "",
                "",
                "",
                "",
                "",
                "",
                "x",
                "x",
            ]],
        ));
        let config = test_config(&work);
        let images_dir = config.work_dir.clone();
        let pipeline = pipeline_with(
            &work,
            table.clone(),
            Arc::new(FakeSource::empty()),
            Arc::new(FakeDownloader::ok()),
            Arc::new(FakeComposer::ok()),
            None,
        );

        let report = pipeline.run_once().await.expect("run");
        let mut leftover = Vec::new();
        for entry in std::fs::read_dir(&images_dir).expect("read work dir") {
            let name = entry
                .expect("entry")
                .file_name()
                .to_string_lossy()
                .into_owned();
            if !name.starts_with("run_") {
                leftover.push(name);
            }
        }
        assert!(leftover.is_empty(), "unexpected leftovers: {leftover:?}");
        // The run report is the one file that stays.
        assert!(images_dir
            .join(format!("run_{}.json", report.run_id))
            .exists());
    }

    #[tokio::test]
    async fn image_url_validation_rules() {
        assert!(validate_image_url("").await.is_ok());
        assert!(validate_image_url("https://203.0.113.9/a.png").await.is_ok());
        // Unresolvable hosts pass; the download step reports them.
        assert!(validate_image_url("https://no-such-host.invalid/a.png")
            .await
            .is_ok());

        assert!(validate_image_url("http://127.0.0.1/a.png").await.is_err());
        assert!(validate_image_url("http://10.0.0.8/a.png").await.is_err());
        assert!(validate_image_url("http://192.168.1.5/a.png").await.is_err());
        assert!(validate_image_url("http://169.254.1.1/a.png").await.is_err());
        assert!(validate_image_url("ftp://example.com/a.png").await.is_err());
        assert!(validate_image_url("not a url").await.is_err());
    }

    #[test]
    fn restricted_address_checks() {
        assert!(is_restricted_address(&"127.0.0.1".parse().unwrap()));
        assert!(is_restricted_address(&"10.1.2.3".parse().unwrap()));
        assert!(is_restricted_address(&"172.16.0.1".parse().unwrap()));
        assert!(is_restricted_address(&"0.0.0.0".parse().unwrap()));
        assert!(is_restricted_address(&"::1".parse().unwrap()));
        assert!(is_restricted_address(&"fe80::1".parse().unwrap()));
        assert!(is_restricted_address(&"fc00::1".parse().unwrap()));
        assert!(!is_restricted_address(&"203.0.113.9".parse().unwrap()));
        assert!(!is_restricted_address(
            &"2001:4860:4860::8888".parse().unwrap()
        ));
    }
}
