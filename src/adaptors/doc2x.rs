//! Doc2x adaptor
//!
//! PDF parsing is asynchronous upstream: the file is uploaded, then the task
//! status is polled until the per-page Markdown is ready. The Markdown is
//! cleaned up before it is returned (HTML tables and images are rewritten and
//! remote images are inlined as `data:` URLs).

use super::{
    decode, ensure_success, read_body, unsupported, validate_bearer_key, Adaptor, HttpClients,
    KeyValidator, UpstreamBody,
};
use crate::models::channel::ModelConfig;
use crate::models::meta::{Meta, META_RESPONSE_FORMAT};
use crate::models::mode::Mode;
use crate::models::openai::{ParsePdfListResponse, ParsePdfResponse, RelayRequest, Usage};
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use crate::utils::image::mime_from_url;
use anyhow::{bail, Context};
use async_trait::async_trait;
use axum::http::StatusCode;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const STATUS_SUCCESS: &str = "success";
const STATUS_FAILED: &str = "failed";
/// Upper bound for a single rowspan/colspan attribute
const MAX_SPAN: usize = 64;

static MODEL_LIST: Lazy<Vec<ModelConfig>> =
    Lazy::new(|| vec![ModelConfig::new("doc2x", Mode::ParsePdf, "doc2x").price(0.02, 0.0)]);

static TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<table>[\s\S]*?</table>").expect("valid regex"));
static TABLE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"<tr>(.*?)</tr>").expect("valid regex"));
static TABLE_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<td[^>]*/>|<td[^>]*>(.*?)</td>").expect("valid regex"));
static LINE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*").expect("valid regex"));
static CELL_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<td.*?>|</td>").expect("valid regex"));
static COLSPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r#"colspan="(\d+)""#).expect("valid regex"));
static ROWSPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r#"rowspan="(\d+)""#).expect("valid regex"));
static HTML_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<img\s+src="([^"]+)"(?:\s*\?[^>]*)?(?:\s*/>|>)"#).expect("valid regex")
});
static MD_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[(.*?)\]\((http[^)]+)\)").expect("valid regex"));

/// Layout markers Doc2x leaves in the Markdown
const LAYOUT_COMMENTS: [&str; 2] = ["<!-- Media -->", "<!-- Footnote -->"];

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
    data: Option<UploadData>,
}

#[derive(Debug, Deserialize)]
struct UploadData {
    uid: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
    data: Option<StatusData>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    #[serde(default)]
    progress: u32,
    #[serde(default)]
    status: String,
    #[serde(default)]
    detail: String,
    result: Option<ParseResult>,
}

#[derive(Debug, Default, Deserialize)]
struct ParseResult {
    #[serde(default)]
    pages: Vec<ParsedPage>,
}

#[derive(Debug, Deserialize)]
struct ParsedPage {
    #[serde(default)]
    md: String,
}

fn parse_failed(message: String) -> AppError {
    AppError::Upstream {
        status: StatusCode::BAD_REQUEST,
        message: format!("parse pdf failed: {}", message),
        error_type: "parse_pdf_failed".to_string(),
        code: None,
    }
}

/// Doc2x PDF parsing adaptor
pub struct Doc2xAdaptor {
    clients: HttpClients,
    poll_interval: Duration,
    max_wait: Duration,
}

impl Doc2xAdaptor {
    pub fn new(clients: HttpClients) -> Self {
        Self {
            clients,
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(600),
        }
    }

    /// Override how often and how long the parse status is polled
    pub fn with_polling(mut self, poll_interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.max_wait = max_wait;
        self
    }

    fn check_mode(&self, mode: Mode) -> AppResult<()> {
        if mode == Mode::ParsePdf {
            Ok(())
        } else {
            Err(unsupported(self.channel_name(), mode))
        }
    }

    async fn wait_for_result(&self, meta: &Meta, uid: &str) -> AppResult<ParseResult> {
        let url = format!("{}/api/v2/parse/status", meta.base_url());
        let deadline = Instant::now() + self.max_wait;

        loop {
            let response = self
                .clients
                .client
                .get(&url)
                .query(&[("uid", uid)])
                .bearer_auth(&meta.channel.key)
                .send()
                .await?;
            let response = ensure_success(response).await?;
            let status: StatusResponse = decode(&read_body(response).await?)?;
            if status.code != STATUS_SUCCESS {
                return Err(AppError::Upstream {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: format!("get status failed: {}", status.msg),
                    error_type: "get_status_failed".to_string(),
                    code: None,
                });
            }

            let data = status
                .data
                .ok_or_else(|| AppError::Decode("status response without data".to_string()))?;
            match data.status.as_str() {
                STATUS_SUCCESS => return Ok(data.result.unwrap_or_default()),
                STATUS_FAILED => return Err(parse_failed(data.detail)),
                other => debug!("Parse task {} is {} ({}%)", uid, other, data.progress),
            }

            if Instant::now() >= deadline {
                return Err(AppError::Upstream {
                    status: StatusCode::GATEWAY_TIMEOUT,
                    message: format!("parse task {} did not finish in {:?}", uid, self.max_wait),
                    error_type: "parse_pdf_timeout".to_string(),
                    code: None,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl KeyValidator for Doc2xAdaptor {
    fn validate_key(&self, key: &str) -> AppResult<()> {
        validate_bearer_key(key)
    }
}

/// Rewrite every HTML table as a Markdown table
///
/// Spanned cells are repeated as `^^` so the grid stays rectangular.
pub fn html_table_to_md(content: &str) -> String {
    TABLE
        .replace_all(content, |caps: &Captures| convert_table(&caps[0]))
        .into_owned()
}

fn span(pattern: &Regex, cell: &str) -> usize {
    pattern
        .captures(cell)
        .and_then(|c| c[1].parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, MAX_SPAN)
}

fn convert_table(html: &str) -> String {
    let clean = LINE_BREAK.replace_all(html, "");
    let rows: Vec<&str> = TABLE_ROW.find_iter(&clean).map(|m| m.as_str()).collect();

    let mut grid: Vec<Vec<Option<String>>> = Vec::new();
    for (row_index, row) in rows.iter().enumerate() {
        let mut column = 0;
        for cell in TABLE_CELL.find_iter(row).map(|m| m.as_str()) {
            if grid.len() <= row_index {
                grid.resize(row_index + 1, Vec::new());
            }
            // skip columns filled by a rowspan from above
            while grid[row_index].get(column).is_some_and(Option::is_some) {
                column += 1;
            }

            let colspan = span(&COLSPAN, cell);
            let rowspan = span(&ROWSPAN, cell);
            let text = CELL_TAG.replace_all(cell, "").trim().to_string();
            for i in 0..rowspan {
                for j in 0..colspan {
                    let (r, c) = (row_index + i, column + j);
                    if grid.len() <= r {
                        grid.resize(r + 1, Vec::new());
                    }
                    if grid[r].len() <= c {
                        grid[r].resize(c + 1, None);
                    }
                    let cell = if i == 0 && j == 0 {
                        text.clone()
                    } else {
                        "^^".to_string()
                    };
                    grid[r][c] = Some(cell);
                }
            }
            column += colspan;
        }
    }

    if grid.is_empty() {
        return html.to_string();
    }

    let columns = grid.iter().map(Vec::len).max().unwrap_or(0);
    let render = |row: &[Option<String>]| {
        let cells: Vec<&str> = (0..columns)
            .map(|c| row.get(c).and_then(Option::as_deref).unwrap_or(" "))
            .collect();
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = Vec::with_capacity(grid.len() + 1);
    lines.push(render(grid[0].as_slice()));
    lines.push(format!("| {} |", vec!["---"; columns].join(" | ")));
    lines.extend(grid[1..].iter().map(|row| render(row.as_slice())));
    lines.join("\n")
}

/// Rewrite `<img src="...">` tags as Markdown images
pub fn html_image_to_md(content: &str) -> String {
    HTML_IMAGE.replace_all(content, "![img](${1})").into_owned()
}

/// Drop the layout comments from parsed Markdown
pub fn strip_layout_comments(content: &str) -> String {
    LAYOUT_COMMENTS
        .iter()
        .fold(content.to_string(), |text, comment| text.replace(comment, ""))
}

async fn image_data_url(client: &Client, url: &str) -> anyhow::Result<String> {
    let response = client.get(url).send().await.context("failed to download image")?;
    if !response.status().is_success() {
        bail!("failed to download image, status code: {}", response.status());
    }
    let mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| mime_from_url(url).to_string());
    let data = response.bytes().await.context("failed to read image data")?;
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(&data)))
}

/// Replace remote Markdown images with inline base64 copies.
///
/// Images are fetched concurrently; one that cannot be fetched keeps its
/// original link.
pub async fn inline_images(client: &Client, content: &str) -> String {
    let text = html_image_to_md(content);
    let images: Vec<(usize, usize, String, String)> = MD_IMAGE
        .captures_iter(&text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let alt = caps.get(1)?.as_str().to_string();
            let url = caps.get(2)?.as_str().to_string();
            Some((whole.start(), whole.end(), alt, url))
        })
        .collect();
    if images.is_empty() {
        return text;
    }

    let fetched = join_all(images.iter().map(|(_, _, _, url)| image_data_url(client, url))).await;

    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    for ((start, end, alt, url), data_url) in images.iter().zip(fetched) {
        result.push_str(&text[last..*start]);
        match data_url {
            Ok(data_url) => result.push_str(&format!("![{}]({})", alt, data_url)),
            Err(e) => {
                warn!("Failed to inline image {}: {:#}", url, e);
                result.push_str(&text[*start..*end]);
            }
        }
        last = *end;
    }
    result.push_str(&text[last..]);
    result
}

/// Full clean-up of one parsed Markdown text
pub async fn convert_markdown(client: &Client, content: &str) -> String {
    let inlined = inline_images(client, content).await;
    strip_layout_comments(&html_table_to_md(&inlined))
}

#[async_trait]
impl Adaptor for Doc2xAdaptor {
    fn channel_name(&self) -> &'static str {
        "doc2x"
    }

    fn default_base_url(&self) -> &'static str {
        "https://v2.doc2x.noedgeai.com"
    }

    fn model_list(&self) -> &[ModelConfig] {
        &MODEL_LIST
    }

    fn http_clients(&self) -> &HttpClients {
        &self.clients
    }

    async fn get_request_url(&self, meta: &Meta) -> AppResult<String> {
        self.check_mode(meta.mode)?;
        Ok(format!("{}/api/v2/parse/pdf", meta.base_url()))
    }

    async fn setup_request_header(
        &self,
        meta: &Meta,
        builder: RequestBuilder,
    ) -> AppResult<RequestBuilder> {
        Ok(builder.bearer_auth(&meta.channel.key))
    }

    fn convert_request(&self, meta: &Meta, request: &RelayRequest) -> AppResult<UpstreamBody> {
        self.check_mode(meta.mode)?;
        match request {
            RelayRequest::Document(document) => Ok(UpstreamBody::Raw {
                content_type: "application/pdf".to_string(),
                body: document.file.clone(),
            }),
            _ => Err(unsupported(self.channel_name(), meta.mode)),
        }
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        self.check_mode(meta.mode)?;
        let response = ensure_success(response).await?;
        let upload: UploadResponse = decode(&read_body(response).await?)?;
        let uid = match upload.data {
            Some(data) if upload.code == STATUS_SUCCESS => data.uid,
            _ => return Err(parse_failed(upload.msg)),
        };
        debug!("Doc2x accepted upload as task {}", uid);

        let result = self.wait_for_result(meta, &uid).await?;
        let pages = result.pages.len();
        let client = &self.clients.client;

        if meta.get(META_RESPONSE_FORMAT) == Some("list") {
            let conversions = result.pages.iter().map(|page| convert_markdown(client, &page.md));
            let markdowns = join_all(conversions).await;
            writer.write_json(StatusCode::OK, &ParsePdfListResponse { markdowns }).await?;
        } else {
            let joined: String = result.pages.iter().map(|page| page.md.as_str()).collect();
            let markdown = convert_markdown(client, &joined).await;
            writer.write_json(StatusCode::OK, &ParsePdfResponse { pages, markdown }).await?;
        }

        // pages are billed as prompt units
        let pages = u32::try_from(pages).unwrap_or(u32::MAX);
        Ok(Usage::new(pages, 0))
    }

    fn key_validator(&self) -> Option<&dyn KeyValidator> {
        Some(self)
    }
}
