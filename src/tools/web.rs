//! Web 动作：web_extract（抓取网页正文）与 web_search（Firecrawl 搜索）
//!
//! web_extract 不需要凭据：GET 请求带超时与 User-Agent，HTML 用 html2text 提取可读文本，
//! 超过 max_chars 时截断并追加 ...[truncated]。
//! web_search 依赖 FIRECRAWL_API_KEY；缺失时该动作在能力集解析阶段被静默移除。

use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::schema::{parameters_for, parse_args, WebExtractArgs, WebSearchArgs};
use crate::tools::{ActionContext, ActionError, Tool};

pub const FIRECRAWL_API_KEY: &str = "FIRECRAWL_API_KEY";
const FIRECRAWL_SEARCH_URL: &str = "https://api.firecrawl.dev/v1/search";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

fn http_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    let head: String = s.chars().take(512).collect::<String>().to_lowercase();
    head.starts_with("<!") || head.starts_with("<html") || head.contains("<head") || head.contains("<body")
}

fn html_to_text(html: &str) -> String {
    match from_read(html.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(html),
    }
}

fn truncate(body: String, max_chars: usize) -> String {
    if body.chars().count() > max_chars {
        body.chars().take(max_chars).collect::<String>() + "\n...[truncated]"
    } else {
        body
    }
}

/// web_extract：抓取单个 URL 的可读内容
pub struct WebExtractTool {
    client: Client,
    max_chars: usize,
}

impl WebExtractTool {
    pub fn new(timeout_secs: u64, max_chars: usize) -> Self {
        Self {
            client: http_client(timeout_secs),
            max_chars,
        }
    }
}

#[async_trait]
impl Tool for WebExtractTool {
    fn name(&self) -> &str {
        "web_extract"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its readable text content. Args: {\"url\": \"https://...\"}."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<WebExtractArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ActionContext) -> Result<String, ActionError> {
        let args: WebExtractArgs = parse_args(args)?;
        let url = args.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ActionError::validation(format!("unsupported url: {url}")));
        }
        tracing::info!(url = %url, "web_extract fetch");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ActionError::failed(format!("request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ActionError::failed(format!("HTTP {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ActionError::failed(format!("read body: {e}")))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(body) {
            html_to_text(body)
        } else {
            body.to_string()
        };
        Ok(json!({ "url": url, "content": truncate(text, self.max_chars) }).to_string())
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

/// web_search：Firecrawl 搜索（需要 FIRECRAWL_API_KEY）
pub struct WebSearchTool {
    client: Client,
    endpoint: String,
}

impl WebSearchTool {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            client: http_client(timeout_secs),
            endpoint: FIRECRAWL_SEARCH_URL.to_string(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns a list of results with url, title and description. Args: {\"query\": \"...\", \"limit\": 5}."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<WebSearchArgs>()
    }

    fn requirements(&self) -> Vec<String> {
        vec![FIRECRAWL_API_KEY.to_string()]
    }

    async fn execute(&self, args: Value, _ctx: &ActionContext) -> Result<String, ActionError> {
        let args: WebSearchArgs = parse_args(args)?;
        let api_key = std::env::var(FIRECRAWL_API_KEY)
            .map_err(|_| ActionError::failed(format!("{FIRECRAWL_API_KEY} is not set")))?;
        let limit = args.limit.unwrap_or(5).clamp(1, 10);
        tracing::info!(query = %args.query, limit, "web_search");

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&json!({ "query": args.query, "limit": limit }))
            .send()
            .await
            .map_err(|e| ActionError::failed(format!("search request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ActionError::failed(format!("search HTTP {}", resp.status())));
        }
        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| ActionError::failed(format!("search response: {e}")))?;
        let results: Vec<Value> = parsed
            .data
            .into_iter()
            .map(|h| json!({ "url": h.url, "title": h.title, "description": h.description }))
            .collect();
        Ok(json!({ "results": results }).to_string())
    }
}
