use std::collections::BTreeMap;
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;

use crate::config::XWordConfig;
use crate::xmlrpc::{self, Value};

/// Summary record returned by `confluence1.getSpaces`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SpaceSummary {
    pub key: String,
    pub name: String,
    pub url: String,
}

/// Full space record returned by `confluence1.getSpace`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SpaceRecord {
    pub key: String,
    pub name: String,
    pub url: String,
    pub description: String,
    pub home_page: String,
}

/// Summary record returned by `confluence1.getPages`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PageSummary {
    pub id: String,
    pub space: String,
    pub parent_id: String,
    pub title: String,
    pub url: String,
}

/// Full page record, including content, as returned by `confluence1.getPage`
/// and acknowledged by `confluence1.storePage`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Page {
    pub id: String,
    pub space: String,
    pub parent_id: String,
    pub title: String,
    pub url: String,
    pub content: String,
    pub version: Option<i32>,
    pub created: Option<String>,
    pub creator: Option<String>,
    pub modified: Option<String>,
    pub modifier: Option<String>,
}

/// One revision entry from the page history listings.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PageHistorySummary {
    pub id: String,
    pub version: Option<i32>,
    pub modifier: Option<String>,
    pub modified: Option<String>,
}

/// Attachment metadata; binary payloads travel separately as base64.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub page_id: String,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub content_type: String,
    pub created: Option<String>,
    pub creator: Option<String>,
    pub url: String,
}

/// The remote procedure surface of a Confluence-compatible XML-RPC wiki.
///
/// Each call is a single synchronous round trip that either fully succeeds or
/// fails; no partial-write semantics exist. The session token returned by
/// `login` is reused by every subsequent call.
pub trait XWikiProxy {
    fn login(&mut self, username: &str, password: &str) -> Result<String>;
    fn get_spaces(&mut self, token: &str) -> Result<Vec<SpaceSummary>>;
    fn get_space(&mut self, token: &str, space_key: &str) -> Result<SpaceRecord>;
    fn get_pages(&mut self, token: &str, space_key: &str) -> Result<Vec<PageSummary>>;
    fn get_page(&mut self, token: &str, page_id: &str) -> Result<Page>;
    /// Unguarded store: overwrites whatever the server holds for the page.
    fn store_page(&mut self, token: &str, page: &Page) -> Result<Page>;
    /// Guarded store: with `check_version` set the server must fail rather
    /// than overwrite when the page identity already exists remotely.
    fn store_page_checked(&mut self, token: &str, page: &Page, check_version: bool)
    -> Result<Page>;
    fn remove_page(&mut self, token: &str, page_id: &str) -> Result<bool>;
    fn get_page_history(&mut self, token: &str, page_id: &str) -> Result<Vec<PageHistorySummary>>;
    fn get_modified_pages_history(
        &mut self,
        token: &str,
        since: &str,
        max_results: i32,
    ) -> Result<Vec<PageHistorySummary>>;
    fn get_attachments(&mut self, token: &str, page_id: &str) -> Result<Vec<Attachment>>;
    fn add_attachment(
        &mut self,
        token: &str,
        content_id: i32,
        attachment: &Attachment,
        data: &[u8],
    ) -> Result<Attachment>;
    fn get_attachment_data(
        &mut self,
        token: &str,
        page_id: &str,
        file_name: &str,
        version: &str,
    ) -> Result<Vec<u8>>;
    fn remove_attachment(&mut self, token: &str, page_id: &str, file_name: &str) -> Result<bool>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct XWikiClientConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl XWikiClientConfig {
    pub fn from_env() -> Self {
        Self::from_env_with_defaults("", crate::config::DEFAULT_USER_AGENT)
    }

    pub fn from_config(config: &XWordConfig) -> Self {
        let endpoint = config.endpoint().unwrap_or_default();
        Self::from_env_with_defaults(&endpoint, &config.user_agent())
    }

    fn from_env_with_defaults(endpoint_default: &str, user_agent_default: &str) -> Self {
        Self {
            endpoint: env_value("XWIKI_ENDPOINT", endpoint_default),
            user_agent: env_value("XWIKI_USER_AGENT", user_agent_default),
            timeout_ms: env_value_u64("XWIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("XWIKI_RATE_LIMIT_READ", 100),
            rate_limit_write_ms: env_value_u64("XWIKI_RATE_LIMIT_WRITE", 500),
            max_retries: env_value_usize("XWIKI_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("XWIKI_HTTP_WRITE_RETRIES", 0),
            retry_delay_ms: env_value_u64("XWIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

/// Blocking XML-RPC client for an XWiki server's Confluence-compatible
/// endpoint.
#[derive(Debug)]
pub struct XWikiClient {
    client: Client,
    config: XWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl XWikiClient {
    pub fn from_env() -> Result<Self> {
        Self::new(XWikiClientConfig::from_env())
    }

    pub fn new(config: XWikiClientConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            bail!("no XML-RPC endpoint configured (set XWIKI_ENDPOINT or [wiki] url)");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build XML-RPC HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    /// One round trip. Retries are transport-level only: an XML-RPC fault is a
    /// remote application error and surfaces immediately, never retried.
    fn call(&mut self, method: &str, params: &[Value], is_write: bool) -> Result<Value> {
        let body = xmlrpc::write_call(method, params);
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = self
                .client
                .post(&self.config.endpoint)
                .header("User-Agent", self.config.user_agent.clone())
                .header("Content-Type", "text/xml")
                .body(body.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        bail!("XML-RPC call `{method}` failed with HTTP {status}");
                    }
                    let text = response
                        .text()
                        .context("failed to read XML-RPC response body")?;
                    return xmlrpc::parse_response(&text)
                        .with_context(|| format!("XML-RPC call `{method}` failed"));
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to call `{method}`"));
                }
            }
        }

        bail!("XML-RPC call `{method}` exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }
}

impl XWikiProxy for XWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<String> {
        let value = self.call(
            "confluence1.login",
            &[str_value(username), str_value(password)],
            false,
        )?;
        value
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("login did not return a session token"))
    }

    fn get_spaces(&mut self, token: &str) -> Result<Vec<SpaceSummary>> {
        let value = self.call("confluence1.getSpaces", &[str_value(token)], false)?;
        decode_array(&value, SpaceSummary::from_value)
            .context("failed to decode getSpaces response")
    }

    fn get_space(&mut self, token: &str, space_key: &str) -> Result<SpaceRecord> {
        let value = self.call(
            "confluence1.getSpace",
            &[str_value(token), str_value(space_key)],
            false,
        )?;
        SpaceRecord::from_value(&value).context("failed to decode getSpace response")
    }

    fn get_pages(&mut self, token: &str, space_key: &str) -> Result<Vec<PageSummary>> {
        let value = self.call(
            "confluence1.getPages",
            &[str_value(token), str_value(space_key)],
            false,
        )?;
        decode_array(&value, PageSummary::from_value).context("failed to decode getPages response")
    }

    fn get_page(&mut self, token: &str, page_id: &str) -> Result<Page> {
        let value = self.call(
            "confluence1.getPage",
            &[str_value(token), str_value(page_id)],
            false,
        )?;
        Page::from_value(&value).context("failed to decode getPage response")
    }

    fn store_page(&mut self, token: &str, page: &Page) -> Result<Page> {
        let value = self.call(
            "confluence1.storePage",
            &[str_value(token), page.to_value()],
            true,
        )?;
        Page::from_value(&value).context("failed to decode storePage response")
    }

    fn store_page_checked(
        &mut self,
        token: &str,
        page: &Page,
        check_version: bool,
    ) -> Result<Page> {
        let value = self.call(
            "confluence1.storePage",
            &[str_value(token), page.to_value(), Value::Bool(check_version)],
            true,
        )?;
        Page::from_value(&value).context("failed to decode storePage response")
    }

    fn remove_page(&mut self, token: &str, page_id: &str) -> Result<bool> {
        let value = self.call(
            "confluence1.removePage",
            &[str_value(token), str_value(page_id)],
            true,
        )?;
        value
            .as_bool()
            .ok_or_else(|| anyhow::anyhow!("removePage did not return a boolean"))
    }

    fn get_page_history(&mut self, token: &str, page_id: &str) -> Result<Vec<PageHistorySummary>> {
        let value = self.call(
            "confluence1.getPageHistory",
            &[str_value(token), str_value(page_id)],
            false,
        )?;
        decode_array(&value, PageHistorySummary::from_value)
            .context("failed to decode getPageHistory response")
    }

    fn get_modified_pages_history(
        &mut self,
        token: &str,
        since: &str,
        max_results: i32,
    ) -> Result<Vec<PageHistorySummary>> {
        let value = self.call(
            "confluence1.getModifiedPagesHistory",
            &[
                str_value(token),
                Value::DateTime(since.to_string()),
                Value::Int(max_results),
            ],
            false,
        )?;
        decode_array(&value, PageHistorySummary::from_value)
            .context("failed to decode getModifiedPagesHistory response")
    }

    fn get_attachments(&mut self, token: &str, page_id: &str) -> Result<Vec<Attachment>> {
        let value = self.call(
            "confluence1.getAttachments",
            &[str_value(token), str_value(page_id)],
            false,
        )?;
        decode_array(&value, Attachment::from_value)
            .context("failed to decode getAttachments response")
    }

    fn add_attachment(
        &mut self,
        token: &str,
        content_id: i32,
        attachment: &Attachment,
        data: &[u8],
    ) -> Result<Attachment> {
        let value = self.call(
            "confluence1.addAttachment",
            &[
                str_value(token),
                Value::Int(content_id),
                attachment.to_value(),
                Value::Base64(data.to_vec()),
            ],
            true,
        )?;
        Attachment::from_value(&value).context("failed to decode addAttachment response")
    }

    fn get_attachment_data(
        &mut self,
        token: &str,
        page_id: &str,
        file_name: &str,
        version: &str,
    ) -> Result<Vec<u8>> {
        let value = self.call(
            "confluence1.getAttachmentData",
            &[
                str_value(token),
                str_value(page_id),
                str_value(file_name),
                str_value(version),
            ],
            false,
        )?;
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| anyhow::anyhow!("getAttachmentData did not return a base64 payload"))
    }

    fn remove_attachment(&mut self, token: &str, page_id: &str, file_name: &str) -> Result<bool> {
        let value = self.call(
            "confluence1.removeAttachment",
            &[str_value(token), str_value(page_id), str_value(file_name)],
            true,
        )?;
        value
            .as_bool()
            .ok_or_else(|| anyhow::anyhow!("removeAttachment did not return a boolean"))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl SpaceSummary {
    pub fn from_value(value: &Value) -> Result<Self> {
        let members = require_struct(value)?;
        Ok(Self {
            key: member_str(members, "key"),
            name: member_str(members, "name"),
            url: member_str(members, "url"),
        })
    }
}

impl SpaceRecord {
    pub fn from_value(value: &Value) -> Result<Self> {
        let members = require_struct(value)?;
        Ok(Self {
            key: member_str(members, "key"),
            name: member_str(members, "name"),
            url: member_str(members, "url"),
            description: member_str(members, "description"),
            home_page: member_str(members, "homePage"),
        })
    }
}

impl PageSummary {
    pub fn from_value(value: &Value) -> Result<Self> {
        let members = require_struct(value)?;
        Ok(Self {
            id: member_str(members, "id"),
            space: member_str(members, "space"),
            parent_id: member_str(members, "parentId"),
            title: member_str(members, "title"),
            url: member_str(members, "url"),
        })
    }
}

impl Page {
    pub fn from_value(value: &Value) -> Result<Self> {
        let members = require_struct(value)?;
        Ok(Self {
            id: member_str(members, "id"),
            space: member_str(members, "space"),
            parent_id: member_str(members, "parentId"),
            title: member_str(members, "title"),
            url: member_str(members, "url"),
            content: member_str(members, "content"),
            version: members.get("version").and_then(Value::as_i32),
            created: member_opt_str(members, "created"),
            creator: member_opt_str(members, "creator"),
            modified: member_opt_str(members, "modified"),
            modifier: member_opt_str(members, "modifier"),
        })
    }

    /// Encodes the fields a store call sends; empty optional identifiers are
    /// left out so the server assigns them.
    pub fn to_value(&self) -> Value {
        let mut members = BTreeMap::new();
        if !self.id.is_empty() {
            members.insert("id".to_string(), str_value(&self.id));
        }
        members.insert("space".to_string(), str_value(&self.space));
        members.insert("title".to_string(), str_value(&self.title));
        members.insert("content".to_string(), str_value(&self.content));
        if !self.parent_id.is_empty() {
            members.insert("parentId".to_string(), str_value(&self.parent_id));
        }
        if let Some(version) = self.version {
            members.insert("version".to_string(), Value::Int(version));
        }
        Value::Struct(members)
    }
}

impl PageHistorySummary {
    pub fn from_value(value: &Value) -> Result<Self> {
        let members = require_struct(value)?;
        Ok(Self {
            id: member_str(members, "id"),
            version: members.get("version").and_then(Value::as_i32),
            modifier: member_opt_str(members, "modifier"),
            modified: member_opt_str(members, "modified"),
        })
    }
}

impl Attachment {
    pub fn from_value(value: &Value) -> Result<Self> {
        let members = require_struct(value)?;
        let file_size = members.get("fileSize").and_then(|value| match value {
            Value::Int(number) => Some(i64::from(*number)),
            Value::Str(text) => text.trim().parse::<i64>().ok(),
            _ => None,
        });
        Ok(Self {
            id: member_str(members, "id"),
            page_id: member_str(members, "pageId"),
            file_name: member_str(members, "fileName"),
            file_size,
            content_type: member_str(members, "contentType"),
            created: member_opt_str(members, "created"),
            creator: member_opt_str(members, "creator"),
            url: member_str(members, "url"),
        })
    }

    pub fn to_value(&self) -> Value {
        let mut members = BTreeMap::new();
        members.insert("fileName".to_string(), str_value(&self.file_name));
        members.insert("contentType".to_string(), str_value(&self.content_type));
        if !self.page_id.is_empty() {
            members.insert("pageId".to_string(), str_value(&self.page_id));
        }
        Value::Struct(members)
    }
}

fn str_value(text: &str) -> Value {
    Value::Str(text.to_string())
}

fn require_struct(value: &Value) -> Result<&BTreeMap<String, Value>> {
    value
        .as_struct()
        .ok_or_else(|| anyhow::anyhow!("expected an XML-RPC struct"))
}

fn member_str(members: &BTreeMap<String, Value>, key: &str) -> String {
    members
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn member_opt_str(members: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    members
        .get(key)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
}

fn decode_array<T>(value: &Value, decode: impl Fn(&Value) -> Result<T>) -> Result<Vec<T>> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("expected an XML-RPC array"))?;
    items.iter().map(decode).collect()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

fn env_value(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn struct_value(pairs: &[(&str, Value)]) -> Value {
        let mut members = BTreeMap::new();
        for (key, value) in pairs {
            members.insert((*key).to_string(), value.clone());
        }
        Value::Struct(members)
    }

    #[test]
    fn page_decodes_from_struct() {
        let value = struct_value(&[
            ("id", Value::Str("Main.WebHome".to_string())),
            ("space", Value::Str("Main".to_string())),
            ("title", Value::Str("Web Home".to_string())),
            ("content", Value::Str("= Welcome =".to_string())),
            ("version", Value::Int(7)),
            ("modifier", Value::Str("Admin".to_string())),
        ]);
        let page = Page::from_value(&value).expect("decode");
        assert_eq!(page.id, "Main.WebHome");
        assert_eq!(page.space, "Main");
        assert_eq!(page.version, Some(7));
        assert_eq!(page.modifier.as_deref(), Some("Admin"));
        assert_eq!(page.created, None);
    }

    #[test]
    fn page_decode_tolerates_string_version() {
        let value = struct_value(&[
            ("id", Value::Str("Main.WebHome".to_string())),
            ("version", Value::Str("12".to_string())),
        ]);
        let page = Page::from_value(&value).expect("decode");
        assert_eq!(page.version, Some(12));
    }

    #[test]
    fn page_to_value_omits_unassigned_identifiers() {
        let page = Page {
            space: "Main".to_string(),
            title: "New Page".to_string(),
            content: "hello".to_string(),
            ..Page::default()
        };
        let members = page.to_value();
        let members = members.as_struct().expect("struct");
        assert!(!members.contains_key("id"));
        assert!(!members.contains_key("parentId"));
        assert!(!members.contains_key("version"));
        assert_eq!(members.get("space").and_then(Value::as_str), Some("Main"));
    }

    #[test]
    fn page_round_trips_through_wire_struct() {
        let page = Page {
            id: "Main.Install".to_string(),
            space: "Main".to_string(),
            title: "Install".to_string(),
            content: "steps".to_string(),
            version: Some(2),
            ..Page::default()
        };
        let decoded = Page::from_value(&page.to_value()).expect("decode");
        assert_eq!(decoded.id, page.id);
        assert_eq!(decoded.space, page.space);
        assert_eq!(decoded.content, page.content);
        assert_eq!(decoded.version, page.version);
    }

    #[test]
    fn attachment_decodes_string_file_size() {
        let value = struct_value(&[
            ("id", Value::Str("att1".to_string())),
            ("pageId", Value::Str("Main.WebHome".to_string())),
            ("fileName", Value::Str("diagram.png".to_string())),
            ("fileSize", Value::Str("2048".to_string())),
            ("contentType", Value::Str("image/png".to_string())),
        ]);
        let attachment = Attachment::from_value(&value).expect("decode");
        assert_eq!(attachment.file_size, Some(2048));
        assert_eq!(attachment.file_name, "diagram.png");
    }

    #[test]
    fn space_summary_requires_struct() {
        let error = SpaceSummary::from_value(&Value::Str("nope".to_string())).expect_err("fail");
        assert!(error.to_string().contains("expected an XML-RPC struct"));
    }

    #[test]
    fn retryable_status_covers_throttling_and_server_errors() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn client_rejects_empty_endpoint() {
        let config = XWikiClientConfig {
            endpoint: String::new(),
            user_agent: "test".to_string(),
            timeout_ms: 1_000,
            rate_limit_read_ms: 0,
            rate_limit_write_ms: 0,
            max_retries: 0,
            max_write_retries: 0,
            retry_delay_ms: 0,
        };
        let error = XWikiClient::new(config).expect_err("must fail");
        assert!(error.to_string().contains("no XML-RPC endpoint configured"));
    }
}
