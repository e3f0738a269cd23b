//! Client for the signed memo API.
//!
//! Every request carries the common parameters (`timestamp`, `api_key`,
//! `app_version`, `platform`, `webp`) plus its own, and a `sign` computed by
//! [`sign_params`]. Replies are wrapped in `{ code, message, data }` where a
//! non-zero code is an application error even on HTTP 200.

use super::http::HttpClient;
use super::{
    ChangeDetection, NoteDraft, Page, PageRequest, RemoteNote, RemoteService, parse_timestamp,
};
use crate::error::{Result, SyncError};
use crate::settings::{ServiceKind, SigningSettings};
use async_trait::async_trait;
use chrono::Utc;
use md5::{Digest, Md5};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const UPDATED_PATH: &str = "api/v1/memo/updated";
const MEMO_PATH: &str = "api/v1/memo";
const DEFAULT_PAGE_SIZE: usize = 200;
const TITLE_MAX_CHARS: usize = 50;

/// Signature over a parameter set.
///
/// Keys sorted lexicographically, `key=value` pairs joined with `&`, the
/// secret appended, then MD5 as lowercase hex. A `sign` entry already in
/// `params` is ignored.
pub fn sign_params(params: &BTreeMap<String, String>, secret: &str) -> String {
    let joined = params
        .iter()
        .filter(|(k, _)| k.as_str() != "sign")
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Md5::new();
    hasher.update(joined.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Deserialize)]
struct Reply<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Memo {
    slug: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

impl From<Memo> for RemoteNote {
    fn from(memo: Memo) -> Self {
        RemoteNote {
            title: title_from_content(&memo.content),
            id: memo.slug,
            body: memo.content,
            tags: memo.tags,
            source: memo.source.filter(|s| !s.is_empty()),
            created_at: memo.created_at.as_deref().and_then(parse_timestamp),
            updated_at: memo.updated_at.as_deref().and_then(parse_timestamp),
        }
    }
}

/// Memos have no title; use the first non-empty line of text.
fn title_from_content(content: &str) -> String {
    let mut text = String::with_capacity(content.len());
    let mut in_tag = false;
    for c in content.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push('\n');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }

    text.lines()
        .map(|line| line.trim().trim_start_matches('#').trim())
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(TITLE_MAX_CHARS).collect())
        .unwrap_or_default()
}

/// The memo service reads tags from `#tag` words in the content. Tags the
/// body does not already mention are appended on a final line.
fn content_with_tags(body: &str, tags: &[String]) -> String {
    let mut missing: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim().trim_start_matches('#').replace(char::is_whitespace, "-");
        if tag.is_empty() {
            continue;
        }
        let word = format!("#{tag}");
        if !missing.contains(&word) && !body.split_whitespace().any(|w| w == word) {
            missing.push(word);
        }
    }

    if missing.is_empty() {
        return body.to_string();
    }
    let mut content = body.trim_end().to_string();
    if !content.is_empty() {
        content.push_str("\n\n");
    }
    content.push_str(&missing.join(" "));
    content
}

pub struct MemosClient {
    http: HttpClient,
    signing: SigningSettings,
}

impl MemosClient {
    pub fn new(
        base_url: &str,
        token: &str,
        signing: SigningSettings,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(base_url, token, timeout)?,
            signing,
        })
    }

    /// Add the common parameters and the signature to `params`.
    fn sign(&self, mut params: BTreeMap<String, String>) -> BTreeMap<String, String> {
        params.insert("timestamp".into(), Utc::now().timestamp().to_string());
        params.insert("api_key".into(), self.signing.api_key.clone());
        params.insert("app_version".into(), self.signing.app_version.clone());
        params.insert("platform".into(), self.signing.platform.clone());
        params.insert("webp".into(), "1".into());
        let sign = sign_params(&params, &self.signing.secret);
        params.insert("sign".into(), sign);
        params
    }

    async fn call<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
        let reply: Reply<T> = self.http.execute(builder).await?;
        if reply.code != 0 {
            return Err(SyncError::ApplicationError {
                code: reply.code,
                message: reply.message,
            });
        }
        reply
            .data
            .ok_or_else(|| SyncError::Decode("reply has no data".to_string()))
    }

    async fn put_memo(&self, slug: Option<&str>, draft: &NoteDraft) -> Result<String> {
        let mut params = BTreeMap::new();
        params.insert("content".to_string(), content_with_tags(&draft.body, &draft.tags));
        if let Some(source) = &draft.source {
            params.insert("source".to_string(), source.clone());
        }
        if let Some(slug) = slug {
            params.insert("slug".to_string(), slug.to_string());
        }

        let builder = self
            .http
            .request(Method::PUT, MEMO_PATH)?
            .json(&self.sign(params));
        let memo: Memo = self.call(builder).await?;
        Ok(memo.slug)
    }
}

#[async_trait]
impl RemoteService for MemosClient {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Memos
    }

    fn change_detection(&self) -> ChangeDetection {
        ChangeDetection::Timestamp
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let limit = request.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let mut params = BTreeMap::new();
        params.insert("limit".to_string(), limit.to_string());
        if let Some(slug) = &request.since_id {
            params.insert("latest_slug".to_string(), slug.clone());
        }
        if let Some(after) = request.updated_after {
            params.insert("latest_updated_at".to_string(), after.timestamp().to_string());
        }

        let builder = self
            .http
            .request(Method::GET, UPDATED_PATH)?
            .query(&self.sign(params));
        let memos: Vec<Memo> = self.call(builder).await?;

        // The endpoint has no explicit end marker; a full page means there may be more.
        let has_more = memos.len() >= limit;
        debug!(count = memos.len(), limit, has_more, "Fetched memos");

        Ok(Page {
            items: memos.into_iter().map(RemoteNote::from).collect(),
            has_more,
        })
    }

    fn next_page(&self, request: &PageRequest, last: &RemoteNote) -> PageRequest {
        PageRequest {
            since_id: Some(last.id.clone()),
            updated_after: last.updated_at.or(request.updated_after),
            limit: request.limit,
        }
    }

    async fn create_note(&self, draft: &NoteDraft) -> Result<String> {
        let slug = self.put_memo(None, draft).await?;
        info!(slug = %slug, "Created memo");
        Ok(slug)
    }

    async fn update_note(&self, id: &str, draft: &NoteDraft) -> Result<String> {
        self.put_memo(Some(id), draft).await
    }

    async fn test_connection(&self) -> Result<()> {
        self.fetch_page(&PageRequest {
            limit: Some(1),
            ..PageRequest::default()
        })
        .await
        .map(|_| ())
    }
}
