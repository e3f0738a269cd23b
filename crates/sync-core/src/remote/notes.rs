//! Client for the cursor-paginated notes API.

use super::http::HttpClient;
use super::{
    ChangeDetection, NoteDraft, Page, PageRequest, RemoteNote, RemoteService, id_from_json,
    parse_timestamp,
};
use crate::error::{Result, SyncError};
use crate::settings::ServiceKind;
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const ENTRY_TYPE: &str = "manual";
const NOTE_TYPE: &str = "plain_text";
const DEFAULT_SOURCE: &str = "note-sync";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    c: T,
}

#[derive(Debug, Deserialize)]
struct ListBody {
    #[serde(default)]
    list: Vec<NoteItem>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct NoteItem {
    #[serde(deserialize_with = "id_from_json", alias = "note_id")]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<TagRef>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

/// Tags arrive either as bare names or as `{ "name": .. }` objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TagRef {
    Name(String),
    Object { name: String },
}

impl TagRef {
    fn into_name(self) -> String {
        match self {
            TagRef::Name(name) | TagRef::Object { name } => name,
        }
    }
}

impl From<NoteItem> for RemoteNote {
    fn from(item: NoteItem) -> Self {
        RemoteNote {
            id: item.id,
            title: item.title,
            body: item.content,
            tags: item
                .tags
                .into_iter()
                .map(TagRef::into_name)
                .filter(|t| !t.trim().is_empty())
                .collect(),
            source: item.source.filter(|s| !s.is_empty()),
            created_at: item.created_at.as_deref().and_then(parse_timestamp),
            updated_at: item.updated_at.as_deref().and_then(parse_timestamp),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Created {
    #[serde(deserialize_with = "id_from_json", alias = "note_id")]
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    title: &'a str,
    content: &'a str,
    entry_type: &'a str,
    note_type: &'a str,
    source: &'a str,
    tags: &'a [String],
}

pub struct NotesClient {
    http: HttpClient,
}

impl NotesClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(base_url, token, timeout)?,
        })
    }

    async fn delete_note(&self, id: &str) -> Result<()> {
        let request = self.http.request(Method::DELETE, &format!("notes/{id}"))?;
        match self.http.execute_empty(request).await {
            Err(SyncError::RequestFailed { status: 404, .. }) => {
                debug!(id, "Note already gone on the server");
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl RemoteService for NotesClient {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Notes
    }

    fn change_detection(&self) -> ChangeDetection {
        ChangeDetection::Body
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(limit) = request.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(since_id) = &request.since_id {
            query.push(("since_id", since_id.clone()));
        }
        if let Some(after) = request.updated_after {
            query.push((
                "updated_after",
                after.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        query.push(("sort", "create_desc".to_string()));

        let builder = self.http.request(Method::GET, "notes")?.query(&query);
        let envelope: Envelope<ListBody> = self.http.execute(builder).await?;

        Ok(Page {
            items: envelope.c.list.into_iter().map(RemoteNote::from).collect(),
            has_more: envelope.c.has_more,
        })
    }

    async fn create_note(&self, draft: &NoteDraft) -> Result<String> {
        let body = CreateBody {
            title: &draft.title,
            content: &draft.body,
            entry_type: ENTRY_TYPE,
            note_type: NOTE_TYPE,
            source: draft.source.as_deref().unwrap_or(DEFAULT_SOURCE),
            tags: &draft.tags,
        };
        let builder = self.http.request(Method::POST, "notes")?.json(&body);
        let created: Envelope<Created> = self.http.execute(builder).await?;
        info!(id = %created.c.id, title = %draft.title, "Created remote note");
        Ok(created.c.id)
    }

    /// The API has no update endpoint: the old note is deleted and the
    /// content re-created under a new id.
    async fn update_note(&self, id: &str, draft: &NoteDraft) -> Result<String> {
        self.delete_note(id).await?;
        let new_id = self.create_note(draft).await?;
        debug!(old = id, new = %new_id, "Replaced remote note");
        Ok(new_id)
    }

    async fn test_connection(&self) -> Result<()> {
        let builder = self
            .http
            .request(Method::GET, "notes")?
            .query(&[("limit", "1")]);
        let _: Envelope<ListBody> = self.http.execute(builder).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, token: &str) -> NotesClient {
        NotesClient::new(&server.uri(), token, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_page_parses_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notes"))
            .and(header("Authorization", "Bearer secret-token"))
            .and(query_param("sort", "create_desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "c": {
                    "list": [
                        {
                            "id": 42,
                            "title": "Groceries",
                            "content": "milk",
                            "tags": [{"name": "home"}, "errands"],
                            "source": "app",
                            "created_at": "2024-05-01 09:00:00",
                            "updated_at": "2024-05-02T10:00:00Z"
                        },
                        {"id": "n-2", "content": "untitled"}
                    ],
                    "has_more": true
                }
            })))
            .mount(&server)
            .await;

        let page = client(&server, "secret-token")
            .fetch_page(&PageRequest::default())
            .await
            .unwrap();

        assert!(page.has_more);
        assert_eq!(page.items.len(), 2);
        let first = &page.items[0];
        assert_eq!(first.id, "42");
        assert_eq!(first.tags, vec!["home", "errands"]);
        assert_eq!(first.source.as_deref(), Some("app"));
        assert!(first.created_at.is_some());
        assert!(first.updated_at > first.created_at);
        assert_eq!(page.items[1].label(), "n-2");
    }

    #[tokio::test]
    async fn test_cursor_request_has_no_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notes"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"c": {"list": [], "has_more": false}})),
            )
            .mount(&server)
            .await;

        let request = PageRequest {
            since_id: Some("abc123".to_string()),
            ..PageRequest::default()
        };
        client(&server, "t").fetch_page(&request).await.unwrap();

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let pairs: Vec<(String, String)> = received[0]
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("since_id".to_string(), "abc123".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k == "limit"));
    }

    #[tokio::test]
    async fn test_http_error_maps_to_request_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client(&server, "t")
            .fetch_page(&PageRequest::default())
            .await
            .unwrap_err();

        match err {
            SyncError::RequestFailed { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("expected RequestFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"c": {"list": [], "has_more": false}}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = NotesClient::new(&server.uri(), "t", Duration::from_millis(50)).unwrap();
        let err = client.fetch_page(&PageRequest::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
    }

    #[tokio::test]
    async fn test_missing_token_sends_nothing() {
        let server = MockServer::start().await;

        let err = client(&server, "  ").test_connection().await.unwrap_err();

        assert!(matches!(err, SyncError::AuthMissing));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_posts_note_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notes"))
            .and(body_partial_json(json!({
                "title": "Plan",
                "content": "step one",
                "entry_type": "manual",
                "note_type": "plain_text",
                "source": "note-sync",
                "tags": ["work"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"c": {"id": 7}})))
            .expect(1)
            .mount(&server)
            .await;

        let draft = NoteDraft {
            title: "Plan".to_string(),
            body: "step one".to_string(),
            tags: vec!["work".to_string()],
            source: None,
        };
        let id = client(&server, "t").create_note(&draft).await.unwrap();
        assert_eq!(id, "7");
    }

    #[tokio::test]
    async fn test_update_replaces_note() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/notes/old-1"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/notes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"c": {"note_id": "new-1"}})))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server, "t")
            .update_note("old-1", &NoteDraft::default())
            .await
            .unwrap();
        assert_eq!(id, "new-1");
    }
}
