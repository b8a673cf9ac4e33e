//! [`GithubArtifactStore`]: work items are issues, records are comments.
//!
//! | Store concept | GitHub representation |
//! |---------------|-----------------------|
//! | work item | issue (title, body, labels, open/closed) |
//! | run record | issue comment written by the engine's account |
//! | lock marker | `cogworks:processing` label plus a chain of engine lock claim comments |
//! | sub-work-item | sub-issue of the parent, dependencies in a body marker |
//!
//! ## Lock atomicity
//!
//! GitHub offers no conditional write, but it does order comments: ids grow
//! in commit order. Every lock transition is appended as a claim naming the
//! claim it supersedes, and of several claims on one predecessor the lowest
//! id wins. A swap posts its claim and reads back; it succeeded exactly when
//! its claim is the winner. Losing claims are dead branches of the chain and
//! are deleted on a best-effort basis.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use pipeline::work_item::labels;
use pipeline::{
    ArtifactStore, CommentId, LockMarker, NewSubWorkItem, StoreError, StoredComment, SubWorkItem,
    SubWorkItemId, SubWorkItemLink, Timestamp, WorkItem, WorkItemId, WorkItemRef,
};

use crate::client::GithubClient;
use crate::markers::{claim_body, current_lock, split_link, winning_claim, with_link, LinkMarker, LockClaim};

#[derive(Debug, Deserialize)]
struct Issue {
    id: u64,
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Comment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    user: Option<User>,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct CreatedComment {
    id: u64,
}

/// Implements [`ArtifactStore`] over the GitHub REST API.
#[derive(Debug)]
pub struct GithubArtifactStore {
    client: GithubClient,
    engine_login: OnceCell<String>,
}

impl GithubArtifactStore {
    pub fn new(client: GithubClient) -> Self {
        Self {
            client,
            engine_login: OnceCell::new(),
        }
    }

    /// Fixes the account whose comments are trusted as records.
    ///
    /// Needed for GitHub App installation tokens, which cannot call `/user`;
    /// the login is then `<app-slug>[bot]`.
    pub fn with_engine_login(self, login: impl Into<String>) -> Self {
        Self {
            engine_login: OnceCell::new_with(Some(login.into())),
            ..self
        }
    }

    async fn engine_login(&self) -> Result<&str, StoreError> {
        self.engine_login
            .get_or_try_init(|| async {
                let user: User = self.client.get(self.client.url(&["user"])?).await?;
                debug!(login = %user.login, "Resolved engine identity");
                Ok::<_, StoreError>(user.login)
            })
            .await
            .map(String::as_str)
    }

    fn issue_url(&self, item: &WorkItemRef, tail: &[&str]) -> Result<reqwest::Url, StoreError> {
        let (owner, repo) = split_repository(item)?;
        let number = item.number.to_string();
        let mut segments = vec!["repos", owner, repo, "issues", number.as_str()];
        segments.extend_from_slice(tail);
        self.client.url(&segments)
    }

    fn repo_url(&self, item: &WorkItemRef, tail: &[&str]) -> Result<reqwest::Url, StoreError> {
        let (owner, repo) = split_repository(item)?;
        let mut segments = vec!["repos", owner, repo];
        segments.extend_from_slice(tail);
        self.client.url(&segments)
    }

    fn comment_url(&self, item: &WorkItemRef, id: CommentId) -> Result<reqwest::Url, StoreError> {
        let id = id.to_string();
        self.repo_url(item, &["issues", "comments", id.as_str()])
    }
}

fn split_repository(item: &WorkItemRef) -> Result<(&str, &str), StoreError> {
    item.repository
        .as_str()
        .split_once('/')
        .ok_or_else(|| StoreError::NotFound(item.to_string()))
}

fn not_found_as(item: &WorkItemRef) -> impl Fn(StoreError) -> StoreError + '_ {
    move |e| match e {
        StoreError::Api { status: 404, .. } => StoreError::NotFound(item.to_string()),
        other => other,
    }
}

fn to_work_item(reference: WorkItemRef, issue: Issue) -> WorkItem {
    let (body, link) = split_link(issue.body.as_deref().unwrap_or_default());
    WorkItem {
        reference,
        title: issue.title,
        body,
        labels: issue.labels.into_iter().map(|l| l.name).collect(),
        closed: issue.state == "closed",
        sub_work_item: link.map(|l| SubWorkItemLink {
            parent: WorkItemId::new(l.parent),
            depends_on: l.depends_on,
        }),
    }
}

fn to_stored_comment(comment: Comment, engine_login: &str) -> Result<StoredComment, StoreError> {
    let created_at = Timestamp::parse_rfc3339(&comment.created_at)
        .ok_or_else(|| StoreError::Decode(format!("bad created_at '{}'", comment.created_at)))?;
    Ok(StoredComment {
        id: CommentId::new(comment.id),
        body: comment.body.unwrap_or_default(),
        created_at,
        authored_by_engine: comment.user.is_some_and(|u| u.login == engine_login),
    })
}

#[async_trait]
impl ArtifactStore for GithubArtifactStore {
    #[instrument(skip(self), fields(work_item = %item))]
    async fn work_item(&self, item: &WorkItemRef) -> Result<WorkItem, StoreError> {
        let issue: Issue = self
            .client
            .get(self.issue_url(item, &[])?)
            .await
            .map_err(not_found_as(item))?;
        Ok(to_work_item(item.clone(), issue))
    }

    #[instrument(skip(self), fields(work_item = %item))]
    async fn comments(&self, item: &WorkItemRef) -> Result<Vec<StoredComment>, StoreError> {
        let login = self.engine_login().await?;
        let raw: Vec<Comment> = self
            .client
            .get_all(self.issue_url(item, &["comments"])?)
            .await
            .map_err(not_found_as(item))?;
        raw.into_iter().map(|c| to_stored_comment(c, login)).collect()
    }

    async fn append_comment(&self, item: &WorkItemRef, body: &str) -> Result<CommentId, StoreError> {
        let created: CreatedComment = self
            .client
            .post(self.issue_url(item, &["comments"])?, &json!({ "body": body }))
            .await?;
        Ok(CommentId::new(created.id))
    }

    async fn add_label(&self, item: &WorkItemRef, label: &str) -> Result<(), StoreError> {
        let _: serde_json::Value = self
            .client
            .post(self.issue_url(item, &["labels"])?, &json!({ "labels": [label] }))
            .await?;
        Ok(())
    }

    async fn remove_label(&self, item: &WorkItemRef, label: &str) -> Result<(), StoreError> {
        self.client.delete(self.issue_url(item, &["labels", label])?).await
    }

    async fn read_lock(&self, item: &WorkItemRef) -> Result<Option<LockMarker>, StoreError> {
        let comments = self.comments(item).await?;
        Ok(current_lock(&comments).and_then(|(_, marker)| marker))
    }

    #[instrument(skip(self, expected, replacement), fields(work_item = %item))]
    async fn compare_and_swap_lock(
        &self,
        item: &WorkItemRef,
        expected: Option<&LockMarker>,
        replacement: Option<&LockMarker>,
    ) -> Result<bool, StoreError> {
        let comments = self.comments(item).await?;
        let (head, current) = match current_lock(&comments) {
            Some((id, marker)) => (Some(id), marker),
            None => (None, None),
        };
        if current.as_ref() != expected {
            return Ok(false);
        }

        let claim = LockClaim {
            supersedes: head,
            marker: replacement.cloned(),
        };
        let posted = self.append_comment(item, &claim_body(&claim)).await?;
        let comments = self.comments(item).await?;
        let won = winning_claim(&comments, head) == Some(posted);

        if won {
            match replacement {
                Some(_) => self.add_label(item, labels::PROCESSING).await?,
                None => self.remove_label(item, labels::PROCESSING).await?,
            }
        } else if let Err(e) = self.client.delete(self.comment_url(item, posted)?).await {
            warn!(comment = %posted, error = %e, "Could not delete losing lock claim");
        }
        debug!(won, claim = %posted, "Lock compare-and-swap");
        Ok(won)
    }

    async fn sub_work_items(&self, parent: &WorkItemRef) -> Result<Vec<SubWorkItem>, StoreError> {
        let issues: Vec<Issue> = self
            .client
            .get_all(self.issue_url(parent, &["sub_issues"])?)
            .await
            .map_err(not_found_as(parent))?;
        Ok(issues
            .into_iter()
            .map(|issue| {
                let (_, link) = split_link(issue.body.as_deref().unwrap_or_default());
                SubWorkItem {
                    id: SubWorkItemId::new(issue.number),
                    title: issue.title,
                    depends_on: link.map(|l| l.depends_on).unwrap_or_default(),
                }
            })
            .collect())
    }

    #[instrument(skip(self, item), fields(parent = %parent, title = %item.title))]
    async fn create_sub_work_item(
        &self,
        parent: &WorkItemRef,
        item: &NewSubWorkItem,
    ) -> Result<SubWorkItemId, StoreError> {
        let link = LinkMarker {
            parent: parent.number.as_u64(),
            depends_on: item.depends_on.clone(),
        };
        let created: Issue = self
            .client
            .post(
                self.repo_url(parent, &["issues"])?,
                &json!({
                    "title": item.title,
                    "body": with_link(&item.body, &link),
                    "labels": item.labels,
                }),
            )
            .await?;
        let _: serde_json::Value = self
            .client
            .post(
                self.issue_url(parent, &["sub_issues"])?,
                &json!({ "sub_issue_id": created.id }),
            )
            .await?;
        Ok(SubWorkItemId::new(created.number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::testing::sample_ref;

    fn issue(body: &str, state: &str) -> Issue {
        serde_json::from_value(json!({
            "id": 9001,
            "number": 1,
            "title": "Work item 1",
            "body": body,
            "state": state,
            "labels": [{"name": "cogworks:run"}, {"name": "bug"}],
            "user": {"login": "someone"}
        }))
        .unwrap()
    }

    #[test]
    fn issues_become_work_items() {
        let item = to_work_item(sample_ref(1), issue("Make it spin.", "open"));
        assert_eq!(item.labels, vec!["cogworks:run", "bug"]);
        assert!(item.is_triggered());
        assert!(!item.closed);
        assert!(item.sub_work_item.is_none());
    }

    #[test]
    fn sub_issue_links_are_read_from_the_body() {
        let body = with_link(
            "Second step.",
            &LinkMarker {
                parent: 1,
                depends_on: vec![SubWorkItemId::new(2)],
            },
        );
        let item = to_work_item(sample_ref(3), issue(&body, "closed"));
        assert_eq!(item.body, "Second step.");
        assert!(item.closed);
        let link = item.sub_work_item.unwrap();
        assert_eq!(link.parent, WorkItemId::new(1));
        assert_eq!(link.depends_on, vec![SubWorkItemId::new(2)]);
    }

    #[test]
    fn only_the_engine_account_is_trusted() {
        let comment = |login: &str| Comment {
            id: 5,
            body: Some("hello".into()),
            user: Some(User { login: login.into() }),
            created_at: "2026-01-02T03:04:05Z".into(),
        };
        assert!(to_stored_comment(comment("cogworks[bot]"), "cogworks[bot]").unwrap().authored_by_engine);
        assert!(!to_stored_comment(comment("mallory"), "cogworks[bot]").unwrap().authored_by_engine);

        let mut bad = comment("cogworks[bot]");
        bad.created_at = "yesterday".into();
        assert!(matches!(to_stored_comment(bad, "x"), Err(StoreError::Decode(_))));
    }

    #[tokio::test]
    async fn configured_login_skips_the_user_lookup() {
        let client = GithubClient::new("http://127.0.0.1:1", crate::GithubToken::new("t")).unwrap();
        let store = GithubArtifactStore::new(client).with_engine_login("cogworks[bot]");
        assert_eq!(store.engine_login().await.unwrap(), "cogworks[bot]");
    }

    mod lock {
        use std::sync::{Arc, Mutex};

        use serde_json::Value;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        use super::*;
        use crate::markers::parse_claim;
        use pipeline::InvocationId;

        const ENGINE: &str = "cogworks[bot]";

        /// Comments of issue `octo/widgets#1` as GitHub would hold them.
        #[derive(Default)]
        struct FakeIssue {
            comments: Vec<Value>,
            next_id: u64,
            /// Committed just before the next comment we post.
            interloper: Option<String>,
        }

        impl FakeIssue {
            fn push(&mut self, body: String) -> u64 {
                self.next_id += 1;
                self.comments.push(json!({
                    "id": self.next_id,
                    "body": body,
                    "user": {"login": ENGINE},
                    "created_at": "2026-01-02T03:04:05Z"
                }));
                self.next_id
            }
        }

        async fn read_request(stream: &mut TcpStream) -> (String, String, String) {
            let mut buf = vec![0u8; 64 * 1024];
            let mut received = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).into_owned();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if received.len() >= head_end + 4 + length || n == 0 {
                        let mut words = text.split_whitespace();
                        let method = words.next().unwrap_or_default().to_string();
                        let target = words.next().unwrap_or_default();
                        let path = target.split('?').next().unwrap_or_default().to_string();
                        return (method, path, text[head_end + 4..].to_string());
                    }
                }
                if n == 0 {
                    return (String::new(), String::new(), String::new());
                }
            }
        }

        fn route(issue: &Mutex<FakeIssue>, method: &str, path: &str, body: &str) -> (&'static str, String) {
            let mut issue = issue.lock().unwrap();
            match (method, path) {
                ("GET", "/repos/octo/widgets/issues/1/comments") => {
                    ("200 OK", serde_json::to_string(&issue.comments).unwrap())
                }
                ("POST", "/repos/octo/widgets/issues/1/comments") => {
                    if let Some(other) = issue.interloper.take() {
                        issue.push(other);
                    }
                    let text = serde_json::from_str::<Value>(body).unwrap()["body"]
                        .as_str()
                        .unwrap()
                        .to_string();
                    let id = issue.push(text);
                    ("201 Created", json!({ "id": id }).to_string())
                }
                ("POST", "/repos/octo/widgets/issues/1/labels") => ("200 OK", "[]".to_string()),
                ("DELETE", p) if p.starts_with("/repos/octo/widgets/issues/comments/") => {
                    let id: u64 = p.rsplit('/').next().unwrap().parse().unwrap();
                    issue.comments.retain(|c| c["id"] != id);
                    ("204 No Content", String::new())
                }
                ("DELETE", p) if p.starts_with("/repos/octo/widgets/issues/1/labels/") => {
                    ("204 No Content", String::new())
                }
                _ => ("404 Not Found", r#"{"message":"Not Found"}"#.to_string()),
            }
        }

        async fn serve(issue: Arc<Mutex<FakeIssue>>) -> GithubArtifactStore {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let issue = issue.clone();
                    tokio::spawn(async move {
                        let (method, path, body) = read_request(&mut stream).await;
                        let (status, reply) = route(&issue, &method, &path, &body);
                        let response = format!(
                            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
                            reply.len()
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
            });
            let client = GithubClient::new(&url, crate::GithubToken::new("t")).unwrap();
            GithubArtifactStore::new(client).with_engine_login(ENGINE)
        }

        fn marker() -> LockMarker {
            LockMarker {
                holder: InvocationId::new_random(),
                acquired_at: Timestamp::now(),
            }
        }

        #[tokio::test]
        async fn acquire_and_release_append_claims() {
            let issue = Arc::new(Mutex::new(FakeIssue::default()));
            let store = serve(issue.clone()).await;
            let item = sample_ref(1);
            let mine = marker();

            assert!(store.compare_and_swap_lock(&item, None, Some(&mine)).await.unwrap());
            assert_eq!(store.read_lock(&item).await.unwrap(), Some(mine.clone()));
            assert!(!store.compare_and_swap_lock(&item, None, Some(&marker())).await.unwrap());

            assert!(store.compare_and_swap_lock(&item, Some(&mine), None).await.unwrap());
            assert_eq!(store.read_lock(&item).await.unwrap(), None);
            assert_eq!(issue.lock().unwrap().comments.len(), 2);
        }

        #[tokio::test]
        async fn overriding_a_stale_marker_loses_to_an_earlier_claim() {
            let issue = Arc::new(Mutex::new(FakeIssue::default()));
            let stale = marker();
            let theirs = marker();
            {
                let mut issue = issue.lock().unwrap();
                issue.push(claim_body(&LockClaim {
                    supersedes: None,
                    marker: Some(stale.clone()),
                }));
                // Another invocation overrides the same stale marker between
                // our read and our write.
                issue.interloper = Some(claim_body(&LockClaim {
                    supersedes: Some(CommentId::new(1)),
                    marker: Some(theirs.clone()),
                }));
            }
            let store = serve(issue.clone()).await;
            let item = sample_ref(1);

            let won = store
                .compare_and_swap_lock(&item, Some(&stale), Some(&marker()))
                .await
                .unwrap();
            assert!(!won);
            assert_eq!(store.read_lock(&item).await.unwrap(), Some(theirs.clone()));

            // The losing claim was removed; the chain is genesis plus theirs.
            let bodies: Vec<String> = issue
                .lock()
                .unwrap()
                .comments
                .iter()
                .map(|c| c["body"].as_str().unwrap().to_string())
                .collect();
            assert_eq!(bodies.len(), 2);
            assert_eq!(parse_claim(&bodies[1]).and_then(|c| c.marker), Some(theirs));
        }
    }
}
