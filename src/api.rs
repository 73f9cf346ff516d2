use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{CacheStore, KeySelector};
use crate::credentials::Credential;
use crate::error::ApiError;
use crate::optimistic::{OnSuccess, OptimisticMutator};
use crate::query::resolve_query;
use crate::transport::{ApiRequest, FileUpload, MultipartBody, TransportClient};
use crate::types::{AuthResponse, Comment, CommentTarget, Connection, ConnectionStatus, Post, QueryKey, User};
use crate::vote::{toggle_in, VoteChoice};

#[derive(Debug, Clone, Serialize)]
pub struct AccountCredentials {
    pub username: String,
    pub password: String,
}

impl AccountCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PostDraft {
    pub content: String,
    pub media: Option<FileUpload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionAction {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
struct ConnectionFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ConnectionStatus>,
}

#[derive(Serialize)]
struct NewPost<'a> {
    content: &'a str,
    topics: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionRequestBody<'a> {
    recipient_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionResponseBody<'a> {
    request_id: &'a str,
    action: ConnectionAction,
}

/// Splits hashtag words out of `content`. Returns the remaining text and the
/// tags without their leading `#`.
pub fn extract_topics(content: &str) -> (String, Vec<String>) {
    let (tags, words): (Vec<&str>, Vec<&str>) =
        content.split(' ').partition(|word| word.starts_with('#'));

    let topics = tags.into_iter().map(|tag| tag[1..].to_string()).collect();
    (words.join(" "), topics)
}

pub fn auth_user_key() -> QueryKey {
    auth_key("user")
}

pub fn posts_key() -> QueryKey {
    QueryKey::new("posts")
}

pub fn users_key() -> QueryKey {
    QueryKey::new("users")
}

pub fn comments_key(target: &CommentTarget) -> Result<QueryKey, ApiError> {
    Ok(QueryKey::with_params("comments", target)?)
}

fn auth_key(scope: &str) -> QueryKey {
    QueryKey {
        resource: "auth".into(),
        params: format!("\"{scope}\"").into(),
    }
}

fn connections_key(filter: &ConnectionFilter) -> Result<QueryKey, ApiError> {
    Ok(QueryKey::with_params("connections", filter)?)
}

fn online_connections_key() -> Result<QueryKey, ApiError> {
    Ok(QueryKey::with_params("connections", "online")?)
}

/// Merges a post/comment target with extra body fields.
fn targeted_body<T: Serialize>(target: &CommentTarget, extra: &[(&str, T)]) -> Result<Value, ApiError> {
    let mut body = serde_json::to_value(target)?;
    if let Value::Object(map) = &mut body {
        for (name, value) in extra {
            map.insert((*name).to_string(), serde_json::to_value(value)?);
        }
    }
    Ok(body)
}

/// Typed surface of the feed backend, on top of the transport and cache.
#[derive(Clone)]
pub struct FeedApi {
    transport: TransportClient,
    cache: CacheStore,
    mutator: OptimisticMutator,
}

impl FeedApi {
    pub fn new(transport: TransportClient, cache: CacheStore) -> Self {
        let mutator = OptimisticMutator::new(cache.clone());
        Self {
            transport,
            cache,
            mutator,
        }
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn mutator(&self) -> &OptimisticMutator {
        &self.mutator
    }

    pub async fn register(&self, account: &AccountCredentials) -> Result<AuthResponse, ApiError> {
        let request = ApiRequest::post("/users/register").unauthenticated().json(account)?;
        let auth: AuthResponse = self.transport.send_json(request).await?;
        self.start_session(&auth);
        info!(username = %account.username, "registered");
        Ok(auth)
    }

    pub async fn login(&self, account: &AccountCredentials) -> Result<AuthResponse, ApiError> {
        let request = ApiRequest::post("/users/login").unauthenticated().json(account)?;
        let auth: AuthResponse = self.transport.send_json(request).await?;
        self.start_session(&auth);
        info!(username = %account.username, "logged in");
        Ok(auth)
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        self.transport.send(ApiRequest::post("/users/logout")).await?;
        self.transport.credentials().clear();
        self.cache.remove(&KeySelector::resource("auth"));
        info!("logged out");
        Ok(())
    }

    pub async fn refresh_token(&self) -> Result<Credential, ApiError> {
        self.transport.refresh_credential().await
    }

    pub async fn current_user(&self) -> Result<User, ApiError> {
        resolve_query(&self.cache, &auth_user_key(), || {
            self.transport.send_json(ApiRequest::get("/users/me"))
        })
        .await
    }

    pub async fn me(&self) -> Result<User, ApiError> {
        self.transport.send_json(ApiRequest::get("/users/me")).await
    }

    pub async fn users(&self) -> Result<Vec<User>, ApiError> {
        resolve_query(&self.cache, &users_key(), || {
            self.transport.send_json(ApiRequest::get("/users"))
        })
        .await
    }

    pub async fn posts(&self) -> Result<Vec<Post>, ApiError> {
        resolve_query(&self.cache, &posts_key(), || {
            self.transport.send_json(ApiRequest::get("/posts"))
        })
        .await
    }

    pub async fn create_post(&self, draft: PostDraft) -> Result<(), ApiError> {
        let (content, topics) = extract_topics(&draft.content);

        let request = match draft.media {
            Some(mut file) => {
                file.field = "file".into();
                ApiRequest::post("/posts").multipart(MultipartBody {
                    fields: vec![
                        ("content".into(), content),
                        ("topics".into(), serde_json::to_string(&topics)?),
                    ],
                    file: Some(file),
                })
            }
            None => ApiRequest::post("/posts").json(&NewPost {
                content: &content,
                topics: &topics,
            })?,
        };

        self.transport.send(request).await?;
        self.cache.invalidate(&KeySelector::Exact(posts_key()));
        debug!(topics = topics.len(), "post created");
        Ok(())
    }

    /// Toggles the caller's vote on a post in the cached feed before the
    /// server confirms it.
    pub async fn vote_post(&self, post_id: &str, vote: VoteChoice) -> Result<(), ApiError> {
        let target = CommentTarget::Post(post_id.to_string());
        let request = ApiRequest::post("/posts/vote").json(&targeted_body(&target, &[("type", vote)])?)?;
        let transport = &self.transport;

        self.mutator
            .mutate(
                &posts_key(),
                |mut posts: Vec<Post>| {
                    toggle_in(&mut posts, post_id, vote);
                    posts
                },
                move || async move { transport.send(request).await.map(drop) },
                OnSuccess::Commit,
            )
            .await
    }

    /// Toggles a vote on a comment within the thread hanging off `thread`.
    pub async fn vote_comment(
        &self,
        thread: &CommentTarget,
        comment_id: &str,
        vote: VoteChoice,
    ) -> Result<(), ApiError> {
        let target = CommentTarget::Comment(comment_id.to_string());
        let request = ApiRequest::post("/posts/vote").json(&targeted_body(&target, &[("type", vote)])?)?;
        let transport = &self.transport;

        self.mutator
            .mutate(
                &comments_key(thread)?,
                |mut comments: Vec<Comment>| {
                    toggle_in(&mut comments, comment_id, vote);
                    comments
                },
                move || async move { transport.send(request).await.map(drop) },
                OnSuccess::Invalidate,
            )
            .await?;

        // Replies to this comment are cached under their own thread key.
        self.cache
            .invalidate(&KeySelector::Exact(comments_key(&target)?));
        Ok(())
    }

    pub async fn comments(&self, target: &CommentTarget) -> Result<Vec<Comment>, ApiError> {
        let request = ApiRequest::get("/posts/comments").query(target)?;
        resolve_query(&self.cache, &comments_key(target)?, || {
            self.transport.send_json(request)
        })
        .await
    }

    pub async fn create_comment(&self, target: &CommentTarget, content: &str) -> Result<(), ApiError> {
        let body = targeted_body(target, &[("content", content)])?;
        self.transport
            .send(ApiRequest::post("/posts/comments").json(&body)?)
            .await?;
        self.cache.invalidate(&KeySelector::resource("comments"));
        Ok(())
    }

    pub async fn request_connection(&self, recipient_id: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post("/connections/request")
            .json(&ConnectionRequestBody { recipient_id })?;
        self.transport.send(request).await?;
        self.cache.invalidate(&KeySelector::resource("connections"));
        Ok(())
    }

    pub async fn accept_connection(&self, request_id: &str) -> Result<(), ApiError> {
        self.respond_to_connection(request_id, ConnectionAction::Accept)
            .await
    }

    pub async fn reject_connection(&self, request_id: &str) -> Result<(), ApiError> {
        self.respond_to_connection(request_id, ConnectionAction::Reject)
            .await
    }

    pub async fn connections(&self, status: Option<ConnectionStatus>) -> Result<Vec<Connection>, ApiError> {
        let filter = ConnectionFilter { status };
        let request = ApiRequest::get("/connections").query(&filter)?;
        resolve_query(&self.cache, &connections_key(&filter)?, || {
            self.transport.send_json(request)
        })
        .await
    }

    pub async fn online_connections(&self) -> Result<Vec<User>, ApiError> {
        resolve_query(&self.cache, &online_connections_key()?, || {
            self.transport
                .send_json(ApiRequest::get("/connections/online-connections"))
        })
        .await
    }

    async fn respond_to_connection(&self, request_id: &str, action: ConnectionAction) -> Result<(), ApiError> {
        let request = ApiRequest::post("/connections/response")
            .json(&ConnectionResponseBody { request_id, action })?;
        self.transport.send(request).await?;
        self.cache.invalidate(&KeySelector::resource("connections"));
        Ok(())
    }

    fn start_session(&self, auth: &AuthResponse) {
        self.transport.credentials().set(Credential::new(&auth.token));
        self.transport.session().arm();
        self.cache.invalidate(&KeySelector::Exact(auth_user_key()));
    }
}
