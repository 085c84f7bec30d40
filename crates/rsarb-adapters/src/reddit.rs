//! Reddit OAuth client implementing [`PlatformGateway`].

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode, Url};
use rsarb_core::{Comment, Entity, EntityError, EntityKind, Fullname, Post, ThreadRef};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{HttpClientConfig, PlatformError, PlatformGateway};

const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const API_BASE: &str = "https://oauth.reddit.com";
const PAGE_SIZE: usize = 100;
const MORE_CHILDREN_BATCH: usize = 100;
const COMMENT_PAGE_LIMIT: &str = "500";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// `/api/comment` error codes for targets that can no longer be replied to.
const FORBIDDEN_REPLY_CODES: &[&str] = &[
    "THREAD_LOCKED",
    "TOO_OLD",
    "DELETED_COMMENT",
    "DELETED_LINK",
    "COMMENT_UNREPLIABLE",
];

#[derive(Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct RedditGateway {
    client: reqwest::Client,
    credentials: RedditCredentials,
    token: Mutex<Option<AccessToken>>,
}

impl std::fmt::Debug for RedditGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditGateway")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl RedditGateway {
    /// Build the HTTP client and authenticate once, so bad credentials fail at startup.
    pub async fn connect(credentials: RedditCredentials, http: HttpClientConfig) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(http.timeout)
            .user_agent(http.user_agent)
            .build()
            .map_err(|source| PlatformError::Request {
                url: TOKEN_URL.to_string(),
                source,
            })?;

        let gateway = Self {
            client,
            credentials,
            token: Mutex::new(None),
        };
        gateway.access_token().await?;
        Ok(gateway)
    }

    async fn access_token(&self) -> Result<String, PlatformError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }
        let fresh = self.fetch_token().await?;
        let value = fresh.value.clone();
        *guard = Some(fresh);
        Ok(value)
    }

    async fn fetch_token(&self) -> Result<AccessToken, PlatformError> {
        let response = self
            .client
            .post(TOKEN_URL)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(|source| PlatformError::Request {
                url: TOKEN_URL.to_string(),
                source,
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PlatformError::Auth(format!("token endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(PlatformError::HttpStatus {
                status: status.as_u16(),
                url: TOKEN_URL.to_string(),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|err| PlatformError::Decode {
            url: TOKEN_URL.to_string(),
            detail: err.to_string(),
        })?;
        match body {
            TokenResponse {
                access_token: Some(value),
                expires_in,
                ..
            } => {
                debug!(username = %self.credentials.username, "obtained reddit access token");
                Ok(AccessToken {
                    value,
                    expires_at: Instant::now() + Duration::from_secs(expires_in.unwrap_or(3600)),
                })
            }
            TokenResponse { error, .. } => Err(PlatformError::Auth(
                error.unwrap_or_else(|| "no access token in response".to_string()),
            )),
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, &str)]>,
    ) -> Result<JsonValue, PlatformError> {
        let url = format!("{API_BASE}{path}");
        let token = self.access_token().await?;
        let mut request = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(token)
            .query(&[("raw_json", "1")])
            .query(query);
        if let Some(form) = form {
            request = request.form(form);
        }

        debug!(%method, %url, "reddit api call");
        let response = request.send().await.map_err(|source| PlatformError::Request {
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(PlatformError::Forbidden(format!("{url} returned 403")));
        }
        if status == StatusCode::UNAUTHORIZED {
            self.token.lock().await.take();
            return Err(PlatformError::Auth(format!("{url} returned 401")));
        }
        if !status.is_success() {
            return Err(PlatformError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        response.json().await.map_err(|err| PlatformError::Decode {
            url,
            detail: err.to_string(),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<JsonValue, PlatformError> {
        self.call(Method::GET, path, query, None).await
    }

    async fn user_comment_page(
        &self,
        identity: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<(Vec<Comment>, Option<String>), PlatformError> {
        let path = format!("/user/{identity}/comments");
        let mut query = vec![("sort", "new".to_string()), ("limit", limit.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let listing: Listing = decode(&path, self.get(&path, &query).await?)?;
        let mut comments = Vec::new();
        for thing in listing.data.children {
            if thing.kind == EntityKind::Comment.prefix() {
                comments.push(decode::<CommentData>(&path, thing.data)?.into_comment());
            }
        }
        Ok((comments, listing.data.after))
    }
}

#[async_trait]
impl PlatformGateway for RedditGateway {
    async fn current_user(&self) -> Result<String, PlatformError> {
        let path = "/api/v1/me";
        let me: MeResponse = decode(path, self.get(path, &[]).await?)?;
        Ok(me.name)
    }

    async fn list_new_posts(&self, forums: &str, limit: Option<usize>) -> Result<Vec<Post>, PlatformError> {
        let path = format!("/r/{forums}/new");
        let mut posts = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let want = limit
                .map(|limit| limit.saturating_sub(posts.len()))
                .unwrap_or(PAGE_SIZE)
                .min(PAGE_SIZE);
            if want == 0 {
                break;
            }
            let mut query = vec![("limit", want.to_string())];
            if let Some(after) = &after {
                query.push(("after", after.clone()));
            }

            let listing: Listing = decode(&path, self.get(&path, &query).await?)?;
            let page_len = listing.data.children.len();
            posts.extend(posts_from_listing(&path, listing.data.children)?);
            after = listing.data.after;
            if after.is_none() || page_len == 0 {
                break;
            }
        }
        Ok(posts)
    }

    async fn list_comments(&self, post: &Post) -> Result<Vec<Comment>, PlatformError> {
        let local_id = Fullname::parse(&post.fullname)?.local_id().to_string();
        let path = format!("/comments/{local_id}");
        let listings: Vec<Listing> = decode(
            &path,
            self.get(&path, &[("limit", COMMENT_PAGE_LIMIT.to_string())]).await?,
        )?;
        let Some(tree) = listings.into_iter().nth(1) else {
            return Err(PlatformError::Decode {
                url: path,
                detail: "missing comment listing".to_string(),
            });
        };

        let mut flat = CommentTree::default();
        flat.collect(&path, tree.data.children)?;

        let mut requested = HashSet::new();
        while !flat.more.is_empty() {
            let batch = flat
                .more
                .drain(..flat.more.len().min(MORE_CHILDREN_BATCH))
                .filter(|id| requested.insert(id.clone()))
                .collect::<Vec<_>>();
            if batch.is_empty() {
                continue;
            }
            let value = self
                .get(
                    "/api/morechildren",
                    &[
                        ("api_type", "json".to_string()),
                        ("link_id", post.fullname.clone()),
                        ("children", batch.join(",")),
                    ],
                )
                .await?;
            let things = value
                .pointer("/json/data/things")
                .cloned()
                .unwrap_or(JsonValue::Array(Vec::new()));
            flat.collect("/api/morechildren", decode("/api/morechildren", things)?)?;
        }

        Ok(flat.comments)
    }

    async fn resolve_thread(&self, thread: &ThreadRef) -> Result<Option<Post>, PlatformError> {
        let fullname = match thread {
            ThreadRef::Fullname(raw) => {
                let parsed = Fullname::parse(raw)?;
                if parsed.kind() != EntityKind::Post {
                    return Err(EntityError::InvalidEntity(raw.clone()).into());
                }
                parsed.to_string()
            }
            ThreadRef::Uri(uri) => match thread_id_from_uri(uri) {
                Some(id) => Fullname::new(EntityKind::Post, id).to_string(),
                None => return Ok(None),
            },
        };

        let path = "/api/info";
        let listing: Listing = decode(path, self.get(path, &[("id", fullname)]).await?)?;
        Ok(posts_from_listing(path, listing.data.children)?.into_iter().next())
    }

    async fn post_reply(&self, target: &Entity, body: &str) -> Result<Option<Comment>, PlatformError> {
        let value = self
            .call(
                Method::POST,
                "/api/comment",
                &[],
                Some(&[("api_type", "json"), ("thing_id", target.fullname()), ("text", body)][..]),
            )
            .await?;
        parse_reply_response(target.fullname(), value)
    }

    async fn list_own_replies(&self, identity: &str) -> Result<Vec<Comment>, PlatformError> {
        let mut replies = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let (page, next) = self.user_comment_page(identity, PAGE_SIZE, after.as_deref()).await?;
            let page_len = page.len();
            replies.extend(page);
            after = next;
            if after.is_none() || page_len == 0 {
                break;
            }
        }
        Ok(replies)
    }

    async fn recent_own_replies(&self, identity: &str, limit: usize) -> Result<Vec<Comment>, PlatformError> {
        let (mut replies, _) = self
            .user_comment_page(identity, limit.clamp(1, PAGE_SIZE), None)
            .await?;
        replies.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        replies.truncate(limit);
        Ok(replies)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Thing>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Thing {
    kind: String,
    data: JsonValue,
}

#[derive(Debug, Deserialize)]
struct PostData {
    name: String,
    subreddit: String,
    #[serde(default)]
    author: String,
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    created_utc: f64,
}

impl From<PostData> for Post {
    fn from(data: PostData) -> Self {
        Post {
            fullname: data.name,
            subreddit: data.subreddit,
            author: data.author,
            title: data.title,
            selftext: data.selftext,
            locked: data.locked,
            permalink: data.permalink,
            created_utc: timestamp(data.created_utc),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommentData {
    name: String,
    link_id: String,
    parent_id: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    created_utc: f64,
    /// Either `""` or a nested listing.
    #[serde(default)]
    replies: JsonValue,
}

impl CommentData {
    fn into_comment(self) -> Comment {
        Comment {
            fullname: self.name,
            link_fullname: self.link_id,
            parent_fullname: self.parent_id,
            author: self.author,
            body: self.body,
            created_utc: timestamp(self.created_utc),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MoreData {
    #[serde(default)]
    children: Vec<String>,
}

/// Depth-first flattening of a comment tree; `more` holds ids still to fetch.
#[derive(Debug, Default)]
struct CommentTree {
    comments: Vec<Comment>,
    seen: HashSet<String>,
    more: Vec<String>,
}

impl CommentTree {
    fn collect(&mut self, url: &str, things: Vec<Thing>) -> Result<(), PlatformError> {
        for thing in things {
            match thing.kind.as_str() {
                "t1" => {
                    let mut data: CommentData = decode(url, thing.data)?;
                    let replies = std::mem::take(&mut data.replies);
                    if self.seen.insert(data.name.clone()) {
                        self.comments.push(data.into_comment());
                    }
                    if replies.is_object() {
                        let listing: Listing = decode(url, replies)?;
                        self.collect(url, listing.data.children)?;
                    }
                }
                "more" => {
                    let more: MoreData = decode(url, thing.data)?;
                    self.more.extend(more.children);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn posts_from_listing(url: &str, things: Vec<Thing>) -> Result<Vec<Post>, PlatformError> {
    things
        .into_iter()
        .filter(|thing| thing.kind == EntityKind::Post.prefix())
        .map(|thing| decode::<PostData>(url, thing.data).map(Post::from))
        .collect()
}

fn parse_reply_response(target: &str, value: JsonValue) -> Result<Option<Comment>, PlatformError> {
    if let Some(error) = value
        .pointer("/json/errors")
        .and_then(JsonValue::as_array)
        .and_then(|errors| errors.first())
    {
        let code = error.get(0).and_then(JsonValue::as_str).unwrap_or("UNKNOWN");
        let message = error.get(1).and_then(JsonValue::as_str).unwrap_or_default();
        if FORBIDDEN_REPLY_CODES.contains(&code) {
            return Err(PlatformError::Forbidden(format!("{code} replying to {target}")));
        }
        return Err(PlatformError::Api(format!("{code}: {message}")));
    }

    let Some(thing) = value
        .pointer("/json/data/things")
        .and_then(JsonValue::as_array)
        .and_then(|things| things.first())
    else {
        return Ok(None);
    };

    // The reply exists at this point; an unreadable payload is resolved like a silent drop.
    match thing
        .get("data")
        .cloned()
        .map(serde_json::from_value::<CommentData>)
    {
        Some(Ok(data)) => Ok(Some(data.into_comment())),
        Some(Err(err)) => {
            warn!(%target, error = %err, "could not decode created reply");
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Post id from a thread permalink or a `redd.it` short link.
pub fn thread_id_from_uri(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    if url.host_str()?.ends_with("redd.it") {
        return segments.next().map(str::to_string);
    }
    segments
        .skip_while(|segment| *segment != "comments")
        .nth(1)
        .map(str::to_string)
}

fn decode<T: DeserializeOwned>(url: &str, value: JsonValue) -> Result<T, PlatformError> {
    serde_json::from_value(value).map_err(|err| PlatformError::Decode {
        url: url.to_string(),
        detail: err.to_string(),
    })
}

fn timestamp(epoch_seconds: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch_seconds as i64, 0).unwrap_or_default()
}
