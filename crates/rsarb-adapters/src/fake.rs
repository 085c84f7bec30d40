//! In-memory stand-in for Reddit used by orchestrator and reconciler tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rsarb_core::{Comment, Entity, EntityError, EntityKind, Fullname, Post, ThreadRef};

use crate::{PlatformError, PlatformGateway};

/// How a subreddit treats replies posted into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForumBehavior {
    #[default]
    Normal,
    /// The reply is created but the call returns nothing.
    Quarantined,
    /// The call returns nothing and no reply is created.
    Blackhole,
}

#[derive(Debug, Default)]
struct FakeState {
    forums: BTreeMap<String, ForumBehavior>,
    posts: Vec<Post>,
    comments: Vec<Comment>,
    reply_attempts: Vec<String>,
    next_id: u64,
    offline: bool,
    history_offline: bool,
    overlapping_pages: bool,
}

impl FakeState {
    fn next_local_id(&mut self, prefix: char) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    /// Strictly increasing creation times, in insertion order.
    fn next_created(&self) -> DateTime<Utc> {
        let epoch = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        epoch + Duration::seconds(self.next_id as i64)
    }

    fn post(&self, fullname: &str) -> Option<&Post> {
        self.posts.iter().find(|post| post.fullname == fullname)
    }

    fn forum_of(&self, link_fullname: &str) -> ForumBehavior {
        self.post(link_fullname)
            .and_then(|post| self.forums.get(&post.subreddit.to_lowercase()).copied())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct FakePlatform {
    identity: String,
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_forum_behavior(&self, subreddit: &str, behavior: ForumBehavior) {
        self.state().forums.insert(subreddit.to_lowercase(), behavior);
    }

    /// Every call fails as if Reddit were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Only the bot's reply history fails, as if that endpoint were down.
    pub fn set_history_offline(&self, offline: bool) {
        self.state().history_offline = offline;
    }

    /// Listings return every post and comment twice, like pages that
    /// shifted while being read.
    pub fn set_overlapping_pages(&self, overlapping: bool) {
        self.state().overlapping_pages = overlapping;
    }

    pub fn add_post(&self, subreddit: &str, author: &str, title: &str, selftext: &str) -> Post {
        let mut state = self.state();
        let local_id = state.next_local_id('s');
        let post = Post {
            fullname: Fullname::new(EntityKind::Post, local_id.clone()).to_string(),
            subreddit: subreddit.to_string(),
            author: author.to_string(),
            title: title.to_string(),
            selftext: selftext.to_string(),
            locked: false,
            permalink: format!("/r/{subreddit}/comments/{local_id}/"),
            created_utc: state.next_created(),
        };
        state.posts.push(post.clone());
        post
    }

    pub fn lock_post(&self, fullname: &str) {
        if let Some(post) = self.state().posts.iter_mut().find(|post| post.fullname == fullname) {
            post.locked = true;
        }
    }

    /// Comment under `parent`, which is a post or another comment.
    pub fn add_comment(&self, parent: &str, author: &str, body: &str) -> Comment {
        let mut state = self.state();
        let link_fullname = state
            .comments
            .iter()
            .find(|comment| comment.fullname == parent)
            .map(|comment| comment.link_fullname.clone())
            .unwrap_or_else(|| parent.to_string());
        let local_id = state.next_local_id('c');
        let comment = Comment {
            fullname: Fullname::new(EntityKind::Comment, local_id).to_string(),
            link_fullname,
            parent_fullname: parent.to_string(),
            author: author.to_string(),
            body: body.to_string(),
            created_utc: state.next_created(),
        };
        state.comments.push(comment.clone());
        comment
    }

    /// Fullnames `post_reply` was called with, in call order.
    pub fn reply_attempts(&self) -> Vec<String> {
        self.state().reply_attempts.clone()
    }

    /// Replies authored by the bot that exist on the platform.
    pub fn own_replies(&self) -> Vec<Comment> {
        let identity = self.identity.to_lowercase();
        self.state()
            .comments
            .iter()
            .filter(|comment| comment.author.to_lowercase() == identity)
            .cloned()
            .collect()
    }

    fn ensure_online(&self) -> Result<(), PlatformError> {
        if self.state().offline {
            return Err(PlatformError::HttpStatus {
                status: 503,
                url: "fake://reddit".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformGateway for FakePlatform {
    async fn current_user(&self) -> Result<String, PlatformError> {
        self.ensure_online()?;
        Ok(self.identity.clone())
    }

    async fn list_new_posts(&self, forums: &str, limit: Option<usize>) -> Result<Vec<Post>, PlatformError> {
        self.ensure_online()?;
        let wanted = forums
            .split('+')
            .map(str::to_lowercase)
            .collect::<Vec<_>>();
        let state = self.state();
        let mut posts = state
            .posts
            .iter()
            .filter(|post| wanted.contains(&post.subreddit.to_lowercase()))
            .cloned()
            .collect::<Vec<_>>();
        posts.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        if let Some(limit) = limit {
            posts.truncate(limit);
        }
        if state.overlapping_pages {
            posts.extend(posts.clone());
        }
        Ok(posts)
    }

    async fn list_comments(&self, post: &Post) -> Result<Vec<Comment>, PlatformError> {
        self.ensure_online()?;
        let state = self.state();
        let mut comments = state
            .comments
            .iter()
            .filter(|comment| comment.link_fullname == post.fullname)
            .cloned()
            .collect::<Vec<_>>();
        if state.overlapping_pages {
            comments.extend(comments.clone());
        }
        Ok(comments)
    }

    async fn resolve_thread(&self, thread: &ThreadRef) -> Result<Option<Post>, PlatformError> {
        self.ensure_online()?;
        let state = self.state();
        let post = match thread {
            ThreadRef::Fullname(raw) => {
                let parsed = Fullname::parse(raw)?;
                if parsed.kind() != EntityKind::Post {
                    return Err(EntityError::InvalidEntity(raw.clone()).into());
                }
                state.post(raw).cloned()
            }
            ThreadRef::Uri(uri) => crate::reddit::thread_id_from_uri(uri)
                .and_then(|id| state.post(&Fullname::new(EntityKind::Post, id).to_string()).cloned()),
        };
        Ok(post)
    }

    async fn post_reply(&self, target: &Entity, body: &str) -> Result<Option<Comment>, PlatformError> {
        self.ensure_online()?;
        let link_fullname = match target {
            Entity::Post(post) => post.fullname.clone(),
            Entity::Comment(comment) => comment.link_fullname.clone(),
        };
        let behavior = {
            let mut state = self.state();
            state.reply_attempts.push(target.fullname().to_string());
            if state.post(&link_fullname).is_some_and(|post| post.locked) {
                return Err(PlatformError::Forbidden(format!("THREAD_LOCKED replying to {}", target.fullname())));
            }
            state.forum_of(&link_fullname)
        };

        match behavior {
            ForumBehavior::Blackhole => Ok(None),
            ForumBehavior::Quarantined => {
                self.add_comment(target.fullname(), &self.identity, body);
                Ok(None)
            }
            ForumBehavior::Normal => Ok(Some(self.add_comment(target.fullname(), &self.identity, body))),
        }
    }

    async fn list_own_replies(&self, identity: &str) -> Result<Vec<Comment>, PlatformError> {
        self.ensure_online()?;
        if self.state().history_offline {
            return Err(PlatformError::HttpStatus {
                status: 503,
                url: format!("fake://reddit/user/{identity}/comments"),
            });
        }
        let identity = identity.to_lowercase();
        Ok(self
            .state()
            .comments
            .iter()
            .filter(|comment| comment.author.to_lowercase() == identity)
            .cloned()
            .collect())
    }

    async fn recent_own_replies(&self, identity: &str, limit: usize) -> Result<Vec<Comment>, PlatformError> {
        let mut replies = self.list_own_replies(identity).await?;
        replies.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        replies.truncate(limit);
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn quarantined_forums_create_replies_silently() {
        let platform = FakePlatform::new("lightweaver_bot");
        platform.set_forum_behavior("hidden", ForumBehavior::Quarantined);
        let post = platform.add_post("hidden", "alice", "book1", "");

        let reply = platform.post_reply(&Entity::from(post.clone()), "hi").await.unwrap();
        assert!(reply.is_none());

        let recent = platform.recent_own_replies("lightweaver_bot", 1).await.unwrap();
        assert_eq!(recent[0].parent_fullname, post.fullname);
    }

    #[tokio::test]
    async fn locked_threads_reject_replies_to_comments() {
        let platform = FakePlatform::new("lightweaver_bot");
        let post = platform.add_post("books", "alice", "title", "");
        let comment = platform.add_comment(&post.fullname, "bob", "book1");
        platform.lock_post(&post.fullname);

        let result = platform.post_reply(&Entity::from(comment.clone()), "hi").await;
        assert!(matches!(result, Err(PlatformError::Forbidden(_))));
        assert_eq!(platform.reply_attempts(), vec![comment.fullname]);
        assert!(platform.own_replies().is_empty());
    }

    #[tokio::test]
    async fn posts_are_listed_newest_first_across_forums() {
        let platform = FakePlatform::new("lightweaver_bot");
        let first = platform.add_post("books", "alice", "one", "");
        platform.add_post("elsewhere", "alice", "two", "");
        let third = platform.add_post("Fantasy", "bob", "three", "");

        let posts = platform.list_new_posts("books+fantasy", None).await.unwrap();
        let names = posts.iter().map(|p| p.fullname.clone()).collect::<Vec<_>>();
        assert_eq!(names, vec![third.fullname, first.fullname]);
    }

    #[tokio::test]
    async fn threads_resolve_by_uri_or_fullname() {
        let platform = FakePlatform::new("lightweaver_bot");
        let post = platform.add_post("lightweaver_bot", "mod", "opt in here", "");
        let uri = format!("https://www.reddit.com{}", post.permalink);

        let by_uri = platform.find_thread(None, Some(&uri)).await.unwrap();
        assert_eq!(by_uri.map(|p| p.fullname), Some(post.fullname.clone()));
        let by_name = platform.find_thread(Some(&post.fullname), None).await.unwrap();
        assert!(by_name.is_some());
        assert!(platform.find_thread(Some("t3_missing"), None).await.unwrap().is_none());
        assert!(platform.find_thread(None, None).await.is_err());
    }
}
