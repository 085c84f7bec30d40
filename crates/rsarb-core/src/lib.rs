//! Core entity model, mention scanner and reply rendering for RSARB.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rsarb-core";

/// Author name Reddit reports for removed accounts.
pub const DELETED_AUTHOR: &str = "[deleted]";

const REPLY_DELIMITER: &str = "------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Post,
    Comment,
}

impl EntityKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Post => "t3",
            Self::Comment => "t1",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "t3" => Some(Self::Post),
            "t1" => Some(Self::Comment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("invalid entity {0:?}: expected a post (t3_) or comment (t1_) fullname")]
    InvalidEntity(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Platform-wide identifier: a type prefix plus the entity's local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fullname {
    kind: EntityKind,
    local_id: String,
}

impl Fullname {
    pub fn new(kind: EntityKind, local_id: impl Into<String>) -> Self {
        Self {
            kind,
            local_id: local_id.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EntityError> {
        let invalid = || EntityError::InvalidEntity(raw.to_string());
        let (prefix, local_id) = raw.split_once('_').ok_or_else(invalid)?;
        let kind = EntityKind::from_prefix(prefix).ok_or_else(invalid)?;
        if local_id.is_empty() || local_id.contains('_') {
            return Err(invalid());
        }
        Ok(Self::new(kind, local_id))
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

impl fmt::Display for Fullname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.prefix(), self.local_id)
    }
}

/// Read view of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub fullname: String,
    pub subreddit: String,
    pub author: String,
    pub title: String,
    pub selftext: String,
    pub locked: bool,
    pub permalink: String,
    pub created_utc: DateTime<Utc>,
}

/// Read view of a comment. `parent_fullname` is either the post or another comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub fullname: String,
    pub link_fullname: String,
    pub parent_fullname: String,
    pub author: String,
    pub body: String,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entity {
    Post(Post),
    Comment(Comment),
}

impl Entity {
    pub fn fullname(&self) -> &str {
        match self {
            Self::Post(post) => &post.fullname,
            Self::Comment(comment) => &comment.fullname,
        }
    }

    pub fn author(&self) -> &str {
        match self {
            Self::Post(post) => &post.author,
            Self::Comment(comment) => &comment.author,
        }
    }

    fn kind(&self) -> EntityKind {
        match self {
            Self::Post(_) => EntityKind::Post,
            Self::Comment(_) => EntityKind::Comment,
        }
    }

    /// Text fields a mention may appear in. Fields are matched one by one so a
    /// title never straddles the title/selftext boundary.
    fn scanned_fields(&self) -> [&str; 2] {
        match self {
            Self::Post(post) => [&post.title, &post.selftext],
            Self::Comment(comment) => [&comment.body, ""],
        }
    }
}

impl From<Post> for Entity {
    fn from(post: Post) -> Self {
        Self::Post(post)
    }
}

impl From<Comment> for Entity {
    fn from(comment: Comment) -> Self {
        Self::Comment(comment)
    }
}

/// Reference to a thread; exactly one of fullname or URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadRef {
    Fullname(String),
    Uri(String),
}

impl ThreadRef {
    pub fn from_parts(fullname: Option<&str>, uri: Option<&str>) -> Result<Self, EntityError> {
        match (fullname, uri) {
            (Some(fullname), None) => Ok(Self::Fullname(fullname.to_string())),
            (None, Some(uri)) => Ok(Self::Uri(uri.to_string())),
            (Some(_), Some(_)) => Err(EntityError::InvalidArgument(
                "specify either a thread fullname or a thread URI, not both".to_string(),
            )),
            (None, None) => Err(EntityError::InvalidArgument(
                "must specify either a thread fullname or a thread URI".to_string(),
            )),
        }
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fullname(fullname) => f.write_str(fullname),
            Self::Uri(uri) => f.write_str(uri),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub title: String,
    pub author: String,
    pub identifier_code: String,
    #[serde(default)]
    pub reference_uri: Option<String>,
    pub summary: String,
}

/// Store state captured once at the start of a scan cycle.
#[derive(Debug, Clone, Default)]
pub struct ScanSnapshot {
    bot_identity: String,
    catalog_titles: BTreeSet<String>,
    replied: HashSet<String>,
    opted_in: HashSet<String>,
}

impl ScanSnapshot {
    pub fn new(
        bot_identity: &str,
        catalog_titles: impl IntoIterator<Item = String>,
        replied: impl IntoIterator<Item = String>,
        opted_in: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            bot_identity: bot_identity.to_lowercase(),
            catalog_titles: catalog_titles
                .into_iter()
                .map(|title| title.to_lowercase())
                .filter(|title| !title.is_empty())
                .collect(),
            replied: replied.into_iter().collect(),
            opted_in: opted_in.into_iter().map(|user| user.to_lowercase()).collect(),
        }
    }

    pub fn catalog_len(&self) -> usize {
        self.catalog_titles.len()
    }

    pub fn roster_len(&self) -> usize {
        self.opted_in.len()
    }

    pub fn ledger_len(&self) -> usize {
        self.replied.len()
    }

    /// Catalog titles the entity should be replied with, lower-cased and sorted.
    /// Empty when the entity was already handled, is the bot's own, or its
    /// author has not opted in.
    pub fn scan(&self, entity: &Entity) -> Result<BTreeSet<String>, EntityError> {
        let fullname = Fullname::parse(entity.fullname())?;
        if fullname.kind() != entity.kind() {
            return Err(EntityError::InvalidEntity(entity.fullname().to_string()));
        }

        if self.replied.contains(fullname.local_id()) {
            return Ok(BTreeSet::new());
        }

        let author = entity.author().to_lowercase();
        if author == self.bot_identity || author == DELETED_AUTHOR {
            return Ok(BTreeSet::new());
        }
        if !self.opted_in.contains(&author) {
            return Ok(BTreeSet::new());
        }

        let fields = entity.scanned_fields().map(str::to_lowercase);
        Ok(self
            .catalog_titles
            .iter()
            .filter(|title| fields.iter().any(|field| field.contains(title.as_str())))
            .cloned()
            .collect())
    }
}

/// Render the reply body. Blocks follow the order of `entries`.
pub fn render_reply(entries: &[CatalogEntry], bot_identity: &str, feedback_subreddit: &str) -> String {
    let header = format!(
        "Hello, I am {bot_identity}. I am a bot that posts information on books that you have mentioned.\n\n{REPLY_DELIMITER}\n"
    );

    let body = entries
        .iter()
        .map(|entry| {
            let block = [
                format!("Title:  {}", entry.title),
                format!("Author: {}", entry.author),
                format!("ISBN:   {}", entry.identifier_code),
                format!("URI:    {}", entry.reference_uri.as_deref().unwrap_or("n/a")),
            ]
            .join("\n\n");
            format!("{block}\n\n{REPLY_DELIMITER}\n\n")
        })
        .collect::<String>();

    let footer = format!(
        "This post was made by a bot.\nFor more information, or to give feedback or suggestions, please visit /r/{feedback_subreddit}."
    );

    [header, body, footer].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn post(fullname: &str, author: &str, title: &str, selftext: &str) -> Entity {
        Entity::Post(Post {
            fullname: fullname.to_string(),
            subreddit: "books".to_string(),
            author: author.to_string(),
            title: title.to_string(),
            selftext: selftext.to_string(),
            locked: false,
            permalink: format!("/r/books/comments/{fullname}/"),
            created_utc: ts(),
        })
    }

    fn comment(fullname: &str, author: &str, body: &str) -> Entity {
        Entity::Comment(Comment {
            fullname: fullname.to_string(),
            link_fullname: "t3_s1".to_string(),
            parent_fullname: "t3_s1".to_string(),
            author: author.to_string(),
            body: body.to_string(),
            created_utc: ts(),
        })
    }

    fn snapshot(replied: &[&str]) -> ScanSnapshot {
        ScanSnapshot::new(
            "lightweaver_bot",
            ["book1", "book2", "book3"].map(String::from),
            replied.iter().map(|id| id.to_string()),
            ["alice".to_string()],
        )
    }

    fn titles(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn fullname_parses_posts_and_comments() {
        let post = Fullname::parse("t3_abc").unwrap();
        assert_eq!(post.kind(), EntityKind::Post);
        assert_eq!(post.local_id(), "abc");
        assert_eq!(post.to_string(), "t3_abc");

        let comment = Fullname::parse("t1_xyz").unwrap();
        assert_eq!(comment.kind(), EntityKind::Comment);
        assert_eq!(comment.local_id(), "xyz");
    }

    #[test]
    fn fullname_rejects_other_kinds() {
        for raw in ["t5_sub", "t2_user", "abc", "t3_", "t1_a_b"] {
            assert_eq!(
                Fullname::parse(raw),
                Err(EntityError::InvalidEntity(raw.to_string())),
                "{raw}"
            );
        }
    }

    #[test]
    fn post_title_mentions_match() {
        let found = snapshot(&[]).scan(&post("t3_s1", "alice", "book1 book2", "")).unwrap();
        assert_eq!(found, titles(&["book1", "book2"]));
    }

    #[test]
    fn post_selftext_and_title_are_both_scanned() {
        let found = snapshot(&[]).scan(&post("t3_s1", "alice", "book1", "about BOOK3")).unwrap();
        assert_eq!(found, titles(&["book1", "book3"]));
    }

    #[test]
    fn repeated_mentions_collapse() {
        let found = snapshot(&[])
            .scan(&post("t3_s1", "alice", "book1 book1", "book1 again"))
            .unwrap();
        assert_eq!(found, titles(&["book1"]));
    }

    #[test]
    fn comment_body_matches_literal_substrings() {
        let found = snapshot(&[]).scan(&comment("t1_c1", "ALICE", "notabook1ever")).unwrap();
        assert_eq!(found, titles(&["book1"]));
    }

    #[test]
    fn no_mentions_yields_empty() {
        assert!(snapshot(&[]).scan(&comment("t1_c1", "alice", "hello")).unwrap().is_empty());
    }

    #[test]
    fn author_not_opted_in_yields_empty() {
        let found = snapshot(&[]).scan(&post("t3_s1", "bob", "book1 book2", "")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn already_replied_yields_empty() {
        let found = snapshot(&["s1"]).scan(&post("t3_s1", "alice", "book1", "")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn own_entities_yield_empty() {
        let snap = ScanSnapshot::new(
            "Lightweaver_Bot",
            ["book1".to_string()],
            Vec::<String>::new(),
            ["lightweaver_bot".to_string()],
        );
        assert!(snap.scan(&comment("t1_c9", "lightweaver_bot", "book1")).unwrap().is_empty());
    }

    #[test]
    fn deleted_authors_yield_empty() {
        let snap = ScanSnapshot::new(
            "bot",
            ["book1".to_string()],
            Vec::<String>::new(),
            [DELETED_AUTHOR.to_string()],
        );
        assert!(snap.scan(&comment("t1_c9", DELETED_AUTHOR, "book1")).unwrap().is_empty());
    }

    #[test]
    fn invalid_fullname_is_an_error() {
        let err = snapshot(&[]).scan(&comment("t5_c1", "alice", "book1")).unwrap_err();
        assert_eq!(err, EntityError::InvalidEntity("t5_c1".to_string()));

        let err = snapshot(&[]).scan(&post("t1_c1", "alice", "book1", "")).unwrap_err();
        assert_eq!(err, EntityError::InvalidEntity("t1_c1".to_string()));
    }

    #[test]
    fn scan_is_repeatable() {
        let snap = snapshot(&[]);
        let entity = comment("t1_c1", "alice", "book2 and book3");
        assert_eq!(snap.scan(&entity).unwrap(), snap.scan(&entity).unwrap());
    }

    #[test]
    fn thread_ref_requires_exactly_one_reference() {
        assert_eq!(
            ThreadRef::from_parts(Some("t3_s1"), None).unwrap(),
            ThreadRef::Fullname("t3_s1".to_string())
        );
        assert_eq!(
            ThreadRef::from_parts(None, Some("https://reddit.com/r/a/comments/s1/t/")).unwrap(),
            ThreadRef::Uri("https://reddit.com/r/a/comments/s1/t/".to_string())
        );
        assert!(matches!(
            ThreadRef::from_parts(Some("t3_s1"), Some("https://reddit.com")),
            Err(EntityError::InvalidArgument(_))
        ));
        assert!(matches!(
            ThreadRef::from_parts(None, None),
            Err(EntityError::InvalidArgument(_))
        ));
    }

    #[test]
    fn reply_has_one_block_per_entry_in_order() {
        let entries = vec![
            CatalogEntry {
                title: "Book2".into(),
                author: "author2".into(),
                identifier_code: "isbn2".into(),
                reference_uri: Some("url2".into()),
                summary: "sum2".into(),
            },
            CatalogEntry {
                title: "Book1".into(),
                author: "author1".into(),
                identifier_code: "isbn1".into(),
                reference_uri: None,
                summary: "sum1".into(),
            },
        ];
        let body = render_reply(&entries, "lightweaver_bot", "lightweaver_bot");

        assert!(body.starts_with("Hello, I am lightweaver_bot."));
        assert!(body.ends_with("please visit /r/lightweaver_bot."));
        assert_eq!(body.matches("Title:  ").count(), 2);
        assert!(body.contains("Title:  Book2\n\nAuthor: author2\n\nISBN:   isbn2\n\nURI:    url2"));
        assert!(body.contains("URI:    n/a"));
        assert!(body.find("Book2").unwrap() < body.find("Book1").unwrap());
        assert!(!body.contains("sum1"));
    }
}
