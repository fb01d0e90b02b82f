use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A user's social record. One per identity, created on first session,
/// never deleted. Membership lists are sets by invariant; they are stored
/// as ordered lists the way the backing document store holds them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub email: String,
    pub following: Vec<String>,
    pub followers: Vec<String>,
}

impl UserRecord {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            following: Vec::new(),
            followers: Vec::new(),
        }
    }

    pub fn is_following(&self, target: &str) -> bool {
        self.following.iter().any(|e| e == target)
    }

    pub fn has_follower(&self, source: &str) -> bool {
        self.followers.iter().any(|e| e == source)
    }
}

/// One entry in a user's notification queue. Immutable once created except
/// for the `seen` flag, which mark-as-seen bulk-flips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub source: String,
    pub action: String,
    pub created_at: DateTime<Utc>,
    pub seen: bool,
}

/// Per-user notification queue, newest-first. Length stays at or below the
/// configured cap after every notify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationQueueRecord {
    pub email: String,
    pub queue: Vec<NotificationEntry>,
}

impl NotificationQueueRecord {
    pub fn empty(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            queue: Vec::new(),
        }
    }

    pub fn unseen_count(&self) -> usize {
        self.queue.iter().filter(|entry| !entry.seen).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub author: String,
    pub content: String,
    pub submitted_at: DateTime<Utc>,
    pub likes: Vec<String>,
}

impl MessageRecord {
    pub fn is_liked_by(&self, email: &str) -> bool {
        self.likes.iter().any(|e| e == email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFilter {
    All,
    Mine(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowOutcome {
    Followed,
    Unfollowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LikeOutcome {
    Liked,
    Unliked,
}
