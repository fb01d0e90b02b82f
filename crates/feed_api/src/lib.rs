use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use realtime::{PublishError, SignalHub, FEED_CHANNEL};
use shared::{
    domain::{
        FeedFilter, FollowOutcome, LikeOutcome, MessageId, MessageRecord, NotificationEntry,
        NotificationQueueRecord, UserRecord,
    },
    error::{ApiError, ErrorCode},
};
use storage::Storage;

/// Observed queue trim threshold of the system this replaces; the intended
/// cap was ambiguous there, so it stays configurable here.
pub const DEFAULT_QUEUE_CAP: usize = 5;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub signals: SignalHub,
    pub queue_cap: usize,
}

/// Per-session context object. Holds the identity plus the snapshots the
/// session works from: message fan-out reads `user.followers`, and
/// mark-as-seen writes back `notifications`, both as cached at bootstrap or
/// last refresh. There is deliberately no process-wide session state.
#[derive(Debug, Clone)]
pub struct Session {
    pub email: String,
    pub user: UserRecord,
    pub notifications: NotificationQueueRecord,
}

impl Session {
    pub fn is_following(&self, target: &str) -> bool {
        self.user.is_following(target)
    }

    pub fn unseen_count(&self) -> usize {
        self.notifications.unseen_count()
    }
}

/// Operation failures, one variant per boundary in the store/transport
/// contract. Nothing is swallowed: every operation returns these to the
/// caller, and the server maps them through a single rejection handler.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("store read failed: {0:#}")]
    StoreRead(anyhow::Error),
    #[error("store write failed: {0:#}")]
    StoreWrite(anyhow::Error),
    #[error("missing {collection} record for '{key}'")]
    MissingRecord {
        collection: &'static str,
        key: String,
    },
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    Validation(&'static str),
}

impl FeedError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FeedError::StoreRead(_) | FeedError::StoreWrite(_) | FeedError::Publish(_) => {
                ErrorCode::Unavailable
            }
            FeedError::MissingRecord { .. } => ErrorCode::NotFound,
            FeedError::Forbidden(_) => ErrorCode::Forbidden,
            FeedError::Validation(_) => ErrorCode::Validation,
        }
    }
}

impl From<FeedError> for ApiError {
    fn from(err: FeedError) -> Self {
        ApiError::new(err.code(), err.to_string())
    }
}

fn missing(collection: &'static str, key: &str) -> FeedError {
    FeedError::MissingRecord {
        collection,
        key: key.to_string(),
    }
}

/// Resolves the identity's user record, creating the user record and an
/// empty notification queue on first access. The two inserts are separate,
/// non-transactional writes; a crash between them is healed on the next
/// bootstrap, which re-creates whichever record is missing.
pub async fn bootstrap_session(ctx: &ApiContext, email: &str) -> Result<Session, FeedError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(FeedError::Validation("identity must be non-empty"));
    }

    let user = match ctx
        .storage
        .fetch_user(email)
        .await
        .map_err(FeedError::StoreRead)?
    {
        Some(record) => record,
        None => {
            debug!(%email, "first access, creating social records");
            let record = UserRecord::new(email);
            ctx.storage
                .insert_user(&record)
                .await
                .map_err(FeedError::StoreWrite)?;
            record
        }
    };

    let notifications = match ctx
        .storage
        .fetch_queue(email)
        .await
        .map_err(FeedError::StoreRead)?
    {
        Some(record) => record,
        None => {
            let record = NotificationQueueRecord::empty(email);
            ctx.storage
                .insert_queue(&record)
                .await
                .map_err(FeedError::StoreWrite)?;
            record
        }
    };

    Ok(Session {
        email: email.to_string(),
        user,
        notifications,
    })
}

/// Toggles the follow edge from the session identity to `target`.
///
/// Two-phase write contract: phase 1 updates the actor's `following` list,
/// phase 2 updates the target's `followers` list. The phases are not
/// atomic; a failure between them leaves the graph asymmetric until
/// `reconcile_follow_links` resends phase 2 from phase-1 truth.
pub async fn follow_toggle(
    ctx: &ApiContext,
    session: &mut Session,
    target: &str,
) -> Result<FollowOutcome, FeedError> {
    if target == session.email {
        return Err(FeedError::Validation("cannot follow yourself"));
    }

    let mut target_record = ctx
        .storage
        .fetch_user(target)
        .await
        .map_err(FeedError::StoreRead)?
        .ok_or_else(|| missing("users", target))?;

    let mut actor_record = session.user.clone();
    let outcome = if actor_record.is_following(target) {
        actor_record.following.retain(|e| e != target);
        target_record.followers.retain(|e| e != &session.email);
        FollowOutcome::Unfollowed
    } else {
        actor_record.following.push(target.to_string());
        if !target_record.has_follower(&session.email) {
            target_record.followers.push(session.email.clone());
        }
        FollowOutcome::Followed
    };

    // Phase 1: the actor's side is the source of truth.
    if !ctx
        .storage
        .update_user(&actor_record)
        .await
        .map_err(FeedError::StoreWrite)?
    {
        return Err(missing("users", &session.email));
    }

    // Phase 2: the target's follower list.
    if !ctx
        .storage
        .update_user(&target_record)
        .await
        .map_err(FeedError::StoreWrite)?
    {
        return Err(missing("users", target));
    }

    session.user = actor_record;
    Ok(outcome)
}

/// Repairs follow-graph asymmetry left by a failed phase 2: every identity
/// in `email`'s following list must list them back as a follower, and
/// nobody else may. Returns the number of records rewritten.
pub async fn reconcile_follow_links(ctx: &ApiContext, email: &str) -> Result<usize, FeedError> {
    let user = ctx
        .storage
        .fetch_user(email)
        .await
        .map_err(FeedError::StoreRead)?
        .ok_or_else(|| missing("users", email))?;

    let mut repaired = 0;

    for followed in &user.following {
        let Some(mut record) = ctx
            .storage
            .fetch_user(followed)
            .await
            .map_err(FeedError::StoreRead)?
        else {
            warn!(%followed, "followed identity has no user record, skipping");
            continue;
        };
        if !record.has_follower(email) {
            record.followers.push(email.to_string());
            if !ctx
                .storage
                .update_user(&record)
                .await
                .map_err(FeedError::StoreWrite)?
            {
                return Err(missing("users", followed));
            }
            repaired += 1;
        }
    }

    for mut other in ctx
        .storage
        .list_users()
        .await
        .map_err(FeedError::StoreRead)?
    {
        if other.email == email || user.is_following(&other.email) {
            continue;
        }
        if other.has_follower(email) {
            other.followers.retain(|e| e != email);
            if !ctx
                .storage
                .update_user(&other)
                .await
                .map_err(FeedError::StoreWrite)?
            {
                return Err(missing("users", &other.email));
            }
            repaired += 1;
        }
    }

    Ok(repaired)
}

/// Posts a message, signals the shared feed channel, and fans one
/// notification out to each follower in the session snapshot. Followers
/// gained after bootstrap are not notified until a fresh session sees them.
/// Fan-out is best-effort: per-recipient failures are logged and skipped.
pub async fn post_message(
    ctx: &ApiContext,
    session: &Session,
    content: &str,
) -> Result<MessageRecord, FeedError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(FeedError::Validation("message content must be non-empty"));
    }

    let record = MessageRecord {
        id: MessageId::generate(),
        author: session.email.clone(),
        content: content.to_string(),
        submitted_at: Utc::now(),
        likes: Vec::new(),
    };
    ctx.storage
        .insert_message(&record)
        .await
        .map_err(FeedError::StoreWrite)?;
    ctx.signals.publish(FEED_CHANNEL)?;

    for follower in &session.user.followers {
        if let Err(err) = notify(ctx, follower, &session.email, "added a new message").await {
            warn!(%follower, error = %err, "notification fan-out failed");
        }
    }

    Ok(record)
}

pub async fn edit_message(
    ctx: &ApiContext,
    session: &Session,
    id: MessageId,
    content: &str,
) -> Result<MessageRecord, FeedError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(FeedError::Validation("message content must be non-empty"));
    }

    let mut record = ctx
        .storage
        .fetch_message(id)
        .await
        .map_err(FeedError::StoreRead)?
        .ok_or_else(|| missing("messages", &id.to_string()))?;
    if record.author != session.email {
        return Err(FeedError::Forbidden("only the author may edit a message"));
    }

    record.content = content.to_string();
    if !ctx
        .storage
        .update_message(&record)
        .await
        .map_err(FeedError::StoreWrite)?
    {
        return Err(missing("messages", &id.to_string()));
    }
    ctx.signals.publish(FEED_CHANNEL)?;
    Ok(record)
}

pub async fn delete_message(
    ctx: &ApiContext,
    session: &Session,
    id: MessageId,
) -> Result<(), FeedError> {
    let record = ctx
        .storage
        .fetch_message(id)
        .await
        .map_err(FeedError::StoreRead)?
        .ok_or_else(|| missing("messages", &id.to_string()))?;
    if record.author != session.email {
        return Err(FeedError::Forbidden("only the author may delete a message"));
    }

    if !ctx
        .storage
        .remove_message(id)
        .await
        .map_err(FeedError::StoreWrite)?
    {
        return Err(missing("messages", &id.to_string()));
    }
    ctx.signals.publish(FEED_CHANNEL)?;
    Ok(())
}

/// Toggles the session identity in the message's likes. A new like sends
/// one notification to the author; unliking sends nothing. Rapid toggles
/// from concurrent sessions stay last-write-wins.
pub async fn like_toggle(
    ctx: &ApiContext,
    session: &Session,
    id: MessageId,
) -> Result<(LikeOutcome, MessageRecord), FeedError> {
    let mut record = ctx
        .storage
        .fetch_message(id)
        .await
        .map_err(FeedError::StoreRead)?
        .ok_or_else(|| missing("messages", &id.to_string()))?;

    let outcome = if record.is_liked_by(&session.email) {
        record.likes.retain(|e| e != &session.email);
        LikeOutcome::Unliked
    } else {
        record.likes.push(session.email.clone());
        LikeOutcome::Liked
    };

    if !ctx
        .storage
        .update_message(&record)
        .await
        .map_err(FeedError::StoreWrite)?
    {
        return Err(missing("messages", &id.to_string()));
    }

    if outcome == LikeOutcome::Liked {
        if let Err(err) = notify(ctx, &record.author, &session.email, "liked your message").await {
            warn!(author = %record.author, error = %err, "like notification failed");
        }
    }

    Ok((outcome, record))
}

/// Prepends an entry to the recipient's queue, trims to the configured cap,
/// writes the record back, and signals the recipient's derived channel.
/// Delivery is at-most-once: receivers re-fetch their queue on signal.
pub async fn notify(
    ctx: &ApiContext,
    recipient: &str,
    source: &str,
    action: &str,
) -> Result<(), FeedError> {
    let mut record = ctx
        .storage
        .fetch_queue(recipient)
        .await
        .map_err(FeedError::StoreRead)?
        .ok_or_else(|| missing("notifications", recipient))?;

    record.queue.insert(
        0,
        NotificationEntry {
            source: source.to_string(),
            action: action.to_string(),
            created_at: Utc::now(),
            seen: false,
        },
    );
    record.queue.truncate(ctx.queue_cap);

    if !ctx
        .storage
        .update_queue(&record)
        .await
        .map_err(FeedError::StoreWrite)?
    {
        return Err(missing("notifications", recipient));
    }

    ctx.signals.publish(&realtime::user_channel(recipient))?;
    Ok(())
}

/// Re-fetches the notification queue into the session snapshot.
pub async fn refresh_notifications(
    ctx: &ApiContext,
    session: &mut Session,
) -> Result<(), FeedError> {
    session.notifications = ctx
        .storage
        .fetch_queue(&session.email)
        .await
        .map_err(FeedError::StoreRead)?
        .ok_or_else(|| missing("notifications", &session.email))?;
    Ok(())
}

/// Flips `seen` on every entry of the cached queue snapshot and writes the
/// record back once. Entries that landed after the last refresh are
/// overwritten by the snapshot; refresh before calling to narrow the window.
pub async fn mark_all_seen(ctx: &ApiContext, session: &mut Session) -> Result<(), FeedError> {
    for entry in &mut session.notifications.queue {
        entry.seen = true;
    }

    if !ctx
        .storage
        .update_queue(&session.notifications)
        .await
        .map_err(FeedError::StoreWrite)?
    {
        return Err(missing("notifications", &session.email));
    }
    Ok(())
}

/// Newest-first feed page, either everyone's messages or one author's.
pub async fn list_feed(
    ctx: &ApiContext,
    filter: &FeedFilter,
    limit: u32,
) -> Result<Vec<MessageRecord>, FeedError> {
    ctx.storage
        .list_messages(filter, limit)
        .await
        .map_err(FeedError::StoreRead)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
