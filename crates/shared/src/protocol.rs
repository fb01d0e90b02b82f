use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    FollowOutcome, LikeOutcome, MessageRecord, NotificationEntry, UserRecord,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub user: UserRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowRequest {
    pub session_id: Uuid,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowResponse {
    pub outcome: FollowOutcome,
    pub following: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub repaired: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMessageRequest {
    pub session_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub session_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikeRequest {
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikeResponse {
    pub outcome: LikeOutcome,
    pub likes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageListResponse {
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsResponse {
    pub queue: Vec<NotificationEntry>,
    pub unseen: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenRequest {
    pub session_id: Uuid,
}
