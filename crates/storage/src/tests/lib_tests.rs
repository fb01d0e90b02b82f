use super::*;
use chrono::Duration;

fn message_at(author: &str, content: &str, offset_secs: i64) -> MessageRecord {
    MessageRecord {
        id: MessageId::generate(),
        author: author.to_string(),
        content: content.to_string(),
        submitted_at: Utc::now() - Duration::seconds(offset_secs),
        likes: Vec::new(),
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("pulsefeed_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("feed.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn stores_and_fetches_user_record() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let record = UserRecord::new("alice@example.com");
    storage.insert_user(&record).await.expect("insert");

    let fetched = storage
        .fetch_user("alice@example.com")
        .await
        .expect("fetch")
        .expect("record exists");
    assert_eq!(fetched, record);

    let missing = storage.fetch_user("bob@example.com").await.expect("fetch");
    assert!(missing.is_none());
}

#[tokio::test]
async fn update_user_is_a_full_record_replace() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut record = UserRecord::new("alice@example.com");
    record.following.push("bob@example.com".to_string());
    storage.insert_user(&record).await.expect("insert");

    record.following.clear();
    record.followers.push("carol@example.com".to_string());
    assert!(storage.update_user(&record).await.expect("update"));

    let fetched = storage
        .fetch_user("alice@example.com")
        .await
        .expect("fetch")
        .expect("record exists");
    assert!(fetched.following.is_empty());
    assert_eq!(fetched.followers, vec!["carol@example.com".to_string()]);
}

#[tokio::test]
async fn update_user_reports_missing_record() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let record = UserRecord::new("ghost@example.com");
    assert!(!storage.update_user(&record).await.expect("update"));
}

#[tokio::test]
async fn lists_all_user_records() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .insert_user(&UserRecord::new("bob@example.com"))
        .await
        .expect("insert");
    storage
        .insert_user(&UserRecord::new("alice@example.com"))
        .await
        .expect("insert");

    let users = storage.list_users().await.expect("list");
    assert_eq!(users.len(), 2);
    assert_eq!(users[0].email, "alice@example.com");
    assert_eq!(users[1].email, "bob@example.com");
}

#[tokio::test]
async fn queue_roundtrip_preserves_order_and_seen_flags() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut record = NotificationQueueRecord::empty("alice@example.com");
    record.queue.push(NotificationEntry {
        source: "bob@example.com".to_string(),
        action: "liked your message".to_string(),
        created_at: Utc::now(),
        seen: false,
    });
    record.queue.push(NotificationEntry {
        source: "carol@example.com".to_string(),
        action: "added a new message".to_string(),
        created_at: Utc::now() - Duration::minutes(1),
        seen: true,
    });
    storage.insert_queue(&record).await.expect("insert");

    let fetched = storage
        .fetch_queue("alice@example.com")
        .await
        .expect("fetch")
        .expect("record exists");
    assert_eq!(fetched, record);
    assert_eq!(fetched.unseen_count(), 1);
}

#[tokio::test]
async fn lists_messages_newest_first() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let oldest = message_at("alice@example.com", "first", 30);
    let middle = message_at("bob@example.com", "second", 20);
    let newest = message_at("alice@example.com", "third", 10);
    for record in [&oldest, &middle, &newest] {
        storage.insert_message(record).await.expect("insert");
    }

    let all = storage
        .list_messages(&FeedFilter::All, 100)
        .await
        .expect("list");
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].id, newest.id);
    assert_eq!(all[2].id, oldest.id);
}

#[tokio::test]
async fn mine_filter_returns_only_author_messages() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mine = message_at("alice@example.com", "mine", 20);
    let other = message_at("bob@example.com", "not mine", 10);
    storage.insert_message(&mine).await.expect("insert");
    storage.insert_message(&other).await.expect("insert");

    let filtered = storage
        .list_messages(&FeedFilter::Mine("alice@example.com".to_string()), 100)
        .await
        .expect("list");
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, mine.id);
}

#[tokio::test]
async fn list_respects_limit() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for offset in 0..5 {
        storage
            .insert_message(&message_at("alice@example.com", "msg", offset))
            .await
            .expect("insert");
    }

    let page = storage
        .list_messages(&FeedFilter::All, 2)
        .await
        .expect("list");
    assert_eq!(page.len(), 2);
}

#[tokio::test]
async fn update_message_replaces_content_and_likes() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut record = message_at("alice@example.com", "draft", 10);
    storage.insert_message(&record).await.expect("insert");

    record.content = "edited".to_string();
    record.likes.push("bob@example.com".to_string());
    assert!(storage.update_message(&record).await.expect("update"));

    let fetched = storage
        .fetch_message(record.id)
        .await
        .expect("fetch")
        .expect("record exists");
    assert_eq!(fetched.content, "edited");
    assert_eq!(fetched.likes, vec!["bob@example.com".to_string()]);
}

#[tokio::test]
async fn remove_message_deletes_exactly_once() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let record = message_at("alice@example.com", "going away", 10);
    storage.insert_message(&record).await.expect("insert");

    assert!(storage.remove_message(record.id).await.expect("remove"));
    assert!(!storage.remove_message(record.id).await.expect("remove again"));
    assert!(storage
        .fetch_message(record.id)
        .await
        .expect("fetch")
        .is_none());
}
