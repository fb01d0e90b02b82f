use feed_api::{
    bootstrap_session, delete_message, edit_message, follow_toggle, like_toggle, post_message,
    reconcile_follow_links, ApiContext, DEFAULT_QUEUE_CAP,
};
use realtime::{user_channel, SignalHub, FEED_CHANNEL};
use shared::domain::{FeedFilter, FollowOutcome, LikeOutcome};
use storage::Storage;

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob.builder@example.com";

#[tokio::test]
async fn follow_post_like_edit_delete_acceptance() {
    let ctx = ApiContext {
        storage: Storage::new("sqlite::memory:").await.expect("db"),
        signals: SignalHub::new(64),
        queue_cap: DEFAULT_QUEUE_CAP,
    };

    bootstrap_session(&ctx, ALICE).await.expect("alice session");
    let mut bob = bootstrap_session(&ctx, BOB).await.expect("bob session");

    let outcome = follow_toggle(&ctx, &mut bob, ALICE).await.expect("follow");
    assert_eq!(outcome, FollowOutcome::Followed);

    // Alice's session starts after the follow, so her snapshot sees Bob.
    let alice = bootstrap_session(&ctx, ALICE).await.expect("alice session");
    assert_eq!(alice.user.followers, vec![BOB.to_string()]);

    let mut signals = ctx.signals.subscribe();

    let posted = post_message(&ctx, &alice, "hello, feed").await.expect("post");
    assert_eq!(signals.recv().await.expect("signal").channel, FEED_CHANNEL);
    assert_eq!(
        signals.recv().await.expect("signal").channel,
        user_channel(BOB)
    );

    let bob_queue = ctx
        .storage
        .fetch_queue(BOB)
        .await
        .expect("fetch")
        .expect("queue");
    assert_eq!(bob_queue.queue.len(), 1);
    assert_eq!(bob_queue.queue[0].source, ALICE);

    let (outcome, _) = like_toggle(&ctx, &bob, posted.id).await.expect("like");
    assert_eq!(outcome, LikeOutcome::Liked);
    assert_eq!(
        signals.recv().await.expect("signal").channel,
        user_channel(ALICE)
    );

    let (outcome, unliked) = like_toggle(&ctx, &bob, posted.id).await.expect("unlike");
    assert_eq!(outcome, LikeOutcome::Unliked);
    assert!(unliked.likes.is_empty());

    let edited = edit_message(&ctx, &alice, posted.id, "hello, edited feed")
        .await
        .expect("edit");
    assert_eq!(edited.content, "hello, edited feed");
    assert_eq!(signals.recv().await.expect("signal").channel, FEED_CHANNEL);

    delete_message(&ctx, &alice, posted.id).await.expect("delete");
    assert_eq!(signals.recv().await.expect("signal").channel, FEED_CHANNEL);

    let feed = ctx
        .storage
        .list_messages(&FeedFilter::All, 100)
        .await
        .expect("list");
    assert!(feed.is_empty());

    // The unlike published nothing, so the graph-consistency check should
    // see a fully symmetric graph with nothing left to repair.
    let repaired = reconcile_follow_links(&ctx, BOB).await.expect("reconcile");
    assert_eq!(repaired, 0);
}
