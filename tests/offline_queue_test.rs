mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{Fixture, options, poll, wait_for};
use live_activation_sync::{
    LiveSession,
    dao::{
        journal::{FileJournal, MemoryJournal, VoteJournal},
        models::PollState,
    },
    dto::VoteStatus,
    services::queue_supervisor,
};

#[tokio::test]
async fn journaled_vote_survives_a_restart_and_is_replayed_once() {
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("pending-votes.json");
    let fx = Fixture::new();
    fx.seed(&poll("poll-1", PollState::Voting)).await;

    let session = LiveSession::new(
        Arc::new(fx.store.clone()),
        Arc::new(FileJournal::new(&journal_path)),
        &fx.config,
        fx.shared_clock(),
    );
    session.attach("poll-1", "me").await.unwrap();
    wait_for(&mut session.poll().subscribe(), |v| {
        v.poll_state == PollState::Voting
    })
    .await;

    fx.store.set_offline(true);
    let receipt = session.submit_vote("opt-b").await.unwrap();
    assert_eq!(receipt.status, VoteStatus::Queued);
    assert_eq!(
        receipt.user_message(),
        "Connection issue. Vote saved, will resend."
    );
    session.detach();
    drop(session);

    let reopened: Arc<dyn VoteJournal> = Arc::new(FileJournal::new(&journal_path));
    let entries = reopened.read_all().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].vote.option_id.as_deref(), Some("opt-b"));

    fx.store.set_offline(false);
    let queue = fx.queue(reopened.clone());
    let report = queue.drain().await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(fx.vote_rows("poll-1"), 1);
    assert!(reopened.read_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn replay_after_another_path_delivered_counts_as_resolved() {
    let fx = Fixture::new();
    let journal: Arc<dyn VoteJournal> = Arc::new(MemoryJournal::new());
    let queue = fx.queue(journal.clone());
    let opts = options();

    fx.add_vote("poll-1", "me", &opts[0]).await;
    queue
        .enqueue(live_activation_sync::dao::models::VoteEntity {
            activation_id: "poll-1".into(),
            player_id: "me".into(),
            option_id: opts[0].id.clone(),
            option_text: opts[0].text.clone(),
            created_at: common::T0,
        })
        .await
        .unwrap();

    let report = queue.drain().await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(fx.vote_rows("poll-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn supervisor_delivers_once_connectivity_returns() {
    let fx = Fixture::new();
    fx.seed(&poll("poll-1", PollState::Voting)).await;
    let session = Arc::new(fx.session());
    session.attach("poll-1", "me").await.unwrap();
    let mut views = session.poll().subscribe();
    wait_for(&mut views, |v| v.poll_state == PollState::Voting).await;

    let drained = Arc::new(AtomicUsize::new(0));
    let counter = drained.clone();
    let poller = session.clone();
    let supervisor = tokio::spawn(queue_supervisor::run(session.queue(), move |report| {
        counter.fetch_add(report.resolved(), Ordering::SeqCst);
        poller.poll().refresh_now();
    }));

    fx.store.set_offline(true);
    session.submit_vote("opt-a").await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(fx.vote_rows("poll-1"), 0);

    fx.store.set_offline(false);
    let view = wait_for(&mut views, |v| v.has_voted && !v.optimistic).await;

    assert_eq!(view.total_votes, 1);
    assert_eq!(fx.vote_rows("poll-1"), 1);
    assert_eq!(drained.load(Ordering::SeqCst), 1);
    assert!(session.queue().pending().await.unwrap().is_empty());
    supervisor.abort();
}
