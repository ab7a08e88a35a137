mod common;

use std::time::Duration;

use common::{Fixture, T0, question, wait_for};
use live_activation_sync::{error::AnswerError, state::TimerPhase};
use tokio::time::{sleep, timeout};

#[tokio::test(start_paused = true)]
async fn reward_is_withheld_until_the_window_closes() {
    let fx = Fixture::new();
    fx.seed(&question("q1", Some(10))).await;
    let session = fx.session();
    session.attach("q1", "p1").await.unwrap();
    let mut reveals = session.scoring().subscribe();
    let mut timers = session.reveal().subscribe();

    assert!(session.can_reveal_results());
    assert_eq!(
        session.reveal().view().unwrap().phase,
        TimerPhase::WaitingToStart
    );

    fx.start_timer("q1", T0).await;
    wait_for(&mut timers, |v| {
        v.as_ref().is_some_and(|v| v.phase == TimerPhase::Running)
    })
    .await;
    assert!(!session.can_reveal_results());

    sleep(Duration::from_secs(3)).await;
    fx.clock.advance(Duration::from_secs(3));
    let receipt = session.submit_answer("opt-a").await.unwrap();
    assert!(receipt.is_pending());
    let pending = session.scoring().pending_reward().unwrap();
    assert!(pending.is_correct);
    assert_eq!(pending.points, 135);
    assert!(fx.player("p1").is_none());

    fx.clock.advance(Duration::from_secs(8));
    let event = timeout(Duration::from_secs(30), reveals.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.points, 135);
    assert!(event.persisted);
    assert_eq!(event.total_score, Some(135));

    assert!(session.can_reveal_results());
    assert!(session.reveal().view().unwrap().has_expired);
    assert!(session.scoring().pending_reward().is_none());

    let player = fx.player("p1").unwrap();
    assert_eq!(player.score, 135);
    assert_eq!(player.correct_answers, 1);
    assert_eq!(player.total_answers, 1);
    assert_eq!(player.avg_response_time_ms, 3_000.0);

    // nothing is revealed or persisted a second time
    session.can_reveal_results();
    assert!(
        timeout(Duration::from_secs(30), reveals.recv())
            .await
            .is_err()
    );
    assert_eq!(fx.player("p1").unwrap().score, 135);
}

#[tokio::test(start_paused = true)]
async fn server_time_expires_a_stalled_countdown() {
    let fx = Fixture::new();
    let mut q = question("q1", Some(10));
    q.timer_started_at = Some(T0);
    fx.seed(&q).await;
    let session = fx.session();
    session.attach("q1", "p1").await.unwrap();
    let mut reveals = session.scoring().subscribe();

    session.submit_answer("opt-b").await.unwrap();
    assert!(!session.can_reveal_results());

    // local ticks never ran, only the wall clock moved
    fx.clock.advance(Duration::from_secs(11));
    assert!(session.can_reveal_results());
    let view = session.reveal().view().unwrap();
    assert!(view.has_expired);
    assert_eq!(view.phase, TimerPhase::Expired);

    let event = timeout(Duration::from_secs(1), reveals.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!event.is_correct);
    assert_eq!(event.points, 0);
    assert_eq!(fx.player("p1").unwrap().total_answers, 1);
}

#[tokio::test(start_paused = true)]
async fn expiry_is_monotonic_and_reveal_is_stable() {
    let fx = Fixture::new();
    let mut q = question("q1", Some(5));
    q.timer_started_at = Some(T0);
    fx.seed(&q).await;
    let session = fx.session();
    session.attach("q1", "p1").await.unwrap();
    let mut timers = session.reveal().subscribe();

    wait_for(&mut timers, |v| v.as_ref().is_some_and(|v| v.has_expired)).await;
    for _ in 0..5 {
        assert!(session.can_reveal_results());
    }

    session.reveal().observe_start(None);
    session.reveal().observe_start(Some(T0 + Duration::from_secs(60)));
    fx.patch_activation("q1", serde_json::json!({ "timer_started_at": null }))
        .await;
    sleep(Duration::from_secs(10)).await;

    let view = session.reveal().view().unwrap();
    assert!(view.has_expired);
    assert_eq!(view.time_remaining_secs, 0);
    assert!(session.can_reveal_results());
}

#[tokio::test(start_paused = true)]
async fn untimed_question_reveals_on_submit() {
    let fx = Fixture::new();
    fx.seed(&question("q1", None)).await;
    let session = fx.session();
    session.attach("q1", "p1").await.unwrap();
    let mut reveals = session.scoring().subscribe();

    fx.clock.advance(Duration::from_secs(15));
    let receipt = session.submit_answer("A").await.unwrap();
    let reward = receipt.reward.unwrap();
    assert!(reward.is_correct);
    assert_eq!(reward.points, 125);

    let event = reveals.recv().await.unwrap();
    assert_eq!(event.total_score, Some(125));
    assert_eq!(fx.player("p1").unwrap().score, 125);
}

#[tokio::test(start_paused = true)]
async fn failed_write_back_still_reveals_once() {
    let fx = Fixture::new();
    let mut q = question("q1", Some(10));
    q.timer_started_at = Some(T0);
    fx.seed(&q).await;
    let session = fx.session();
    session.attach("q1", "p1").await.unwrap();
    let mut reveals = session.scoring().subscribe();
    session.submit_answer("opt-a").await.unwrap();

    fx.store.set_offline(true);
    fx.clock.advance(Duration::from_secs(10));
    session.can_reveal_results();

    let event = timeout(Duration::from_secs(30), reveals.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!event.persisted);
    assert_eq!(event.total_score, None);
    assert_eq!(event.points, 150);

    fx.store.set_offline(false);
    sleep(Duration::from_secs(5)).await;
    assert!(fx.player("p1").is_none());
}

#[tokio::test(start_paused = true)]
async fn answers_are_validated_and_only_taken_once() {
    let fx = Fixture::new();
    fx.seed(&question("q1", None)).await;
    let session = fx.session();

    assert!(matches!(
        session.submit_answer("opt-a").await,
        Err(AnswerError::NotAttached)
    ));
    session.attach("q1", "p1").await.unwrap();
    assert!(matches!(
        session.submit_answer("   ").await,
        Err(AnswerError::EmptyAnswer)
    ));
    assert!(matches!(
        session.submit_answer("opt-z").await,
        Err(AnswerError::InvalidOption(_))
    ));

    session.submit_answer("opt-b").await.unwrap();
    let err = session.submit_answer("opt-a").await.unwrap_err();
    assert!(matches!(err, AnswerError::AlreadyAnswered));

    // a second device of the same player hits the store's uniqueness constraint
    let other = fx.session();
    other.attach("q1", "p1").await.unwrap();
    assert!(matches!(
        other.submit_answer("opt-a").await,
        Err(AnswerError::AlreadyAnswered)
    ));
    assert_eq!(fx.player("p1").unwrap().total_answers, 1);
}

#[tokio::test(start_paused = true)]
async fn reattach_drops_the_previous_countdown() {
    let fx = Fixture::new();
    let mut timed = question("q1", Some(5));
    timed.timer_started_at = Some(T0);
    fx.seed(&timed).await;
    fx.seed(&question("q2", None)).await;
    let session = fx.session();
    session.attach("q1", "p1").await.unwrap();
    assert_eq!(session.reveal().view().unwrap().phase, TimerPhase::Running);

    session.attach("q2", "p1").await.unwrap();
    sleep(Duration::from_secs(10)).await;

    let view = session.reveal().view().unwrap();
    assert_eq!(view.activation_id, "q2");
    assert_eq!(view.phase, TimerPhase::NoTimer);
    assert!(!view.has_expired);

    session.detach();
    assert!(session.reveal().view().is_none());
    assert!(session.can_reveal_results());
}

#[tokio::test(start_paused = true)]
async fn missing_activation_is_reported() {
    let fx = Fixture::new();
    let session = fx.session();
    let err = session.attach("nope", "p1").await.unwrap_err();
    assert_eq!(err.user_message(), "This question is no longer available.");
    assert!(session.attach("", "p1").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn withheld_reward_is_settled_when_the_activation_changes() {
    let fx = Fixture::new();
    let mut timed = question("q1", Some(10));
    timed.timer_started_at = Some(T0);
    fx.seed(&timed).await;
    fx.seed(&question("q2", Some(10))).await;
    let session = fx.session();
    session.attach("q1", "p1").await.unwrap();
    let mut reveals = session.scoring().subscribe();

    fx.clock.advance(Duration::from_secs(3));
    let receipt = session.submit_answer("opt-a").await.unwrap();
    assert!(receipt.is_pending());
    assert!(session.scoring().has_answered());

    session.attach("q2", "p1").await.unwrap();
    assert_eq!(session.activation().unwrap().id, "q2");

    let event = timeout(Duration::from_secs(5), reveals.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.activation_id, "q1");
    assert_eq!(event.points, 135);
    assert!(event.persisted);
    let player = fx.player("p1").unwrap();
    assert_eq!(player.score, 135);
    assert_eq!(player.correct_answers, 1);

    assert!(session.scoring().pending_reward().is_none());
    assert!(!session.scoring().has_answered());
    assert!(
        timeout(Duration::from_secs(30), reveals.recv())
            .await
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn abandoned_answer_does_not_block_the_next_one() {
    let mut fx = Fixture::new();
    fx.config.retry.attempts = 5;
    fx.config.retry.base_delay = Duration::from_secs(1);
    fx.seed(&question("q1", None)).await;
    let session = fx.session();
    session.attach("q1", "p1").await.unwrap();

    fx.store.set_offline(true);
    let abandoned = timeout(Duration::from_millis(1), session.submit_answer("opt-a")).await;
    assert!(abandoned.is_err());
    assert!(!session.scoring().has_answered());
    fx.store.set_offline(false);

    let receipt = session.submit_answer("opt-a").await.unwrap();
    assert!(!receipt.is_pending());
    assert!(session.scoring().has_answered());
    assert_eq!(fx.player("p1").unwrap().total_answers, 1);
}
