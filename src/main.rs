//! Follower binary: attaches one player to one activation and logs every change.

use std::{env, sync::Arc};

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_activation_sync::{
    AppConfig, LiveSession, SharedClock, SystemClock,
    dao::{
        journal::FileJournal,
        rest::{RestConfig, RestStore},
    },
    services::queue_supervisor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let activation_id = env::var("ACTIVATION_ID").context("ACTIVATION_ID must be set")?;
    let player_id = env::var("PLAYER_ID").context("PLAYER_ID must be set")?;

    let store = RestStore::connect(RestConfig::from_env()?).context("building remote store")?;
    let journal = FileJournal::new(&config.journal_path);
    info!(journal = %journal.path().display(), "using offline vote journal");

    let clock: SharedClock = Arc::new(SystemClock);
    let session = Arc::new(LiveSession::new(
        Arc::new(store),
        Arc::new(journal),
        &config,
        clock,
    ));

    let activation = session
        .attach(&activation_id, &player_id)
        .await
        .map_err(|err| anyhow::anyhow!("{}: {err}", err.user_message()))?;
    info!(activation_id = %activation.id, kind = ?activation.kind, "following activation");

    let drained = session.clone();
    let supervisor = tokio::spawn(queue_supervisor::run(session.queue(), move |report| {
        info!(delivered = report.delivered, "queued votes delivered");
        drained.poll().refresh_now();
    }));

    let mut polls = session.poll().subscribe();
    let mut timers = session.reveal().subscribe();
    let mut reveals = session.scoring().subscribe();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = polls.changed() => {
                if changed.is_err() { break; }
                let view = polls.borrow_and_update().clone();
                info!(
                    state = ?view.poll_state,
                    total = view.total_votes,
                    votes = ?view.votes_by_text,
                    has_voted = view.has_voted,
                    "poll updated"
                );
            }
            changed = timers.changed() => {
                if changed.is_err() { break; }
                if let Some(view) = timers.borrow_and_update().clone() {
                    info!(
                        phase = ?view.phase,
                        remaining_secs = view.time_remaining_secs,
                        "countdown updated"
                    );
                }
            }
            event = reveals.recv() => match event {
                Ok(event) => info!(
                    points = event.points,
                    correct = event.is_correct,
                    persisted = event.persisted,
                    "reward revealed"
                ),
                Err(err) => warn!(error = %err, "reveal feed interrupted"),
            },
        }
    }

    info!("shutting down");
    supervisor.abort();
    session.detach();
    Ok(())
}

/// Configure tracing subscribers with an env-overridable filter.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,live_activation_sync=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
