//! Answer correctness, point values and aggregate player stats.

use std::time::Duration;

use serde::Serialize;

use crate::{
    config::ScoringConfig,
    dao::models::{ActivationEntity, ActivationKind, PlayerEntity, PlayerStatsPatch, resolve_option},
};

/// Result of an answer, computed at submission and withheld until reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingReward {
    pub points: u32,
    pub is_correct: bool,
    pub response_time_ms: u64,
}

/// Whether `answer` is correct for `activation`.
///
/// Multiple choice answers name an option by id or text; the chosen option matches when its id or
/// its text equals `correct_answer`. Text answers compare trimmed, case-insensitive text against
/// `exact_answer`, or `correct_answer` when no exact answer is set. Other kinds never score.
pub fn is_correct(activation: &ActivationEntity, answer: &str) -> bool {
    match activation.kind {
        ActivationKind::MultipleChoice => {
            let Some(expected) = activation.correct_answer.as_deref() else {
                return false;
            };
            match resolve_option(&activation.options, Some(answer), Some(answer)) {
                Some(option) => option.id.as_deref() == Some(expected) || option.text == expected,
                None => false,
            }
        }
        ActivationKind::TextAnswer => activation
            .exact_answer
            .as_deref()
            .or(activation.correct_answer.as_deref())
            .is_some_and(|expected| normalize(expected) == normalize(answer)),
        ActivationKind::Poll | ActivationKind::Leaderboard => false,
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Window against which the speed bonus is measured.
pub fn answer_window(activation: &ActivationEntity, config: &ScoringConfig) -> Duration {
    activation
        .time_limit
        .map(|secs| Duration::from_secs(u64::from(secs)))
        .unwrap_or(config.untimed_bonus_window)
}

/// Points earned: nothing when wrong, otherwise base points plus a bonus that shrinks linearly
/// to zero over the answer window.
pub fn points_for(
    is_correct: bool,
    response_time: Duration,
    window: Duration,
    config: &ScoringConfig,
) -> u32 {
    if !is_correct {
        return 0;
    }
    let left = if window.is_zero() {
        0.0
    } else {
        1.0 - (response_time.as_secs_f64() / window.as_secs_f64()).min(1.0)
    };
    let bonus = (f64::from(config.max_speed_bonus) * left).round() as u32;
    config.base_points + bonus
}

/// Evaluate an answer into the reward it will earn at reveal.
pub fn evaluate(
    activation: &ActivationEntity,
    answer: &str,
    response_time: Duration,
    config: &ScoringConfig,
) -> PendingReward {
    let correct = is_correct(activation, answer);
    PendingReward {
        points: points_for(
            correct,
            response_time,
            answer_window(activation, config),
            config,
        ),
        is_correct: correct,
        response_time_ms: u64::try_from(response_time.as_millis()).unwrap_or(u64::MAX),
    }
}

/// New score and stats after folding one reward into a player row.
pub fn apply_reward(player: &PlayerEntity, reward: &PendingReward) -> PlayerStatsPatch {
    let total_answers = player.total_answers.saturating_add(1);
    let previous_sum = player.avg_response_time_ms * f64::from(player.total_answers);
    PlayerStatsPatch {
        score: player.score + i64::from(reward.points),
        correct_answers: player.correct_answers + u32::from(reward.is_correct),
        total_answers,
        avg_response_time_ms: (previous_sum + reward.response_time_ms as f64)
            / f64::from(total_answers),
    }
}
