//! Vote tallies recomputed from the full vote set, joined to options by id or by text.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::Serialize;

use crate::dao::models::{OptionEntity, VoteEntity, resolve_option};

/// Which mapping of a tally is authoritative for the data it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeySpace {
    /// Every option and every counted vote carries an option id.
    Id,
    /// Some option or vote lacks an id; option text is the join key.
    #[default]
    Text,
}

/// Per-option vote counts in two parallel key spaces.
///
/// The sum of `votes_by_text` always equals `total_votes`. The sum of `votes_by_id` equals it
/// too whenever the key space is [`KeySpace::Id`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTally {
    by_id: IndexMap<String, u32>,
    by_text: IndexMap<String, u32>,
    total: u32,
    key_space: KeySpace,
}

impl VoteTally {
    /// Tally with a zero entry for every known option.
    pub fn empty(options: &[OptionEntity]) -> Self {
        let mut tally = Self::default();
        for option in options {
            if let Some(id) = &option.id {
                tally.by_id.entry(id.clone()).or_insert(0);
            }
            tally.by_text.entry(option.text.clone()).or_insert(0);
        }
        tally.key_space = if !options.is_empty() && options.iter().all(|o| o.id.is_some()) {
            KeySpace::Id
        } else {
            KeySpace::Text
        };
        tally
    }

    /// Recompute the tally from scratch. At most one vote per player is counted.
    pub fn from_votes(options: &[OptionEntity], votes: &[VoteEntity]) -> Self {
        let mut tally = Self::empty(options);
        let mut seen_players = HashSet::new();
        let mut every_vote_has_id = true;

        for vote in votes {
            if !seen_players.insert(vote.player_id.as_str()) {
                continue;
            }
            let has_id = tally.record(options, vote.option_id.as_deref(), &vote.option_text);
            every_vote_has_id &= has_id;
        }

        if !every_vote_has_id {
            tally.key_space = KeySpace::Text;
        }
        tally
    }

    /// Copy of this tally with one extra vote applied on top.
    pub fn with_vote(&self, options: &[OptionEntity], option_id: Option<&str>, option_text: &str) -> Self {
        let mut tally = self.clone();
        if !tally.record(options, option_id, option_text) {
            tally.key_space = KeySpace::Text;
        }
        tally
    }

    /// Counts keyed by option id.
    pub fn votes_by_id(&self) -> &IndexMap<String, u32> {
        &self.by_id
    }

    /// Counts keyed by option text.
    pub fn votes_by_text(&self) -> &IndexMap<String, u32> {
        &self.by_text
    }

    /// Total number of counted votes.
    pub fn total_votes(&self) -> u32 {
        self.total
    }

    /// Key space trusted for this tally.
    pub fn key_space(&self) -> KeySpace {
        self.key_space
    }

    /// Count for one option, read from the authoritative key space.
    pub fn count_for(&self, option: &OptionEntity) -> u32 {
        match (self.key_space, &option.id) {
            (KeySpace::Id, Some(id)) => self.by_id.get(id).copied().unwrap_or(0),
            _ => self.by_text.get(&option.text).copied().unwrap_or(0),
        }
    }

    /// Record one vote. Returns whether the vote landed in the id mapping.
    fn record(&mut self, options: &[OptionEntity], option_id: Option<&str>, option_text: &str) -> bool {
        let resolved = resolve_option(options, option_id, Some(option_text));
        let text_key = resolved.map_or(option_text, |o| o.text.as_str());
        *self.by_text.entry(text_key.to_string()).or_insert(0) += 1;
        self.total += 1;

        let id_key = resolved.and_then(|o| o.id.as_deref()).or(option_id);
        match id_key {
            Some(id) => {
                *self.by_id.entry(id.to_string()).or_insert(0) += 1;
                true
            }
            None => false,
        }
    }
}
