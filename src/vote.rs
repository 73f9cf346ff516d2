//! Vote toggling shared by posts and comments.
//!
//! A vote state is the pair of aggregate counters plus the caller's own
//! choice. Toggling keeps the two consistent: repeating a choice undoes it,
//! switching moves one count from the old counter to the new one.

use serde::{Deserialize, Serialize};

use crate::types::{Comment, Post};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteChoice {
    #[serde(rename = "upvote")]
    Up,
    #[serde(rename = "downvote")]
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoteState {
    pub user_vote: Option<VoteChoice>,
    pub upvotes: u32,
    pub downvotes: u32,
}

impl VoteState {
    pub fn new(user_vote: Option<VoteChoice>, upvotes: u32, downvotes: u32) -> Self {
        Self {
            user_vote,
            upvotes,
            downvotes,
        }
    }

    #[must_use]
    pub fn toggle(self, vote: VoteChoice) -> Self {
        let mut next = self;

        if self.user_vote == Some(vote) {
            next.decrement(vote);
            next.user_vote = None;
        } else {
            if let Some(previous) = self.user_vote {
                next.decrement(previous);
            }
            next.increment(vote);
            next.user_vote = Some(vote);
        }

        next
    }

    fn counter_mut(&mut self, vote: VoteChoice) -> &mut u32 {
        match vote {
            VoteChoice::Up => &mut self.upvotes,
            VoteChoice::Down => &mut self.downvotes,
        }
    }

    fn increment(&mut self, vote: VoteChoice) {
        let counter = self.counter_mut(vote);
        *counter = counter.saturating_add(1);
    }

    // Saturating so a counter that drifted from the caller's vote never wraps.
    fn decrement(&mut self, vote: VoteChoice) {
        let counter = self.counter_mut(vote);
        *counter = counter.saturating_sub(1);
    }
}

pub trait Votable {
    fn id(&self) -> &str;
    fn vote_state(&self) -> VoteState;
    fn set_vote_state(&mut self, state: VoteState);
}

impl Votable for Post {
    fn id(&self) -> &str {
        &self.id
    }

    fn vote_state(&self) -> VoteState {
        VoteState::new(self.user_vote, self.upvotes, self.downvotes)
    }

    fn set_vote_state(&mut self, state: VoteState) {
        self.user_vote = state.user_vote;
        self.upvotes = state.upvotes;
        self.downvotes = state.downvotes;
    }
}

impl Votable for Comment {
    fn id(&self) -> &str {
        &self.id
    }

    fn vote_state(&self) -> VoteState {
        VoteState::new(self.user_vote, self.upvotes, self.downvotes)
    }

    fn set_vote_state(&mut self, state: VoteState) {
        self.user_vote = state.user_vote;
        self.upvotes = state.upvotes;
        self.downvotes = state.downvotes;
    }
}

/// Applies `vote` to the item with `id`. Returns false when no item matched.
pub fn toggle_in<T: Votable>(items: &mut [T], id: &str, vote: VoteChoice) -> bool {
    match items.iter_mut().find(|item| item.id() == id) {
        Some(item) => {
            let next = item.vote_state().toggle(vote);
            item.set_vote_state(next);
            true
        }
        None => false,
    }
}
