//! Voting round state machine.
//!
//! Pure state: no I/O and no timers. The session drives ticks and broadcasts.

use crate::error::RoundError;
use crate::types::*;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// No ticket selected; voting disabled
    Idle,
    TicketSelected,
    CountingDown { remaining: u32 },
    Revealed,
}

/// Outcome of a finished round
#[derive(Debug, Clone, PartialEq)]
pub struct RoundResult {
    pub ticket: Ticket,
    pub average: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct VotingRound {
    local_id: ClientId,
    scale: VotingScale,
    phase: RoundPhase,
    ticket: Option<Ticket>,
    votes: HashMap<ClientId, f64>,
    average: Option<f64>,
}

impl VotingRound {
    pub fn new(local_id: &str, scale: VotingScale) -> Self {
        Self {
            local_id: local_id.to_string(),
            scale,
            phase: RoundPhase::Idle,
            ticket: None,
            votes: HashMap::new(),
            average: None,
        }
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }

    pub fn votes(&self) -> &HashMap<ClientId, f64> {
        &self.votes
    }

    pub fn average(&self) -> Option<f64> {
        self.average
    }

    pub fn scale(&self) -> VotingScale {
        self.scale
    }

    pub fn set_scale(&mut self, scale: VotingScale) {
        self.scale = scale;
    }

    pub fn has_voted(&self) -> bool {
        self.votes.contains_key(&self.local_id)
    }

    pub fn is_counting_down(&self) -> bool {
        matches!(self.phase, RoundPhase::CountingDown { .. })
    }

    /// Make `ticket` the subject of a fresh round, discarding any votes and countdown
    pub fn select(&mut self, ticket: Ticket) {
        self.ticket = Some(ticket);
        self.votes.clear();
        self.average = None;
        self.phase = RoundPhase::TicketSelected;
    }

    /// Record our own vote; casting again overwrites it
    pub fn cast_vote(&mut self, value: f64) -> Result<(), RoundError> {
        match self.phase {
            RoundPhase::Idle => return Err(RoundError::NoTicketSelected),
            RoundPhase::CountingDown { .. } | RoundPhase::Revealed => {
                return Err(RoundError::CountdownInProgress)
            }
            RoundPhase::TicketSelected => {}
        }
        if !self.scale.accepts(value) {
            return Err(RoundError::InvalidCard(value));
        }
        self.votes.insert(self.local_id.clone(), value);
        Ok(())
    }

    /// Record a peer's vote. Accepted during the countdown too; ignored without
    /// a ticket or once revealed.
    pub fn record_remote_vote(&mut self, participant_id: &str, value: f64) -> bool {
        if matches!(self.phase, RoundPhase::Idle | RoundPhase::Revealed)
            || participant_id == self.local_id
        {
            return false;
        }
        self.votes.insert(participant_id.to_string(), value);
        true
    }

    /// Merge votes from a host snapshot without overwriting our own
    pub fn restore_votes(&mut self, votes: &HashMap<ClientId, f64>) {
        for (id, value) in votes {
            self.record_remote_vote(id, *value);
        }
    }

    pub fn start_countdown(&mut self, ticks: u32) -> Result<(), RoundError> {
        if self.ticket.is_none() {
            return Err(RoundError::NoTicketSelected);
        }
        match self.phase {
            RoundPhase::CountingDown { .. } | RoundPhase::Revealed => {
                Err(RoundError::CountdownInProgress)
            }
            _ if ticks == 0 => {
                self.reveal();
                Ok(())
            }
            _ => {
                self.phase = RoundPhase::CountingDown { remaining: ticks };
                Ok(())
            }
        }
    }

    /// Advance the countdown by one tick; reveals when it reaches zero.
    ///
    /// Returns the ticks left, or `None` when no countdown is running.
    pub fn tick(&mut self) -> Option<u32> {
        let RoundPhase::CountingDown { remaining } = self.phase else {
            return None;
        };
        let remaining = remaining.saturating_sub(1);
        if remaining == 0 {
            self.reveal();
        } else {
            self.phase = RoundPhase::CountingDown { remaining };
        }
        Some(remaining)
    }

    fn reveal(&mut self) {
        self.average = average(self.votes.values().copied());
        self.phase = RoundPhase::Revealed;
    }

    /// Close a revealed round: the ticket gets the average as its story point,
    /// votes are cleared and the round goes back to `Idle`.
    pub fn finish(&mut self) -> Option<RoundResult> {
        if self.phase != RoundPhase::Revealed {
            return None;
        }
        let average = self.average.take();
        let mut ticket = self.ticket.take()?;
        if average.is_some() {
            ticket.story_point = average;
        }
        self.votes.clear();
        self.phase = RoundPhase::Idle;
        Some(RoundResult { ticket, average })
    }

    /// Clear votes and countdown, keeping the ticket if there is one
    pub fn reset(&mut self) {
        self.votes.clear();
        self.average = None;
        self.phase = if self.ticket.is_some() {
            RoundPhase::TicketSelected
        } else {
            RoundPhase::Idle
        };
    }

    /// Forget the ticket too
    pub fn clear(&mut self) {
        self.ticket = None;
        self.reset();
    }
}

/// Mean of the positive votes, rounded to one decimal place
pub fn average(votes: impl IntoIterator<Item = f64>) -> Option<f64> {
    let positive: Vec<f64> = votes.into_iter().filter(|v| *v > 0.0).collect();
    if positive.is_empty() {
        return None;
    }
    let mean = positive.iter().sum::<f64>() / positive.len() as f64;
    Some((mean * 10.0).round() / 10.0)
}
