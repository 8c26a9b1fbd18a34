//! Eight-slot single-elimination bracket

use serde::Serialize;
use thiserror::Error;

/// Matches per round: quarter-finals, semi-finals, final
pub const ROUND_SIZES: [usize; 3] = [4, 2, 1];
/// Entrants a bracket can seat
pub const BRACKET_SLOTS: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BracketError {
    #[error("Round {round} has no match {index}")]
    NoSuchMatch { round: usize, index: usize },

    #[error("Player {0} is not an entrant of that match")]
    NotInMatch(u32),

    #[error("Match already has a winner")]
    AlreadyDecided,

    #[error("Tournament is already finished")]
    Finished,

    #[error("Bracket seats 8 players, got {0}")]
    TooManyEntrants(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BracketMatch {
    pub a: Option<u32>,
    pub b: Option<u32>,
    pub winner: Option<u32>,
}

impl BracketMatch {
    fn entrants(&self) -> usize {
        usize::from(self.a.is_some()) + usize::from(self.b.is_some())
    }

    /// Both entrants present, no winner yet
    pub fn is_playable(&self) -> bool {
        self.entrants() == 2 && self.winner.is_none()
    }

    /// Decided, or empty and therefore never played
    fn is_complete(&self) -> bool {
        self.winner.is_some() || self.entrants() == 0
    }

    pub fn has(&self, player: u32) -> bool {
        self.a == Some(player) || self.b == Some(player)
    }

    /// The entrant that is not `player`
    pub fn opponent_of(&self, player: u32) -> Option<u32> {
        if self.a == Some(player) {
            self.b
        } else if self.b == Some(player) {
            self.a
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentBracket {
    rounds: Vec<Vec<BracketMatch>>,
    current_round: usize,
}

impl Default for TournamentBracket {
    fn default() -> Self {
        Self {
            rounds: ROUND_SIZES
                .iter()
                .map(|size| vec![BracketMatch::default(); *size])
                .collect(),
            current_round: 0,
        }
    }
}

impl TournamentBracket {
    /// Seat `players` in order: match i gets players 2i and 2i+1.
    /// Byes resolve immediately.
    pub fn seed(players: &[u32]) -> Result<Self, BracketError> {
        if players.len() > BRACKET_SLOTS {
            return Err(BracketError::TooManyEntrants(players.len()));
        }

        let mut bracket = Self::default();
        for (index, pair) in players.chunks(2).enumerate() {
            let m = &mut bracket.rounds[0][index];
            m.a = pair.first().copied();
            m.b = pair.get(1).copied();
        }
        bracket.settle();
        Ok(bracket)
    }

    #[cfg(test)]
    pub fn rounds(&self) -> &[Vec<BracketMatch>] {
        &self.rounds
    }

    #[cfg(test)]
    pub fn current_round(&self) -> usize {
        self.current_round
    }

    pub fn is_finished(&self) -> bool {
        self.current_round >= self.rounds.len()
    }

    pub fn champion(&self) -> Option<u32> {
        self.rounds.last().and_then(|r| r.first()).and_then(|m| m.winner)
    }

    /// Next match to play in the current round
    pub fn current_match(&self) -> Option<(usize, &BracketMatch)> {
        self.rounds
            .get(self.current_round)?
            .iter()
            .enumerate()
            .find(|(_, m)| m.is_playable())
    }

    /// Record `winner` for match `match_index` of the current round and feed
    /// them into the next round.
    pub fn advance(&mut self, match_index: usize, winner: u32) -> Result<(), BracketError> {
        if self.is_finished() {
            return Err(BracketError::Finished);
        }
        let round = self.current_round;
        let m = self.rounds[round]
            .get_mut(match_index)
            .ok_or(BracketError::NoSuchMatch {
                round,
                index: match_index,
            })?;
        if m.winner.is_some() {
            return Err(BracketError::AlreadyDecided);
        }
        if !m.has(winner) {
            return Err(BracketError::NotInMatch(winner));
        }

        m.winner = Some(winner);
        self.promote(round, match_index, winner);
        self.settle();
        Ok(())
    }

    fn promote(&mut self, round: usize, match_index: usize, winner: u32) {
        let Some(next_round) = self.rounds.get_mut(round + 1) else {
            return;
        };
        let next = &mut next_round[match_index / 2];
        if match_index % 2 == 0 {
            next.a = Some(winner);
        } else {
            next.b = Some(winner);
        }
    }

    /// Resolve byes in the current round and move the pointer past every
    /// round that is complete.
    fn settle(&mut self) {
        while let Some(round) = self.rounds.get(self.current_round) {
            let byes: Vec<(usize, u32)> = round
                .iter()
                .enumerate()
                .filter(|(_, m)| m.winner.is_none() && m.entrants() == 1)
                .filter_map(|(i, m)| m.a.or(m.b).map(|p| (i, p)))
                .collect();

            let current = self.current_round;
            for (index, player) in byes {
                self.rounds[current][index].winner = Some(player);
                self.promote(current, index, player);
            }

            if self.rounds[current].iter().all(BracketMatch::is_complete) {
                self.current_round += 1;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_bracket() -> TournamentBracket {
        TournamentBracket::seed(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap()
    }

    #[test]
    fn test_round_zero_fills_round_one() {
        let mut bracket = full_bracket();
        for (index, winner) in [(0, 1), (1, 4), (2, 5), (3, 8)] {
            assert_eq!(bracket.current_round(), 0);
            bracket.advance(index, winner).unwrap();
        }

        let semis = &bracket.rounds()[1];
        assert_eq!((semis[0].a, semis[0].b), (Some(1), Some(4)));
        assert_eq!((semis[1].a, semis[1].b), (Some(5), Some(8)));
        assert_eq!(bracket.current_round(), 1);
        assert!(!bracket.is_finished());
    }

    #[test]
    fn test_finishes_with_final() {
        let mut bracket = full_bracket();
        for (index, winner) in [(0, 2), (1, 3), (2, 6), (3, 7)] {
            bracket.advance(index, winner).unwrap();
        }
        bracket.advance(0, 2).unwrap();
        bracket.advance(1, 7).unwrap();
        assert!(!bracket.is_finished());
        assert_eq!(bracket.current_match().map(|(i, _)| i), Some(0));

        bracket.advance(0, 7).unwrap();
        assert!(bracket.is_finished());
        assert_eq!(bracket.champion(), Some(7));
        assert_eq!(bracket.advance(0, 7), Err(BracketError::Finished));
    }

    #[test]
    fn test_rejects_invalid_advance() {
        let mut bracket = full_bracket();
        assert_eq!(bracket.advance(0, 3), Err(BracketError::NotInMatch(3)));
        assert_eq!(
            bracket.advance(9, 1),
            Err(BracketError::NoSuchMatch { round: 0, index: 9 })
        );
        bracket.advance(0, 1).unwrap();
        assert_eq!(bracket.advance(0, 2), Err(BracketError::AlreadyDecided));
        assert!(TournamentBracket::seed(&[0; 9]).is_err());
    }

    #[test]
    fn test_byes_resolve_automatically() {
        let mut bracket = TournamentBracket::seed(&[10, 20, 30]).unwrap();
        // 30 has a bye, matches 2 and 3 are empty
        assert_eq!(bracket.rounds()[0][1].winner, Some(30));
        assert_eq!(bracket.current_match().map(|(i, _)| i), Some(0));

        bracket.advance(0, 20).unwrap();
        let (index, semi) = bracket.current_match().unwrap();
        assert_eq!(index, 0);
        assert_eq!((semi.a, semi.b), (Some(20), Some(30)));

        bracket.advance(0, 30).unwrap();
        assert!(bracket.is_finished());
        assert_eq!(bracket.champion(), Some(30));
    }

    #[test]
    fn test_two_player_bracket() {
        let mut bracket = TournamentBracket::seed(&[1, 2]).unwrap();
        assert_eq!(bracket.rounds()[0][0].opponent_of(1), Some(2));
        bracket.advance(0, 2).unwrap();
        assert!(bracket.is_finished());
        assert_eq!(bracket.champion(), Some(2));
    }
}
