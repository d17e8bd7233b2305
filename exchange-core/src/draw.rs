use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use thiserror::Error;

use crate::ParticipantId;

pub const DEFAULT_MAX_ATTEMPTS: usize = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("need at least 2 participants to draw, have {count}")]
    TooFewParticipants { count: usize },
    #[error("participant {0} listed more than once")]
    DuplicateParticipant(ParticipantId),
    #[error("unable to compute assignment after {attempts} attempts")]
    Exhausted { attempts: usize },
}

// giver -> receiver, in input order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pairs: Vec<(ParticipantId, ParticipantId)>,
}

impl Assignment {
    pub fn target_of(&self, giver: &str) -> Option<&ParticipantId> {
        self.pairs
            .iter()
            .find(|(from, _)| from == giver)
            .map(|(_, to)| to)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &ParticipantId)> {
        self.pairs.iter().map(|(from, to)| (from, to))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn into_pairs(self) -> Vec<(ParticipantId, ParticipantId)> {
        self.pairs
    }
}

// Rejection sampling over full shuffles; about 1/e of attempts succeed.
pub fn derangement<R: Rng + ?Sized>(
    ids: &[ParticipantId],
    rng: &mut R,
    max_attempts: usize,
) -> Result<Assignment, AssignmentError> {
    if ids.len() < 2 {
        return Err(AssignmentError::TooFewParticipants { count: ids.len() });
    }

    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id) {
            return Err(AssignmentError::DuplicateParticipant(id.clone()));
        }
    }

    let mut shuffled = ids.to_vec();
    for _ in 0..max_attempts {
        shuffled.shuffle(rng);
        if !has_fixed_point(ids, &shuffled) {
            let pairs = ids.iter().cloned().zip(shuffled).collect();
            return Ok(Assignment { pairs });
        }
    }

    Err(AssignmentError::Exhausted {
        attempts: max_attempts,
    })
}

fn has_fixed_point(original: &[ParticipantId], permuted: &[ParticipantId]) -> bool {
    original.iter().zip(permuted).any(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    fn ids(n: usize) -> Vec<ParticipantId> {
        (0..n).map(|i| format!("p{i}")).collect()
    }

    fn assert_derangement(input: &[ParticipantId], assignment: &Assignment) {
        assert_eq!(assignment.len(), input.len());
        let givers: Vec<&ParticipantId> = assignment.iter().map(|(from, _)| from).collect();
        assert_eq!(givers, input.iter().collect::<Vec<_>>());

        let targets: HashSet<&ParticipantId> = assignment.iter().map(|(_, to)| to).collect();
        let expected: HashSet<&ParticipantId> = input.iter().collect();
        assert_eq!(targets, expected, "targets must be a permutation of the roster");

        for (from, to) in assignment.iter() {
            assert_ne!(from, to, "{from} was assigned to themselves");
        }
    }

    #[test]
    fn rejects_rosters_smaller_than_two() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(
            derangement(&[], &mut rng, DEFAULT_MAX_ATTEMPTS).unwrap_err(),
            AssignmentError::TooFewParticipants { count: 0 }
        );
        assert_eq!(
            derangement(&ids(1), &mut rng, DEFAULT_MAX_ATTEMPTS).unwrap_err(),
            AssignmentError::TooFewParticipants { count: 1 }
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let roster = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(
            derangement(&roster, &mut rng, DEFAULT_MAX_ATTEMPTS).unwrap_err(),
            AssignmentError::DuplicateParticipant("a".into())
        );
    }

    #[test]
    fn two_participants_always_swap() {
        let roster = vec!["a".to_string(), "b".to_string()];
        for seed in 0..50 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let assignment = derangement(&roster, &mut rng, DEFAULT_MAX_ATTEMPTS).unwrap();
            assert_eq!(assignment.target_of("a").map(String::as_str), Some("b"));
            assert_eq!(assignment.target_of("b").map(String::as_str), Some("a"));
        }
    }

    #[test]
    fn output_is_a_derangement_for_many_sizes() {
        for n in 2..=12 {
            let roster = ids(n);
            for seed in 0..40 {
                let mut rng = ChaCha8Rng::seed_from_u64(seed * 31 + n as u64);
                let assignment = derangement(&roster, &mut rng, DEFAULT_MAX_ATTEMPTS).unwrap();
                assert_derangement(&roster, &assignment);
            }
        }
    }

    #[test]
    fn zero_attempt_cap_reports_exhaustion() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert_eq!(
            derangement(&ids(4), &mut rng, 0).unwrap_err(),
            AssignmentError::Exhausted { attempts: 0 }
        );
    }

    #[test]
    fn repeated_draws_are_not_memoized() {
        let roster = ids(6);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let distinct: HashSet<Vec<(ParticipantId, ParticipantId)>> = (0..20)
            .map(|_| {
                derangement(&roster, &mut rng, DEFAULT_MAX_ATTEMPTS)
                    .unwrap()
                    .into_pairs()
            })
            .collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn both_three_cycles_show_up_evenly() {
        // n = 3 has exactly two derangements: the two rotations.
        let roster = ids(3);
        let mut rng = ChaCha8Rng::seed_from_u64(2024);
        let mut forward = 0;
        let draws = 2000;
        for _ in 0..draws {
            let assignment = derangement(&roster, &mut rng, DEFAULT_MAX_ATTEMPTS).unwrap();
            if assignment.target_of("p0").map(String::as_str) == Some("p1") {
                forward += 1;
            }
        }
        assert!((800..=1200).contains(&forward), "forward rotations: {forward}");
    }
}
