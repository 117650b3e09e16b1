//! PairwiseTournament: all-pairs round robin between one document's candidates.
//!
//! Pairs are `(i, j)` with `i < j` in generation order, the earlier candidate
//! always shown as "A". Comparisons run concurrently through the API gate but
//! are tallied in pair order once all have resolved, so the outcome does not
//! depend on completion order. Win = 1 point, tie = ½ point each. Ranking is
//! by points, ties broken by generation order. Failed or unparseable
//! comparisons are recorded and excluded.

use std::cmp::Ordering;

use futures::stream::{self, StreamExt};

use crate::gateway::CallKind;
use crate::prompts::COMPARE_V1;

use super::gate::GatedCallError;
use super::judging::parse_comparison_response;
use super::types::{ComparisonRecord, PairwiseOutcome, Tally, Verdict};
use super::DocumentScope;

/// Something that can enter a tournament: a variant, or a combined output.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub id: &'a str,
    pub content: &'a str,
}

#[derive(Debug, thiserror::Error)]
pub enum TournamentError {
    #[error("tournament needs at least 2 candidates, got {0}")]
    TooFewCandidates(usize),
    #[error("tournament cancelled")]
    Cancelled,
    #[error("all {attempted} comparisons failed; last error: {last_error}")]
    NoSuccessfulComparisons {
        attempted: usize,
        last_error: String,
        /// Spend on the failed comparisons, still billed to the document.
        cost_nanodollars: i64,
    },
}

/// Round-robin pairing over `n` candidates in lexicographic index order.
pub fn round_robin_pairs(n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
        .collect()
}

/// Tallies in candidate order. Records naming unknown candidates are ignored.
pub fn tally(candidate_ids: &[&str], records: &[ComparisonRecord]) -> Vec<Tally> {
    let mut tallies: Vec<Tally> = candidate_ids
        .iter()
        .map(|id| Tally {
            candidate_id: id.to_string(),
            wins: 0,
            losses: 0,
            ties: 0,
            points: 0.0,
        })
        .collect();

    let index_of = |id: &str| candidate_ids.iter().position(|c| *c == id);

    for record in records {
        let (Some(a), Some(b), Some(verdict)) = (
            index_of(&record.candidate_a),
            index_of(&record.candidate_b),
            record.verdict,
        ) else {
            continue;
        };
        let (winner, loser) = match verdict {
            Verdict::A => (a, b),
            Verdict::B => (b, a),
            Verdict::Tie => {
                for idx in [a, b] {
                    tallies[idx].ties += 1;
                    tallies[idx].points += 0.5;
                }
                continue;
            }
        };
        tallies[winner].wins += 1;
        tallies[winner].points += 1.0;
        tallies[loser].losses += 1;
    }

    tallies
}

/// Order tallies by points, keeping candidate order among equals.
pub fn rank(tallies: Vec<Tally>) -> Vec<Tally> {
    let mut ranked = tallies;
    // sort_by is stable, which keeps generation order for equal points.
    ranked.sort_by(|x, y| {
        y.points
            .partial_cmp(&x.points)
            .unwrap_or(Ordering::Equal)
    });
    ranked
}

pub struct PairwiseTournament<'a> {
    scope: DocumentScope<'a>,
}

impl<'a> PairwiseTournament<'a> {
    pub fn new(scope: DocumentScope<'a>) -> Self {
        Self { scope }
    }

    /// Run every comparison, calling `on_comparison` as each one resolves.
    pub async fn run<F>(
        &self,
        candidates: &[Candidate<'_>],
        mut on_comparison: F,
    ) -> Result<PairwiseOutcome, TournamentError>
    where
        F: FnMut(&ComparisonRecord),
    {
        if candidates.len() < 2 {
            return Err(TournamentError::TooFewCandidates(candidates.len()));
        }

        let pairs = round_robin_pairs(candidates.len());
        let mut slots: Vec<Option<ComparisonRecord>> = vec![None; pairs.len()];
        let mut cancelled = false;

        let comparisons: Vec<_> = pairs
            .iter()
            .enumerate()
            .map(|(idx, &(i, j))| {
                let (a, b) = (candidates[i], candidates[j]);
                async move { (idx, self.compare(a, b).await) }
            })
            .collect();
        let mut results = stream::iter(comparisons).buffer_unordered(pairs.len());
        while let Some((idx, record)) = results.next().await {
            match record {
                Some(record) => {
                    on_comparison(&record);
                    slots[idx] = Some(record);
                }
                None => cancelled = true,
            }
        }
        drop(results);

        if cancelled {
            return Err(TournamentError::Cancelled);
        }

        let comparisons: Vec<ComparisonRecord> = slots.into_iter().flatten().collect();
        let attempted = comparisons.len();
        let failed = comparisons.iter().filter(|r| !r.succeeded()).count();
        let cost_nanodollars = comparisons.iter().map(|r| r.cost_nanodollars).sum();

        if failed == attempted {
            let last_error = comparisons
                .iter()
                .rev()
                .find_map(|r| r.error.clone())
                .unwrap_or_else(|| "no comparisons".to_string());
            return Err(TournamentError::NoSuccessfulComparisons {
                attempted,
                last_error,
                cost_nanodollars,
            });
        }

        let ids: Vec<&str> = candidates.iter().map(|c| c.id).collect();
        let tallies = rank(tally(&ids, &comparisons));
        let ranking: Vec<String> = tallies.iter().map(|t| t.candidate_id.clone()).collect();
        let winner_id = ranking[0].clone();

        Ok(PairwiseOutcome {
            ranking,
            tallies,
            winner_id,
            comparisons,
            attempted,
            failed,
            cost_nanodollars,
        })
    }

    /// One gated comparison. `None` means cancellation was observed before the call.
    async fn compare(&self, a: Candidate<'_>, b: Candidate<'_>) -> Option<ComparisonRecord> {
        let settings = self.scope.settings;
        let prompt = COMPARE_V1.render(&[
            ("criteria", settings.evaluation_criteria.as_str()),
            ("document", self.scope.document.content.as_str()),
            ("candidate_a", a.content),
            ("candidate_b", b.content),
        ]);
        let req = self
            .scope
            .request(CallKind::Compare, &settings.judge_model, prompt.to_messages())
            .max_tokens(settings.max_eval_tokens)
            .json();

        let mut record = ComparisonRecord {
            candidate_a: a.id.to_string(),
            candidate_b: b.id.to_string(),
            verdict: None,
            rationale: String::new(),
            error: None,
            cost_nanodollars: 0,
        };

        match self.scope.gate.call(req).await {
            Err(GatedCallError::Cancelled) => return None,
            Err(GatedCallError::Provider(e)) => record.error = Some(e.to_string()),
            Ok(resp) => {
                record.cost_nanodollars = resp.cost_nanodollars;
                match parse_comparison_response(&resp.content) {
                    Ok(parsed) => {
                        record.verdict = Some(parsed.verdict);
                        record.rationale = parsed.rationale;
                    }
                    Err(e) => record.error = Some(format!("unparseable verdict: {e}")),
                }
            }
        }
        Some(record)
    }
}
