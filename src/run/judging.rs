//! Parsing judge responses: single-variant scores and pairwise verdicts.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::types::Verdict;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JudgeParseError {
    #[error("invalid judge JSON: {0}")]
    Json(String),
    #[error("missing '{0}'")]
    Missing(&'static str),
    #[error("score out of range [0,10]: {0}")]
    ScoreOutOfRange(f64),
    #[error("invalid winner: {0}")]
    InvalidWinner(String),
    #[error("judge refused")]
    Refused,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedScore {
    pub score: f64,
    pub criteria: BTreeMap<String, f64>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedVerdict {
    pub verdict: Verdict,
    pub rationale: String,
}

#[derive(Deserialize)]
struct ScoreJson {
    score: Option<f64>,
    #[serde(default)]
    criteria: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    refused: Option<bool>,
}

#[derive(Deserialize)]
struct VerdictJson {
    winner: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    refused: Option<bool>,
}

pub fn parse_eval_response(raw: &str) -> Result<ParsedScore, JudgeParseError> {
    let parsed: ScoreJson = serde_json::from_str(extract_json(raw))
        .map_err(|e| JudgeParseError::Json(e.to_string()))?;

    if parsed.refused.unwrap_or(false) {
        return Err(JudgeParseError::Refused);
    }

    let score = parsed.score.ok_or(JudgeParseError::Missing("score"))?;
    if !(0.0..=10.0).contains(&score) {
        return Err(JudgeParseError::ScoreOutOfRange(score));
    }

    // Non-numeric criterion values are dropped rather than failing the score.
    let criteria = parsed
        .criteria
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| v.as_f64().map(|s| (k, s.clamp(0.0, 10.0))))
        .collect();

    Ok(ParsedScore {
        score,
        criteria,
        rationale: parsed.rationale.unwrap_or_default(),
    })
}

pub fn parse_comparison_response(raw: &str) -> Result<ParsedVerdict, JudgeParseError> {
    let parsed: VerdictJson = serde_json::from_str(extract_json(raw))
        .map_err(|e| JudgeParseError::Json(e.to_string()))?;

    if parsed.refused.unwrap_or(false) {
        return Err(JudgeParseError::Refused);
    }

    let winner = parsed.winner.ok_or(JudgeParseError::Missing("winner"))?;
    let verdict = match winner.trim().to_lowercase().as_str() {
        "a" => Verdict::A,
        "b" => Verdict::B,
        "tie" | "draw" | "equal" => Verdict::Tie,
        _ => return Err(JudgeParseError::InvalidWinner(winner)),
    };

    Ok(ParsedVerdict {
        verdict,
        rationale: parsed.rationale.unwrap_or_default(),
    })
}

/// First balanced `{...}` object in `raw`, or `raw` trimmed if there is none.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find('{') else {
        return trimmed;
    };

    let remainder = &trimmed[start..];
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &remainder[..=i];
                }
            }
            _ => {}
        }
    }
    remainder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_score_with_criteria() {
        let raw = r#"{"score": 7.5, "criteria": {"clarity": 8, "tone": "n/a"}, "rationale": "ok"}"#;
        let parsed = parse_eval_response(raw).unwrap();
        assert_eq!(parsed.score, 7.5);
        assert_eq!(parsed.criteria.get("clarity"), Some(&8.0));
        assert!(!parsed.criteria.contains_key("tone"));
        assert_eq!(parsed.rationale, "ok");
    }

    #[test]
    fn rejects_out_of_range_score() {
        assert_eq!(
            parse_eval_response(r#"{"score": 11}"#),
            Err(JudgeParseError::ScoreOutOfRange(11.0))
        );
        assert_eq!(
            parse_eval_response(r#"{"rationale": "x"}"#),
            Err(JudgeParseError::Missing("score"))
        );
    }

    #[test]
    fn parses_verdict_surrounded_by_prose() {
        let raw = "Sure! Here is my verdict:\n```json\n{\"winner\": \"b\", \"rationale\": \"uses {braces}\"}\n```";
        let parsed = parse_comparison_response(raw).unwrap();
        assert_eq!(parsed.verdict, Verdict::B);
        assert_eq!(parsed.rationale, "uses {braces}");
    }

    #[test]
    fn parses_tie_and_rejects_garbage() {
        assert_eq!(
            parse_comparison_response(r#"{"winner": "TIE"}"#)
                .unwrap()
                .verdict,
            Verdict::Tie
        );
        assert!(matches!(
            parse_comparison_response(r#"{"winner": "C"}"#),
            Err(JudgeParseError::InvalidWinner(_))
        ));
        assert!(matches!(
            parse_comparison_response("no json here"),
            Err(JudgeParseError::Json(_))
        ));
        assert_eq!(
            parse_comparison_response(r#"{"refused": true}"#),
            Err(JudgeParseError::Refused)
        );
    }
}
