//! Claim-level comparison of a generated answer against an expected answer.
//!
//! The expected answer is segmented into atomic claims locally (sentences,
//! then `;`-separated clauses). A single model call classifies every claim as
//! covered, missing or contradicted. The comparison is all-or-nothing: any
//! provider or schema failure fails the whole call.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::brain::{CompletionRequest, ModelClient};
use crate::error::{JudgeError, RaglensError, ValidationError};
use crate::judge::extract_json_block;

static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+").expect("valid list marker regex"));

const CLAIM_SYSTEM_PROMPT: &str = "You compare a chatbot answer against a reference answer, \
one factual claim at a time. You are strict about contradictions and literal about quotes.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Covered,
    Missing,
    Contradicted,
}

/// One atomic assertion from the expected answer and how the generated answer treats it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub claim: String,
    pub status: ClaimStatus,
    /// Verbatim excerpt of the generated answer supporting the status.
    #[serde(default)]
    pub generated_quote: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimComparison {
    pub claims: Vec<Claim>,
    pub covered: usize,
    pub missing: usize,
    pub contradicted: usize,
    /// Fraction of claims covered, zero when there are no claims.
    pub coverage: f64,
}

impl ClaimComparison {
    fn from_claims(claims: Vec<Claim>) -> Self {
        let count = |status| claims.iter().filter(|c| c.status == status).count();
        let covered = count(ClaimStatus::Covered);
        let missing = count(ClaimStatus::Missing);
        let contradicted = count(ClaimStatus::Contradicted);
        let coverage = if claims.is_empty() {
            0.0
        } else {
            covered as f64 / claims.len() as f64
        };
        Self {
            claims,
            covered,
            missing,
            contradicted,
            coverage,
        }
    }
}

/// Split text into non-overlapping atomic claims, in order of appearance.
pub fn segment_claims(text: &str) -> Vec<String> {
    let mut claims = Vec::new();
    for line in text.lines() {
        let line = LIST_MARKER.replace(line, "");
        for sentence in split_sentences(&line) {
            for clause in sentence.split(';') {
                let clause = clause.trim();
                if clause.chars().any(char::is_alphanumeric) {
                    claims.push(clause.to_string());
                }
            }
        }
    }
    claims
}

/// Abbreviations whose trailing period does not end a sentence.
const ABBREVIATIONS: &[&str] = &[
    "e.g.", "i.e.", "vs.", "dr.", "mr.", "mrs.", "ms.", "prof.", "st.", "no.", "approx.", "inc.", "ltd.",
    "jr.", "sr.", "dept.", "est.", "min.", "max.", "fig.",
];

/// True when the `.` at `dot` closes an abbreviation or a single-letter initial.
fn is_abbreviation(text: &str, dot: usize) -> bool {
    let word_start = text[..dot]
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map_or(0, |(i, c)| i + c.len_utf8());
    let word = text[word_start..=dot].trim_start_matches(|c: char| !c.is_alphanumeric());
    let mut letters = word.chars();
    if let (Some(initial), Some('.'), None) = (letters.next(), letters.next(), letters.next())
        && initial.is_uppercase()
    {
        return true;
    }
    ABBREVIATIONS.iter().any(|a| a.eq_ignore_ascii_case(word))
}

/// Split at `.`, `!` or `?` followed by whitespace or end of text.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?') {
            let at_boundary = match chars.peek() {
                None => true,
                Some((_, next)) => next.is_whitespace() && !(ch == '.' && is_abbreviation(text, idx)),
            };
            if at_boundary {
                let end = idx + ch.len_utf8();
                sentences.push(&text[start..end]);
                start = end;
            }
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

fn build_classification_prompt(claims: &[String], generated: &str) -> String {
    let numbered = claims
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}", i + 1, c))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "REFERENCE CLAIMS:\n{numbered}\n\nGENERATED ANSWER:\n{generated}\n\n\
For each reference claim decide whether the generated answer:\n\
- \"covered\": states the same fact (wording may differ)\n\
- \"contradicted\": states something inconsistent with the claim\n\
- \"missing\": neither supports nor contradicts it\n\n\
Respond with JSON only, one entry per claim, in the same order:\n\
{{\"claims\": [{{\"index\": 1, \"status\": \"covered|missing|contradicted\", \
\"quote\": \"<exact excerpt copied from the generated answer, or null>\", \
\"detail\": \"<one sentence explanation>\"}}]}}"
    )
}

#[derive(Deserialize)]
struct RawClassification {
    claims: Vec<RawVerdict>,
}

#[derive(Deserialize)]
struct RawVerdict {
    index: usize,
    status: ClaimStatus,
    #[serde(default)]
    quote: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Locate `quote` in `answer` and return the answer's own text for it.
fn verbatim_quote(answer: &str, quote: &str) -> Option<String> {
    let quote = quote.trim().trim_matches('"').trim();
    if quote.is_empty() {
        return None;
    }
    if answer.contains(quote) {
        return Some(quote.to_string());
    }
    find_ignoring_case(answer, quote).map(str::to_string)
}

/// Case-insensitive search that compares lowercased chars but slices the
/// haystack on its own char boundaries, since lowercasing can change byte lengths.
fn find_ignoring_case<'a>(haystack: &'a str, needle: &str) -> Option<&'a str> {
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() {
        return None;
    }
    haystack.char_indices().find_map(|(start, _)| {
        let mut matched = 0;
        for (offset, ch) in haystack[start..].char_indices() {
            for lower in ch.to_lowercase() {
                if needle.get(matched) != Some(&lower) {
                    return None;
                }
                matched += 1;
            }
            if matched == needle.len() {
                return Some(&haystack[start..start + offset + ch.len_utf8()]);
            }
        }
        None
    })
}

fn parse_classification(raw: &str, claims: &[String], generated: &str) -> Result<Vec<Claim>, JudgeError> {
    let malformed = |reason: String| JudgeError::MalformedOutput {
        reason,
        raw: raw.to_string(),
    };
    let parsed: RawClassification = serde_json::from_str(extract_json_block(raw))
        .map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let mut verdicts: Vec<Option<RawVerdict>> = claims.iter().map(|_| None).collect();
    for verdict in parsed.claims {
        let slot = verdict
            .index
            .checked_sub(1)
            .and_then(|i| verdicts.get_mut(i))
            .ok_or_else(|| malformed(format!("claim index {} out of range", verdict.index)))?;
        if slot.is_some() {
            return Err(malformed(format!("duplicate verdict for claim {}", verdict.index)));
        }
        *slot = Some(verdict);
    }

    claims
        .iter()
        .zip(verdicts)
        .enumerate()
        .map(|(i, (claim, verdict))| {
            let verdict = verdict.ok_or_else(|| malformed(format!("no verdict for claim {}", i + 1)))?;
            let generated_quote = match verdict.status {
                ClaimStatus::Missing => None,
                _ => verdict.quote.as_deref().and_then(|q| verbatim_quote(generated, q)),
            };
            Ok(Claim {
                claim: claim.clone(),
                status: verdict.status,
                generated_quote,
                detail: verdict.detail.unwrap_or_default(),
            })
        })
        .collect()
}

/// Explains divergence between an expected and a generated answer claim by claim.
#[derive(Debug, Clone)]
pub struct ClaimComparator {
    client: ModelClient,
    max_tokens: usize,
}

impl ClaimComparator {
    pub fn new(client: ModelClient) -> Self {
        Self {
            client,
            max_tokens: 2000,
        }
    }

    pub async fn compare(&self, expected: &str, generated: &str) -> Result<ClaimComparison, RaglensError> {
        if expected.trim().is_empty() {
            return Err(ValidationError::empty("expected_answer").into());
        }
        let claims = segment_claims(expected);
        if claims.is_empty() {
            return Err(ValidationError::invalid("expected_answer", "contains no claims").into());
        }

        if generated.trim().is_empty() {
            let claims = claims
                .into_iter()
                .map(|claim| Claim {
                    claim,
                    status: ClaimStatus::Missing,
                    generated_quote: None,
                    detail: "The generated answer is empty.".to_string(),
                })
                .collect();
            return Ok(ClaimComparison::from_claims(claims));
        }

        let prompt = build_classification_prompt(&claims, generated);
        debug!(claims = claims.len(), "Classifying claims");

        let first = self.classify(prompt.clone()).await?;
        let classified = match parse_classification(&first, &claims, generated) {
            Ok(classified) => classified,
            Err(e) => {
                warn!(error = %e, "Malformed claim classification, retrying once");
                let strict = format!(
                    "{prompt}\n\nIMPORTANT: Return ONLY the JSON object, with exactly {} entries.",
                    claims.len()
                );
                let second = self.classify(strict).await?;
                parse_classification(&second, &claims, generated).map_err(|e| match e {
                    JudgeError::MalformedOutput { reason, raw } => JudgeError::Parsing { reason, raw },
                    other => other,
                })?
            }
        };

        Ok(ClaimComparison::from_claims(classified))
    }

    async fn classify(&self, prompt: String) -> Result<String, RaglensError> {
        let request = CompletionRequest::prompt(Some(CLAIM_SYSTEM_PROMPT.to_string()), prompt)
            .with_temperature(0.0)
            .with_max_tokens(self.max_tokens);
        let response = self
            .client
            .complete(request)
            .await
            .map_err(JudgeError::Provider)?;
        Ok(response.text)
    }
}
