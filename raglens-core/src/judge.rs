//! LLM-as-judge scoring of generated answers.
//!
//! The judge renders a fixed rubric prompt, calls the model at temperature 0,
//! and parses a strict score schema. Malformed output gets exactly one retry
//! with a stricter instruction; a second failure is surfaced as
//! [`JudgeError::Parsing`] and is never replaced by a default score.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use tracing::{debug, warn};

use crate::brain::{CompletionRequest, ModelClient};
use crate::config::JudgeConfig;
use crate::error::{JudgeError, ProviderError, RaglensError, ValidationError};
use crate::types::{CriterionScores, EvaluationScores, EvaluatorIdentity, RetrievedDocument, TokenUsage};

pub const EVALUATION_SYSTEM_PROMPT: &str = "You are an expert evaluator assessing the quality of customer support chatbot responses.

Your task is to evaluate responses across multiple dimensions considering:
1. The customer's original query
2. The retrieved context that was provided to the chatbot
3. The chatbot's generated response
4. The expected category and intent from the knowledge base

Be objective and thorough in your evaluation.";

const RUBRIC: &str = "Please evaluate the response on the following criteria (score each 0-5):

1. **Accuracy**: Is the information factually correct based on the provided context?
   - 5: Completely accurate, all facts verified against context
   - 3: Mostly accurate with minor issues
   - 0: Contains incorrect information

2. **Completeness**: Does it fully address the customer's question?
   - 5: Fully comprehensive, covers all aspects
   - 3: Addresses main points but misses some details
   - 0: Incomplete or missing key information

3. **Faithfulness**: Is the response grounded in the provided context?
   - 5: Entirely based on context, no hallucinations
   - 3: Mostly grounded with some unsupported statements
   - 0: Makes claims not supported by context

4. **Tone**: Is the tone appropriate for customer support?
   - 5: Professional, friendly, and empathetic
   - 3: Acceptable but could be warmer/more professional
   - 0: Inappropriate tone (too casual, rude, or cold)

5. **Relevance**: Is the response relevant to the query's category and intent?
   - 5: Perfect match for category/intent
   - 3: Related but may address wrong aspect
   - 0: Completely off-topic

6. **Clarity**: Is the response clear and easy to understand?
   - 5: Crystal clear, well-structured
   - 3: Understandable but could be clearer
   - 0: Confusing or poorly structured

Provide your evaluation in the following JSON format:
{
    \"scores\": {
        \"accuracy\": <0-5>,
        \"completeness\": <0-5>,
        \"faithfulness\": <0-5>,
        \"tone\": <0-5>,
        \"relevance\": <0-5>,
        \"clarity\": <0-5>
    },
    \"overall_score\": <average of above scores>,
    \"explanation\": \"<brief explanation of your scoring>\",
    \"strengths\": [\"<strength 1>\", \"<strength 2>\"],
    \"weaknesses\": [\"<weakness 1>\", \"<weakness 2>\"],
    \"suggested_improvement\": \"<optional suggestion for improvement>\"
}";

const STRICT_JSON_INSTRUCTION: &str = "IMPORTANT: Your previous reply could not be parsed. \
Return ONLY a single JSON object matching the format above. Every score must be an integer \
from 0 to 5. Do not include markdown fences, commentary, or any text outside the JSON object.";

/// One (query, context, answer) triple to score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeInput {
    pub query: String,
    pub answer: String,
    #[serde(default)]
    pub contexts: Vec<RetrievedDocument>,
    #[serde(default)]
    pub expected_category: Option<String>,
    #[serde(default)]
    pub expected_intent: Option<String>,
    /// Reference answer from a golden set, when one exists.
    #[serde(default)]
    pub reference_answer: Option<String>,
}

impl JudgeInput {
    pub fn new(query: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            answer: answer.into(),
            ..Default::default()
        }
    }

    pub fn with_contexts(mut self, contexts: Vec<RetrievedDocument>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn with_expected(mut self, category: Option<String>, intent: Option<String>) -> Self {
        self.expected_category = category;
        self.expected_intent = intent;
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference_answer = Some(reference.into());
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.query.trim().is_empty() {
            return Err(ValidationError::empty("query"));
        }
        if self.answer.trim().is_empty() {
            return Err(ValidationError::empty("answer"));
        }
        Ok(())
    }
}

/// A validated judgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub scores: EvaluationScores,
    pub explanation: Option<String>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub suggested_improvement: Option<String>,
    /// What the model claimed the overall score was. Informational only.
    pub reported_overall: Option<f64>,
    pub evaluator: EvaluatorIdentity,
    pub usage: TokenUsage,
    /// Number of model calls made, 1 or 2.
    pub attempts: u32,
}

impl JudgeVerdict {
    pub fn overall_score(&self) -> f64 {
        self.scores.overall_score().unwrap_or(0.0)
    }
}

/// Schema-checked content of a judge reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJudgement {
    pub criteria: CriterionScores,
    pub reported_overall: Option<f64>,
    pub explanation: Option<String>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub suggested_improvement: Option<String>,
}

/// Result of a single judge attempt.
#[derive(Debug, Clone)]
pub enum JudgeOutcome {
    Ok(ParsedJudgement),
    SchemaError { reason: String, raw: String },
    ProviderError(ProviderError),
}

#[derive(Deserialize)]
struct RawJudgeOutput {
    scores: serde_json::Map<String, Value>,
    #[serde(default)]
    overall_score: Option<Value>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    weaknesses: Vec<String>,
    #[serde(default)]
    suggested_improvement: Option<String>,
}

/// Strip markdown fences and surrounding prose, leaving the JSON object text.
pub fn extract_json_block(text: &str) -> &str {
    let mut text = text.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    let text = text.trim();
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

fn criterion(scores: &serde_json::Map<String, Value>, name: &str) -> Result<u8, String> {
    let value = scores
        .get(name)
        .ok_or_else(|| format!("missing score '{name}'"))?;
    let number = value
        .as_f64()
        .ok_or_else(|| format!("score '{name}' is not a number"))?;
    if number.fract() != 0.0 {
        return Err(format!("score '{name}' must be an integer, got {number}"));
    }
    if !(0.0..=f64::from(CriterionScores::MAX)).contains(&number) {
        return Err(format!("score '{name}' is outside 0-5: {number}"));
    }
    Ok(number as u8)
}

/// Parse and validate a raw judge reply against the score schema.
pub fn parse_judge_output(raw: &str) -> Result<ParsedJudgement, JudgeError> {
    let malformed = |reason: String| JudgeError::MalformedOutput {
        reason,
        raw: raw.to_string(),
    };

    let parsed: RawJudgeOutput = serde_json::from_str(extract_json_block(raw))
        .map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let criteria = CriterionScores {
        accuracy: criterion(&parsed.scores, "accuracy").map_err(malformed)?,
        completeness: criterion(&parsed.scores, "completeness").map_err(malformed)?,
        faithfulness: criterion(&parsed.scores, "faithfulness").map_err(malformed)?,
        tone: criterion(&parsed.scores, "tone").map_err(malformed)?,
        relevance: criterion(&parsed.scores, "relevance").map_err(malformed)?,
        clarity: criterion(&parsed.scores, "clarity").map_err(malformed)?,
    };

    Ok(ParsedJudgement {
        criteria,
        reported_overall: parsed.overall_score.as_ref().and_then(Value::as_f64),
        explanation: parsed.explanation,
        strengths: parsed.strengths,
        weaknesses: parsed.weaknesses,
        suggested_improvement: parsed.suggested_improvement,
    })
}

/// Render the evaluation prompt. Identical input always yields identical text.
pub fn build_evaluation_prompt(input: &JudgeInput) -> String {
    let contexts = input
        .contexts
        .iter()
        .enumerate()
        .map(|(i, ctx)| {
            let flags = ctx.flags();
            format!(
                "[Context {}] (Category: {}, Intent: {}, Flags: {}, Relevance: {:.2})\n{}",
                i + 1,
                ctx.category().unwrap_or("None"),
                ctx.intent().unwrap_or("None"),
                if flags.is_empty() { "None".to_string() } else { flags.join(",") },
                ctx.relevance_score,
                ctx.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut prompt = String::from("Evaluate the following customer support interaction:\n\n");
    let _ = write!(prompt, "CUSTOMER QUERY:\n{}\n\n", input.query);
    if contexts.is_empty() {
        prompt.push_str("RETRIEVED CONTEXT PROVIDED TO CHATBOT:\n(no context was retrieved)\n\n");
    } else {
        let _ = write!(prompt, "RETRIEVED CONTEXT PROVIDED TO CHATBOT:\n{contexts}\n\n");
    }
    let _ = write!(prompt, "CHATBOT'S RESPONSE:\n{}\n", input.answer);

    if input.expected_category.is_some() || input.expected_intent.is_some() {
        let _ = write!(
            prompt,
            "\nExpected Classification:\n- Category: {}\n- Intent: {}\n",
            input.expected_category.as_deref().unwrap_or("Not specified"),
            input.expected_intent.as_deref().unwrap_or("Not specified"),
        );
    }
    if let Some(reference) = &input.reference_answer {
        let _ = write!(
            prompt,
            "\nEXPECTED/IDEAL ANSWER (use as the reference for accuracy and completeness):\n{reference}\n"
        );
    }

    prompt.push('\n');
    prompt.push_str(RUBRIC);
    prompt
}

/// Scores answers with an LLM judge.
#[derive(Debug, Clone)]
pub struct ResponseJudge {
    client: ModelClient,
    config: JudgeConfig,
}

impl ResponseJudge {
    pub fn new(client: ModelClient, config: JudgeConfig) -> Self {
        Self { client, config }
    }

    pub fn identity(&self) -> EvaluatorIdentity {
        self.client.identity()
    }

    fn request(&self, prompt: String) -> CompletionRequest {
        CompletionRequest::prompt(Some(EVALUATION_SYSTEM_PROMPT.to_string()), prompt)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens)
    }

    /// One model call and parse, classified into a tagged outcome.
    pub async fn attempt(&self, prompt: String, usage: &mut TokenUsage) -> JudgeOutcome {
        match self.client.complete(self.request(prompt)).await {
            Err(e) => JudgeOutcome::ProviderError(e),
            Ok(response) => {
                usage.accumulate(&response.usage);
                match parse_judge_output(&response.text) {
                    Ok(parsed) => JudgeOutcome::Ok(parsed),
                    Err(JudgeError::MalformedOutput { reason, raw }) => {
                        JudgeOutcome::SchemaError { reason, raw }
                    }
                    Err(other) => JudgeOutcome::SchemaError {
                        reason: other.to_string(),
                        raw: response.text,
                    },
                }
            }
        }
    }

    /// Score a single triple.
    pub async fn evaluate(&self, input: &JudgeInput) -> Result<JudgeVerdict, RaglensError> {
        input.validate()?;
        let prompt = build_evaluation_prompt(input);
        let mut usage = TokenUsage::default();

        let (parsed, attempts) = match self.attempt(prompt.clone(), &mut usage).await {
            JudgeOutcome::Ok(parsed) => (parsed, 1),
            JudgeOutcome::ProviderError(e) => return Err(JudgeError::Provider(e).into()),
            JudgeOutcome::SchemaError { reason, .. } => {
                warn!(reason = %reason, "Malformed judge output, retrying with strict JSON instruction");
                let strict = format!("{prompt}\n\n{STRICT_JSON_INSTRUCTION}");
                match self.attempt(strict, &mut usage).await {
                    JudgeOutcome::Ok(parsed) => (parsed, 2),
                    JudgeOutcome::ProviderError(e) => return Err(JudgeError::Provider(e).into()),
                    JudgeOutcome::SchemaError { reason, raw } => {
                        return Err(JudgeError::Parsing { reason, raw }.into());
                    }
                }
            }
        };

        let scores = EvaluationScores::from_criteria(parsed.criteria);
        if let (Some(reported), Some(computed)) = (parsed.reported_overall, scores.overall_score()) {
            // The model may report on a 0-5 or 0-1 scale; compare on 0-1.
            let reported = if reported > 1.0 { reported / 5.0 } else { reported };
            if (reported - computed).abs() > 0.05 {
                debug!(reported, computed, "Judge self-reported overall score differs from computed");
            }
        }

        Ok(JudgeVerdict {
            scores,
            explanation: parsed.explanation,
            strengths: parsed.strengths,
            weaknesses: parsed.weaknesses,
            suggested_improvement: parsed.suggested_improvement,
            reported_overall: parsed.reported_overall,
            evaluator: self.identity(),
            usage,
            attempts,
        })
    }

    /// Score many triples with at most `concurrency` judge calls in flight.
    /// Results are returned in input order; one failure never affects the others.
    pub async fn evaluate_many(&self, inputs: &[JudgeInput]) -> Vec<Result<JudgeVerdict, RaglensError>> {
        let concurrency = self.config.concurrency.max(1);
        stream::iter(inputs)
            .map(|input| self.evaluate(input))
            .buffered(concurrency)
            .collect()
            .await
    }
}
