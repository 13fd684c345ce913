use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::{Config, JudgeProvider};
use crate::error::EngineError;
use crate::metrics::JUDGE_FALLBACKS_TOTAL;
use crate::models::FeedbackBundle;

const JUDGE_TIMEOUT: Duration = Duration::from_secs(60);
const NEUTRAL_SCORE: f64 = 0.5;
/// A reply without a relevance sub-score is assumed fully on-topic, so the
/// low-relevance penalty only fires when the judge explicitly reports one.
pub const FULL_RELEVANCE: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct EffortJudgment {
    pub effort_score: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone)]
pub struct LogicJudgment {
    pub logic_similarity: f64,
    /// How on-topic the student code is for the problem, 0.0-1.0. Reported
    /// inside the reply's `similarity_breakdown`; defaults to full relevance.
    pub relevance: f64,
    pub notes: String,
}

/// Semantic judgments the grading pipeline cannot compute deterministically.
/// Implementations must stay within a bounded time budget; the pipeline
/// falls back to heuristics when a call errors.
#[async_trait]
pub trait JudgmentBackend: Send + Sync {
    async fn assess_effort(&self, question: &str, code: &str)
        -> Result<EffortJudgment, EngineError>;

    async fn assess_logic(
        &self,
        question: &str,
        ideal_solution: &str,
        code: &str,
    ) -> Result<LogicJudgment, EngineError>;

    async fn compose_feedback(
        &self,
        question: &str,
        code: &str,
        result_summary: &str,
    ) -> Result<FeedbackBundle, EngineError>;
}

enum ProviderClient {
    Ollama { url: String, model: String },
    OpenAi { api_key: String, model: String },
    Anthropic { api_key: String, model: String },
    Gemini { api_key: String, model: String },
}

impl ProviderClient {
    fn name(&self) -> &'static str {
        match self {
            ProviderClient::Ollama { .. } => "ollama",
            ProviderClient::OpenAi { .. } => "openai",
            ProviderClient::Anthropic { .. } => "anthropic",
            ProviderClient::Gemini { .. } => "gemini",
        }
    }

    async fn complete(
        &self,
        client: &reqwest::Client,
        prompt: &str,
    ) -> Result<String, EngineError> {
        let unavailable =
            |e: reqwest::Error| EngineError::BackendUnavailable(format!("{}: {}", self.name(), e));

        let value: Value = match self {
            ProviderClient::Ollama { url, model } => {
                let body = json!({
                    "model": model,
                    "prompt": prompt,
                    "stream": false,
                    "format": "json",
                });
                client
                    .post(format!("{}/api/generate", url.trim_end_matches('/')))
                    .json(&body)
                    .send()
                    .await
                    .map_err(unavailable)?
                    .error_for_status()
                    .map_err(unavailable)?
                    .json()
                    .await
                    .map_err(unavailable)?
            }
            ProviderClient::OpenAi { api_key, model } => {
                let body = json!({
                    "model": model,
                    "messages": [{"role": "user", "content": prompt}],
                    "temperature": 0,
                });
                client
                    .post("https://api.openai.com/v1/chat/completions")
                    .bearer_auth(api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(unavailable)?
                    .error_for_status()
                    .map_err(unavailable)?
                    .json()
                    .await
                    .map_err(unavailable)?
            }
            ProviderClient::Anthropic { api_key, model } => {
                let body = json!({
                    "model": model,
                    "max_tokens": 1024,
                    "messages": [{"role": "user", "content": prompt}],
                });
                client
                    .post("https://api.anthropic.com/v1/messages")
                    .header("x-api-key", api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send()
                    .await
                    .map_err(unavailable)?
                    .error_for_status()
                    .map_err(unavailable)?
                    .json()
                    .await
                    .map_err(unavailable)?
            }
            ProviderClient::Gemini { api_key, model } => {
                let url = format!(
                    "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
                    model, api_key
                );
                let body = json!({
                    "contents": [{"parts": [{"text": prompt}]}],
                });
                client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(unavailable)?
                    .error_for_status()
                    .map_err(unavailable)?
                    .json()
                    .await
                    .map_err(unavailable)?
            }
        };

        let text = match self {
            ProviderClient::Ollama { .. } => value.get("response").and_then(Value::as_str),
            ProviderClient::OpenAi { .. } => value
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str),
            ProviderClient::Anthropic { .. } => {
                value.pointer("/content/0/text").and_then(Value::as_str)
            }
            ProviderClient::Gemini { .. } => value
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(Value::as_str),
        };

        text.map(str::to_owned).ok_or_else(|| {
            EngineError::ParseError(format!("{}: response missing completion text", self.name()))
        })
    }
}

/// LLM-backed judge with an explicit provider chain: the configured provider
/// first, then Gemini when a key is present. Chain order is fixed at
/// construction; there is no ambient environment sniffing at call time.
pub struct LlmJudge {
    client: reqwest::Client,
    chain: Vec<ProviderClient>,
}

impl LlmJudge {
    /// Returns `None` when no provider can be built, in which case the
    /// pipeline runs heuristics only.
    pub fn from_config(config: &Config) -> Option<Self> {
        let mut chain = Vec::new();

        let primary = match config.judge_provider {
            JudgeProvider::Ollama => Some(ProviderClient::Ollama {
                url: config.judge_url.clone(),
                model: config.judge_model.clone(),
            }),
            JudgeProvider::OpenAi => config.openai_api_key.clone().map(|api_key| {
                ProviderClient::OpenAi {
                    api_key,
                    model: config.judge_model.clone(),
                }
            }),
            JudgeProvider::Anthropic => config.anthropic_api_key.clone().map(|api_key| {
                ProviderClient::Anthropic {
                    api_key,
                    model: config.judge_model.clone(),
                }
            }),
            JudgeProvider::Gemini => config.gemini_api_key.clone().map(|api_key| {
                ProviderClient::Gemini {
                    api_key,
                    model: config.judge_model.clone(),
                }
            }),
            JudgeProvider::None => None,
        };
        if let Some(p) = primary {
            chain.push(p);
        }

        if config.judge_provider != JudgeProvider::Gemini {
            if let Some(api_key) = config.gemini_api_key.clone() {
                chain.push(ProviderClient::Gemini {
                    api_key,
                    model: "gemini-2.5-flash".to_string(),
                });
            }
        }

        if chain.is_empty() {
            return None;
        }

        let client = reqwest::Client::builder()
            .timeout(JUDGE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Some(Self { client, chain })
    }

    /// Walks the provider chain until one returns a completion.
    async fn complete(&self, operation: &str, prompt: &str) -> Result<String, EngineError> {
        let mut last_err = EngineError::BackendUnavailable("no judge provider".to_string());
        for provider in &self.chain {
            match provider.complete(&self.client, prompt).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(
                        "judge provider {} failed for {}: {}",
                        provider.name(),
                        operation,
                        e
                    );
                    JUDGE_FALLBACKS_TOTAL.with_label_values(&[operation]).inc();
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl JudgmentBackend for LlmJudge {
    async fn assess_effort(
        &self,
        question: &str,
        code: &str,
    ) -> Result<EffortJudgment, EngineError> {
        let prompt = format!(
            "You are grading how much genuine effort a student put into solving a \
             programming problem. Ignore correctness.\n\n\
             Problem:\n{}\n\nStudent code:\n{}\n\n\
             Respond with ONLY a JSON object with exactly these keys:\n\
             {{\"effort_score\": <number 0.0-1.0>, \"components\": {{}}, \"reasoning\": \"<one sentence>\"}}",
            question, code
        );
        let text = self.complete("effort", &prompt).await?;
        let value = parse_json_reply("effort", &text);
        Ok(EffortJudgment {
            effort_score: extract_score(&value, "effort_score"),
            reasoning: extract_text(&value, "reasoning"),
        })
    }

    async fn assess_logic(
        &self,
        question: &str,
        ideal_solution: &str,
        code: &str,
    ) -> Result<LogicJudgment, EngineError> {
        let prompt = format!(
            "Compare the logical approach of a student's solution against a reference \
             solution for the same problem. Judge the approach, not style.\n\n\
             Problem:\n{}\n\nReference solution:\n{}\n\nStudent code:\n{}\n\n\
             Respond with ONLY a JSON object with exactly these keys:\n\
             {{\"logic_similarity\": <number 0.0-1.0>, \"similarity_breakdown\": {{\"relevance\": <number 0.0-1.0>}}, \"notes\": \"<one sentence>\"}}",
            question, ideal_solution, code
        );
        let text = self.complete("logic", &prompt).await?;
        let value = parse_json_reply("logic", &text);
        Ok(LogicJudgment {
            logic_similarity: extract_score(&value, "logic_similarity"),
            relevance: extract_relevance(&value),
            notes: extract_text(&value, "notes"),
        })
    }

    async fn compose_feedback(
        &self,
        question: &str,
        code: &str,
        result_summary: &str,
    ) -> Result<FeedbackBundle, EngineError> {
        let prompt = format!(
            "Write short, constructive feedback for a student's exam submission.\n\n\
             Problem:\n{}\n\nStudent code:\n{}\n\nTest results:\n{}\n\n\
             Respond with ONLY a JSON object with exactly these keys:\n\
             {{\"feedback\": \"...\", \"critic\": \"...\", \"improvements\": \"...\", \"scope_for_improvement\": \"...\"}}",
            question, code, result_summary
        );
        let text = self.complete("feedback", &prompt).await?;
        let value = parse_json_reply("feedback", &text);
        Ok(FeedbackBundle {
            feedback: extract_text(&value, "feedback"),
            critic: extract_text(&value, "critic"),
            improvements: extract_text(&value, "improvements"),
            scope_for_improvement: extract_text(&value, "scope_for_improvement"),
        })
    }
}

/// Strips markdown code fences and parses the first JSON object found. A
/// reply that cannot be parsed yields an empty object, so every field falls
/// back to its neutral default rather than failing the attempt.
fn parse_json_reply(operation: &str, text: &str) -> Value {
    let stripped = strip_markdown_fences(text);
    if let Ok(v) = serde_json::from_str::<Value>(stripped.trim()) {
        return v;
    }
    if let (Some(start), Some(end)) = (stripped.find('{'), stripped.rfind('}')) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<Value>(&stripped[start..=end]) {
                return v;
            }
        }
    }
    tracing::warn!("judge reply for {} was not valid JSON, using defaults", operation);
    json!({})
}

fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.strip_suffix("```").unwrap_or(rest);
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

fn extract_score(value: &Value, key: &str) -> f64 {
    let raw = match value.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    raw.unwrap_or(NEUTRAL_SCORE).clamp(0.0, 1.0)
}

/// The relevance sub-score nested in `similarity_breakdown`. Missing or
/// unparsable values mean full relevance, never a penalty.
fn extract_relevance(value: &Value) -> f64 {
    let raw = match value.pointer("/similarity_breakdown/relevance") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    raw.unwrap_or(FULL_RELEVANCE).clamp(0.0, 1.0)
}

fn extract_text(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

const EFFORT_KEYWORDS: &[&str] = &[
    "def", "class", "for", "while", "if", "return", "import", "function", "try",
];

/// Deterministic effort estimate used when no judgment backend is reachable:
/// code length scaled to 4000 characters, plus a small bonus per construct
/// keyword present.
pub fn heuristic_effort(code: &str) -> EffortJudgment {
    let length_component = (code.len() as f64 / 4000.0).min(1.0) * 0.9;
    let keyword_bonus = EFFORT_KEYWORDS
        .iter()
        .filter(|kw| code.contains(*kw))
        .count() as f64
        * 0.05;
    EffortJudgment {
        effort_score: (length_component + keyword_bonus).min(1.0),
        reasoning: "Estimated from code length and structure.".to_string(),
    }
}

/// Deterministic feedback used when no judgment backend is reachable.
pub fn fallback_feedback(passed: usize, total: usize) -> FeedbackBundle {
    let feedback = if total == 0 {
        "Your submission was recorded. No public test cases were available for this question."
            .to_string()
    } else if passed == total {
        format!("All {} public test cases passed. Well done.", total)
    } else {
        format!(
            "{} of {} public test cases passed. Review the failing cases and check your handling of edge inputs.",
            passed, total
        )
    };
    FeedbackBundle {
        feedback,
        critic: "Automated review was unavailable for this attempt.".to_string(),
        improvements: "Compare your output against the expected output for each failing case."
            .to_string(),
        scope_for_improvement: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_is_parsed() {
        let reply = "```json\n{\"effort_score\": 0.8, \"reasoning\": \"solid\"}\n```";
        let v = parse_json_reply("effort", reply);
        assert_eq!(extract_score(&v, "effort_score"), 0.8);
        assert_eq!(extract_text(&v, "reasoning"), "solid");
    }

    #[test]
    fn chatter_around_json_is_tolerated() {
        let reply = "Sure! Here is the assessment: {\"logic_similarity\": 0.4, \"notes\": \"ok\"} hope that helps";
        let v = parse_json_reply("logic", reply);
        assert_eq!(extract_score(&v, "logic_similarity"), 0.4);
    }

    #[test]
    fn garbage_reply_falls_back_to_neutral() {
        let v = parse_json_reply("effort", "I cannot answer that.");
        assert_eq!(extract_score(&v, "effort_score"), NEUTRAL_SCORE);
        assert_eq!(extract_text(&v, "reasoning"), "");
    }

    #[test]
    fn relevance_is_read_from_the_breakdown() {
        let v = json!({
            "logic_similarity": 0.7,
            "similarity_breakdown": {"relevance": 0.15},
        });
        assert_eq!(extract_relevance(&v), 0.15);
    }

    #[test]
    fn missing_relevance_defaults_to_full() {
        let v = json!({"logic_similarity": 0.7, "similarity_breakdown": {}});
        assert_eq!(extract_relevance(&v), FULL_RELEVANCE);
        let v = json!({"logic_similarity": 0.7});
        assert_eq!(extract_relevance(&v), FULL_RELEVANCE);
    }

    #[test]
    fn string_scores_are_coerced_and_clamped() {
        let v = json!({"effort_score": "1.7"});
        assert_eq!(extract_score(&v, "effort_score"), 1.0);
        let v = json!({"effort_score": -0.3});
        assert_eq!(extract_score(&v, "effort_score"), 0.0);
    }

    #[test]
    fn heuristic_effort_rewards_structure() {
        let trivial = heuristic_effort("x = 1");
        let real = heuristic_effort(
            "import sys\n\ndef solve(n):\n    total = 0\n    for i in range(n):\n        if i % 2 == 0:\n            total += i\n    return total\n",
        );
        assert!(real.effort_score > trivial.effort_score);
        assert!(real.effort_score <= 1.0);
    }

    #[test]
    fn heuristic_effort_is_capped() {
        let huge = "def f():\n    return 1\n".repeat(500);
        assert_eq!(heuristic_effort(&huge).effort_score, 1.0);
    }

    #[test]
    fn fallback_feedback_mentions_pass_counts() {
        let fb = fallback_feedback(2, 5);
        assert!(fb.feedback.contains("2 of 5"));
        let fb = fallback_feedback(3, 3);
        assert!(fb.feedback.contains("All 3"));
    }
}
