//! The LLM backend contract and the scripted test double.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use snafu::ResultExt as _;

use crate::{AiResult, BadJsonSnafu, ExhaustedSnafu};

/// A blocking completion backend. When `schema` is given the reply must be
/// a JSON document matching it.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        schema: Option<&serde_json::Value>,
    ) -> AiResult<String>;
}

/// Generate against a schema and decode the reply.
///
/// Model output is tolerated inside Markdown code fences; anything that
/// still fails to decode is a content error for the caller to log and skip.
pub async fn generate_json<T: DeserializeOwned>(
    generator: &dyn Generator,
    prompt: &str,
    schema: &serde_json::Value,
) -> AiResult<T> {
    let reply = generator.generate(prompt, Some(schema)).await?;
    serde_json::from_str(strip_fences(&reply)).context(BadJsonSnafu)
}

fn strip_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Canned responses in order, with every prompt recorded. The test double
/// for everything prompt-shaped.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .expect("Locking failed")
            .push_back(response.into());
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("Locking failed").clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _schema: Option<&serde_json::Value>,
    ) -> AiResult<String> {
        self.prompts
            .lock()
            .expect("Locking failed")
            .push(prompt.to_string());
        match self.responses.lock().expect("Locking failed").pop_front() {
            Some(response) => Ok(response),
            None => ExhaustedSnafu.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        answer: String,
    }

    #[tokio::test]
    async fn generate_json_decodes_plain_and_fenced_replies() {
        let generator = ScriptedGenerator::new();
        generator.push(r#"{"answer": "plain"}"#);
        generator.push("```json\n{\"answer\": \"fenced\"}\n```");

        let schema = serde_json::json!({"type": "object"});
        let plain: Reply = generate_json(&generator, "p1", &schema).await.unwrap();
        assert_eq!(plain.answer, "plain");
        let fenced: Reply = generate_json(&generator, "p2", &schema).await.unwrap();
        assert_eq!(fenced.answer, "fenced");

        assert_eq!(generator.prompts(), ["p1", "p2"]);
    }

    #[tokio::test]
    async fn bad_json_and_exhaustion_are_distinct_errors() {
        let generator = ScriptedGenerator::new();
        generator.push("not json at all");

        let schema = serde_json::json!({"type": "object"});
        let bad = generate_json::<Reply>(&generator, "p", &schema)
            .await
            .unwrap_err();
        assert!(matches!(bad, crate::AiError::BadJson { .. }));

        let exhausted = generate_json::<Reply>(&generator, "p", &schema)
            .await
            .unwrap_err();
        assert!(matches!(exhausted, crate::AiError::Exhausted));
    }
}
