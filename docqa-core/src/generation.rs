//! Answer generation over retrieved context.

use crate::brain::Brain;
use crate::error::LlmError;
use crate::types::{FusedResult, TokenUsage};
use async_trait::async_trait;
use tracing::info;

/// Everything a generator sees for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub question: &'a str,
    pub context: &'a [FusedResult],
    /// Gate feedback from the previous iteration, if any.
    pub feedback: Option<&'a str>,
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub model: String,
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Generation, LlmError>;
}

const ANSWER_PROMPT: &str = "You are a technical assistant answering developer questions about a product from its documentation. Give accurate, clear and actionable answers.

Context from the documentation:
{context}

User Question: {question}
{feedback}
Rules:
1. Use ONLY information explicitly stated in the documentation above.
2. Do not invent, assume or extrapolate plan names, limits, features or prices.
3. Keep different products and plan types apart; never carry a feature of one over to another.
4. If the answer is in the context, state it confidently. Only say something is not documented after checking every document.
5. Do not build tables or specifications that the documents do not contain.

Answer:";

const REVISION_NOTE: &str = "
Feedback from the quality check on your previous answer:
{feedback}

Revise your answer to address this feedback. Only add details that appear in the documents above; when in doubt be less comprehensive and more accurate.
";

/// Render retrieved documents as numbered context blocks.
pub fn format_context(context: &[FusedResult]) -> String {
    context
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let doc = &result.document;
            let heading = match &doc.section {
                Some(section) if section != &doc.title => format!("{} / {}", doc.title, section),
                _ => doc.title.clone(),
            };
            format!(
                "[Document {}] {}\nSource: {}\nContent: {}\n",
                i + 1,
                heading,
                doc.source,
                doc.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the full generation prompt.
pub fn build_prompt(request: &GenerationRequest<'_>) -> String {
    let feedback = match request.feedback {
        Some(text) if !text.trim().is_empty() => REVISION_NOTE.replace("{feedback}", text.trim()),
        _ => String::new(),
    };
    ANSWER_PROMPT
        .replace("{context}", &format_context(request.context))
        .replace("{question}", request.question)
        .replace("{feedback}", &feedback)
}

/// Generator backed by a chat completion model.
#[derive(Debug, Clone)]
pub struct LlmAnswerGenerator {
    brain: Brain,
}

impl LlmAnswerGenerator {
    pub fn new(brain: Brain) -> Self {
        Self { brain }
    }
}

#[async_trait]
impl AnswerGenerator for LlmAnswerGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Generation, LlmError> {
        let prompt = build_prompt(&request);
        let reply = self.brain.ask(&prompt).await?;

        info!(
            iteration = request.iteration,
            documents = request.context.len(),
            has_feedback = request.feedback.is_some(),
            answer_len = reply.text.len(),
            cost_usd = reply.cost_usd,
            "Answer generated"
        );

        Ok(Generation {
            text: reply.text.trim().to_string(),
            usage: reply.usage,
            cost_usd: reply.cost_usd,
            model: reply.model,
        })
    }
}
