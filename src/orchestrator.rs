use anyhow::{Context, Result};
use serde_json::json;
use std::path::PathBuf;

use crate::embeddings::Embedder;
use crate::llm::{ChatMessage, LlmClient};
use crate::retriever::Retriever;
use crate::store::{IndexStore, ScoredChunk};

pub const NO_CONTEXT_MESSAGE: &str = "Sorry, I couldn't find relevant information.";
pub const LLM_ERROR_MESSAGE: &str = "An error occurred while contacting the LLM.";

/// Refusal phrases the answering model is instructed to use when the context
/// is insufficient. Matched case-insensitively by substring.
const FALLBACK_PHRASES: &[&str] = &[
    "Based on the provided context, I am unable to provide an answer.",
    "I'm sorry, but I couldn't find enough context to answer your question.",
];

/// Exchanges of history included when rewriting a follow-up question.
const HISTORY_WINDOW: usize = 3;

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

const ANSWER_SYSTEM_PROMPT: &str = "You are a helpful AI assistant specializing in answering \
questions about cars. Your primary goal is to answer the user's question using ONLY the \
information provided in the \"Context\" section.\n\n\
IMPORTANT: The \"Context\" may contain textual descriptions of one or more images. You should \
treat these descriptions as factual information about the visual aspects of the car(s) or \
relevant scenes.\n\n\
Carefully and thoroughly review the ENTIRE provided context before answering.\n\n\
If the information required to answer the question is explicitly present or can be directly \
inferred from the provided context (including any image descriptions), provide a concise \
answer.\n\n\
Do not use any external knowledge or make assumptions beyond what is explicitly stated in the \
context. If the context is insufficient, reply exactly: \"Based on the provided context, I am \
unable to provide an answer.\"";

const REPHRASE_SYSTEM_PROMPT: &str = "You are a query rewriting expert. Your task is to \
rephrase the \"Follow-up Question\" to be a standalone question that incorporates necessary \
context from the \"Chat History\". If the \"Follow-up Question\" is already standalone or the \
history does not seem relevant to it, return the original \"Follow-up Question\" unchanged. \
Only output the rephrased standalone question, without any preamble or explanation.";

const SEARCH_STATEMENT_PROMPT: &str = "Your task is to convert user questions into concise \
statements or descriptive phrases suitable for semantic search in a vector database. Focus on \
the core topic, removing conversational filler and question structure.\n\
---\n\
User Question: \"Hey, can you tell me what the main benefits of using Retrieval-Augmented \
Generation are?\"\n\
Optimized Search Statement: \"Benefits of Retrieval-Augmented Generation (RAG)\"\n\
---\n\
User Question: \"I'm trying to understand how photosynthesis works in plants.\"\n\
Optimized Search Statement: \"Process of photosynthesis in plants\"\n\
---\n\
User Question: \"How do I reset my forgotten password for my online banking account?\"\n\
Optimized Search Statement: \"Resetting forgotten online banking password\"\n\
---";

/// One completed question/answer turn.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

/// What the caller shows the user: the answer and, when it is grounded, the
/// retrieved context for citation display.
#[derive(Debug, Clone)]
pub struct AnswerOutcome {
    pub answer: String,
    pub context: Option<String>,
}

/// The conversational layer: rewrites follow-up questions into standalone
/// queries, optimizes them for vector search, retrieves context, and asks
/// the model to answer strictly from that context.
pub struct Orchestrator<'a, E: Embedder> {
    llm: &'a LlmClient,
    store: &'a IndexStore,
    embedder: &'a E,
    top_k: usize,
    history: Vec<Exchange>,
    interactions_path: Option<PathBuf>,
}

impl<'a, E: Embedder> Orchestrator<'a, E> {
    pub fn new(llm: &'a LlmClient, store: &'a IndexStore, embedder: &'a E, top_k: usize) -> Self {
        Self {
            llm,
            store,
            embedder,
            top_k,
            history: Vec::new(),
            interactions_path: None,
        }
    }

    /// Enables JSONL interaction logging, one record per completed turn.
    pub fn with_interaction_log(mut self, path: PathBuf) -> Self {
        self.interactions_path = Some(path);
        self
    }

    pub fn history(&self) -> &[Exchange] {
        &self.history
    }

    /// Runs one full chat turn: rewrite, optimize, retrieve, answer. Every
    /// external failure degrades to a fixed user-facing message; this never
    /// returns an error for an LLM or retrieval problem.
    pub async fn ask(&mut self, question: &str) -> AnswerOutcome {
        let standalone = self.rewrite_standalone(question).await;
        tracing::info!("Standalone query: {}", standalone);

        let statement = self.optimize_search_statement(&standalone).await;
        tracing::info!("Search statement: {}", statement);

        let retriever = Retriever::new(self.store, self.embedder, self.top_k);
        let retrieved = match retriever.search_default(&statement).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!("Retrieval failed: {}", e);
                Vec::new()
            }
        };

        let outcome = self.answer(&standalone, &retrieved).await;

        self.history.push(Exchange {
            question: question.to_string(),
            answer: outcome.answer.clone(),
        });
        if let Err(e) = self.log_interaction(question, &standalone, &outcome).await {
            tracing::warn!("Failed to log interaction: {}", e);
        }

        outcome
    }

    /// Rephrases a follow-up question into a standalone one using the last
    /// few exchanges. With no history the question is returned unchanged;
    /// the model returning it unchanged is also valid output. A rewrite
    /// failure degrades to the original question.
    pub async fn rewrite_standalone(&self, question: &str) -> String {
        if self.history.is_empty() {
            return question.to_string();
        }

        let history_str = self.history_for_prompt();
        let user = format!(
            "Chat History:\n{}\n\nFollow-up Question: {}\n\nStandalone Question:",
            history_str, question
        );

        let messages = [
            ChatMessage::system(REPHRASE_SYSTEM_PROMPT),
            ChatMessage::user(user),
        ];
        match self.llm.chat(&messages).await {
            Ok(rewritten) => {
                let rewritten = rewritten.trim();
                if rewritten.is_empty() {
                    question.to_string()
                } else {
                    rewritten.to_string()
                }
            }
            Err(e) => {
                tracing::warn!("Standalone rewrite failed, using original query: {}", e);
                question.to_string()
            }
        }
    }

    /// Turns a standalone question into a search-optimized statement. Falls
    /// back to the standalone question on failure.
    async fn optimize_search_statement(&self, standalone: &str) -> String {
        let user = format!(
            "User Question: \"{}\"\nOptimized Search Statement:",
            standalone
        );
        let messages = [
            ChatMessage::system(SEARCH_STATEMENT_PROMPT),
            ChatMessage::user(user),
        ];
        match self.llm.chat(&messages).await {
            Ok(statement) => {
                let statement = statement.trim().trim_matches('"');
                if statement.is_empty() {
                    standalone.to_string()
                } else {
                    statement.to_string()
                }
            }
            Err(e) => {
                tracing::warn!("Search statement rewrite failed, using standalone query: {}", e);
                standalone.to_string()
            }
        }
    }

    /// Answers from retrieved context only. Empty retrieval short-circuits
    /// to a fixed message without calling the model; a model failure
    /// converts to a fixed error message. When the answer contains a
    /// fallback phrase the context is suppressed so irrelevant chunks are
    /// not shown alongside a refusal.
    pub async fn answer(&self, question: &str, retrieved: &[ScoredChunk]) -> AnswerOutcome {
        if retrieved.is_empty() {
            tracing::warn!("No context retrieved; answering with the fixed fallback");
            return AnswerOutcome {
                answer: NO_CONTEXT_MESSAGE.to_string(),
                context: None,
            };
        }

        let context = retrieved
            .iter()
            .map(|r| r.chunk.text.as_str())
            .collect::<Vec<_>>()
            .join(CONTEXT_SEPARATOR);

        let user = format!("Context:\n{}\n\nQuestion:\n{}\n\nAnswer:", context, question);
        let messages = [ChatMessage::system(ANSWER_SYSTEM_PROMPT), ChatMessage::user(user)];

        match self.llm.chat(&messages).await {
            Ok(answer) => outcome_from_answer(answer, context),
            Err(e) => {
                tracing::error!("Failed to get LLM response: {}", e);
                AnswerOutcome {
                    answer: LLM_ERROR_MESSAGE.to_string(),
                    context: None,
                }
            }
        }
    }

    /// Last [`HISTORY_WINDOW`] exchanges as "User:"/"Assistant:" lines.
    fn history_for_prompt(&self) -> String {
        let start = self.history.len().saturating_sub(HISTORY_WINDOW);
        self.history[start..]
            .iter()
            .map(|e| format!("User: {}\nAssistant: {}", e.question, e.answer))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn log_interaction(
        &self,
        question: &str,
        standalone: &str,
        outcome: &AnswerOutcome,
    ) -> Result<()> {
        let Some(path) = &self.interactions_path else {
            return Ok(());
        };

        let entry = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "question": question,
            "standalone_question": standalone,
            "answer": outcome.answer,
            "contexts": outcome.context,
        });

        let mut line = entry.to_string();
        line.push('\n');

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .context("Failed to open interaction log")?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append interaction log entry")?;
        Ok(())
    }
}

/// Builds the user-facing outcome for a model answer. Context is suppressed
/// when the answer contains a refusal phrase, no matter what was retrieved.
fn outcome_from_answer(answer: String, context: String) -> AnswerOutcome {
    let context = if contains_fallback_phrase(&answer) {
        None
    } else {
        Some(context)
    };
    AnswerOutcome {
        answer: answer.trim().to_string(),
        context,
    }
}

/// Case-insensitive substring check against the fixed refusal phrases.
/// Substring matching can false-positive on a legitimate answer that quotes
/// one of the phrases; that is accepted, documented behavior.
pub fn contains_fallback_phrase(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    FALLBACK_PHRASES
        .iter()
        .any(|phrase| lower.contains(&phrase.to_lowercase()))
}
