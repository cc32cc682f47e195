pub mod llm;


use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::flowlog::{FlowLogger, FlowStatus, SessionFlow};
use crate::kb::{KbManager, QueryOverrides};
use crate::retrieval::{RetrievalEngine, SynonymMap};
use crate::{RagError, Result};

pub use llm::{ChatMessage, LlmClient, Role, ToolCall, ToolDescriptor};

/// Messages of history kept in the prompt window.
const MAX_HISTORY_MESSAGES: usize = 20;
/// Tool-calling rounds allowed per turn before best-effort synthesis.
const MAX_TOOL_CALLS: usize = 5;

const SYSTEM_PROMPT: &str = "\
You are a knowledge-base assistant. Answer the user's questions accurately \
and concisely.

Tool policy:
- Call search_knowledge_base whenever the question asks about facts, people, \
events, or anything that could be stored in the knowledge base. Do not \
guess from memory when a search could answer the question.
- Before calling the tool, reformulate the question into a short, focused \
search query containing the key entities and terms.
- Greetings and small talk need no tool; answer directly.

Answer policy:
- Base factual answers on the retrieved snippets and name the source \
documents they came from.
- If retrieval returns no relevant snippets, say that the knowledge base \
contains no answer; do not invent one.
- Keep answers in the language of the question.";

const UNAVAILABLE_REPLY: &str =
    "Sorry, the knowledge service is temporarily unavailable. Please try again later.";
const EMPTY_QUERY_REPLY: &str = "Please enter a valid question.";

/// A tool the agent can offer to the model. Tools are registered once at
/// agent construction; the registry is static for the process lifetime.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn descriptor(&self) -> ToolDescriptor;
    async fn invoke(&self, arguments: &Value, kb_id: Option<&str>) -> Result<Value>;
}

/// The retrieval tool: searches the bound knowledge base (or the default
/// collection when the caller selected none) and returns hits as JSON.
pub struct SearchKnowledgeBaseTool {
    manager: Arc<KbManager>,
    engine: Arc<RetrievalEngine>,
    default_collection: String,
    default_config: RetrievalConfig,
    synonyms: SynonymMap,
}

impl SearchKnowledgeBaseTool {
    pub fn new(
        manager: Arc<KbManager>,
        engine: Arc<RetrievalEngine>,
        default_collection: String,
        default_config: RetrievalConfig,
        synonyms: SynonymMap,
    ) -> Self {
        Self {
            manager,
            engine,
            default_collection,
            default_config,
            synonyms,
        }
    }
}

#[async_trait]
impl AgentTool for SearchKnowledgeBaseTool {
    fn name(&self) -> &str {
        "search_knowledge_base"
    }

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::function(
            "search_knowledge_base",
            "Search the knowledge base for text snippets relevant to a query. \
             Returns scored snippets with their source documents.",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    }
                },
                "required": ["query"]
            }),
        )
    }

    async fn invoke(&self, arguments: &Value, kb_id: Option<&str>) -> Result<Value> {
        let query = arguments
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RagError::Validation("tool call is missing 'query'".into()))?;

        let hits = match kb_id {
            Some(kb_id) => {
                self.manager
                    .query(kb_id, query, &QueryOverrides::default(), &self.synonyms)
                    .await?
            }
            None => {
                self.engine
                    .search(&self.default_collection, query, &self.default_config, &self.synonyms)
                    .await?
            }
        };

        let results: Vec<Value> = hits
            .iter()
            .map(|hit| {
                json!({
                    "score": hit.score,
                    "content": hit.content,
                    "source": hit.source,
                    "metadata": hit.metadata,
                })
            })
            .collect();
        Ok(json!({ "count": results.len(), "results": results }))
    }
}

/// Per-call options for [`RagAgent::chat`].
#[derive(Default)]
pub struct ChatOptions {
    pub history: Vec<ChatMessage>,
    pub kb_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub cancellation: Option<CancellationToken>,
}

/// The tool-calling orchestrator over the external LLM.
///
/// Within one `chat` call every LLM and tool invocation is strictly
/// sequential. Callers must not overlap two `chat` calls for the same
/// session; the API layer holds a per-session lock for this.
pub struct RagAgent {
    llm: Arc<LlmClient>,
    tools: Vec<Arc<dyn AgentTool>>,
    flow: FlowLogger,
    max_query_length: usize,
}

impl RagAgent {
    pub fn new(
        llm: Arc<LlmClient>,
        tools: Vec<Arc<dyn AgentTool>>,
        flow: FlowLogger,
        max_query_length: usize,
    ) -> Self {
        Self {
            llm,
            tools,
            flow,
            max_query_length,
        }
    }

    /// Process one user query, optionally continuing a conversation and
    /// bound to one knowledge base. Returns the final answer text.
    pub async fn chat(&self, query: &str, options: ChatOptions) -> Result<String> {
        if query.trim().is_empty() {
            return Ok(EMPTY_QUERY_REPLY.to_string());
        }
        if query.chars().count() > self.max_query_length {
            return Err(RagError::Validation(format!(
                "query exceeds the maximum length of {} characters",
                self.max_query_length
            )));
        }

        let session_id = options.session_id.unwrap_or_else(Uuid::new_v4);
        let flow = self.flow.session(session_id);
        flow.query_start(query);

        let (intent, requires_tools, reasoning) = analyze_intent(query);
        flow.query_analysis(intent, requires_tools, reasoning);

        info!("Processing chat query for session {session_id}");
        let result = self
            .run_turn(query, &options, &flow)
            .await;

        match result {
            Ok(answer) => {
                flow.query_complete(&answer, FlowStatus::Success);
                Ok(answer)
            }
            Err(RagError::Cancelled(reason)) => {
                flow.error("Cancelled", &reason);
                flow.query_complete("", FlowStatus::Error);
                Err(RagError::Cancelled(reason))
            }
            Err(err) => {
                flow.error(error_kind(&err), &err.to_string());
                flow.query_complete("", FlowStatus::Error);
                // Backing-service exhaustion surfaces as a short diagnostic
                // phrase, never a stack trace.
                match err {
                    RagError::Llm(_) | RagError::Timeout(_) => Ok(UNAVAILABLE_REPLY.to_string()),
                    other => Err(other),
                }
            }
        }
    }

    async fn run_turn(
        &self,
        query: &str,
        options: &ChatOptions,
        flow: &SessionFlow,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(options.history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt(options.kb_id.as_deref())));
        let history_start = options.history.len().saturating_sub(MAX_HISTORY_MESSAGES);
        messages.extend_from_slice(&options.history[history_start..]);
        messages.push(ChatMessage::user(query));

        let descriptors: Vec<ToolDescriptor> =
            self.tools.iter().map(|tool| tool.descriptor()).collect();

        let mut tool_rounds = 0usize;
        loop {
            self.check_cancelled(options)?;

            let offer_tools = tool_rounds < MAX_TOOL_CALLS;
            if !offer_tools {
                warn!("Tool call budget exhausted; requesting a best-effort answer");
                messages.push(ChatMessage::system(
                    "You have reached the tool call limit. Answer now with the \
                     observations collected so far.",
                ));
            }

            let llm_started = Instant::now();
            let response = self
                .llm
                .chat(
                    messages.clone(),
                    if offer_tools { descriptors.clone() } else { Vec::new() },
                )
                .await;
            let llm_duration = llm_started.elapsed().as_secs_f64();

            let response = match response {
                Ok(message) => {
                    flow.llm_call(
                        self.llm.model(),
                        &render_prompt(&messages),
                        &message.content,
                        llm_duration,
                        FlowStatus::Success,
                    );
                    message
                }
                Err(err) => {
                    flow.llm_call(
                        self.llm.model(),
                        &render_prompt(&messages),
                        "",
                        llm_duration,
                        FlowStatus::Error,
                    );
                    return Err(err);
                }
            };

            let tool_calls = response.tool_calls.clone().unwrap_or_default();
            if tool_calls.is_empty() || !offer_tools {
                return Ok(response.content);
            }

            messages.push(response);
            for call in tool_calls {
                self.check_cancelled(options)?;
                tool_rounds += 1;

                let observation = self
                    .execute_tool(&call, options.kb_id.as_deref(), flow)
                    .await;
                messages.push(ChatMessage::tool(observation.to_string()));
            }
        }
    }

    /// Run one tool call, converting failures into observations the model
    /// can react to instead of aborting the turn.
    async fn execute_tool(
        &self,
        call: &ToolCall,
        kb_id: Option<&str>,
        flow: &SessionFlow,
    ) -> Value {
        let name = call.function.name.as_str();
        let arguments = &call.function.arguments;

        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            warn!("Model requested unknown tool '{name}'");
            flow.tool_execution(
                name,
                &arguments.to_string(),
                "unknown tool",
                0.0,
                FlowStatus::Error,
            );
            return json!({ "error": format!("unknown tool '{name}'") });
        };

        flow.tool_selection(name, "the model requested knowledge base retrieval");

        let started = Instant::now();
        let result = tool.invoke(arguments, kb_id).await;
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(value) => {
                debug!("Tool '{name}' completed in {duration:.3}s");
                flow.tool_execution(
                    name,
                    &arguments.to_string(),
                    &value.to_string(),
                    duration,
                    FlowStatus::Success,
                );
                value
            }
            Err(err) => {
                warn!("Tool '{name}' failed: {err}");
                flow.tool_execution(
                    name,
                    &arguments.to_string(),
                    &err.to_string(),
                    duration,
                    FlowStatus::Error,
                );
                json!({ "error": err.to_string() })
            }
        }
    }

    fn system_prompt(&self, kb_id: Option<&str>) -> String {
        match kb_id {
            Some(kb_id) => format!(
                "{SYSTEM_PROMPT}\n\nAll searches in this conversation are bound \
                 to knowledge base '{kb_id}'."
            ),
            None => SYSTEM_PROMPT.to_string(),
        }
    }

    fn check_cancelled(&self, options: &ChatOptions) -> Result<()> {
        if options
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(RagError::Cancelled("chat was cancelled by the caller".into()));
        }
        Ok(())
    }
}

/// Lightweight intent heuristic recorded in the flow log: greetings skip
/// retrieval, question-shaped or entity-bearing queries suggest it.
fn analyze_intent(query: &str) -> (&'static str, bool, &'static str) {
    let lowered = query.to_lowercase();
    let greetings = ["hello", "hi ", "hey", "你好", "您好", "嗨"];
    if greetings
        .iter()
        .any(|g| lowered.starts_with(g) || lowered == g.trim())
    {
        return (
            "conversational",
            false,
            "the query is a greeting and needs no retrieval",
        );
    }

    let question_words = [
        "who", "what", "where", "when", "why", "how", "which", "谁", "什么", "哪", "何时", "为什么",
        "如何", "怎么", "多少",
    ];
    if question_words.iter().any(|w| lowered.contains(w)) || query.chars().count() > 10 {
        (
            "factual_lookup",
            true,
            "the query asks for facts that may live in the knowledge base",
        )
    } else {
        (
            "conversational",
            false,
            "the query looks conversational; the model may still choose to search",
        )
    }
}

fn render_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            format!("{role}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn error_kind(err: &RagError) -> &'static str {
    match err {
        RagError::Validation(_) => "ValidationError",
        RagError::Conflict(_) => "ConflictError",
        RagError::NotFound(_) => "NotFoundError",
        RagError::Embedding(_) => "EmbeddingError",
        RagError::VectorStore(_) => "VectorStoreError",
        RagError::Llm(_) => "LLMError",
        RagError::Timeout(_) => "TimeoutError",
        RagError::Loader(_) => "LoaderError",
        RagError::Database(_) => "DatabaseError",
        RagError::Config(_) => "ConfigError",
        RagError::Cancelled(_) => "Cancelled",
        RagError::Io(_) => "IoError",
        RagError::Internal(_) => "InternalError",
    }
}
