//! Tool-calling dispatch loop

use crate::error::{AppError, Result};
use crate::llm::{ChatMessage, ChatModel, Completion, ToolSpec};
use crate::tools::ToolRegistry;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of an agent dispatch
pub struct AgentOutcome {
    pub reply: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// True when the loop stopped because the model kept requesting tools
    pub capped: bool,
}

/// Drive the model until it stops requesting tools or the iteration cap is
/// reached. Each round appends the assistant's tool calls and their results
/// to the transcript before re-dispatching.
pub async fn run_tool_loop(
    handle: &Arc<dyn ChatModel>,
    registry: &ToolRegistry,
    mut messages: Vec<ChatMessage>,
    temperature: f32,
    max_iterations: u32,
) -> Result<AgentOutcome> {
    let specs: Vec<ToolSpec> = registry.specs();
    let mut prompt_tokens = 0u32;
    let mut completion_tokens = 0u32;
    let mut last_reply = String::new();

    for iteration in 0..max_iterations {
        let completion: Completion = handle.complete(&messages, temperature, &specs).await?;
        prompt_tokens += completion.prompt_tokens.unwrap_or(0);
        completion_tokens += completion.completion_tokens.unwrap_or(0);

        if completion.tool_calls.is_empty() {
            return Ok(AgentOutcome {
                reply: completion.reply,
                prompt_tokens,
                completion_tokens,
                capped: false,
            });
        }

        debug!(
            iteration,
            calls = completion.tool_calls.len(),
            "Model requested tool calls"
        );
        last_reply = completion.reply.clone();

        let mut assistant = ChatMessage::assistant(completion.reply);
        assistant.tool_calls = completion.tool_calls.clone();
        messages.push(assistant);

        for call in completion.tool_calls {
            let result = match registry.invoke(&call.name, &call.arguments).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool invocation failed");
                    json!({ "error": e.to_string() })
                }
            };
            messages.push(ChatMessage::tool_result(call.id, result.to_string()));
        }
    }

    Ok(AgentOutcome {
        reply: last_reply,
        prompt_tokens,
        completion_tokens,
        capped: true,
    })
}

/// The error surfaced when the loop hit its cap.
pub fn iteration_cap_error(max_iterations: u32) -> AppError {
    AppError::AgentIterationCap { max_iterations }
}
