use crate::llm::{
    FunctionCall, InputItem, ModelClient, ModelError, ModelRequest, ToolDefinition, ToolOutput,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Model call failed: {0}")]
    Model(#[from] ModelError),
    #[error("Agent did not produce a final answer within {0} turns")]
    MaxTurnsExceeded(usize),
}

/// A capability the agent may invoke during a run.
///
/// Failures are reported back to the model through the returned
/// [`ToolOutput`], never raised, so the agent can decide how to describe
/// them to the recipient.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    async fn call(&self, arguments: Value) -> ToolOutput;

    /// Whether the model must match `parameters` exactly. Only schemas that
    /// list every property as required and forbid additional ones qualify.
    fn strict(&self) -> bool {
        false
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::Function {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
            strict: self.strict(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub final_output: String,
    pub turns: usize,
    pub tool_calls: usize,
}

pub struct AgentRunner<M: ModelClient> {
    model: Arc<M>,
    max_turns: usize,
}

impl<M: ModelClient> AgentRunner<M> {
    pub fn new(model: M, max_turns: usize) -> Self {
        Self {
            model: Arc::new(model),
            max_turns,
        }
    }

    /// Runs the model until it answers without requesting a tool call.
    #[instrument(skip_all, fields(tools = tools.len()))]
    pub async fn run(
        &self,
        instructions: &str,
        goal: &str,
        tools: &[Arc<dyn Tool>],
    ) -> Result<AgentRun, AgentError> {
        let mut request = ModelRequest {
            instructions: instructions.to_string(),
            input: vec![InputItem::user(goal)],
            tools: tools.iter().map(|tool| tool.definition()).collect(),
            previous_response_id: None,
        };
        let mut tool_calls = 0;

        for turn in 1..=self.max_turns {
            let response = self.model.respond(&request).await?;
            let calls = response.function_calls();

            if calls.is_empty() {
                return Ok(AgentRun {
                    final_output: response.output_text(),
                    turns: turn,
                    tool_calls,
                });
            }

            tracing::info!("Turn {} requested {} tool call(s)", turn, calls.len());
            let mut outputs = Vec::with_capacity(calls.len());
            for call in calls {
                tool_calls += 1;
                let output = dispatch(tools, &call).await;
                outputs.push(InputItem::FunctionCallOutput {
                    call_id: call.call_id,
                    output,
                });
            }

            request.input = outputs;
            request.previous_response_id = Some(response.id);
        }

        Err(AgentError::MaxTurnsExceeded(self.max_turns))
    }
}

async fn dispatch(tools: &[Arc<dyn Tool>], call: &FunctionCall) -> ToolOutput {
    let Some(tool) = tools.iter().find(|tool| tool.name() == call.name) else {
        tracing::warn!("Model requested unknown tool `{}`", call.name);
        return ToolOutput::error(format!("Unknown tool: {}", call.name));
    };

    let arguments = if call.arguments.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str(&call.arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                tracing::warn!("Invalid arguments for `{}`: {}", call.name, e);
                return ToolOutput::error(format!("Invalid JSON arguments: {}", e));
            }
        }
    };

    tracing::debug!("Calling tool `{}`", call.name);
    tool.call(arguments).await
}
