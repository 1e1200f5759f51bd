//! The cursor contract every provider adapter implements, plus the shared
//! tool-dispatch helper.

pub mod sse;

use async_trait::async_trait;
use thiserror::Error;

use crate::api::ApiError;
use crate::proto::{Chunk, Function, Message, Role, ToolCall, ToolCallStatus, ToolCaller};

/// Errors surfaced by a [`Stream`].
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The provider event carried no user-visible text; keep pulling.
    /// Never terminates the outer loop.
    #[error("no content")]
    NoContent,

    /// A status-coded provider error; retry policy lives in the
    /// coordinator.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The stream produced only heartbeats past the tolerated limit.
    #[error("stream sent too many empty messages")]
    TooManyEmptyMessages,

    /// Network or decode failure below the provider protocol.
    #[error("{0}")]
    Transport(String),
}

impl StreamError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        StreamError::Transport(err.to_string())
    }

    pub fn is_no_content(&self) -> bool {
        matches!(self, StreamError::NoContent)
    }
}

/// An in-progress completion stream.
///
/// `next` returns `false` at end-of-turn without consuming the stream: the
/// caller must run [`Stream::call_tools`], and if any tools ran, `next`
/// reopens the underlying request with the extended message list. When the
/// turn produced no tool calls the following `next` is terminally `false`.
#[async_trait]
pub trait Stream: Send {
    /// Advances the stream; `true` when [`Stream::current`] will produce a
    /// chunk from the current provider turn.
    async fn next(&mut self) -> bool;

    /// The current delta. [`StreamError::NoContent`] means "keep pulling".
    async fn current(&mut self) -> Result<Chunk, StreamError>;

    /// Executes every tool call recorded on the current assistant turn, in
    /// order, appending each result to both the provider request state and
    /// the canonical message list.
    async fn call_tools(&mut self) -> Vec<ToolCallStatus>;

    /// Releases the underlying transport. Idempotent.
    async fn close(&mut self) -> Result<(), StreamError>;

    /// Sticky terminal error, if any.
    fn err(&self) -> Option<StreamError>;

    /// The canonical conversation at current progress.
    fn messages(&self) -> Vec<Message>;
}

/// Invokes one tool through the request's caller and packages the result
/// as the paired tool message and status. A failed call folds its error
/// into the message content so the model sees what went wrong.
pub async fn call_tool(
    id: &str,
    name: &str,
    arguments: &str,
    caller: &ToolCaller,
) -> (Message, ToolCallStatus) {
    let result = (caller.as_ref())(name.to_string(), arguments.as_bytes().to_vec()).await;
    let (content, err) = match result {
        Ok(content) => (content, None),
        Err(err) => (err.clone(), Some(err)),
    };
    (
        Message {
            role: Role::Tool,
            content,
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                is_error: err.is_some(),
                function: Function {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            }],
        },
        ToolCallStatus {
            name: name.to_string(),
            err,
        },
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn caller(result: Result<String, String>) -> ToolCaller {
        Arc::new(move |_, _| {
            let result = result.clone();
            Box::pin(async move { result })
        })
    }

    #[tokio::test]
    async fn call_tool_packages_success() {
        let caller = caller(Ok("four".into()));
        let (msg, status) = call_tool("call_1", "math_add", r#"{"a":2,"b":2}"#, &caller).await;
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.content, "four");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].id, "call_1");
        assert!(!msg.tool_calls[0].is_error);
        assert_eq!(msg.tool_calls[0].function.name, "math_add");
        assert!(status.err.is_none());
    }

    #[tokio::test]
    async fn call_tool_folds_error_into_content() {
        let caller = caller(Err("server disabled".into()));
        let (msg, status) = call_tool("call_2", "math_add", "{}", &caller).await;
        assert_eq!(msg.content, "server disabled");
        assert!(msg.tool_calls[0].is_error);
        assert_eq!(status.err.as_deref(), Some("server disabled"));
    }
}
