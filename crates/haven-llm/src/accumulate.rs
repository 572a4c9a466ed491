use std::collections::BTreeMap;

use haven_core::messages::{ChatChunk, ToolCallBlock, ToolCallDelta};

/// Merges streamed tool-call fragments keyed by their integer index.
///
/// Per index: argument fragments concatenate in arrival order; the first
/// non-empty id and name win; an id never supplied by the model is
/// synthesized as `call_{index}`.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    entries: BTreeMap<u32, PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, delta: &ToolCallDelta) {
        let entry = self.entries.entry(delta.index).or_default();

        if entry.id.is_none() {
            if let Some(id) = delta.id.as_deref() {
                if !id.is_empty() {
                    entry.id = Some(id.to_string());
                }
            }
        }
        if let Some(function) = &delta.function {
            if entry.name.is_none() {
                if let Some(name) = function.name.as_deref() {
                    if !name.is_empty() {
                        entry.name = Some(name.to_string());
                    }
                }
            }
            if let Some(fragment) = function.arguments.as_deref() {
                entry.arguments.push_str(fragment);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finalize in index order.
    pub fn finish(self) -> Vec<ToolCallBlock> {
        self.entries
            .into_iter()
            .map(|(index, partial)| {
                let id = partial.id.unwrap_or_else(|| format!("call_{index}"));
                let name = partial.name.unwrap_or_default();
                ToolCallBlock::new(id, name, partial.arguments)
            })
            .collect()
    }
}

/// Accumulates one full assistant turn from a chunk stream: content text,
/// tool calls, and the final finish_reason.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    content: String,
    tool_calls: ToolCallAccumulator,
    finish_reason: Option<String>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk; returns the content delta, if any, so the caller can
    /// forward it to the live channel as it arrives.
    pub fn apply(&mut self, chunk: &ChatChunk) -> Option<String> {
        let choice = chunk.choices.first()?;

        if let Some(reason) = choice.finish_reason.as_deref() {
            self.finish_reason = Some(reason.to_string());
        }
        if let Some(deltas) = &choice.delta.tool_calls {
            for delta in deltas {
                self.tool_calls.apply(delta);
            }
        }
        if let Some(text) = choice.delta.content.as_deref() {
            self.content.push_str(text);
            return Some(text.to_string());
        }
        None
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Finalize into (content, tool_calls).
    pub fn finish(self) -> (Option<String>, Vec<ToolCallBlock>) {
        let content = if self.content.is_empty() {
            None
        } else {
            Some(self.content)
        };
        (content, self.tool_calls.finish())
    }
}
