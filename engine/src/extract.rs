//! Incremental detection of tool invocations in streamed assistant text.
//!
//! A block is `<name>` ... `</name>` for a registered tool name. Its body is a
//! sequence of `<param>value</param>` elements separated by whitespace:
//!
//! ```text
//! <read_file>
//! <path>src/main.rs</path>
//! </read_file>
//! ```
//!
//! The extractor keeps the whole turn's text and a scan cursor. A block is
//! reported the moment its closing tag is seen; an unterminated block, or a
//! `<` that could still grow into an opening tag, holds the cursor until more
//! text arrives. Every decision depends only on text that can no longer
//! change, so chunking never changes the result.

use drover_types::ToolInvocation;
use serde_json::{Map, Value};

const SNIPPET_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolParseError {
    #[error("parameter <{param}> is never closed")]
    UnterminatedParameter { param: String },
    #[error("unexpected text between parameters: {snippet:?}")]
    UnexpectedText { snippet: String },
    #[error("parameter tag has an empty name")]
    EmptyParameterName,
    #[error("parameter <{param}> appears more than once")]
    DuplicateParameter { param: String },
}

/// One result of scanning: a well-formed invocation or a malformed block.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Invocation(ToolInvocation),
    ParseError { tool: String, error: ToolParseError },
}

#[derive(Debug, Clone)]
struct Tag {
    name: String,
    open: String,
    close: String,
}

enum OpenTag {
    Complete(usize),
    Partial,
    None,
}

#[derive(Debug)]
pub struct ToolCallExtractor {
    tags: Vec<Tag>,
    id_prefix: String,
    buffer: String,
    cursor: usize,
    /// Open tag offset of the unterminated block and where its close-tag
    /// search resumes.
    pending_close: Option<(usize, usize)>,
    next_index: usize,
    detected: Vec<Extraction>,
}

impl ToolCallExtractor {
    /// `id_prefix` names the turn; invocation ids are `{id_prefix}-{n}`.
    #[must_use]
    pub fn new<I, S>(tool_names: I, id_prefix: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags = tool_names
            .into_iter()
            .map(Into::into)
            .filter(|name: &String| !name.is_empty())
            .map(|name| Tag {
                open: format!("<{name}>"),
                close: format!("</{name}>"),
                name,
            })
            .collect();
        Self {
            tags,
            id_prefix: id_prefix.into(),
            buffer: String::new(),
            cursor: 0,
            pending_close: None,
            next_index: 0,
            detected: Vec::new(),
        }
    }

    /// Append streamed text; returns blocks completed by this chunk.
    pub fn push(&mut self, chunk: &str) -> Vec<Extraction> {
        self.buffer.push_str(chunk);
        let found = self.scan();
        self.detected.extend(found.iter().cloned());
        found
    }

    /// Align with the authoritative final message text and return every
    /// extraction of the turn.
    ///
    /// When the streamed text is a prefix of the final text only the remainder
    /// is scanned; otherwise the final text is rescanned from the start.
    pub fn reconcile(&mut self, final_text: &str) -> Vec<Extraction> {
        if let Some(rest) = final_text.strip_prefix(self.buffer.as_str()) {
            let rest = rest.to_string();
            self.push(&rest);
        } else {
            tracing::debug!(
                streamed = self.buffer.len(),
                final_len = final_text.len(),
                "Final text diverged from streamed text; rescanning"
            );
            self.buffer.clear();
            self.cursor = 0;
            self.pending_close = None;
            self.next_index = 0;
            self.detected.clear();
            self.push(final_text);
        }
        self.detected.clone()
    }

    /// Name of a block that was opened but never closed, if any.
    #[must_use]
    pub fn finish(&self) -> Option<&str> {
        match self.match_open(self.cursor) {
            OpenTag::Complete(index) => Some(self.tags[index].name.as_str()),
            OpenTag::Partial | OpenTag::None => None,
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.buffer
    }

    fn match_open(&self, start: usize) -> OpenTag {
        let Some(tail) = self.buffer.get(start..) else {
            return OpenTag::None;
        };
        if tail.is_empty() {
            return OpenTag::None;
        }
        let mut partial = false;
        for (index, tag) in self.tags.iter().enumerate() {
            if tail.starts_with(tag.open.as_str()) {
                return OpenTag::Complete(index);
            }
            if tag.open.starts_with(tail) {
                partial = true;
            }
        }
        if partial {
            OpenTag::Partial
        } else {
            OpenTag::None
        }
    }

    fn scan(&mut self) -> Vec<Extraction> {
        let mut found = Vec::new();
        loop {
            let Some(offset) = self.buffer[self.cursor..].find('<') else {
                self.cursor = self.buffer.len();
                break;
            };
            let start = self.cursor + offset;
            match self.match_open(start) {
                OpenTag::Complete(index) => {
                    let tag = self.tags[index].clone();
                    let body_start = start + tag.open.len();
                    let search_from = match self.pending_close {
                        Some((open, from)) if open == start => from.max(body_start),
                        _ => body_start,
                    };
                    let Some(found_at) = self.buffer[search_from..].find(tag.close.as_str()) else {
                        self.cursor = start;
                        self.pending_close = Some((start, self.close_resume_offset(&tag)));
                        break;
                    };
                    self.pending_close = None;
                    let body_len = search_from + found_at - body_start;
                    let parsed = parse_parameters(&self.buffer[body_start..body_start + body_len]);
                    self.cursor = body_start + body_len + tag.close.len();
                    found.push(match parsed {
                        Ok(params) => Extraction::Invocation(self.invocation(&tag.name, params)),
                        Err(error) => Extraction::ParseError {
                            tool: tag.name,
                            error,
                        },
                    });
                }
                OpenTag::Partial => {
                    self.cursor = start;
                    break;
                }
                OpenTag::None => self.cursor = start + 1,
            }
        }
        found
    }

    /// Earliest offset where a close tag could still begin: its length minus
    /// one byte back from the end, on a char boundary.
    fn close_resume_offset(&self, tag: &Tag) -> usize {
        let mut offset = self.buffer.len().saturating_sub(tag.close.len() - 1);
        while !self.buffer.is_char_boundary(offset) {
            offset -= 1;
        }
        offset
    }

    fn invocation(&mut self, name: &str, params: Map<String, Value>) -> ToolInvocation {
        let id = format!("{}-{}", self.id_prefix, self.next_index);
        self.next_index += 1;
        tracing::debug!(tool = name, id = %id, "Tool invocation detected");
        ToolInvocation::detected(id, name, Value::Object(params))
    }
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

fn trim_one_newline(value: &str) -> &str {
    let value = value
        .strip_prefix("\r\n")
        .or_else(|| value.strip_prefix('\n'))
        .unwrap_or(value);
    value
        .strip_suffix("\r\n")
        .or_else(|| value.strip_suffix('\n'))
        .unwrap_or(value)
}

fn is_param_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_parameters(body: &str) -> Result<Map<String, Value>, ToolParseError> {
    let mut params = Map::new();
    let mut rest = body;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return Ok(params);
        }
        let unexpected = || ToolParseError::UnexpectedText {
            snippet: snippet(rest),
        };
        let after_open = rest.strip_prefix('<').ok_or_else(unexpected)?;
        let name_end = after_open.find('>').ok_or_else(unexpected)?;
        let name = &after_open[..name_end];
        if name.is_empty() {
            return Err(ToolParseError::EmptyParameterName);
        }
        if !is_param_name(name) {
            return Err(unexpected());
        }

        let value_region = &after_open[name_end + 1..];
        let close = format!("</{name}>");
        let Some(value_len) = value_region.find(&close) else {
            return Err(ToolParseError::UnterminatedParameter {
                param: name.to_string(),
            });
        };
        if params.contains_key(name) {
            return Err(ToolParseError::DuplicateParameter {
                param: name.to_string(),
            });
        }
        let value = trim_one_newline(&value_region[..value_len]);
        params.insert(name.to_string(), Value::String(value.to_string()));
        rest = &value_region[value_len + close.len()..];
    }
}
