//! Inline `<think>` block splitting
//!
//! Some OpenAI-compatible upstreams return their reasoning inline, wrapped in
//! `<think>...</think>` at the start of the content. The splitter moves that
//! block into `reasoning_content`, incrementally for streams.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum State {
    /// Nothing but whitespace seen so far
    #[default]
    Head,
    Think,
    /// Whitespace between the closing tag and the answer
    Gap,
    Body,
}

/// Incremental splitter for one content stream.
///
/// Only a block opening the content is treated as reasoning. Tags appearing
/// later pass through untouched.
#[derive(Debug, Default)]
pub struct ThinkSplitter {
    state: State,
    pending: String,
}

impl ThinkSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next fragment and return `(reasoning, content)` ready to emit.
    ///
    /// A fragment ending in part of a tag is held back until the next call.
    pub fn process(&mut self, fragment: &str) -> (String, String) {
        let mut reasoning = String::new();
        let mut content = String::new();
        self.pending.push_str(fragment);

        loop {
            match self.state {
                State::Head => {
                    let trimmed = self.pending.trim_start();
                    if let Some(rest) = trimmed.strip_prefix(OPEN_TAG) {
                        self.pending = rest.to_string();
                        self.state = State::Think;
                    } else if OPEN_TAG.starts_with(trimmed) {
                        break;
                    } else {
                        self.state = State::Body;
                    }
                }
                State::Think => match self.pending.find(CLOSE_TAG) {
                    Some(end) => {
                        reasoning.push_str(&self.pending[..end]);
                        self.pending.drain(..end + CLOSE_TAG.len());
                        self.state = State::Gap;
                    }
                    None => {
                        let held = partial_tag_suffix(&self.pending, CLOSE_TAG);
                        let split = self.pending.len() - held;
                        reasoning.push_str(&self.pending[..split]);
                        self.pending.drain(..split);
                        break;
                    }
                },
                State::Gap => {
                    let trimmed = self.pending.trim_start();
                    if trimmed.is_empty() {
                        self.pending.clear();
                        break;
                    }
                    self.pending = trimmed.to_string();
                    self.state = State::Body;
                }
                State::Body => {
                    content.push_str(&self.pending);
                    self.pending.clear();
                    break;
                }
            }
        }

        (reasoning, content)
    }

    /// Flush whatever is still held back at the end of the stream
    pub fn finish(&mut self) -> (String, String) {
        let pending = std::mem::take(&mut self.pending);
        match self.state {
            State::Think => (pending, String::new()),
            State::Head | State::Body => (String::new(), pending),
            State::Gap => (String::new(), String::new()),
        }
    }
}

/// Split a complete content string into `(reasoning, content)`
pub fn split_think(text: &str) -> (String, String) {
    let mut splitter = ThinkSplitter::new();
    let (mut reasoning, mut content) = splitter.process(text);
    let (rest_reasoning, rest_content) = splitter.finish();
    reasoning.push_str(&rest_reasoning);
    content.push_str(&rest_content);
    (reasoning, content)
}

/// Length of the longest suffix of `text` that could start `tag`
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&len| text.ends_with(&tag[..len]))
        .unwrap_or(0)
}
