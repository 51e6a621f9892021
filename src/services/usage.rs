//! Usage fallbacks shared by the response normalizers

use crate::models::meta::Meta;
use crate::models::openai::Usage;
use crate::utils::tokenizer::count_text_tokens;

/// Final usage of a text response.
///
/// Missing counters are filled from the pre-counted prompt tokens and the
/// token count of the completion text. The result always satisfies
/// `total = prompt + completion`.
pub fn resolve_usage(reported: Option<Usage>, completion_text: &str, meta: &Meta) -> Usage {
    let mut usage = reported.unwrap_or_default();
    if usage.total_tokens == 0 {
        usage.total_tokens = usage.prompt_tokens.saturating_add(usage.completion_tokens);
    }

    if usage.total_tokens == 0 {
        return Usage::new(
            meta.input_tokens,
            count_text_tokens(completion_text, &meta.actual_model),
        );
    }

    if usage.prompt_tokens == 0 {
        return Usage::new(
            meta.input_tokens,
            usage.total_tokens.saturating_sub(meta.input_tokens),
        );
    }

    if usage.completion_tokens == 0 && usage.total_tokens > usage.prompt_tokens {
        usage.completion_tokens = usage.total_tokens - usage.prompt_tokens;
    }

    Usage::new(usage.prompt_tokens, usage.completion_tokens)
}

/// Usage of an input-only mode (embeddings, moderations, rerank)
pub fn resolve_input_usage(reported: Option<Usage>, meta: &Meta) -> Usage {
    match reported {
        Some(usage) if usage.prompt_tokens != 0 => {
            Usage::new(usage.prompt_tokens, usage.completion_tokens)
        }
        Some(usage) if usage.total_tokens != 0 => Usage::new(usage.total_tokens, 0),
        _ => Usage::new(meta.input_tokens, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::{Channel, ChannelType};
    use crate::models::mode::Mode;
    use std::sync::Arc;

    fn meta(input_tokens: u32) -> Meta {
        let channel = Arc::new(Channel::new(1, ChannelType::OpenAI, "sk"));
        Meta::new(Mode::ChatCompletions, channel, "gpt-4o", false).with_input_tokens(input_tokens)
    }

    #[test]
    fn test_reported_usage_kept() {
        let usage = resolve_usage(Some(Usage::new(5, 2)), "ignored", &meta(100));
        assert_eq!(usage, Usage::new(5, 2));
    }

    #[test]
    fn test_missing_usage_counts_text() {
        let usage = resolve_usage(None, "hello world", &meta(12));
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, count_text_tokens("hello world", "gpt-4o"));
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[test]
    fn test_total_without_prompt() {
        let reported = Usage { prompt_tokens: 0, completion_tokens: 0, total_tokens: 30 };
        let usage = resolve_usage(Some(reported), "", &meta(10));
        assert_eq!(usage, Usage::new(10, 20));

        let usage = resolve_usage(Some(reported), "", &meta(50));
        assert_eq!(usage, Usage::new(50, 0));
    }

    #[test]
    fn test_split_counters_without_total() {
        let reported = Usage { prompt_tokens: 7, completion_tokens: 3, total_tokens: 0 };
        assert_eq!(resolve_usage(Some(reported), "text", &meta(1)), Usage::new(7, 3));
    }

    #[test]
    fn test_input_usage() {
        assert_eq!(resolve_input_usage(None, &meta(9)), Usage::new(9, 0));
        let reported = Usage { prompt_tokens: 0, completion_tokens: 0, total_tokens: 4 };
        assert_eq!(resolve_input_usage(Some(reported), &meta(9)), Usage::new(4, 0));
    }
}
