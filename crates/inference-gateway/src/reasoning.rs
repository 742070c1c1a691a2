//! Reasoning extraction.
//!
//! Splits `<think>`-style blocks out of a completion so the visible answer
//! and the model's reasoning can be returned separately.

use serde::{Deserialize, Serialize};

/// A start/end marker pair delimiting one reasoning block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPair {
    pub start: String,
    pub end: String,
}

impl TagPair {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self { start: start.into(), end: end.into() }
    }

    fn is_valid(&self) -> bool {
        !self.start.is_empty() && !self.end.is_empty()
    }
}

const DEFAULT_TAG_PAIRS: &[(&str, &str)] = &[
    ("<thinking>", "</thinking>"),
    ("<think>", "</think>"),
    ("<|START_THINKING|>", "<|END_THINKING|>"),
    ("<|inner_prefix|>", "<|inner_suffix|>"),
    ("<seed:think>", "</seed:think>"),
    ("<|think|>", "<|end|><|begin|>assistant<|content|>"),
    ("[THINK]", "[/THINK]"),
];

pub fn default_tag_pairs() -> Vec<TagPair> {
    DEFAULT_TAG_PAIRS.iter().map(|(s, e)| TagPair::new(*s, *e)).collect()
}

/// Per-model reasoning settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    /// The prompt already opened a thinking block, so output starts inside one.
    pub thinking_forced_open: bool,
    pub disable_reasoning: bool,
    pub disable_reasoning_tag_prefill: bool,
    /// Clean the content but drop the extracted reasoning.
    pub strip_reasoning_only: bool,
    /// Tried before the defaults.
    pub tag_pairs: Vec<TagPair>,
    pub thinking_start_tokens: Vec<String>,
}

impl ReasoningConfig {
    /// User pairs first, then the defaults; pairs with an empty side are dropped.
    pub fn active_pairs(&self) -> Vec<TagPair> {
        self.tag_pairs
            .iter()
            .cloned()
            .chain(default_tag_pairs())
            .filter(TagPair::is_valid)
            .collect()
    }

    fn start_tokens(&self) -> Vec<String> {
        self.thinking_start_tokens
            .iter()
            .filter(|t| !t.is_empty())
            .cloned()
            .chain(self.active_pairs().into_iter().map(|p| p.start))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub reasoning: String,
    pub cleaned_content: String,
}

/// Separates reasoning blocks from `content`.
pub fn extract_reasoning(content: &str, config: &ReasoningConfig) -> Extracted {
    if config.disable_reasoning || content.is_empty() {
        return Extracted { reasoning: String::new(), cleaned_content: content.to_string() };
    }

    let pairs = config.active_pairs();
    let mut extracted = if config.thinking_forced_open {
        extract_forced_open(content, &pairs)
    } else {
        extract_from_tags(content, &pairs)
    };
    if config.strip_reasoning_only {
        extracted.reasoning.clear();
    }
    extracted
}

/// Everything up to the first closing tag is reasoning; the rest goes
/// through normal extraction.
fn extract_forced_open(content: &str, pairs: &[TagPair]) -> Extracted {
    let close = pairs
        .iter()
        .filter_map(|p| content.find(&p.end).map(|idx| (idx, p.end.len())))
        .min_by_key(|(idx, _)| *idx);

    let Some((idx, len)) = close else {
        return Extracted { reasoning: content.trim().to_string(), cleaned_content: String::new() };
    };

    let mut parts = Vec::new();
    let head = content[..idx].trim();
    if !head.is_empty() {
        parts.push(head.to_string());
    }
    let rest = extract_from_tags(&content[idx + len..], pairs);
    if !rest.reasoning.is_empty() {
        parts.push(rest.reasoning);
    }
    Extracted { reasoning: parts.join("\n\n"), cleaned_content: rest.cleaned_content }
}

fn extract_from_tags(content: &str, pairs: &[TagPair]) -> Extracted {
    let mut reasoning_parts: Vec<&str> = Vec::new();
    let mut cleaned = String::with_capacity(content.len());
    let mut pos = 0;

    while pos < content.len() {
        let rest = &content[pos..];
        // Earliest start tag; on a tie the first pair in priority order wins.
        let hit = pairs
            .iter()
            .filter_map(|p| rest.find(&p.start).map(|idx| (idx, p)))
            .min_by_key(|(idx, _)| *idx);

        // A closing tag with no opening tag of its own before it: the text
        // leading up to it is reasoning.
        let stray_close = pairs
            .iter()
            .filter_map(|p| {
                let end_idx = rest.find(&p.end)?;
                match rest.find(&p.start) {
                    Some(start_idx) if start_idx <= end_idx => None,
                    _ => Some((end_idx, p.end.len())),
                }
            })
            .min_by_key(|(idx, _)| *idx);

        if let Some((end_idx, len)) = stray_close {
            if hit.map_or(true, |(start_idx, _)| end_idx < start_idx) {
                let body = rest[..end_idx].trim();
                if !body.is_empty() {
                    reasoning_parts.push(body);
                }
                pos += end_idx + len;
                continue;
            }
        }

        let Some((start_idx, pair)) = hit else {
            cleaned.push_str(rest);
            break;
        };

        cleaned.push_str(&rest[..start_idx]);
        let body_start = start_idx + pair.start.len();
        match rest[body_start..].find(&pair.end) {
            Some(end_idx) => {
                let body = rest[body_start..body_start + end_idx].trim();
                if !body.is_empty() {
                    reasoning_parts.push(body);
                }
                pos += body_start + end_idx + pair.end.len();
            }
            None => {
                let body = rest[body_start..].trim();
                if !body.is_empty() {
                    reasoning_parts.push(body);
                }
                break;
            }
        }
    }

    Extracted { reasoning: reasoning_parts.join("\n\n"), cleaned_content: cleaned }
}

/// The start token the prompt ends with, if any. Trailing whitespace is ignored.
pub fn detect_thinking_start_token(prompt: &str, config: &ReasoningConfig) -> Option<String> {
    let trimmed = prompt.trim_end();
    config.start_tokens().into_iter().find(|t| trimmed.ends_with(t.trim_end()))
}

/// Inserts `token` after the leading whitespace of `content` unless it is already there.
pub fn prepend_thinking_token_if_needed(content: &str, token: &str) -> String {
    if token.is_empty() {
        return content.to_string();
    }
    let body = content.trim_start();
    if body.starts_with(token) {
        return content.to_string();
    }
    let lead = &content[..content.len() - body.len()];
    format!("{}{}{}", lead, token, body)
}

/// Applies tag prefill and extraction to a full completion.
///
/// `prompt_token` is the start token detected at the end of the prompt.
pub fn process_completion(content: &str, prompt_token: Option<&str>, config: &ReasoningConfig) -> Extracted {
    if config.disable_reasoning {
        return extract_reasoning(content, config);
    }
    match prompt_token {
        Some(token) if !config.disable_reasoning_tag_prefill => {
            extract_reasoning(&prepend_thinking_token_if_needed(content, token), config)
        }
        _ => extract_reasoning(content, config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn extract(s: &str) -> Extracted {
        extract_reasoning(s, &ReasoningConfig::default())
    }

    #[test]
    fn test_mixed_default_tags() {
        let out = extract("Hello <thinking>step 1</thinking> world <think>step 2</think>");
        assert_eq!(out.reasoning, "step 1\n\nstep 2");
        assert_eq!(out.cleaned_content, "Hello  world ");
    }

    #[test]
    fn test_no_tags_is_untouched() {
        let out = extract("just an answer");
        assert_eq!(out, Extracted { reasoning: String::new(), cleaned_content: "just an answer".into() });
    }

    #[test]
    fn test_unclosed_tag_absorbs_rest() {
        let out = extract("Answer <think>still going");
        assert_eq!(out.reasoning, "still going");
        assert_eq!(out.cleaned_content, "Answer ");
    }

    #[test]
    fn test_special_token_pairs() {
        let out = extract("<|START_THINKING|>plan<|END_THINKING|>done [THINK]more[/THINK]!");
        assert_eq!(out.reasoning, "plan\n\nmore");
        assert_eq!(out.cleaned_content, "done !");
    }

    #[test]
    fn test_user_pairs_take_precedence() {
        let config = ReasoningConfig {
            tag_pairs: vec![TagPair::new("<r>", "</r>"), TagPair::new("", "</x>")],
            ..Default::default()
        };
        let out = extract_reasoning("a<r>why</r>b", &config);
        assert_eq!(out.reasoning, "why");
        assert_eq!(out.cleaned_content, "ab");
        assert_eq!(config.active_pairs()[0], TagPair::new("<r>", "</r>"));
        assert_eq!(config.active_pairs().len(), DEFAULT_TAG_PAIRS.len() + 1);
    }

    #[test]
    fn test_disable_and_strip_only() {
        let input = "x<think>y</think>z";
        let disabled = ReasoningConfig { disable_reasoning: true, ..Default::default() };
        assert_eq!(extract_reasoning(input, &disabled).cleaned_content, input);

        let strip = ReasoningConfig { strip_reasoning_only: true, ..Default::default() };
        let out = extract_reasoning(input, &strip);
        assert_eq!(out.reasoning, "");
        assert_eq!(out.cleaned_content, "xz");
    }

    #[test]
    fn test_forced_open() {
        let config = ReasoningConfig { thinking_forced_open: true, ..Default::default() };
        let out = extract_reasoning("first thought</think>answer<think>again</think>", &config);
        assert_eq!(out.reasoning, "first thought\n\nagain");
        assert_eq!(out.cleaned_content, "answer");

        let out = extract_reasoning("never closed", &config);
        assert_eq!(out.reasoning, "never closed");
        assert_eq!(out.cleaned_content, "");
    }

    #[test]
    fn test_detect_thinking_start_token() {
        let config = ReasoningConfig::default();
        assert_eq!(
            detect_thinking_start_token("<|im_start|>assistant\n<think>\n", &config).as_deref(),
            Some("<think>")
        );
        assert_eq!(detect_thinking_start_token("plain prompt", &config), None);

        let custom = ReasoningConfig { thinking_start_tokens: vec!["<reason>".into()], ..Default::default() };
        assert_eq!(detect_thinking_start_token("go <reason>", &custom).as_deref(), Some("<reason>"));
    }

    #[test]
    fn test_prepend_thinking_token() {
        assert_eq!(prepend_thinking_token_if_needed("  idea</think>ok", "<think>"), "  <think>idea</think>ok");
        assert_eq!(prepend_thinking_token_if_needed("<think>idea", "<think>"), "<think>idea");
        assert_eq!(prepend_thinking_token_if_needed("abc", ""), "abc");
    }

    #[test]
    fn test_process_completion_prefills() {
        let config = ReasoningConfig::default();
        let out = process_completion("idea</think>answer", Some("<think>"), &config);
        assert_eq!(out.reasoning, "idea");
        assert_eq!(out.cleaned_content, "answer");

        let no_prefill = ReasoningConfig { disable_reasoning_tag_prefill: true, ..Default::default() };
        let out = process_completion("idea</think>answer", Some("<think>"), &no_prefill);
        assert_eq!(out.reasoning, "idea");
        assert_eq!(out.cleaned_content, "answer");
    }

    #[test]
    fn test_closing_tag_without_opening() {
        let out = extract("idea</think>answer");
        assert_eq!(out.reasoning, "idea");
        assert_eq!(out.cleaned_content, "answer");

        let out = extract("  plan </thinking> reply <think>more</think>!");
        assert_eq!(out.reasoning, "plan\n\nmore");
        assert_eq!(out.cleaned_content, " reply !");

        // A start tag ahead of the close keeps the normal pairing.
        let out = extract("a<think>b</think>c");
        assert_eq!(out.reasoning, "b");
        assert_eq!(out.cleaned_content, "ac");
    }

    fn arb_segment() -> impl Strategy<Value = String> {
        let plain = "[a-zA-Z0-9 .,\n]{0,12}";
        let pair = prop::sample::select(DEFAULT_TAG_PAIRS.to_vec());
        prop_oneof![
            plain.prop_map(|s| s),
            (pair, plain).prop_map(|((s, e), body)| format!("{}{}{}", s, body, e)),
        ]
    }

    proptest! {
        #[test]
        fn prop_cleaned_content_is_a_fixed_point(
            segments in prop::collection::vec(arb_segment(), 0..6),
            tail in prop::option::of(("[a-z ]{0,8}", prop::sample::select(DEFAULT_TAG_PAIRS.to_vec()))),
        ) {
            let mut input: String = segments.concat();
            if let Some((body, (start, _))) = tail {
                input.push_str(start);
                input.push_str(&body);
            }
            let first = extract(&input);
            let second = extract(&first.cleaned_content);
            prop_assert_eq!(&second.cleaned_content, &first.cleaned_content);
            prop_assert_eq!(second.reasoning, "");
        }
    }
}
