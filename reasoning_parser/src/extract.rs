//! One-shot reasoning extraction.

use crate::traits::TagPair;

/// Opening tags that, when a prompt ends with them, mean the model starts
/// generating inside a reasoning block.
pub const THINKING_OPEN_TAGS: &[&str] = &[
    "<think>\n",
    "<think>",
    "<thinking>\n",
    "<thinking>",
    "<|inner_prefix|>",
    "<|START_THINKING|>",
    "<seed:think>",
    "[THINK]\n",
    "[THINK]",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReasoningOptions {
    /// The prompt already opened a reasoning block, so the output starts
    /// inside it and may only carry the closing tag.
    pub thinking_forced_open: bool,
}

/// True when `prompt` ends with one of [`THINKING_OPEN_TAGS`].
pub fn detect_thinking_forced_open(prompt: &str) -> bool {
    THINKING_OPEN_TAGS.iter().any(|tag| prompt.ends_with(tag))
}

fn default_tags() -> [TagPair; 2] {
    [
        TagPair::new("<thinking>", "</thinking>"),
        TagPair::new("<think>", "</think>"),
    ]
}

/// Split `content` into `(reasoning, content)` using the `<thinking>` and
/// `<think>` tag pairs.
pub fn extract_reasoning(content: &str, opts: &ReasoningOptions) -> (String, String) {
    extract_reasoning_with_tags(content, &default_tags(), opts.thinking_forced_open)
}

/// Split `content` into `(reasoning, content)`.
///
/// Every reasoning block is trimmed and non-empty blocks are joined with a
/// blank line. Text outside blocks is concatenated untouched. An unclosed
/// block runs to the end of input, and a closing tag with no opener turns
/// everything before it into reasoning.
pub fn extract_reasoning_with_tags(
    content: &str,
    tags: &[TagPair],
    forced_open: bool,
) -> (String, String) {
    if content.is_empty() {
        return (String::new(), String::new());
    }
    if !forced_open {
        return extract_from_tags(content, tags);
    }

    let earliest_close = tags
        .iter()
        .filter_map(|pair| content.find(&pair.end).map(|idx| (idx, pair.end.len())))
        .min_by_key(|&(idx, _)| idx);
    let Some((idx, len)) = earliest_close else {
        return (content.trim().to_string(), String::new());
    };

    let mut reasoning = content[..idx].trim().to_string();
    let rest = &content[idx + len..];
    let (more, cleaned) = extract_from_tags(rest, tags);
    join_reasoning(&mut reasoning, &more);
    (reasoning, cleaned)
}

fn join_reasoning(acc: &mut String, part: &str) {
    if part.is_empty() {
        return;
    }
    if !acc.is_empty() {
        acc.push_str("\n\n");
    }
    acc.push_str(part);
}

enum Block<'t> {
    /// A closing tag with nothing opening it
    CloseOnly { close: usize, pair: &'t TagPair },
    /// An opening tag, closed at `close` if it is closed at all
    Open {
        open: usize,
        close: Option<usize>,
        pair: &'t TagPair,
    },
}

impl Block<'_> {
    fn position(&self) -> usize {
        match self {
            Block::CloseOnly { .. } => 0,
            Block::Open { open, .. } => *open,
        }
    }
}

fn next_block<'t>(rest: &str, tags: &'t [TagPair]) -> Option<Block<'t>> {
    let mut best: Option<Block<'t>> = None;
    for pair in tags {
        let open = rest.find(&pair.start);
        let close = rest.find(&pair.end);
        let candidate = match (open, close) {
            (open, Some(close)) if open.is_none_or(|open| close < open) => {
                Block::CloseOnly { close, pair }
            }
            (Some(open), _) => {
                let body = open + pair.start.len();
                Block::Open {
                    open,
                    close: rest[body..].find(&pair.end).map(|c| body + c),
                    pair,
                }
            }
            _ => continue,
        };
        let better = match (&best, &candidate) {
            (None, _) => true,
            (Some(Block::CloseOnly { close: a, .. }), Block::CloseOnly { close: b, .. }) => b < a,
            (Some(Block::CloseOnly { .. }), Block::Open { .. }) => false,
            (Some(current), _) => candidate.position() < current.position(),
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

fn extract_from_tags(content: &str, tags: &[TagPair]) -> (String, String) {
    let mut reasoning = String::new();
    let mut cleaned = String::new();
    let mut rest = content;

    while let Some(block) = next_block(rest, tags) {
        match block {
            Block::CloseOnly { close, pair } => {
                join_reasoning(&mut reasoning, rest[..close].trim());
                rest = &rest[close + pair.end.len()..];
            }
            Block::Open { open, close, pair } => {
                cleaned.push_str(&rest[..open]);
                let body = open + pair.start.len();
                match close {
                    Some(close) => {
                        join_reasoning(&mut reasoning, rest[body..close].trim());
                        rest = &rest[close + pair.end.len()..];
                    }
                    None => {
                        join_reasoning(&mut reasoning, rest[body..].trim());
                        rest = "";
                    }
                }
            }
        }
    }
    cleaned.push_str(rest);
    (reasoning, cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(content: &str) -> (String, String) {
        extract_reasoning(content, &ReasoningOptions::default())
    }

    #[test]
    fn no_tags_is_all_content() {
        assert_eq!(extract("plain answer"), (String::new(), "plain answer".into()));
        assert_eq!(extract(""), (String::new(), String::new()));
    }

    #[test]
    fn single_block() {
        let (reasoning, content) = extract("<think>\nstep one\n</think>\n\nThe answer is 4.");
        assert_eq!(reasoning, "step one");
        assert_eq!(content, "\n\nThe answer is 4.");
    }

    #[test]
    fn multiple_blocks_are_joined() {
        let (reasoning, content) =
            extract("a<think>first</think>b<thinking> second </thinking>c<think></think>d");
        assert_eq!(reasoning, "first\n\nsecond");
        assert_eq!(content, "abcd");
    }

    #[test]
    fn unclosed_block_runs_to_end() {
        let (reasoning, content) = extract("Intro <thinking>still going");
        assert_eq!(reasoning, "still going");
        assert_eq!(content, "Intro ");
    }

    #[test]
    fn closing_tag_without_opener() {
        let (reasoning, content) = extract("thought about it</think>Answer");
        assert_eq!(reasoning, "thought about it");
        assert_eq!(content, "Answer");
    }

    #[test]
    fn forced_open() {
        let opts = ReasoningOptions {
            thinking_forced_open: true,
        };
        assert_eq!(
            extract_reasoning("mulling", &opts),
            ("mulling".into(), String::new())
        );
        let (reasoning, content) =
            extract_reasoning(" plan </think>Hi<think>more</think>!", &opts);
        assert_eq!(reasoning, "plan\n\nmore");
        assert_eq!(content, "Hi!");
    }

    #[test]
    fn detects_forced_open_prompts() {
        assert!(detect_thinking_forced_open("<|im_start|>assistant\n<think>\n"));
        assert!(detect_thinking_forced_open("prompt [THINK]"));
        assert!(detect_thinking_forced_open("x<seed:think>"));
        assert!(!detect_thinking_forced_open("<think>done</think>"));
    }

    #[test]
    fn every_visible_character_survives() {
        let input = "pre<think>a b</think>mid<thinking>c</thinking>post";
        let (reasoning, content) = extract(input);
        let stripped: String = input
            .replace("<thinking>", "")
            .replace("</thinking>", "")
            .replace("<think>", "")
            .replace("</think>", "")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let mut seen: Vec<char> = format!("{reasoning}{content}")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let mut expected: Vec<char> = stripped.chars().collect();
        seen.sort_unstable();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}
