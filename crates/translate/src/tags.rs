//! Reasoning/answer tag handling
//!
//! K2Think wraps its chain of thought in `<think>…</think>` and the final
//! reply in `<answer>…</answer>`. Which parts reach the client depends on the
//! model name the client asked for.

use crate::wire::MODEL_ID_NOTHINK;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const ANSWER_OPEN: &str = "<answer>";
const ANSWER_CLOSE: &str = "</answer>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingMode {
    /// Reasoning stays in the output, only the outer answer tags go
    Visible,
    /// Only the answer body is returned
    Hidden,
}

impl ThinkingMode {
    pub fn for_model(model: &str) -> Self {
        if model == MODEL_ID_NOTHINK {
            Self::Hidden
        } else {
            Self::Visible
        }
    }
}

/// Strip tags from a raw upstream answer.
///
/// Visible: drop the first `<answer>` and the last `</answer>`, keep the rest.
/// Hidden: drop the first `<think>`…`</think>` span, then keep only what lies
/// between the first `<answer>` and the last `</answer>` when both exist.
/// Both modes trim surrounding whitespace.
pub fn extract_answer(raw: &str, mode: ThinkingMode) -> String {
    match mode {
        ThinkingMode::Visible => {
            let mut text = raw.to_string();
            if let Some(start) = text.find(ANSWER_OPEN) {
                text.replace_range(start..start + ANSWER_OPEN.len(), "");
            }
            if let Some(end) = text.rfind(ANSWER_CLOSE) {
                text.replace_range(end..end + ANSWER_CLOSE.len(), "");
            }
            text.trim().to_string()
        }
        ThinkingMode::Hidden => {
            let mut text = raw.to_string();
            if let (Some(start), Some(end)) = (text.find(THINK_OPEN), text.find(THINK_CLOSE)) {
                if end >= start {
                    text.replace_range(start..end + THINK_CLOSE.len(), "");
                }
            }

            match (text.find(ANSWER_OPEN), text.rfind(ANSWER_CLOSE)) {
                (Some(start), Some(end)) => {
                    let body_start = start + ANSWER_OPEN.len();
                    text.get(body_start..end).unwrap_or("").trim().to_string()
                }
                _ => text.trim().to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MODEL_ID;

    const SAMPLE: &str = "<think>reason</think><answer>hi</answer>";

    #[test]
    fn visible_keeps_reasoning() {
        assert_eq!(
            extract_answer(SAMPLE, ThinkingMode::Visible),
            "<think>reason</think>hi"
        );
    }

    #[test]
    fn hidden_returns_answer_only() {
        assert_eq!(extract_answer(SAMPLE, ThinkingMode::Hidden), "hi");
    }

    #[test]
    fn visible_removes_only_outer_answer_tags() {
        let raw = "  <answer>a <answer>nested</answer> b</answer>\n";
        assert_eq!(
            extract_answer(raw, ThinkingMode::Visible),
            "a <answer>nested</answer> b"
        );
    }

    #[test]
    fn hidden_without_answer_tags_returns_remainder() {
        let raw = "<think>long chain</think>\n plain reply ";
        assert_eq!(extract_answer(raw, ThinkingMode::Hidden), "plain reply");
    }

    #[test]
    fn hidden_with_unclosed_think_keeps_text() {
        let raw = "<think>never closed <answer>x</answer>";
        assert_eq!(extract_answer(raw, ThinkingMode::Hidden), "x");
    }

    #[test]
    fn untagged_text_is_trimmed() {
        assert_eq!(extract_answer("  hello \n", ThinkingMode::Visible), "hello");
        assert_eq!(extract_answer("  hello \n", ThinkingMode::Hidden), "hello");
        assert_eq!(extract_answer("", ThinkingMode::Hidden), "");
    }

    #[test]
    fn mode_follows_model_name() {
        assert_eq!(ThinkingMode::for_model(MODEL_ID), ThinkingMode::Visible);
        assert_eq!(
            ThinkingMode::for_model(MODEL_ID_NOTHINK),
            ThinkingMode::Hidden
        );
        assert_eq!(ThinkingMode::for_model("gpt-4o"), ThinkingMode::Visible);
    }
}
