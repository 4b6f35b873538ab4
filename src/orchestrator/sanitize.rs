//! 生成结果清洗：去掉角色前缀、占位 token，识别并去掉结束标记

use std::sync::OnceLock;

use regex::Regex;

use crate::agents::AgentDefinition;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<\|[^|>]*\|>|</?s>").expect("static regex"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub text: String,
    /// 出现过结束标记
    pub ended: bool,
}

pub fn sanitize(raw: &str, agent: &AgentDefinition, end_marker: &str) -> Sanitized {
    let mut text = placeholder_re().replace_all(raw, "").into_owned();

    let ended = !end_marker.is_empty() && text.contains(end_marker);
    if ended {
        text = text.replace(end_marker, "");
    }

    let prefixes = [
        "assistant:".to_string(),
        format!("{}:", agent.name.to_lowercase()),
        format!("{}:", agent.mention_handle.to_lowercase()),
    ];
    let mut rest = text.trim();
    loop {
        let lower = rest.to_lowercase();
        let Some(prefix) = prefixes.iter().find(|p| lower.starts_with(p.as_str())) else {
            break;
        };
        // 前缀均为 ASCII 或与原文逐字对应，按字符数截取
        let skip: usize = rest.chars().take(prefix.chars().count()).map(char::len_utf8).sum();
        rest = rest[skip..].trim_start();
    }

    Sanitized {
        text: rest.trim().to_string(),
        ended,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentId;

    fn ada() -> AgentDefinition {
        AgentDefinition {
            id: AgentId(0),
            name: "Ada".to_string(),
            mention_handle: "<@42>".to_string(),
            generation_endpoint: String::new(),
            delivery_endpoint: String::new(),
        }
    }

    #[test]
    fn test_strips_prefixes_and_placeholders() {
        let out = sanitize("<s>Assistant: ada: Hello <|eot_id|>there</s>", &ada(), "[END]");
        assert_eq!(out.text, "Hello there");
        assert!(!out.ended);

        let out = sanitize("<@42>: sure thing", &ada(), "[END]");
        assert_eq!(out.text, "sure thing");
    }

    #[test]
    fn test_end_marker_detected_and_removed() {
        let out = sanitize("Goodbye everyone! [END]", &ada(), "[END]");
        assert_eq!(out.text, "Goodbye everyone!");
        assert!(out.ended);

        let out = sanitize("  [END]  ", &ada(), "[END]");
        assert_eq!(out.text, "");
        assert!(out.ended);
    }

    #[test]
    fn test_name_inside_text_kept() {
        let out = sanitize("I agree with Ada: tests first.", &ada(), "[END]");
        assert_eq!(out.text, "I agree with Ada: tests first.");
    }
}
