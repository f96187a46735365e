//! Thinking-level policy shared by the chat session and the agentic loop.
//!
//! A closed set of six levels controls how much reasoning budget an LLM call
//! gets: temperature, max tokens, and an appended system-prompt suffix all
//! scale together as the level rises. [`parse_command`] recognizes an inline
//! `<prefix>:<level>` token in free text without pulling in a regex crate.

use std::fmt;

/// Ordered from least to most reasoning effort. `Default` is [`ThinkingLevel::Medium`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThinkingLevel {
    Off,
    Minimal,
    Low,
    Medium,
    High,
    XHigh,
}

impl Default for ThinkingLevel {
    fn default() -> Self {
        ThinkingLevel::Medium
    }
}

impl fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ThinkingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Minimal => "minimal",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::XHigh => "xhigh",
        }
    }

    pub fn parse(s: &str) -> Option<ThinkingLevel> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Some(ThinkingLevel::Off),
            "minimal" => Some(ThinkingLevel::Minimal),
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            "xhigh" => Some(ThinkingLevel::XHigh),
            _ => None,
        }
    }

    /// All six levels in ascending order.
    pub const ALL: [ThinkingLevel; 6] = [
        ThinkingLevel::Off,
        ThinkingLevel::Minimal,
        ThinkingLevel::Low,
        ThinkingLevel::Medium,
        ThinkingLevel::High,
        ThinkingLevel::XHigh,
    ];
}

/// The derived LLM call parameters for a given level.
#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_suffix: &'static str,
}

/// Total function mapping a level to its call parameters. Temperature and
/// `max_tokens` are monotonic nondecreasing across [`ThinkingLevel::ALL`].
pub fn params_for(level: ThinkingLevel) -> ThinkingParams {
    match level {
        ThinkingLevel::Off => ThinkingParams {
            temperature: 0.0,
            max_tokens: 256,
            system_suffix: "",
        },
        ThinkingLevel::Minimal => ThinkingParams {
            temperature: 0.2,
            max_tokens: 512,
            system_suffix: "Answer directly and concisely.",
        },
        ThinkingLevel::Low => ThinkingParams {
            temperature: 0.3,
            max_tokens: 1024,
            system_suffix: "Think briefly before answering.",
        },
        ThinkingLevel::Medium => ThinkingParams {
            temperature: 0.5,
            max_tokens: 2048,
            system_suffix: "Reason step by step before giving your final answer.",
        },
        ThinkingLevel::High => ThinkingParams {
            temperature: 0.6,
            max_tokens: 4096,
            system_suffix: "Reason step by step, consider alternatives, then give your final answer. \
                Double check the answer against the original request before responding.",
        },
        ThinkingLevel::XHigh => ThinkingParams {
            temperature: 0.7,
            max_tokens: 8192,
            system_suffix: "Reason step by step, consider multiple alternatives and their tradeoffs, \
                self-critique your reasoning, then give your final answer. \
                Double check the answer against the original request before responding.",
        },
    }
}

/// Scan `text` for a `<prefix>:<level>` token (e.g. `thinking:high`) and
/// return the parsed level if found. Matching is case-insensitive and does
/// not require the token to be the whole message.
pub fn parse_command(text: &str, prefix: &str) -> Option<ThinkingLevel> {
    let lower = text.to_ascii_lowercase();
    let needle = format!("{}:", prefix.to_ascii_lowercase());
    let start = lower.find(&needle)? + needle.len();
    let rest = &text[start..];
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    ThinkingLevel::parse(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_monotonic_nondecreasing() {
        let mut prev_temp = f32::MIN;
        let mut prev_tokens = 0u32;
        for level in ThinkingLevel::ALL {
            let p = params_for(level);
            assert!(p.temperature >= prev_temp);
            assert!(p.max_tokens >= prev_tokens);
            prev_temp = p.temperature;
            prev_tokens = p.max_tokens;
        }
    }

    #[test]
    fn default_is_medium() {
        assert_eq!(ThinkingLevel::default(), ThinkingLevel::Medium);
    }

    #[test]
    fn parse_command_extracts_level_from_free_text() {
        assert_eq!(
            parse_command("thinking:high please", "thinking"),
            Some(ThinkingLevel::High)
        );
        assert_eq!(parse_command("hello there", "thinking"), None);
        assert_eq!(parse_command("THINKING:XHIGH", "thinking"), Some(ThinkingLevel::XHigh));
    }

    #[test]
    fn parse_rejects_unknown_level() {
        assert_eq!(ThinkingLevel::parse("extreme"), None);
    }
}
