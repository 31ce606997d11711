use anyhow::{Context, Result};
use regex::{Captures, Regex};

/// A regex that only matches when it covers the whole input. Prompt and
/// pager detection, as well as most device-output parsing, test complete
/// lines (or complete partial buffers) rather than substrings.
#[derive(Debug, Clone)]
pub struct FullMatch(Regex);

impl FullMatch {
    pub fn new(pattern: &str) -> Result<Self> {
        let anchored = format!(r"\A(?:{pattern})\z");
        let regex = Regex::new(&anchored)
            .with_context(|| format!("invalid pattern '{pattern}'"))?;
        Ok(FullMatch(regex))
    }

    pub fn is_match(&self, input: &str) -> bool {
        self.0.is_match(input)
    }

    pub fn captures<'t>(&self, input: &'t str) -> Option<Captures<'t>> {
        self.0.captures(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_does_not_match() {
        let prompt = FullMatch::new("[a-zA-Z0-9_-]+>").expect("pattern");
        assert!(prompt.is_match("switch-01>"));
        assert!(!prompt.is_match("switch-01> show version"));
        assert!(!prompt.is_match("log: switch-01>"));
    }

    #[test]
    fn captures_are_relative_to_whole_input() {
        let line = FullMatch::new(r"MAC address *: (.*)").expect("pattern");
        let caps = line.captures("MAC address    : 00:11:22:33:44:55").expect("match");
        assert_eq!(&caps[1], "00:11:22:33:44:55");
        assert!(line.captures("  MAC address : x").is_none());
    }
}
