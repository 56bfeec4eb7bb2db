//! # Region Detection
//!
//! The target service reveals the catalogue region either in the final URL
//! of a redirect (`/sg-en/title/...`) or somewhere in the page body. Body
//! rules are tried in a fixed order and the first match wins. Nothing here
//! ever falls back to a default region.

use regex::Regex;

/// A named body pattern. Capture group 1 holds the region code.
#[derive(Debug, Clone)]
pub struct RegionRule {
    pub label: &'static str,
    pattern: Regex,
}

impl RegionRule {
    /// # Errors
    /// Returns the regex error when `pattern` does not compile.
    pub fn new(label: &'static str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            label,
            pattern: Regex::new(pattern)?,
        })
    }

    fn capture(&self, text: &str) -> Option<String> {
        self.pattern
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_uppercase())
    }
}

const CODE: &str = r"([A-Za-z]{2}(?:-[A-Za-z]{2})?)";

/// Built-in body rules, in priority order.
fn builtin_rules() -> Vec<(&'static str, String)> {
    vec![
        ("geoCountry", format!(r#""geoCountry"\s*:\s*"{CODE}""#)),
        ("countryCode", format!(r#""countryCode"\s*:\s*"{CODE}""#)),
        ("data-geo", format!(r#"data-geo="{CODE}""#)),
        ("location", format!(r#""location"\s*:\s*"{CODE}""#)),
        ("geolocation", format!(r#"\\?"geolocation\\?"\s*:\s*\\?"{CODE}\\?""#)),
        (
            "reactContext",
            format!(r#"window\.netflix\.reactContext\.models\.geo\.country\s*=\s*["']{CODE}["']"#),
        ),
    ]
}

/// # Region Extractor
///
/// Ordered list of [`RegionRule`]s applied to a response body.
#[derive(Debug, Clone)]
pub struct RegionExtractor {
    rules: Vec<RegionRule>,
}

impl RegionExtractor {
    pub fn new(rules: Vec<RegionRule>) -> Self {
        Self { rules }
    }

    /// First rule that matches wins.
    pub fn extract(&self, text: &str) -> Option<String> {
        self.rules.iter().find_map(|rule| rule.capture(text))
    }

    pub fn rules(&self) -> &[RegionRule] {
        &self.rules
    }
}

impl Default for RegionExtractor {
    fn default() -> Self {
        let rules = builtin_rules()
            .into_iter()
            .filter_map(|(label, pattern)| RegionRule::new(label, &pattern).ok())
            .collect();
        Self { rules }
    }
}

/// Region code embedded in a path such as `/sg-en/title/81280792`.
///
/// Only the segment directly before `title` counts, and only when it is
/// shaped like `xx` or `xx-yy`; `/title/70143836` and `/tv/show/1` yield
/// `None`.
pub fn region_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    segments
        .windows(2)
        .find(|pair| pair[1].eq_ignore_ascii_case("title"))
        .map(|pair| pair[0])
        .filter(|s| is_region_code(s))
        .map(|s| s.to_ascii_uppercase())
}

fn is_region_code(segment: &str) -> bool {
    let mut parts = segment.split('-');
    let two_letters = |p: &str| p.len() == 2 && p.chars().all(|c| c.is_ascii_alphabetic());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), None, None) => two_letters(a),
        (Some(a), Some(b), None) => two_letters(a) && two_letters(b),
        _ => false,
    }
}
