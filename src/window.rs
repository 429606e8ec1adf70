use regex::{Regex, RegexBuilder};

use crate::{config::Config, error::ProviderFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The 24-hour customer-service window has elapsed; only templates go out.
    WindowExpired,
    Other,
}

/// Decides whether a provider failure means the session window is closed.
///
/// Codes and message patterns come from configuration since they follow
/// the provider's wording, not ours.
#[derive(Debug, Clone)]
pub struct WindowClassifier {
    codes: Vec<i64>,
    patterns: Vec<Regex>,
}

impl WindowClassifier {
    pub fn new(codes: Vec<i64>, patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|pattern| {
                match RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(err) => {
                        tracing::warn!(%pattern, error = %err, "ignoring invalid window error pattern");
                        None
                    }
                }
            })
            .collect();
        Self { codes, patterns }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.window_error_codes.clone(),
            &config.window_error_patterns,
        )
    }

    pub fn classify(&self, code: Option<i64>, message: &str) -> FailureKind {
        if code.is_some_and(|c| self.codes.contains(&c)) {
            return FailureKind::WindowExpired;
        }
        if self.patterns.iter().any(|re| re.is_match(message)) {
            return FailureKind::WindowExpired;
        }
        FailureKind::Other
    }

    pub fn classify_failure(&self, failure: &ProviderFailure) -> FailureKind {
        self.classify(failure.code, &failure.full_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> WindowClassifier {
        WindowClassifier::from_config(&Config::default())
    }

    #[test]
    fn recognizes_window_code() {
        assert_eq!(
            classifier().classify(Some(131047), "anything"),
            FailureKind::WindowExpired
        );
    }

    #[test]
    fn recognizes_message_substrings_case_insensitively() {
        let c = classifier();
        assert_eq!(
            c.classify(None, "(#131047) Re-engagement message"),
            FailureKind::WindowExpired
        );
        assert_eq!(
            c.classify(Some(100), "More than 24 hours have passed since the customer last replied"),
            FailureKind::WindowExpired
        );
        assert_eq!(
            c.classify(None, "Message is outside the allowed window"),
            FailureKind::WindowExpired
        );
    }

    #[test]
    fn other_failures_stay_other() {
        let c = classifier();
        assert_eq!(
            c.classify(Some(131026), "Message undeliverable"),
            FailureKind::Other
        );
        assert_eq!(
            c.classify(Some(190), "Invalid OAuth access token"),
            FailureKind::Other
        );
        assert_eq!(c.classify(None, ""), FailureKind::Other);
        assert_eq!(
            c.classify(Some(131056), "Pair rate limit hit, retry within 24 hours"),
            FailureKind::Other
        );
        assert_eq!(
            c.classify(Some(80007), "Rate limit reached for the next 24-hour period"),
            FailureKind::Other
        );
    }

    #[test]
    fn configured_signals_replace_defaults() {
        let c = WindowClassifier::new(vec![42], &["session closed".to_string(), "(".to_string()]);
        assert_eq!(c.classify(Some(42), ""), FailureKind::WindowExpired);
        assert_eq!(c.classify(None, "Session Closed by provider"), FailureKind::WindowExpired);
        assert_eq!(c.classify(Some(131047), "re-engagement"), FailureKind::Other);
    }

    #[test]
    fn classifies_parsed_failures() {
        let failure = ProviderFailure::from_response(
            400,
            r#"{"error":{"message":"Re-engagement message","code":131047}}"#.to_string(),
        );
        assert_eq!(classifier().classify_failure(&failure), FailureKind::WindowExpired);
    }
}
