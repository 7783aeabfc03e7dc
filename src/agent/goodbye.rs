use async_trait::async_trait;

/// Decides whether agent text means the call should end.
#[async_trait]
pub trait GoodbyeDetector: Send + Sync {
    async fn is_goodbye(&self, text: &str) -> bool;
}

/// Matches a fixed phrase anywhere in the text, ignoring case.
#[derive(Debug, Clone)]
pub struct PhraseGoodbyeDetector {
    phrase: String,
}

impl PhraseGoodbyeDetector {
    pub fn new(phrase: &str) -> Self {
        Self {
            phrase: phrase.to_lowercase(),
        }
    }
}

#[async_trait]
impl GoodbyeDetector for PhraseGoodbyeDetector {
    async fn is_goodbye(&self, text: &str) -> bool {
        !self.phrase.is_empty() && text.to_lowercase().contains(&self.phrase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_phrase_match_ignores_case() {
        let detector = PhraseGoodbyeDetector::new("STOP CALL");
        assert!(detector.is_goodbye("Thanks for calling. stop call").await);
        assert!(detector.is_goodbye("STOP CALL").await);
        assert!(!detector.is_goodbye("Please stop calling me names").await);
        assert!(!detector.is_goodbye("Sure, let me help.").await);
    }

    #[tokio::test]
    async fn test_empty_phrase_never_matches() {
        let detector = PhraseGoodbyeDetector::new("");
        assert!(!detector.is_goodbye("anything").await);
    }
}
