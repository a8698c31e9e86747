use sb_core::types::TaskType;

/// Maps free text onto a [`TaskType`]. The result only biases scoring, so a
/// cheap heuristic is acceptable; a learned model can slot in later.
pub trait Classifier: Send + Sync {
    fn classify(&self, text: &str) -> TaskType;
}

/// First-match keyword containment. Rules are tried in order and the first
/// rule with any keyword contained in the lowercased text wins; no match
/// means [`TaskType::General`].
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<(TaskType, Vec<String>)>,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<(TaskType, Vec<String>)>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(t, words)| (t, words.into_iter().map(|w| w.to_lowercase()).collect()))
            .collect();
        Self { rules }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        fn words(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }
        Self::new(vec![
            (
                TaskType::Coding,
                words(&[
                    "code", "function", "python", "javascript", "typescript", "rust ", "debug",
                    "compile", "bug", "script", "program", "refactor", "sql", "algorithm",
                ]),
            ),
            (
                TaskType::Reasoning,
                words(&[
                    "why", "explain", "reason", "analyze", "analyse", "prove", "logic", "math",
                    "calculate", "compare", "solve",
                ]),
            ),
            (
                TaskType::Creative,
                words(&[
                    "story", "poem", "creative", "imagine", "song", "lyrics", "fiction", "slogan",
                    "write a",
                ]),
            ),
        ])
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, text: &str) -> TaskType {
        let lowered = text.to_lowercase();
        self.rules
            .iter()
            .find(|(_, words)| words.iter().any(|w| lowered.contains(w.as_str())))
            .map(|(task, _)| *task)
            .unwrap_or(TaskType::General)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coding_prompt() {
        let c = KeywordClassifier::default();
        assert_eq!(
            c.classify("write a python function to sort a list"),
            TaskType::Coding
        );
    }

    #[test]
    fn reasoning_and_creative_prompts() {
        let c = KeywordClassifier::default();
        assert_eq!(c.classify("Explain why the sky is blue"), TaskType::Reasoning);
        assert_eq!(c.classify("Write a poem about autumn"), TaskType::Creative);
    }

    #[test]
    fn unmatched_is_general() {
        let c = KeywordClassifier::default();
        assert_eq!(c.classify("hello there"), TaskType::General);
        assert_eq!(c.classify(""), TaskType::General);
    }

    #[test]
    fn rule_order_decides_overlaps() {
        // "story" (creative) and "debug" (coding) both present: coding comes first
        let c = KeywordClassifier::default();
        assert_eq!(c.classify("debug this story generator"), TaskType::Coding);

        let custom = KeywordClassifier::new(vec![
            (TaskType::Creative, vec!["STORY".into()]),
            (TaskType::Coding, vec!["debug".into()]),
        ]);
        assert_eq!(custom.classify("debug this story generator"), TaskType::Creative);
    }
}
