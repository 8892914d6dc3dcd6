use anyhow::{anyhow, Result};

use crate::workflow::WorkflowError;

pub const PROSPECT: &str = "Prospect";
pub const APPLIED: &str = "Applied";
pub const CLOSED: &str = "Closed";

/// Suggested follow-on for a stage: what to do and how many days out it is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextAction {
    pub text: String,
    pub days_out: u32,
}

#[derive(Debug, Clone)]
struct StageRule {
    name: String,
    next_action: Option<NextAction>,
}

/// Ordered pipeline stages and the next-action table.
///
/// Exactly one stage is terminal and carries no next action; every other stage
/// must have one with a positive day offset. Built once and shared read-only.
#[derive(Debug, Clone)]
pub struct StageVocabulary {
    rules: Vec<StageRule>,
    applied_index: usize,
    terminal_index: usize,
}

impl StageVocabulary {
    /// `stages` is the ordered list of `(name, Some((action, days)))`, with `None`
    /// marking the terminal stage. `applied` names the first stage that counts as
    /// having applied.
    pub fn new(stages: Vec<(&str, Option<(&str, u32)>)>, applied: &str) -> Result<Self> {
        let mut rules = Vec::with_capacity(stages.len());
        let mut terminal_index = None;

        for (idx, (name, action)) in stages.into_iter().enumerate() {
            if rules.iter().any(|r: &StageRule| r.name == name) {
                return Err(anyhow!("Duplicate stage '{}'", name));
            }
            let next_action = match action {
                Some((text, days_out)) => {
                    if text.trim().is_empty() || days_out == 0 {
                        return Err(anyhow!(
                            "Stage '{}' needs a non-empty next action and a positive day offset",
                            name
                        ));
                    }
                    Some(NextAction { text: text.to_string(), days_out })
                }
                None => {
                    if terminal_index.replace(idx).is_some() {
                        return Err(anyhow!("Only one terminal stage is allowed"));
                    }
                    None
                }
            };
            rules.push(StageRule { name: name.to_string(), next_action });
        }

        let terminal_index = terminal_index.ok_or_else(|| anyhow!("No terminal stage defined"))?;
        let applied_index = rules
            .iter()
            .position(|r| r.name == applied)
            .ok_or_else(|| anyhow!("Applied stage '{}' is not in the vocabulary", applied))?;

        Ok(Self { rules, applied_index, terminal_index })
    }

    /// The shipped pipeline.
    pub fn standard() -> Self {
        Self {
            rules: vec![
                rule(PROSPECT, Some(("Research the company and find a warm contact", 2))),
                rule("Warm Lead", Some(("Send Day 0 outreach or submit the application", 2))),
                rule(APPLIED, Some(("Check application status and nudge a contact", 7))),
                rule("Recruiter Screen", Some(("Send thank-you note and prep for hiring manager", 2))),
                rule("HM Interview", Some(("Send thank-you note and follow up on next steps", 3))),
                rule("Loop", Some(("Follow up with recruiter on loop feedback", 3))),
                rule("Offer Pending", Some(("Review offer details and prepare negotiation points", 2))),
                rule(CLOSED, None),
            ],
            applied_index: 2,
            terminal_index: 7,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn position(&self, stage: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.name == stage)
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.position(stage).is_some()
    }

    pub fn initial(&self) -> &str {
        &self.rules[0].name
    }

    pub fn terminal(&self) -> &str {
        &self.rules[self.terminal_index].name
    }

    pub fn is_terminal(&self, stage: &str) -> bool {
        self.terminal() == stage
    }

    pub fn is_applied_or_later(&self, stage: &str) -> bool {
        self.position(stage).is_some_and(|idx| idx >= self.applied_index)
    }

    /// The stage after `stage` in pipeline order, if any.
    pub fn next_stage(&self, stage: &str) -> Option<&str> {
        let idx = self.position(stage)?;
        self.rules.get(idx + 1).map(|r| r.name.as_str())
    }

    /// Next action for a non-terminal stage.
    pub fn calculate_next_action(&self, stage: &str) -> Result<NextAction, WorkflowError> {
        self.rules
            .iter()
            .find(|r| r.name == stage)
            .and_then(|r| r.next_action.clone())
            .ok_or_else(|| self.invalid_stage(stage))
    }

    /// Case-insensitive lookup for user input, returning the canonical name.
    pub fn resolve(&self, input: &str) -> Result<&str, WorkflowError> {
        let wanted = input.trim().to_lowercase();
        self.rules
            .iter()
            .find(|r| r.name.to_lowercase() == wanted)
            .map(|r| r.name.as_str())
            .ok_or_else(|| self.invalid_stage(input))
    }

    pub(crate) fn invalid_stage(&self, stage: &str) -> WorkflowError {
        WorkflowError::InvalidStage {
            stage: stage.to_string(),
            suggestion: self.closest(stage).map(str::to_string),
        }
    }

    fn closest(&self, input: &str) -> Option<&str> {
        let wanted = input.to_lowercase();
        self.rules
            .iter()
            .map(|r| (r.name.as_str(), strsim::jaro_winkler(&wanted, &r.name.to_lowercase())))
            .filter(|(_, score)| *score >= 0.8)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(name, _)| name)
    }
}

impl Default for StageVocabulary {
    fn default() -> Self {
        Self::standard()
    }
}

fn rule(name: &str, action: Option<(&str, u32)>) -> StageRule {
    StageRule {
        name: name.to_string(),
        next_action: action.map(|(text, days_out)| NextAction { text: text.to_string(), days_out }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_next_action_all_stages() {
        let vocab = StageVocabulary::standard();
        for stage in vocab.names().filter(|s| *s != CLOSED) {
            let action = vocab.calculate_next_action(stage).unwrap();
            assert!(!action.text.is_empty(), "{} has empty action", stage);
            assert!(action.days_out > 0, "{} has zero offset", stage);
        }
    }

    #[test]
    fn test_calculate_next_action_is_deterministic() {
        let vocab = StageVocabulary::standard();
        assert_eq!(
            vocab.calculate_next_action("Applied").unwrap(),
            vocab.calculate_next_action("Applied").unwrap()
        );
    }

    #[test]
    fn test_terminal_stage_has_no_next_action() {
        let vocab = StageVocabulary::standard();
        let err = vocab.calculate_next_action(CLOSED).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStage { .. }));
    }

    #[test]
    fn test_unknown_stage_suggests_closest() {
        let vocab = StageVocabulary::standard();
        match vocab.calculate_next_action("Aplied").unwrap_err() {
            WorkflowError::InvalidStage { stage, suggestion } => {
                assert_eq!(stage, "Aplied");
                assert_eq!(suggestion.as_deref(), Some("Applied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_standard_vocabulary_shape() {
        let vocab = StageVocabulary::standard();
        assert_eq!(vocab.len(), 8);
        assert_eq!(vocab.initial(), PROSPECT);
        assert_eq!(vocab.terminal(), CLOSED);
        assert!(!vocab.is_applied_or_later("Warm Lead"));
        assert!(vocab.is_applied_or_later("Applied"));
        assert!(vocab.is_applied_or_later("Offer Pending"));
        assert!(vocab.is_applied_or_later(CLOSED));
        assert_eq!(vocab.next_stage("Loop"), Some("Offer Pending"));
        assert_eq!(vocab.next_stage(CLOSED), None);
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let vocab = StageVocabulary::standard();
        assert_eq!(vocab.resolve("hm interview").unwrap(), "HM Interview");
        assert!(vocab.resolve("Ghosted").is_err());
    }

    #[test]
    fn test_custom_vocabulary() {
        let vocab = StageVocabulary::new(
            vec![
                ("Lead", Some(("Reach out", 1))),
                ("Submitted", Some(("Wait", 5))),
                ("Done", None),
            ],
            "Submitted",
        )
        .unwrap();
        assert_eq!(vocab.terminal(), "Done");
        assert_eq!(vocab.calculate_next_action("Submitted").unwrap().days_out, 5);
        assert!(vocab.is_applied_or_later("Done"));
    }

    #[test]
    fn test_custom_vocabulary_rejects_bad_tables() {
        assert!(StageVocabulary::new(vec![("A", Some(("x", 1)))], "A").is_err());
        assert!(StageVocabulary::new(vec![("A", Some(("x", 0))), ("B", None)], "A").is_err());
        assert!(StageVocabulary::new(vec![("A", None), ("B", None)], "A").is_err());
        assert!(StageVocabulary::new(vec![("A", Some(("x", 1))), ("B", None)], "C").is_err());
    }
}
