// src/models/question.rs

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// One selectable option of a choice question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub label: String,
    /// Part of the answer key; never sent to students.
    #[serde(default)]
    pub correct: bool,
}

/// A quiz question as stored by the quiz content collaborator.
///
/// Stored as tagged JSON (`{"kind": "choice", ...}`), so adding a new kind
/// means adding a variant and its grading rule here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Question {
    Choice {
        id: String,
        prompt: String,
        options: Vec<ChoiceOption>,
        /// Multiple-select when true; a single selection is expected otherwise.
        #[serde(default)]
        multiple: bool,
    },
    FreeText {
        id: String,
        prompt: String,
        /// Accepted answers, compared trimmed and case-insensitively.
        accepted: Vec<String>,
    },
}

/// A submitted answer: free text or the selected option id(s).
///
/// Untagged so clients can send `"B"` or `["A", "C"]` directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Text(String),
    Options(Vec<String>),
}

impl AnswerValue {
    /// Option ids this value selects, deduplicated. Free text selects nothing
    /// unless it is graded against a choice question.
    pub fn selections(&self) -> BTreeSet<&str> {
        match self {
            AnswerValue::Text(single) => BTreeSet::from([single.trim()]),
            AnswerValue::Options(ids) => ids.iter().map(|id| id.trim()).collect(),
        }
    }
}

impl Question {
    pub fn id(&self) -> &str {
        match self {
            Question::Choice { id, .. } | Question::FreeText { id, .. } => id,
        }
    }

    pub fn is_choice(&self) -> bool {
        matches!(self, Question::Choice { .. })
    }

    /// Option ids in display order; empty for free-text questions.
    pub fn option_ids(&self) -> Vec<&str> {
        match self {
            Question::Choice { options, .. } => options.iter().map(|o| o.id.as_str()).collect(),
            Question::FreeText { .. } => Vec::new(),
        }
    }

    /// Ids of the correct options, `None` for free-text questions.
    pub fn correct_option_ids(&self) -> Option<Vec<String>> {
        match self {
            Question::Choice { options, .. } => Some(
                options
                    .iter()
                    .filter(|o| o.correct)
                    .map(|o| o.id.clone())
                    .collect(),
            ),
            Question::FreeText { .. } => None,
        }
    }

    /// Grades `value` against this question's answer key.
    ///
    /// Malformed submissions (wrong shape, unknown option ids, empty text)
    /// are rejected rather than graded as wrong.
    pub fn evaluate(&self, value: &AnswerValue) -> Result<bool, AppError> {
        match self {
            Question::Choice {
                options, multiple, ..
            } => {
                let selected = value.selections();
                if selected.is_empty() || selected.contains("") {
                    return Err(AppError::BadRequest("No option selected".to_string()));
                }
                if !multiple && selected.len() > 1 {
                    return Err(AppError::BadRequest(
                        "This question accepts a single option".to_string(),
                    ));
                }
                if let Some(unknown) = selected
                    .iter()
                    .find(|id| !options.iter().any(|o| o.id == **id))
                {
                    return Err(AppError::BadRequest(format!(
                        "Option '{}' is not part of this question",
                        unknown
                    )));
                }

                let correct: BTreeSet<&str> = options
                    .iter()
                    .filter(|o| o.correct)
                    .map(|o| o.id.as_str())
                    .collect();
                Ok(selected == correct)
            }
            Question::FreeText { accepted, .. } => {
                let AnswerValue::Text(text) = value else {
                    return Err(AppError::BadRequest(
                        "This question expects a text answer".to_string(),
                    ));
                };
                let text = text.trim();
                if text.is_empty() {
                    return Err(AppError::BadRequest("Answer cannot be empty".to_string()));
                }
                let text = text.to_lowercase();
                Ok(accepted.iter().any(|a| a.trim().to_lowercase() == text))
            }
        }
    }

    /// Student-facing view without the answer key.
    pub fn public_view(&self) -> PublicQuestion {
        match self {
            Question::Choice {
                id,
                prompt,
                options,
                multiple,
            } => PublicQuestion {
                id: id.clone(),
                kind: "choice",
                prompt: prompt.clone(),
                options: Some(
                    options
                        .iter()
                        .map(|o| PublicOption {
                            id: o.id.clone(),
                            label: o.label.clone(),
                        })
                        .collect(),
                ),
                multiple: *multiple,
            },
            Question::FreeText { id, prompt, .. } => PublicQuestion {
                id: id.clone(),
                kind: "free_text",
                prompt: prompt.clone(),
                options: None,
                multiple: false,
            },
        }
    }
}

/// DTO for sending question to client (excludes answer key).
#[derive(Debug, Clone, Serialize)]
pub struct PublicQuestion {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<PublicOption>>,
    pub multiple: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicOption {
    pub id: String,
    pub label: String,
}

/// Quiz content resolved from a `quiz_ref`: who may host it and its
/// ordered questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    pub quiz_ref: String,
    pub owner_id: String,
    /// Co-owners allowed to host and drive sessions of this quiz.
    #[serde(default)]
    pub collaborators: Vec<String>,
    pub questions: Vec<Question>,
}

impl Quiz {
    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    pub fn question_at(&self, index: i32) -> Option<&Question> {
        usize::try_from(index).ok().and_then(|i| self.questions.get(i))
    }

    pub fn position_of(&self, question_id: &str) -> Option<usize> {
        self.questions.iter().position(|q| q.id() == question_id)
    }

    pub fn is_owner_or_collaborator(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.collaborators.iter().any(|c| c == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice(multiple: bool, correct: &[&str]) -> Question {
        Question::Choice {
            id: "q1".into(),
            prompt: "Pick".into(),
            options: ["A", "B", "C", "D"]
                .iter()
                .map(|id| ChoiceOption {
                    id: id.to_string(),
                    label: format!("Option {}", id),
                    correct: correct.contains(id),
                })
                .collect(),
            multiple,
        }
    }

    #[test]
    fn single_choice_accepts_plain_string() {
        let q = choice(false, &["B"]);
        assert!(q.evaluate(&AnswerValue::Text("B".into())).unwrap());
        assert!(!q.evaluate(&AnswerValue::Text("A".into())).unwrap());
    }

    #[test]
    fn single_choice_rejects_two_selections() {
        let q = choice(false, &["B"]);
        let err = q
            .evaluate(&AnswerValue::Options(vec!["A".into(), "B".into()]))
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }

    #[test]
    fn multiple_choice_needs_exact_set() {
        let q = choice(true, &["A", "C"]);
        assert!(q.evaluate(&AnswerValue::Options(vec!["C".into(), "A".into()])).unwrap());
        assert!(!q.evaluate(&AnswerValue::Options(vec!["A".into()])).unwrap());
        assert!(
            !q.evaluate(&AnswerValue::Options(vec!["A".into(), "B".into(), "C".into()]))
                .unwrap()
        );
    }

    #[test]
    fn duplicate_selection_counts_once() {
        let q = choice(true, &["A"]);
        assert!(q.evaluate(&AnswerValue::Options(vec!["A".into(), "A".into()])).unwrap());
    }

    #[test]
    fn unknown_option_is_rejected() {
        let q = choice(false, &["A"]);
        assert!(q.evaluate(&AnswerValue::Text("Z".into())).is_err());
        assert!(q.evaluate(&AnswerValue::Options(vec![])).is_err());
    }

    #[test]
    fn free_text_is_trimmed_and_case_insensitive() {
        let q = Question::FreeText {
            id: "q2".into(),
            prompt: "Capital of France?".into(),
            accepted: vec!["Paris".into()],
        };
        assert!(q.evaluate(&AnswerValue::Text("  paris ".into())).unwrap());
        assert!(!q.evaluate(&AnswerValue::Text("Lyon".into())).unwrap());
        assert!(q.evaluate(&AnswerValue::Text("   ".into())).is_err());
        assert!(q.evaluate(&AnswerValue::Options(vec!["Paris".into()])).is_err());
    }

    #[test]
    fn public_view_hides_answer_key() {
        let json = serde_json::to_value(choice(false, &["B"]).public_view()).unwrap();
        assert_eq!(json["type"], "choice");
        assert!(json["options"][0].get("correct").is_none());
        assert!(!json.to_string().contains("correct"));
    }

    #[test]
    fn question_json_is_tagged_by_kind() {
        let raw = serde_json::json!({
            "kind": "free_text",
            "id": "q9",
            "prompt": "2 + 2?",
            "accepted": ["4", "four"]
        });
        let q: Question = serde_json::from_value(raw).unwrap();
        assert_eq!(q.id(), "q9");
        assert!(!q.is_choice());
        assert_eq!(q.correct_option_ids(), None);
    }

    #[test]
    fn answer_value_deserializes_both_shapes() {
        let text: AnswerValue = serde_json::from_str("\"B\"").unwrap();
        let many: AnswerValue = serde_json::from_str("[\"A\",\"C\"]").unwrap();
        assert_eq!(text, AnswerValue::Text("B".into()));
        assert_eq!(many, AnswerValue::Options(vec!["A".into(), "C".into()]));
    }
}
