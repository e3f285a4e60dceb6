use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationKind {
    /// Automatically graded; a submitted quiz lands in `completed`.
    Graded,
    /// Contains items that need manual grading; a submitted quiz lands in `pending`.
    ManualReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    FreeText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(rename = "correctOption", skip_serializing_if = "Option::is_none")]
    pub correct_option: Option<i64>,
    #[serde(rename = "referenceAnswer", skip_serializing_if = "Option::is_none")]
    pub reference_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(rename = "canShuffle", default)]
    pub can_shuffle: bool,
}

/// Student-facing projection of a question. Never carries the answer key.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionView {
    pub id: i64,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub options: Vec<String>,
    pub weight: f64,
    #[serde(rename = "canShuffle")]
    pub can_shuffle: bool,
}

impl From<&Question> for QuestionView {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id,
            prompt: q.prompt.clone(),
            image: q.image.clone(),
            kind: q.kind,
            options: q.options.clone(),
            weight: q.weight.unwrap_or(1.0),
            can_shuffle: q.can_shuffle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizState {
    Started,
    InProgress,
    Pending,
    Completed,
}

impl QuizState {
    pub fn is_ended(self) -> bool {
        matches!(self, QuizState::Pending | QuizState::Completed)
    }
}

/// One question's answer slot within a quiz. The full slot set is fixed when
/// the quiz is created and equals exactly the sampled question set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseSlot {
    pub answer: Option<String>,
    pub score: Option<f64>,
    pub done: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizRecord {
    pub id: i64,
    pub evaluation_id: i64,
    pub student_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_score: Option<f64>,
    pub is_accepted: Option<bool>,
    pub state: QuizState,
    /// question id -> slot; BTreeMap keeps response listings stable.
    pub responses: BTreeMap<i64, ResponseSlot>,
}

impl QuizRecord {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Submitted answer resolved against the question kind. Raw client input is a
/// plain string; the ambiguity is settled here, not carried through the store.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmittedAnswer {
    Choice(i64),
    Text(String),
    Blank,
}

pub fn parse_answer(kind: QuestionKind, raw: Option<&str>) -> SubmittedAnswer {
    let raw = match raw.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return SubmittedAnswer::Blank,
    };
    match kind {
        // A malformed option index degrades to an unanswered item rather
        // than failing the submission.
        QuestionKind::MultipleChoice => match raw.parse::<i64>() {
            Ok(n) => SubmittedAnswer::Choice(n),
            Err(_) => SubmittedAnswer::Blank,
        },
        QuestionKind::FreeText => SubmittedAnswer::Text(raw.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Correct,
    Wrong,
    Unanswered,
    /// Free-text item, left to manual grading.
    Manual,
}

#[derive(Debug, Clone)]
pub struct ItemScore {
    pub score: f64,
    pub outcome: Outcome,
    /// Canonical form written back onto the slot.
    pub stored_answer: Option<String>,
}

/// Scores one question against a raw submitted answer. Pure: reads only the
/// question fields already loaded by the caller.
pub fn score_response(question: &Question, raw_answer: Option<&str>) -> ItemScore {
    match question.kind {
        QuestionKind::MultipleChoice => match parse_answer(question.kind, raw_answer) {
            SubmittedAnswer::Choice(n) => {
                if question.correct_option == Some(n) {
                    ItemScore {
                        score: question.weight.unwrap_or(1.0),
                        outcome: Outcome::Correct,
                        stored_answer: Some(n.to_string()),
                    }
                } else {
                    ItemScore {
                        score: 0.0,
                        outcome: Outcome::Wrong,
                        stored_answer: Some(n.to_string()),
                    }
                }
            }
            _ => ItemScore {
                score: 0.0,
                outcome: Outcome::Unanswered,
                stored_answer: None,
            },
        },
        QuestionKind::FreeText => {
            let text = raw_answer
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            ItemScore {
                score: 0.0,
                outcome: Outcome::Manual,
                stored_answer: text,
            }
        }
    }
}

/// Running totals across one submission. Free-text items never enter the
/// percentage denominator or the correct/wrong counters.
#[derive(Debug, Clone, Default)]
pub struct Scorecard {
    pub total_score: f64,
    pub correct: u32,
    pub wrong: u32,
    pub multiple_choice_total: u32,
}

impl Scorecard {
    pub fn record(&mut self, kind: QuestionKind, item: &ItemScore) {
        self.total_score += item.score;
        if kind == QuestionKind::MultipleChoice {
            self.multiple_choice_total += 1;
        }
        match item.outcome {
            Outcome::Correct => self.correct += 1,
            Outcome::Wrong => self.wrong += 1,
            Outcome::Unanswered | Outcome::Manual => {}
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.multiple_choice_total == 0 {
            0.0
        } else {
            (self.correct as f64) * 100.0 / (self.multiple_choice_total as f64)
        }
    }

    /// Acceptance compares the percentage, never the raw point total, against
    /// the evaluation threshold. A zero/unset threshold never accepts.
    pub fn is_accepted(&self, accept_score: i64) -> bool {
        accept_score > 0 && self.percentage() >= accept_score as f64
    }
}

/// Display rounding. Internal values keep full precision.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseView {
    #[serde(rename = "questionId")]
    pub question_id: i64,
    pub answer: Option<String>,
    pub score: Option<f64>,
    pub done: Option<String>,
}

/// Final outcome of one quiz, as delivered to the caller and cached on the
/// launch for idempotent re-delivery.
#[derive(Debug, Clone, Serialize)]
pub struct QuizResult {
    #[serde(rename = "quizId")]
    pub quiz_id: i64,
    #[serde(rename = "totalQuestions")]
    pub total_questions: usize,
    #[serde(rename = "correctCount")]
    pub correct_count: u32,
    #[serde(rename = "wrongCount")]
    pub wrong_count: u32,
    pub percentage: f64,
    #[serde(rename = "totalScore")]
    pub total_score: f64,
    #[serde(rename = "isAccepted")]
    pub is_accepted: bool,
    pub state: QuizState,
    pub responses: Vec<ResponseView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

pub fn validate_questions(questions: &[Question]) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    for (i, q) in questions.iter().enumerate() {
        if q.prompt.trim().is_empty() {
            issues.push(ValidationIssue {
                field: format!("questions[{i}].prompt"),
                issue: "must not be empty".into(),
            });
        }
        if let Some(w) = q.weight {
            if !w.is_finite() || w < 0.0 {
                issues.push(ValidationIssue {
                    field: format!("questions[{i}].weight"),
                    issue: "must be a non-negative number".into(),
                });
            }
        }
        match q.kind {
            QuestionKind::MultipleChoice => {
                if q.options.len() < 2 || q.options.len() > 4 {
                    issues.push(ValidationIssue {
                        field: format!("questions[{i}].options"),
                        issue: "must contain 2 to 4 options".into(),
                    });
                }
                match q.correct_option {
                    None => issues.push(ValidationIssue {
                        field: format!("questions[{i}].correctOption"),
                        issue: "is required for multiple choice".into(),
                    }),
                    Some(c) if c < 1 || c as usize > q.options.len() => {
                        issues.push(ValidationIssue {
                            field: format!("questions[{i}].correctOption"),
                            issue: "must reference an existing option".into(),
                        })
                    }
                    Some(_) => {}
                }
            }
            QuestionKind::FreeText => {
                if !q.options.is_empty() {
                    issues.push(ValidationIssue {
                        field: format!("questions[{i}].options"),
                        issue: "must be absent for free text".into(),
                    });
                }
            }
        }
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mc_question(correct: i64, weight: Option<f64>) -> Question {
        Question {
            id: 1,
            prompt: "Pick one".into(),
            image: None,
            kind: QuestionKind::MultipleChoice,
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            correct_option: Some(correct),
            reference_answer: None,
            weight,
            can_shuffle: false,
        }
    }

    fn free_text_question() -> Question {
        Question {
            id: 2,
            prompt: "Explain".into(),
            image: None,
            kind: QuestionKind::FreeText,
            options: vec![],
            correct_option: None,
            reference_answer: Some("anything".into()),
            weight: None,
            can_shuffle: false,
        }
    }

    #[test]
    fn parse_answer_resolves_by_kind() {
        assert_eq!(
            parse_answer(QuestionKind::MultipleChoice, Some("3")),
            SubmittedAnswer::Choice(3)
        );
        assert_eq!(
            parse_answer(QuestionKind::MultipleChoice, Some("not a number")),
            SubmittedAnswer::Blank
        );
        assert_eq!(
            parse_answer(QuestionKind::MultipleChoice, Some("  ")),
            SubmittedAnswer::Blank
        );
        assert_eq!(parse_answer(QuestionKind::FreeText, None), SubmittedAnswer::Blank);
        assert_eq!(
            parse_answer(QuestionKind::FreeText, Some(" text ")),
            SubmittedAnswer::Text("text".into())
        );
    }

    #[test]
    fn weighted_multiple_choice_scoring() {
        let q = mc_question(2, Some(1.5));

        let hit = score_response(&q, Some("2"));
        assert_eq!(hit.outcome, Outcome::Correct);
        assert_eq!(hit.score, 1.5);
        assert_eq!(hit.stored_answer.as_deref(), Some("2"));

        let miss = score_response(&q, Some("3"));
        assert_eq!(miss.outcome, Outcome::Wrong);
        assert_eq!(miss.score, 0.0);

        let blank = score_response(&q, Some(""));
        assert_eq!(blank.outcome, Outcome::Unanswered);
        assert_eq!(blank.score, 0.0);
        assert!(blank.stored_answer.is_none());

        let omitted = score_response(&q, None);
        assert_eq!(omitted.outcome, Outcome::Unanswered);
    }

    #[test]
    fn default_weight_is_one() {
        let q = mc_question(1, None);
        assert_eq!(score_response(&q, Some("1")).score, 1.0);
    }

    #[test]
    fn free_text_is_manual_and_scoreless() {
        let q = free_text_question();
        let item = score_response(&q, Some("  my essay  "));
        assert_eq!(item.outcome, Outcome::Manual);
        assert_eq!(item.score, 0.0);
        assert_eq!(item.stored_answer.as_deref(), Some("my essay"));

        let empty = score_response(&q, Some("   "));
        assert!(empty.stored_answer.is_none());
    }

    #[test]
    fn scorecard_percentage_and_acceptance() {
        let q = mc_question(1, None);
        let mut card = Scorecard::default();
        for ans in ["1", "1", "1", "2"] {
            card.record(QuestionKind::MultipleChoice, &score_response(&q, Some(ans)));
        }
        assert_eq!(card.correct, 3);
        assert_eq!(card.wrong, 1);
        assert_eq!(card.multiple_choice_total, 4);
        assert_eq!(card.percentage(), 75.0);
        assert!(card.is_accepted(70));
        assert!(!card.is_accepted(80));
        assert!(!card.is_accepted(0));
    }

    #[test]
    fn unanswered_counts_into_denominator_only() {
        let q = mc_question(1, None);
        let mut card = Scorecard::default();
        card.record(QuestionKind::MultipleChoice, &score_response(&q, Some("1")));
        card.record(QuestionKind::MultipleChoice, &score_response(&q, None));
        assert_eq!(card.correct, 1);
        assert_eq!(card.wrong, 0);
        assert_eq!(card.multiple_choice_total, 2);
        assert_eq!(card.percentage(), 50.0);
    }

    #[test]
    fn free_text_only_never_accepts() {
        let q = free_text_question();
        let mut card = Scorecard::default();
        card.record(QuestionKind::FreeText, &score_response(&q, Some("answer")));
        assert_eq!(card.percentage(), 0.0);
        assert!(!card.is_accepted(10));
    }

    #[test]
    fn question_view_strips_answer_key() {
        let view = QuestionView::from(&mc_question(2, Some(2.0)));
        let raw = serde_json::to_string(&view).unwrap();
        assert!(!raw.contains("correctOption"));
        assert!(!raw.contains("referenceAnswer"));
        assert!(raw.contains("\"weight\":2.0"));
    }

    #[test]
    fn validate_questions_negative() {
        let mut bad = mc_question(7, Some(-1.0));
        bad.prompt = " ".into();
        let issues = validate_questions(&[bad]).unwrap_err();
        assert!(issues.iter().any(|i| i.field.contains("prompt")));
        assert!(issues.iter().any(|i| i.field.contains("weight")));
        assert!(issues.iter().any(|i| i.field.contains("correctOption")));
    }

    #[test]
    fn round2_is_display_only() {
        assert_eq!(round2(66.66666), 66.67);
        assert_eq!(round2(75.0), 75.0);
    }
}
