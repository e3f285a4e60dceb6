use crate::error::SessionError;
use crate::models::{
    round2, score_response, QuizRecord, QuizResult, QuizState, ResponseSlot, ResponseView,
    Scorecard,
};
use crate::state::{AppState, EvaluationRecord, ResultSnapshot};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;

/// One item of a submission, as sent by the client. The answer is always a
/// raw string; the scoring engine resolves it against the question kind.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedResponse {
    #[serde(rename = "questionId")]
    pub question_id: i64,
    pub answer: Option<String>,
    pub done: Option<String>,
}

/// Quiz lifecycle: start-or-resume, answer upsert, submit-once, result.
///
/// Every operation takes the quizzes write lock for its whole critical
/// section, so the look-up-open-else-create sequence in `start_or_resume`
/// is linearizable per (student, evaluation) and two concurrent starts can
/// never both insert.
impl AppState {
    pub async fn start_or_resume_quiz(
        &self,
        evaluation: &EvaluationRecord,
        student_id: i64,
    ) -> Result<(QuizRecord, bool), SessionError> {
        let mut quizzes = self.db.quizzes.write().await;

        let open = quizzes
            .values()
            .find(|q| {
                q.evaluation_id == evaluation.id && q.student_id == student_id && !q.is_ended()
            })
            .cloned();
        if let Some(quiz) = open {
            // Resume: keep the sampled set and any recorded answers untouched.
            return Ok((quiz, true));
        }

        let sampled =
            crate::state::sample_question_ids(evaluation, evaluation.number_of_questions)?;

        let mut responses = BTreeMap::new();
        for question_id in sampled {
            responses.insert(question_id, ResponseSlot::default());
        }

        let quiz = QuizRecord {
            id: self.db.next_quiz_id(),
            evaluation_id: evaluation.id,
            student_id,
            started_at: Utc::now(),
            ended_at: None,
            total_score: None,
            is_accepted: None,
            state: QuizState::Started,
            responses,
        };
        quizzes.insert(quiz.id, quiz.clone());
        info!(quiz_id = quiz.id, evaluation_id = evaluation.id, student_id, "quiz started");
        Ok((quiz, false))
    }

    /// Last-write-wins upsert of a single answer. Never touches the score;
    /// scoring happens only at submit.
    pub async fn record_answer(
        &self,
        quiz_id: i64,
        question_id: i64,
        answer: Option<String>,
        done: Option<String>,
    ) -> Result<(), SessionError> {
        let mut quizzes = self.db.quizzes.write().await;
        let quiz = quizzes.get_mut(&quiz_id).ok_or(SessionError::NotFound("quiz"))?;
        if quiz.is_ended() {
            return Err(SessionError::QuizAlreadyEnded);
        }
        let slot = quiz
            .responses
            .get_mut(&question_id)
            .ok_or(SessionError::QuestionNotInQuiz)?;
        slot.answer = answer.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
        if done.is_some() {
            slot.done = done;
        }
        if quiz.state == QuizState::Started {
            quiz.state = QuizState::InProgress;
        }
        Ok(())
    }

    /// Finalizes the quiz: applies the submitted answers onto the fixed slot
    /// set, scores every slot exactly once, and writes the aggregate. Replays
    /// surface as `QuizAlreadyEnded` so the boundary can answer from the
    /// launch cache instead of re-scoring.
    pub async fn submit_quiz(
        &self,
        evaluation: &EvaluationRecord,
        quiz_id: i64,
        responses: &[SubmittedResponse],
    ) -> Result<QuizResult, SessionError> {
        let mut quizzes = self.db.quizzes.write().await;
        let quiz = quizzes.get_mut(&quiz_id).ok_or(SessionError::NotFound("quiz"))?;
        if quiz.is_ended() {
            return Err(SessionError::QuizAlreadyEnded);
        }
        if responses.len() != quiz.responses.len() {
            return Err(SessionError::ResponseCountMismatch {
                submitted: responses.len(),
                expected: quiz.responses.len(),
            });
        }

        // Question ids outside the sampled set are skipped, not fatal; replayed
        // or partially stale submissions must not abort the whole call.
        for r in responses {
            let Some(slot) = quiz.responses.get_mut(&r.question_id) else {
                continue;
            };
            slot.answer = r
                .answer
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string);
            slot.done = Some(r.done.clone().unwrap_or_else(|| "completed".to_string()));
        }

        // Scoring runs over the slot set, so each sampled question is scored
        // exactly once regardless of duplicates in the submitted list.
        let mut card = Scorecard::default();
        for (question_id, slot) in quiz.responses.iter_mut() {
            let Some(question) = evaluation.questions.iter().find(|q| q.id == *question_id)
            else {
                continue;
            };
            let item = score_response(question, slot.answer.as_deref());
            slot.answer = item.stored_answer.clone();
            slot.score = Some(item.score);
            if slot.done.is_none() {
                slot.done = Some("completed".to_string());
            }
            card.record(question.kind, &item);
        }

        let is_accepted = card.is_accepted(evaluation.accept_score);
        quiz.ended_at = Some(Utc::now());
        quiz.total_score = Some(card.total_score);
        quiz.is_accepted = Some(is_accepted);
        quiz.state = match evaluation.kind {
            crate::models::EvaluationKind::Graded => QuizState::Completed,
            crate::models::EvaluationKind::ManualReview => QuizState::Pending,
        };

        let result = build_result(quiz, &card);
        let student_id = quiz.student_id;

        // The launch snapshot is written before the quizzes lock is released,
        // so any caller that observes the ended quiz also finds the cached
        // result.
        let _ = self
            .complete_launch_for_quiz(
                quiz_id,
                ResultSnapshot {
                    percentage: result.percentage,
                    total_score: result.total_score,
                    is_accepted: result.is_accepted,
                    state: result.state,
                },
            )
            .await;
        drop(quizzes);

        self.db
            .rollups
            .write()
            .await
            .insert((student_id, quiz_id), result.percentage);

        info!(
            quiz_id,
            percentage = result.percentage,
            total_score = result.total_score,
            is_accepted = result.is_accepted,
            "quiz submitted"
        );
        Ok(result)
    }

    /// Rebuilds the result of a finalized quiz from its stored slots. Open
    /// quizzes have no result yet; exposing partial counts would leak the
    /// answer key mid-attempt.
    pub async fn quiz_result(
        &self,
        evaluation: &EvaluationRecord,
        quiz_id: i64,
    ) -> Result<QuizResult, SessionError> {
        let quizzes = self.db.quizzes.read().await;
        let quiz = quizzes.get(&quiz_id).ok_or(SessionError::NotFound("quiz"))?;
        if !quiz.is_ended() {
            return Err(SessionError::NotFound("result"));
        }

        let mut card = Scorecard::default();
        for (question_id, slot) in &quiz.responses {
            let Some(question) = evaluation.questions.iter().find(|q| q.id == *question_id)
            else {
                continue;
            };
            let item = score_response(question, slot.answer.as_deref());
            card.record(question.kind, &item);
        }
        Ok(build_result(quiz, &card))
    }
}

fn build_result(quiz: &QuizRecord, card: &Scorecard) -> QuizResult {
    QuizResult {
        quiz_id: quiz.id,
        total_questions: quiz.responses.len(),
        correct_count: card.correct,
        wrong_count: card.wrong,
        percentage: round2(card.percentage()),
        total_score: round2(card.total_score),
        is_accepted: quiz.is_accepted.unwrap_or(false),
        state: quiz.state,
        responses: quiz
            .responses
            .iter()
            .map(|(question_id, slot)| ResponseView {
                question_id: *question_id,
                answer: slot.answer.clone(),
                score: slot.score,
                done: slot.done.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvaluationKind, Question, QuestionKind};
    use crate::state::NoopMissionNotifier;
    use std::sync::Arc;

    fn test_state() -> AppState {
        AppState::new(Arc::new(NoopMissionNotifier))
    }

    fn mc(id: i64, correct: i64, weight: Option<f64>) -> Question {
        Question {
            id,
            prompt: format!("q{id}"),
            image: None,
            kind: QuestionKind::MultipleChoice,
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            correct_option: Some(correct),
            reference_answer: None,
            weight,
            can_shuffle: false,
        }
    }

    fn free_text(id: i64) -> Question {
        Question {
            id,
            prompt: format!("q{id}"),
            image: None,
            kind: QuestionKind::FreeText,
            options: vec![],
            correct_option: None,
            reference_answer: None,
            weight: None,
            can_shuffle: false,
        }
    }

    fn evaluation(questions: Vec<Question>, n: usize, accept: i64) -> EvaluationRecord {
        EvaluationRecord {
            id: 1,
            company_id: 1,
            title: "exam".into(),
            kind: EvaluationKind::Graded,
            accept_score: accept,
            number_of_questions: n,
            duration_secs: None,
            can_back: true,
            is_active: true,
            mission_id: None,
            questions,
        }
    }

    fn answers_for(quiz: &QuizRecord, answer: &str) -> Vec<SubmittedResponse> {
        quiz.responses
            .keys()
            .map(|qid| SubmittedResponse {
                question_id: *qid,
                answer: Some(answer.to_string()),
                done: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn start_creates_exactly_n_empty_slots() {
        let state = test_state();
        let eval = evaluation((1..=10).map(|i| mc(i, 1, None)).collect(), 4, 50);

        let (quiz, resumed) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        assert!(!resumed);
        assert_eq!(quiz.responses.len(), 4);
        assert!(quiz.responses.values().all(|s| s.answer.is_none() && s.score.is_none()));
        assert_eq!(quiz.state, QuizState::Started);
        assert!(quiz.ended_at.is_none());
    }

    #[tokio::test]
    async fn second_start_resumes_the_open_quiz() {
        let state = test_state();
        let eval = evaluation((1..=6).map(|i| mc(i, 1, None)).collect(), 3, 50);

        let (first, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        state
            .record_answer(first.id, *first.responses.keys().next().unwrap(), Some("1".into()), None)
            .await
            .unwrap();

        let (second, resumed) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        assert!(resumed);
        assert_eq!(second.id, first.id);
        // Progress survives the resume.
        assert!(second.responses.values().any(|s| s.answer.is_some()));
    }

    #[tokio::test]
    async fn start_for_other_student_creates_a_new_quiz() {
        let state = test_state();
        let eval = evaluation((1..=6).map(|i| mc(i, 1, None)).collect(), 3, 50);
        let (a, _) = state.start_or_resume_quiz(&eval, 1).await.unwrap();
        let (b, resumed) = state.start_or_resume_quiz(&eval, 2).await.unwrap();
        assert!(!resumed);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn insufficient_pool_creates_nothing() {
        let state = test_state();
        let eval = evaluation((1..=2).map(|i| mc(i, 1, None)).collect(), 3, 50);
        let err = state.start_or_resume_quiz(&eval, 7).await.unwrap_err();
        assert!(matches!(err, SessionError::InsufficientQuestions { available: 2, required: 3 }));
        assert!(state.db.quizzes.read().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_starts_agree_on_one_quiz() {
        let state = test_state();
        let eval = evaluation((1..=8).map(|i| mc(i, 1, None)).collect(), 4, 50);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            let eval = eval.clone();
            handles.push(tokio::spawn(async move {
                state.start_or_resume_quiz(&eval, 42).await.unwrap().0.id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(state.db.quizzes.read().await.len(), 1);
    }

    #[tokio::test]
    async fn record_answer_overwrites_and_clears() {
        let state = test_state();
        let eval = evaluation((1..=4).map(|i| mc(i, 1, None)).collect(), 2, 50);
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        let qid = *quiz.responses.keys().next().unwrap();

        state.record_answer(quiz.id, qid, Some("2".into()), Some("seen".into())).await.unwrap();
        state.record_answer(quiz.id, qid, Some("3".into()), None).await.unwrap();
        {
            let quizzes = state.db.quizzes.read().await;
            let slot = &quizzes[&quiz.id].responses[&qid];
            assert_eq!(slot.answer.as_deref(), Some("3"));
            assert_eq!(slot.done.as_deref(), Some("seen"));
            assert!(slot.score.is_none());
        }

        // Empty string clears the stored answer.
        state.record_answer(quiz.id, qid, Some("".into()), None).await.unwrap();
        let quizzes = state.db.quizzes.read().await;
        assert!(quizzes[&quiz.id].responses[&qid].answer.is_none());
    }

    #[tokio::test]
    async fn record_answer_rejects_foreign_question() {
        let state = test_state();
        let eval = evaluation((1..=4).map(|i| mc(i, 1, None)).collect(), 2, 50);
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        let foreign = (1..=4).find(|id| !quiz.responses.contains_key(id)).unwrap();
        let err = state.record_answer(quiz.id, foreign, Some("1".into()), None).await.unwrap_err();
        assert!(matches!(err, SessionError::QuestionNotInQuiz));
    }

    #[tokio::test]
    async fn submit_scores_finalizes_and_rolls_up() {
        let state = test_state();
        let eval = evaluation(vec![mc(1, 2, Some(1.5)), mc(2, 1, None)], 2, 50);
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();

        let responses = vec![
            SubmittedResponse { question_id: 1, answer: Some("2".into()), done: None },
            SubmittedResponse { question_id: 2, answer: Some("3".into()), done: None },
        ];
        let result = state.submit_quiz(&eval, quiz.id, &responses).await.unwrap();
        assert_eq!(result.correct_count, 1);
        assert_eq!(result.wrong_count, 1);
        assert_eq!(result.percentage, 50.0);
        assert_eq!(result.total_score, 1.5);
        assert!(result.is_accepted);
        assert_eq!(result.state, QuizState::Completed);

        let rollups = state.db.rollups.read().await;
        assert_eq!(rollups[&(7, quiz.id)], 50.0);
    }

    #[tokio::test]
    async fn submit_is_final_and_second_call_signals_replay() {
        let state = test_state();
        let eval = evaluation((1..=3).map(|i| mc(i, 1, None)).collect(), 3, 50);
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        let responses = answers_for(&quiz, "1");

        let first = state.submit_quiz(&eval, quiz.id, &responses).await.unwrap();
        let err = state.submit_quiz(&eval, quiz.id, &responses).await.unwrap_err();
        assert!(matches!(err, SessionError::QuizAlreadyEnded));

        // Aggregate unchanged, and the derived result matches the first one.
        let again = state.quiz_result(&eval, quiz.id).await.unwrap();
        assert_eq!(again.total_score, first.total_score);
        assert_eq!(again.percentage, first.percentage);
        assert_eq!(again.correct_count, first.correct_count);
    }

    #[tokio::test]
    async fn submit_rejects_count_mismatch() {
        let state = test_state();
        let eval = evaluation((1..=3).map(|i| mc(i, 1, None)).collect(), 3, 50);
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        let err = state
            .submit_quiz(
                &eval,
                quiz.id,
                &[SubmittedResponse { question_id: 1, answer: None, done: None }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ResponseCountMismatch { submitted: 1, expected: 3 }));
        // Nothing finalized.
        assert!(!state.db.quizzes.read().await[&quiz.id].is_ended());
    }

    #[tokio::test]
    async fn unknown_question_ids_are_skipped_not_fatal() {
        let state = test_state();
        let eval = evaluation(vec![mc(1, 1, None), mc(2, 1, None)], 2, 0);
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();

        let responses = vec![
            SubmittedResponse { question_id: 1, answer: Some("1".into()), done: None },
            SubmittedResponse { question_id: 999, answer: Some("1".into()), done: None },
        ];
        let result = state.submit_quiz(&eval, quiz.id, &responses).await.unwrap();
        // The stray id is ignored; the unmatched slot scores as unanswered.
        assert_eq!(result.correct_count, 1);
        assert_eq!(result.wrong_count, 0);
        assert_eq!(result.percentage, 50.0);
        assert!(!result.is_accepted);
    }

    #[tokio::test]
    async fn free_text_only_reports_zero_percent_and_pending() {
        let state = test_state();
        let mut eval = evaluation(vec![free_text(1), free_text(2)], 2, 70);
        eval.kind = EvaluationKind::ManualReview;
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();

        let responses = vec![
            SubmittedResponse { question_id: 1, answer: Some("essay one".into()), done: None },
            SubmittedResponse { question_id: 2, answer: Some("  ".into()), done: None },
        ];
        let result = state.submit_quiz(&eval, quiz.id, &responses).await.unwrap();
        assert_eq!(result.percentage, 0.0);
        assert_eq!(result.total_score, 0.0);
        assert!(!result.is_accepted);
        assert_eq!(result.state, QuizState::Pending);

        let quizzes = state.db.quizzes.read().await;
        let stored = &quizzes[&quiz.id];
        assert_eq!(stored.responses[&1].answer.as_deref(), Some("essay one"));
        assert!(stored.responses[&2].answer.is_none());
    }

    #[tokio::test]
    async fn answer_after_submit_is_a_hard_error() {
        let state = test_state();
        let eval = evaluation((1..=2).map(|i| mc(i, 1, None)).collect(), 2, 50);
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        state.submit_quiz(&eval, quiz.id, &answers_for(&quiz, "1")).await.unwrap();

        let qid = *quiz.responses.keys().next().unwrap();
        let err = state.record_answer(quiz.id, qid, Some("2".into()), None).await.unwrap_err();
        assert!(matches!(err, SessionError::QuizAlreadyEnded));
    }

    #[tokio::test]
    async fn submit_completes_the_launch_in_the_same_step() {
        let state = test_state();
        let eval = evaluation((1..=3).map(|i| mc(i, 1, None)).collect(), 3, 50);
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        state
            .create_or_reuse_launch(1, 7, "stu-1", "+1", eval.id, quiz.id, "https://x.test/cb")
            .await;

        let result = state.submit_quiz(&eval, quiz.id, &answers_for(&quiz, "1")).await.unwrap();

        let completed = state.launch_for_quiz(quiz.id, true).await.unwrap();
        let snapshot = completed.result.unwrap();
        assert_eq!(snapshot.percentage, result.percentage);
        assert_eq!(snapshot.total_score, result.total_score);
        assert_eq!(snapshot.is_accepted, result.is_accepted);
    }

    #[tokio::test]
    async fn submit_race_losers_find_the_completed_launch() {
        let state = test_state();
        let eval = evaluation((1..=3).map(|i| mc(i, 1, None)).collect(), 3, 50);
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        state
            .create_or_reuse_launch(1, 7, "stu-1", "+1", eval.id, quiz.id, "https://x.test/cb")
            .await;
        let responses = answers_for(&quiz, "1");

        let mut handles = Vec::new();
        for _ in 0..6 {
            let state = state.clone();
            let eval = eval.clone();
            let responses = responses.clone();
            let quiz_id = quiz.id;
            handles.push(tokio::spawn(async move {
                match state.submit_quiz(&eval, quiz_id, &responses).await {
                    Ok(_) => true,
                    Err(SessionError::QuizAlreadyEnded) => {
                        // The cached snapshot must be visible the moment the
                        // ended quiz is.
                        let launch = state.launch_for_quiz(quiz_id, true).await.unwrap();
                        assert!(launch.result.is_some());
                        false
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn result_is_unavailable_while_open() {
        let state = test_state();
        let eval = evaluation((1..=2).map(|i| mc(i, 1, None)).collect(), 2, 50);
        let (quiz, _) = state.start_or_resume_quiz(&eval, 7).await.unwrap();
        let err = state.quiz_result(&eval, quiz.id).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound("result")));
    }
}
