use crate::error::SessionError;
use crate::models::{Question, QuizRecord};
use futures::future::BoxFuture;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: i64,
    pub company_id: i64,
    pub external_uuid: String,
    pub mobile: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: i64,
    pub company_id: i64,
    pub title: String,
    pub kind: crate::models::EvaluationKind,
    /// Pass threshold in percent, 0-100. Zero never accepts.
    pub accept_score: i64,
    pub number_of_questions: usize,
    pub duration_secs: Option<i64>,
    pub can_back: bool,
    pub is_active: bool,
    pub mission_id: Option<i64>,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSnapshot {
    pub percentage: f64,
    pub total_score: f64,
    pub is_accepted: bool,
    pub state: crate::models::QuizState,
}

/// Externally-facing handle binding a customer callback to one quiz. The id
/// is safe to put in browser URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub id: Uuid,
    pub company_id: i64,
    pub student_id: i64,
    pub student_uuid: String,
    pub student_mobile: String,
    pub eurl: i64,
    pub quiz_id: i64,
    pub callback_url: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub result: Option<ResultSnapshot>,
}

impl LaunchRecord {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

pub struct InMemoryDb {
    pub companies: RwLock<HashMap<i64, Company>>,
    pub companies_by_token: RwLock<HashMap<String, i64>>,
    pub students: RwLock<HashMap<i64, Student>>,
    /// (company_id, external_uuid) -> student id
    pub students_by_key: RwLock<HashMap<(i64, String), i64>>,
    pub evaluations: RwLock<HashMap<i64, EvaluationRecord>>,
    pub quizzes: RwLock<HashMap<i64, QuizRecord>>,
    pub launches: RwLock<HashMap<Uuid, LaunchRecord>>,
    /// (student_id, quiz_id) -> last known percentage.
    pub rollups: RwLock<HashMap<(i64, i64), f64>>,
    next_company_id: AtomicI64,
    next_student_id: AtomicI64,
    next_evaluation_id: AtomicI64,
    next_question_id: AtomicI64,
    next_quiz_id: AtomicI64,
}

impl InMemoryDb {
    pub fn new() -> Self {
        Self {
            companies: RwLock::new(HashMap::new()),
            companies_by_token: RwLock::new(HashMap::new()),
            students: RwLock::new(HashMap::new()),
            students_by_key: RwLock::new(HashMap::new()),
            evaluations: RwLock::new(HashMap::new()),
            quizzes: RwLock::new(HashMap::new()),
            launches: RwLock::new(HashMap::new()),
            rollups: RwLock::new(HashMap::new()),
            next_company_id: AtomicI64::new(1),
            next_student_id: AtomicI64::new(1),
            next_evaluation_id: AtomicI64::new(1),
            next_question_id: AtomicI64::new(1),
            next_quiz_id: AtomicI64::new(1),
        }
    }

    pub fn next_company_id(&self) -> i64 {
        self.next_company_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_student_id(&self) -> i64 {
        self.next_student_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_evaluation_id(&self) -> i64 {
        self.next_evaluation_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_question_id(&self) -> i64 {
        self.next_question_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_quiz_id(&self) -> i64 {
        self.next_quiz_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for InMemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view over an evaluation's question set.
pub fn question_count(evaluation: &EvaluationRecord) -> usize {
    evaluation.questions.len()
}

/// Uniform sample of `n` distinct question ids, drawn without replacement.
/// The returned order carries no meaning.
pub fn sample_question_ids(
    evaluation: &EvaluationRecord,
    n: usize,
) -> Result<Vec<i64>, SessionError> {
    let pool = &evaluation.questions;
    if pool.len() < n {
        return Err(SessionError::InsufficientQuestions {
            available: pool.len(),
            required: n,
        });
    }
    let picked = sample(&mut rand::thread_rng(), pool.len(), n);
    Ok(picked.into_iter().map(|i| pool[i].id).collect())
}

/// External mission collaborator. Notified when an accepted quiz belongs to a
/// mission-linked evaluation; failures are logged and never propagated.
pub trait MissionNotifier: Send + Sync {
    fn notify_accepted(
        &self,
        mission_id: i64,
        student_id: i64,
        quiz_id: i64,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

#[derive(Clone)]
pub struct NoopMissionNotifier;

impl MissionNotifier for NoopMissionNotifier {
    fn notify_accepted(
        &self,
        mission_id: i64,
        student_id: i64,
        quiz_id: i64,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            tracing::debug!(mission_id, student_id, quiz_id, "mission notification skipped (noop)");
            Ok(())
        })
    }
}

#[derive(Clone)]
pub struct WebhookMissionNotifier {
    pub webhook_url: String,
    pub client: reqwest::Client,
}

impl WebhookMissionNotifier {
    pub fn from_env() -> Option<Self> {
        let webhook_url = std::env::var("MISSION_WEBHOOK_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        Some(Self {
            webhook_url,
            client: reqwest::Client::new(),
        })
    }
}

impl MissionNotifier for WebhookMissionNotifier {
    fn notify_accepted(
        &self,
        mission_id: i64,
        student_id: i64,
        quiz_id: i64,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let client = self.client.clone();
        let url = self.webhook_url.clone();
        Box::pin(async move {
            let resp = client
                .post(&url)
                .json(&serde_json::json!({
                    "missionId": mission_id,
                    "studentId": student_id,
                    "quizId": quiz_id,
                    "state": "completed",
                }))
                .send()
                .await?;
            resp.error_for_status()?;
            Ok(())
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<InMemoryDb>,
    pub mission_notifier: Arc<dyn MissionNotifier>,
    pub exam_front_base_url: Option<String>,
}

impl AppState {
    pub fn new(mission_notifier: Arc<dyn MissionNotifier>) -> Self {
        let exam_front_base_url = std::env::var("EXAM_FRONT_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self {
            db: Arc::new(InMemoryDb::new()),
            mission_notifier,
            exam_front_base_url,
        }
    }

    pub async fn company_by_token(&self, token: &str) -> Option<Company> {
        let id = {
            let by_token = self.db.companies_by_token.read().await;
            by_token.get(token).copied()?
        };
        self.db.companies.read().await.get(&id).cloned()
    }

    /// Fire-and-forget: finalization already committed, so the outcome of the
    /// collaborator never affects the quiz.
    pub fn spawn_mission_notification(&self, mission_id: i64, student_id: i64, quiz_id: i64) {
        let fut = self
            .mission_notifier
            .notify_accepted(mission_id, student_id, quiz_id);
        tokio::spawn(async move {
            if let Err(err) = fut.await {
                warn!(mission_id, student_id, quiz_id, "mission notification failed: {err:#}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvaluationKind, QuestionKind};
    use std::collections::HashSet;

    fn evaluation_with_pool(n: usize) -> EvaluationRecord {
        let questions = (0..n)
            .map(|i| Question {
                id: 100 + i as i64,
                prompt: format!("q{i}"),
                image: None,
                kind: QuestionKind::MultipleChoice,
                options: vec!["a".into(), "b".into()],
                correct_option: Some(1),
                reference_answer: None,
                weight: None,
                can_shuffle: false,
            })
            .collect();
        EvaluationRecord {
            id: 1,
            company_id: 1,
            title: "t".into(),
            kind: EvaluationKind::Graded,
            accept_score: 50,
            number_of_questions: n,
            duration_secs: None,
            can_back: true,
            is_active: true,
            mission_id: None,
            questions,
        }
    }

    #[test]
    fn sample_draws_distinct_ids_without_replacement() {
        let eval = evaluation_with_pool(10);
        for _ in 0..20 {
            let ids = sample_question_ids(&eval, 4).unwrap();
            assert_eq!(ids.len(), 4);
            let unique: HashSet<_> = ids.iter().collect();
            assert_eq!(unique.len(), 4);
            for id in &ids {
                assert!((100..110).contains(id));
            }
        }
    }

    #[test]
    fn sample_fails_fast_on_small_pool() {
        let eval = evaluation_with_pool(3);
        let err = sample_question_ids(&eval, 4).unwrap_err();
        match err {
            SessionError::InsufficientQuestions { available, required } => {
                assert_eq!(available, 3);
                assert_eq!(required, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn full_pool_sample_is_a_permutation() {
        let eval = evaluation_with_pool(5);
        let mut ids = sample_question_ids(&eval, 5).unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![100, 101, 102, 103, 104]);
    }
}
