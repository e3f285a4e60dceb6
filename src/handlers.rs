use crate::error::{AppError, ErrorDetail};
use crate::launch::{build_redirect, validate_callback_url};
use crate::models::{
    validate_questions, EvaluationKind, Question, QuestionView, QuizResult,
};
use crate::session::SubmittedResponse;
use crate::state::{question_count, AppState, Company, EvaluationRecord, LaunchRecord, Student};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Redirect;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Tenant resolution from the opaque client token header. The token scheme
/// itself is an external concern; only the tenant-scoping consequence lives
/// here.
async fn auth_company(
    headers: &HeaderMap,
    state: &AppState,
    req_id: &str,
) -> Result<Company, AppError> {
    let token = headers
        .get("x-client-token")
        .and_then(|h| h.to_str().ok())
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            AppError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing client token", req_id)
        })?;
    state.company_by_token(token).await.ok_or_else(|| {
        AppError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "invalid client token", req_id)
    })
}

fn ensure_same_company(launch: &LaunchRecord, company: &Company, req_id: &str) -> Result<(), AppError> {
    if launch.company_id != company.id {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "quiz does not belong to this company",
            req_id,
        ));
    }
    Ok(())
}

async fn evaluation_by_id(
    state: &AppState,
    evaluation_id: i64,
    req_id: &str,
) -> Result<EvaluationRecord, AppError> {
    state
        .db
        .evaluations
        .read()
        .await
        .get(&evaluation_id)
        .cloned()
        .ok_or_else(|| {
            AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "evaluation not found", req_id)
        })
}

/// Active, company-owned evaluation; the external lookup boundary.
async fn company_evaluation(
    state: &AppState,
    company_id: i64,
    eurl: i64,
    req_id: &str,
) -> Result<EvaluationRecord, AppError> {
    state
        .db
        .evaluations
        .read()
        .await
        .get(&eurl)
        .filter(|e| e.company_id == company_id && e.is_active)
        .cloned()
        .ok_or_else(|| {
            AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "evaluation not found", req_id)
        })
}

#[derive(Debug, Deserialize)]
pub struct RegisterCompanyPayload {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CompanyOut {
    #[serde(rename = "companyId")]
    pub company_id: i64,
    pub name: String,
    pub token: String,
}

pub async fn register_company(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterCompanyPayload>,
) -> Result<(StatusCode, Json<CompanyOut>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let name = payload.name.trim().to_string();
    if name.len() < 2 {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "company name is too short",
            req_id,
        ));
    }

    let company = Company {
        id: state.db.next_company_id(),
        name: name.clone(),
        token: Uuid::new_v4().to_string(),
    };
    state.db.companies.write().await.insert(company.id, company.clone());
    state
        .db
        .companies_by_token
        .write()
        .await
        .insert(company.token.clone(), company.id);

    Ok((
        StatusCode::CREATED,
        Json(CompanyOut { company_id: company.id, name, token: company.token }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct QuestionPayload {
    pub prompt: String,
    #[serde(rename = "type")]
    pub kind: crate::models::QuestionKind,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(rename = "correctOption")]
    pub correct_option: Option<i64>,
    #[serde(rename = "referenceAnswer")]
    pub reference_answer: Option<String>,
    pub image: Option<String>,
    pub weight: Option<f64>,
    #[serde(rename = "canShuffle", default)]
    pub can_shuffle: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateEvaluationPayload {
    pub title: String,
    #[serde(rename = "type")]
    pub kind: EvaluationKind,
    #[serde(rename = "acceptScore")]
    pub accept_score: i64,
    #[serde(rename = "numberOfQuestions")]
    pub number_of_questions: usize,
    #[serde(rename = "durationSecs")]
    pub duration_secs: Option<i64>,
    #[serde(rename = "canBack", default = "default_true")]
    pub can_back: bool,
    #[serde(rename = "missionId")]
    pub mission_id: Option<i64>,
    pub questions: Vec<QuestionPayload>,
}

fn default_true() -> bool {
    true
}

pub async fn create_evaluation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateEvaluationPayload>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let company = auth_company(&headers, &state, &req_id).await?;

    if payload.title.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "title must not be empty",
            req_id,
        ));
    }
    if !(0..=100).contains(&payload.accept_score) {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "acceptScore must be between 0 and 100",
            req_id,
        ));
    }
    if payload.number_of_questions == 0 {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "numberOfQuestions must be at least 1",
            req_id,
        ));
    }

    let questions: Vec<Question> = payload
        .questions
        .into_iter()
        .map(|q| Question {
            id: state.db.next_question_id(),
            prompt: q.prompt,
            image: q.image,
            kind: q.kind,
            options: q.options,
            correct_option: q.correct_option,
            reference_answer: q.reference_answer,
            weight: q.weight,
            can_shuffle: q.can_shuffle,
        })
        .collect();

    if let Err(issues) = validate_questions(&questions) {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "question validation failed",
            req_id,
        )
        .with_details(
            issues
                .into_iter()
                .map(|i| ErrorDetail { field: i.field, issue: i.issue })
                .collect(),
        ));
    }

    let evaluation = EvaluationRecord {
        id: state.db.next_evaluation_id(),
        company_id: company.id,
        title: payload.title.trim().to_string(),
        kind: payload.kind,
        accept_score: payload.accept_score,
        number_of_questions: payload.number_of_questions,
        duration_secs: payload.duration_secs,
        can_back: payload.can_back,
        is_active: true,
        mission_id: payload.mission_id,
        questions,
    };
    let id = evaluation.id;
    state.db.evaluations.write().await.insert(id, evaluation);
    info!(evaluation_id = id, company_id = company.id, "evaluation created");

    Ok((StatusCode::CREATED, Json(json!({ "evaluationId": id, "eurl": id }))))
}

pub async fn exam_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(eurl): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let company = auth_company(&headers, &state, &req_id).await?;
    let evaluation = company_evaluation(&state, company.id, eurl, &req_id).await?;

    Ok(Json(json!({
        "eurl": evaluation.id,
        "title": evaluation.title,
        "type": evaluation.kind,
        "acceptScore": evaluation.accept_score,
        "numberOfQuestions": evaluation.number_of_questions,
        "questionCount": question_count(&evaluation),
        "durationSecs": evaluation.duration_secs,
        "canBack": evaluation.can_back,
        "isActive": evaluation.is_active,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateLaunchPayload {
    #[serde(rename = "studentUuid")]
    pub student_uuid: String,
    pub mobile: String,
    pub eurl: i64,
    #[serde(rename = "callbackUrl")]
    pub callback_url: String,
    #[serde(default)]
    pub name: String,
}

/// Customer starts an exam session for a student: upserts the student, starts
/// or resumes the quiz, and issues (or reuses) the launch handle.
pub async fn create_launch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateLaunchPayload>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let company = auth_company(&headers, &state, &req_id).await?;

    if payload.student_uuid.trim().is_empty() || payload.mobile.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "studentUuid and mobile are required",
            req_id,
        ));
    }
    if let Err(issue) = validate_callback_url(&payload.callback_url) {
        return Err(AppError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", issue, req_id));
    }

    let evaluation = company_evaluation(&state, company.id, payload.eurl, &req_id).await?;

    let student = upsert_student(&state, company.id, &payload).await;

    let (quiz, is_existing) = state
        .start_or_resume_quiz(&evaluation, student.id)
        .await
        .map_err(|e| e.into_app_error(&*req_id))?;

    let launch = state
        .create_or_reuse_launch(
            company.id,
            student.id,
            &payload.student_uuid,
            &payload.mobile,
            evaluation.id,
            quiz.id,
            &payload.callback_url,
        )
        .await;

    let exam_url = state
        .exam_front_base_url
        .as_ref()
        .map(|base| format!("{base}?launch={}", launch.id));

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "launchId": launch.id,
            "examUrl": exam_url,
            "quizId": quiz.id,
            "eurl": evaluation.id,
            "student": { "uuid": payload.student_uuid, "mobile": payload.mobile },
            "isExistingQuiz": is_existing,
        })),
    ))
}

async fn upsert_student(state: &AppState, company_id: i64, payload: &CreateLaunchPayload) -> Student {
    let key = (company_id, payload.student_uuid.trim().to_string());
    let mut by_key = state.db.students_by_key.write().await;
    let mut students = state.db.students.write().await;

    if let Some(id) = by_key.get(&key).copied() {
        if let Some(student) = students.get_mut(&id) {
            if !payload.mobile.trim().is_empty() {
                student.mobile = payload.mobile.trim().to_string();
            }
            if !payload.name.trim().is_empty() {
                student.name = payload.name.trim().to_string();
            }
            return student.clone();
        }
    }

    let student = Student {
        id: state.db.next_student_id(),
        company_id,
        external_uuid: key.1.clone(),
        mobile: payload.mobile.trim().to_string(),
        name: payload.name.trim().to_string(),
    };
    students.insert(student.id, student.clone());
    by_key.insert(key, student.id);
    student
}

/// Student-facing quiz detail: sampled questions with answer keys stripped,
/// plus whatever answers were recorded so far.
pub async fn quiz_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(quiz_id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let company = auth_company(&headers, &state, &req_id).await?;

    let quiz = state
        .db
        .quizzes
        .read()
        .await
        .get(&quiz_id)
        .cloned()
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "quiz not found", req_id.clone()))?;

    let launch = state.launch_for_quiz(quiz_id, false).await.ok_or_else(|| {
        AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "launch not found", req_id.clone())
    })?;
    ensure_same_company(&launch, &company, &req_id)?;

    let evaluation = evaluation_by_id(&state, quiz.evaluation_id, &req_id).await?;

    let questions: Vec<serde_json::Value> = quiz
        .responses
        .iter()
        .filter_map(|(question_id, slot)| {
            let question = evaluation.questions.iter().find(|q| q.id == *question_id)?;
            let mut view = serde_json::to_value(QuestionView::from(question)).ok()?;
            view["currentAnswer"] = json!(slot.answer);
            view["done"] = json!(slot.done);
            Some(view)
        })
        .collect();

    Ok(Json(json!({
        "launchId": launch.id,
        "quizId": quiz.id,
        "eurl": launch.eurl,
        "student": { "uuid": launch.student_uuid, "mobile": launch.student_mobile },
        "evaluation": {
            "eurl": evaluation.id,
            "title": evaluation.title,
            "acceptScore": evaluation.accept_score,
            "durationSecs": evaluation.duration_secs,
            "canBack": evaluation.can_back,
            "numberOfQuestions": evaluation.number_of_questions,
        },
        "state": quiz.state,
        "startedAt": quiz.started_at,
        "endedAt": quiz.ended_at,
        "questions": questions,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AnswerPayload {
    #[serde(rename = "questionId")]
    pub question_id: i64,
    pub answer: Option<String>,
    pub done: Option<String>,
}

pub async fn record_answer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(quiz_id): Path<i64>,
    Json(payload): Json<AnswerPayload>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let company = auth_company(&headers, &state, &req_id).await?;

    // An ended quiz only has a completed launch left; look it up anyway so
    // the tenant check still runs and the late write fails as ended, not as
    // missing.
    let launch = match state.launch_for_quiz(quiz_id, false).await {
        Some(l) => l,
        None => state.launch_for_quiz(quiz_id, true).await.ok_or_else(|| {
            AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "launch not found", req_id.clone())
        })?,
    };
    ensure_same_company(&launch, &company, &req_id)?;

    state
        .record_answer(quiz_id, payload.question_id, payload.answer, payload.done)
        .await
        .map_err(|e| e.into_app_error(&*req_id))?;

    Ok(Json(json!({ "saved": true })))
}

#[derive(Debug, Deserialize)]
pub struct SubmitPayload {
    pub responses: Vec<SubmittedResponse>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponseBody {
    pub replayed: bool,
    pub result: QuizResult,
    #[serde(rename = "redirectUrl")]
    pub redirect_url: String,
}

/// Finalizes a quiz, or replays the cached outcome when the quiz has already
/// been submitted. Repeated customer callbacks are safe: they always receive
/// the same result and redirect, and scoring never runs twice.
pub async fn submit_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(quiz_id): Path<i64>,
    Json(payload): Json<SubmitPayload>,
) -> Result<Json<SubmitResponseBody>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let company = auth_company(&headers, &state, &req_id).await?;

    let quiz = state
        .db
        .quizzes
        .read()
        .await
        .get(&quiz_id)
        .cloned()
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "quiz not found", req_id.clone()))?;
    let evaluation = evaluation_by_id(&state, quiz.evaluation_id, &req_id).await?;

    // Prefer the open launch; fall back to the completed one for replays.
    let launch = match state.launch_for_quiz(quiz_id, false).await {
        Some(l) => l,
        None => state.launch_for_quiz(quiz_id, true).await.ok_or_else(|| {
            AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "launch not found", req_id.clone())
        })?,
    };
    ensure_same_company(&launch, &company, &req_id)?;

    match state.submit_quiz(&evaluation, quiz_id, &payload.responses).await {
        Ok(result) => {
            // The launch was completed inside the submit critical section;
            // re-read it to get the snapshot for the redirect.
            let completed = state.launch_for_quiz(quiz_id, true).await.unwrap_or(launch);
            let redirect_url = redirect_url_for(&completed, &req_id)?;

            if result.is_accepted {
                if let Some(mission_id) = evaluation.mission_id {
                    state.spawn_mission_notification(mission_id, completed.student_id, quiz_id);
                }
            }

            Ok(Json(SubmitResponseBody { replayed: false, result, redirect_url }))
        }
        // Benign idempotency signal: answer from the launch cache.
        Err(crate::error::SessionError::QuizAlreadyEnded) => {
            let completed = state.launch_for_quiz(quiz_id, true).await.ok_or_else(|| {
                AppError::new(
                    StatusCode::BAD_REQUEST,
                    "QUIZ_ALREADY_ENDED",
                    "quiz has already ended",
                    req_id.clone(),
                )
            })?;
            ensure_same_company(&completed, &company, &req_id)?;
            let result = state
                .quiz_result(&evaluation, quiz_id)
                .await
                .map_err(|e| e.into_app_error(&*req_id))?;
            let redirect_url = redirect_url_for(&completed, &req_id)?;
            Ok(Json(SubmitResponseBody { replayed: true, result, redirect_url }))
        }
        Err(other) => Err(other.into_app_error(&*req_id)),
    }
}

pub async fn quiz_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(quiz_id): Path<i64>,
) -> Result<Json<QuizResult>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let company = auth_company(&headers, &state, &req_id).await?;

    let launch = state.launch_for_quiz(quiz_id, true).await.ok_or_else(|| {
        AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "result not found", req_id.clone())
    })?;
    ensure_same_company(&launch, &company, &req_id)?;

    let quiz = state
        .db
        .quizzes
        .read()
        .await
        .get(&quiz_id)
        .cloned()
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "quiz not found", req_id.clone()))?;
    let evaluation = evaluation_by_id(&state, quiz.evaluation_id, &req_id).await?;

    let result = state
        .quiz_result(&evaluation, quiz_id)
        .await
        .map_err(|e| e.into_app_error(&*req_id))?;
    Ok(Json(result))
}

/// Browser redirect to the customer callback with the cached result merged
/// into the query string.
pub async fn launch_redirect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(quiz_id): Path<i64>,
) -> Result<Redirect, AppError> {
    let req_id = request_id_from_headers(&headers);
    let company = auth_company(&headers, &state, &req_id).await?;

    let launch = state.launch_for_quiz(quiz_id, true).await.ok_or_else(|| {
        AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "launch not found", req_id.clone())
    })?;
    ensure_same_company(&launch, &company, &req_id)?;

    let url = redirect_url_for(&launch, &req_id)?;
    Ok(Redirect::to(&url))
}

fn redirect_url_for(launch: &LaunchRecord, req_id: &str) -> Result<String, AppError> {
    build_redirect(launch)
        .map(|u| u.to_string())
        .map_err(|e| {
            tracing::error!(launch_id = %launch.id, "stored callback url failed to parse: {e}");
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "failed to build redirect",
                req_id,
            )
        })
}
