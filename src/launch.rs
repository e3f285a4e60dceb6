use crate::state::{AppState, LaunchRecord, ResultSnapshot};
use chrono::Utc;
use url::Url;
use uuid::Uuid;

/// Callback URLs come from the customer integration and end up receiving
/// browser redirects, so they must at least be absolute http(s) URLs.
pub fn validate_callback_url(raw: &str) -> Result<Url, String> {
    let parsed = Url::parse(raw).map_err(|e| format!("invalid callback url: {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err("callback url must use http or https".to_string());
    }
    if parsed.host_str().is_none() {
        return Err("callback url must have a host".to_string());
    }
    Ok(parsed)
}

/// Merges the launch result into the customer's callback URL as query
/// parameters. Pre-existing parameters survive; values are percent-encoded by
/// the url crate. Pure given the launch snapshot, so repeated redirects never
/// re-score anything.
pub fn build_redirect(launch: &LaunchRecord) -> Result<Url, url::ParseError> {
    // The URL was validated at launch creation.
    let mut url = Url::parse(&launch.callback_url)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("student_uuid", &launch.student_uuid);
        query.append_pair("mobile", &launch.student_mobile);
        query.append_pair("eurl", &launch.eurl.to_string());
        query.append_pair("quiz_id", &launch.quiz_id.to_string());
        if let Some(result) = &launch.result {
            query.append_pair("percentage", &result.percentage.to_string());
            query.append_pair("total_score", &result.total_score.to_string());
            query.append_pair("is_accept", &result.is_accepted.to_string());
            query.append_pair(
                "state",
                &serde_json::to_value(result.state)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
            );
        }
        query.append_pair("launch_id", &launch.id.to_string());
    }
    Ok(url)
}

/// Maps externally-issued launch handles onto quizzes and caches the final
/// result for idempotent re-delivery.
impl AppState {
    /// Idempotency key is (company, quiz, open): an open launch for the quiz
    /// is reused with refreshed contact fields, otherwise a fresh opaque id
    /// is issued.
    pub async fn create_or_reuse_launch(
        &self,
        company_id: i64,
        student_id: i64,
        student_uuid: &str,
        student_mobile: &str,
        eurl: i64,
        quiz_id: i64,
        callback_url: &str,
    ) -> LaunchRecord {
        let mut launches = self.db.launches.write().await;

        let open = launches
            .values_mut()
            .find(|l| l.company_id == company_id && l.quiz_id == quiz_id && !l.is_completed());
        if let Some(launch) = open {
            launch.callback_url = callback_url.to_string();
            launch.student_mobile = student_mobile.to_string();
            return launch.clone();
        }

        let launch = LaunchRecord {
            id: Uuid::new_v4(),
            company_id,
            student_id,
            student_uuid: student_uuid.to_string(),
            student_mobile: student_mobile.to_string(),
            eurl,
            quiz_id,
            callback_url: callback_url.to_string(),
            created_at: Utc::now(),
            completed_at: None,
            result: None,
        };
        launches.insert(launch.id, launch.clone());
        launch
    }

    /// The most recent launch for a quiz, open ones first.
    pub async fn launch_for_quiz(&self, quiz_id: i64, completed: bool) -> Option<LaunchRecord> {
        let launches = self.db.launches.read().await;
        launches
            .values()
            .filter(|l| l.quiz_id == quiz_id && l.is_completed() == completed)
            .max_by_key(|l| l.created_at)
            .cloned()
    }

    /// Stores the final snapshot on the open launch for a quiz, exactly once.
    /// Completed launches are never overwritten; with none open this is a
    /// no-op.
    pub async fn complete_launch_for_quiz(
        &self,
        quiz_id: i64,
        snapshot: ResultSnapshot,
    ) -> Option<LaunchRecord> {
        let mut launches = self.db.launches.write().await;
        let launch = launches
            .values_mut()
            .find(|l| l.quiz_id == quiz_id && !l.is_completed())?;
        launch.completed_at = Some(Utc::now());
        launch.result = Some(snapshot);
        Some(launch.clone())
    }
}
