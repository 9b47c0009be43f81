use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_PASSING_SCORE: f64 = 70.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExamMode {
    Training,
    Exam,
}

impl ExamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamMode::Training => "training",
            ExamMode::Exam => "exam",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerOption {
    pub id: String,
    pub order_index: i32,
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}

fn default_points() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub order_index: i32,
    pub text: String,
    #[serde(default = "default_points")]
    pub points: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub options: Vec<AnswerOption>,
}

impl Question {
    pub fn correct_option_ids(&self) -> Vec<String> {
        self.options
            .iter()
            .filter(|o| o.is_correct)
            .map(|o| o.id.clone())
            .collect()
    }

    /// Checkbox semantics when more than one option is correct, radio otherwise.
    /// Always derived from the option set, never stored.
    pub fn allows_multiple(&self) -> bool {
        self.options.iter().filter(|o| o.is_correct).count() > 1
    }

    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|o| o.id == option_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub questions: Vec<Question>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passing_score: Option<f64>,
    #[serde(default)]
    pub show_answers_immediately: bool,
    #[serde(default)]
    pub is_published: bool,
}

impl Test {
    pub fn passing_threshold(&self, default: f64) -> f64 {
        self.passing_score.unwrap_or(default)
    }

    pub fn time_limit_seconds(&self) -> Option<u64> {
        self.time_limit_minutes
            .filter(|m| *m > 0)
            .map(|m| u64::from(m) * 60)
    }

    /// Orders questions, and options within each question, by display order.
    /// Navigation and the review grid rely on this order staying fixed.
    pub fn sort_for_presentation(&mut self) {
        self.questions.sort_by_key(|q| q.order_index);
        for question in &mut self.questions {
            question.options.sort_by_key(|o| o.order_index);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub question_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit_minutes: Option<u32>,
}

impl From<&Test> for TestSummary {
    fn from(test: &Test) -> Self {
        Self {
            id: test.id.clone(),
            title: test.title.clone(),
            description: test.description.clone(),
            question_count: test.questions.len(),
            time_limit_minutes: test.time_limit_minutes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub user_id: String,
    pub test_id: String,
    pub mode: ExamMode,
    pub question_count: usize,
}

/// One attempt by one user at one test. Scoring fields are filled in exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub test_id: String,
    pub mode: ExamMode,
    pub started_at: DateTime<Utc>,
    pub total_questions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_spent_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
}

impl SessionRecord {
    pub fn start(id: String, new_session: NewSession) -> Self {
        Self {
            id,
            user_id: new_session.user_id,
            test_id: new_session.test_id,
            mode: new_session.mode,
            started_at: Utc::now(),
            total_questions: new_session.question_count,
            completed_at: None,
            time_spent_seconds: None,
            correct_answers: None,
            score_percentage: None,
            passed: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn apply_results(&mut self, results: &SessionResults) {
        self.completed_at = Some(results.completed_at);
        self.time_spent_seconds = Some(results.time_spent_seconds);
        self.correct_answers = Some(results.correct_answers);
        self.total_questions = results.total_questions;
        self.score_percentage = Some(results.score_percentage);
        self.passed = Some(results.passed);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub session_id: String,
    pub question_id: String,
    pub selected_option_ids: Vec<String>,
    pub is_correct: bool,
    pub points_earned: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResults {
    pub completed_at: DateTime<Utc>,
    pub time_spent_seconds: u64,
    pub correct_answers: u32,
    pub total_questions: usize,
    pub score_percentage: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, issue: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            issue: issue.into(),
        }
    }
}

/// Authoring-time checks for a test definition. Every question needs at least
/// one correct option.
pub fn validate_test(test: &Test) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    if test.id.trim().is_empty() {
        issues.push(ValidationIssue::new("id", "must not be empty"));
    }
    if test.title.trim().is_empty() {
        issues.push(ValidationIssue::new("title", "must not be empty"));
    }
    if let Some(d) = &test.description {
        if d.trim().is_empty() {
            issues.push(ValidationIssue::new("description", "must not be empty when present"));
        }
    }
    if test.time_limit_minutes == Some(0) {
        issues.push(ValidationIssue::new("timeLimitMinutes", "must be positive when present"));
    }
    if let Some(score) = test.passing_score {
        if !(0.0..=100.0).contains(&score) {
            issues.push(ValidationIssue::new("passingScore", "must be between 0 and 100"));
        }
    }
    if test.questions.is_empty() {
        issues.push(ValidationIssue::new("questions", "must contain at least one question"));
    }

    let mut question_ids = HashSet::new();
    let mut order_indices = HashSet::new();
    for (i, q) in test.questions.iter().enumerate() {
        if q.id.trim().is_empty() {
            issues.push(ValidationIssue::new(format!("questions[{i}].id"), "must not be empty"));
        }
        if !question_ids.insert(q.id.as_str()) {
            issues.push(ValidationIssue::new(format!("questions[{i}].id"), "must be unique"));
        }
        if !order_indices.insert(q.order_index) {
            issues.push(ValidationIssue::new(
                format!("questions[{i}].orderIndex"),
                "must be unique within the test",
            ));
        }
        if q.text.trim().is_empty() {
            issues.push(ValidationIssue::new(format!("questions[{i}].text"), "must not be empty"));
        }
        if !(q.points.is_finite() && q.points > 0.0) {
            issues.push(ValidationIssue::new(format!("questions[{i}].points"), "must be positive"));
        }
        if q.options.len() < 2 {
            issues.push(ValidationIssue::new(
                format!("questions[{i}].options"),
                "must contain at least 2 options",
            ));
        }

        let mut option_ids = HashSet::new();
        for (j, opt) in q.options.iter().enumerate() {
            if opt.id.trim().is_empty() || opt.text.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("questions[{i}].options[{j}]"),
                    "id/text must not be empty",
                ));
            }
            if !option_ids.insert(opt.id.as_str()) {
                issues.push(ValidationIssue::new(
                    format!("questions[{i}].options[{j}].id"),
                    "must be unique",
                ));
            }
        }
        if !q.options.iter().any(|o| o.is_correct) {
            issues.push(ValidationIssue::new(
                format!("questions[{i}].options"),
                "must mark at least one option as correct",
            ));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}
