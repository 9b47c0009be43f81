use crate::models::Question;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResult {
    pub question_id: String,
    pub selected_option_ids: Vec<String>,
    pub correct_option_ids: Vec<String>,
    pub is_correct: bool,
    pub points: f64,
    pub points_earned: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreReport {
    pub correct_count: u32,
    pub incorrect_count: u32,
    pub total_points: f64,
    pub earned_points: f64,
    pub per_question: Vec<QuestionResult>,
}

impl ScoreReport {
    pub fn score_percentage(&self) -> f64 {
        if self.total_points <= 0.0 {
            0.0
        } else {
            self.earned_points * 100.0 / self.total_points
        }
    }

    pub fn passed(&self, threshold: f64) -> bool {
        self.score_percentage() >= threshold
    }
}

/// Strict set equality: every selected id is correct and every correct id is
/// selected. Partial selections earn nothing and an empty selection is never
/// correct.
pub fn is_correct(selected: &[String], correct: &[String]) -> bool {
    !selected.is_empty()
        && selected.len() == correct.len()
        && selected.iter().all(|id| correct.contains(id))
        && correct.iter().all(|id| selected.contains(id))
}

pub fn score_question(question: &Question, selected: &[String]) -> QuestionResult {
    let correct_option_ids = question.correct_option_ids();
    let is_correct = is_correct(selected, &correct_option_ids);
    QuestionResult {
        question_id: question.id.clone(),
        selected_option_ids: selected.to_vec(),
        correct_option_ids,
        is_correct,
        points: question.points,
        points_earned: if is_correct { question.points } else { 0.0 },
    }
}

/// Scores every question of the test, touched or not.
pub fn score(questions: &[Question], answers: &HashMap<String, Vec<String>>) -> ScoreReport {
    let mut report = ScoreReport {
        correct_count: 0,
        incorrect_count: 0,
        total_points: 0.0,
        earned_points: 0.0,
        per_question: Vec::with_capacity(questions.len()),
    };
    for question in questions {
        let selected = answers
            .get(&question.id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let result = score_question(question, selected);
        report.total_points += result.points;
        report.earned_points += result.points_earned;
        if result.is_correct {
            report.correct_count += 1;
        } else {
            report.incorrect_count += 1;
        }
        report.per_question.push(result);
    }
    report
}
