//! The exam session state machine.
//!
//! One [`ExamSession`] drives one attempt: it loads the test, owns the
//! in-memory answers, runs the countdown and performs the single guarded
//! submission. Phases are derived from flags rather than stored:
//!
//! * `loading` until [`ExamSession::initialize`] settles,
//! * `submitting` while a submission is in flight,
//! * `results` once the store accepted both writes,
//! * `error` for the last fatal or submission failure.
//!
//! Every mutation and every published event is preceded by a liveness check
//! on the session's [`LifecycleTracker`]; once [`ExamSession::unmount`] ran,
//! in-flight store calls finish silently and nothing else changes.

use crate::config::EngineSettings;
use crate::error::ExamError;
use crate::events::{self, BroadcastNotifier, EventEnvelope, Notifier};
use crate::guard::SubmissionGuard;
use crate::lifecycle::LifecycleTracker;
use crate::models::{
    AnswerRecord, ExamMode, NewSession, Question, SessionRecord, SessionResults, Test,
};
use crate::scoring::{self, QuestionResult};
use crate::store::ExamStore;
use crate::timer::{self, TickControl, TimerSlot};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub mode: ExamMode,
    pub test_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Loading,
    Active,
    Submitting,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitTrigger {
    Manual,
    Timeout,
}

/// Completion payload handed to the caller once both writes succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExamResults {
    pub session: SessionRecord,
    pub correct_answers: u32,
    pub incorrect_answers: u32,
    pub total_questions: usize,
    pub total_points: f64,
    pub earned_points: f64,
    pub score_percentage: f64,
    pub passing_score: f64,
    pub passed: bool,
    pub time_spent_seconds: u64,
    pub questions: Vec<QuestionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub answered: usize,
    pub marked_for_review: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionView {
    pub id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionView {
    pub id: String,
    pub order_index: i32,
    pub text: String,
    pub points: f64,
    pub allows_multiple: bool,
    pub options: Vec<OptionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl QuestionView {
    fn new(question: &Question, reveal: bool) -> Self {
        Self {
            id: question.id.clone(),
            order_index: question.order_index,
            text: question.text.clone(),
            points: question.points,
            allows_multiple: question.allows_multiple(),
            options: question
                .options
                .iter()
                .map(|o| OptionView {
                    id: o.id.clone(),
                    text: o.text.clone(),
                    is_correct: reveal.then_some(o.is_correct),
                })
                .collect(),
            explanation: if reveal { question.explanation.clone() } else { None },
        }
    }
}

/// Immediate correctness shown in training mode when the test allows it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerFeedback {
    pub question_id: String,
    pub is_correct: bool,
    pub correct_option_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GridCell {
    pub index: usize,
    pub question_id: String,
    pub answered: bool,
    pub marked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub loading: bool,
    pub phase: SessionPhase,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub session: Option<SessionRecord>,
    pub test_title: Option<String>,
    pub current_index: usize,
    pub current_question: Option<QuestionView>,
    pub selected_answer: Vec<String>,
    pub is_marked_for_review: bool,
    pub progress: Progress,
    pub question_grid: Vec<GridCell>,
    pub time_elapsed: u64,
    pub time_remaining: Option<u64>,
    pub is_submitting: bool,
    pub feedback: Option<AnswerFeedback>,
    pub results: Option<ExamResults>,
}

struct SessionState {
    test: Test,
    record: SessionRecord,
    current_index: usize,
    answers: HashMap<String, Vec<String>>,
    marked_for_review: BTreeSet<String>,
    ticks: u64,
}

impl SessionState {
    fn new(test: Test, record: SessionRecord) -> Self {
        Self {
            test,
            record,
            current_index: 0,
            answers: HashMap::new(),
            marked_for_review: BTreeSet::new(),
            ticks: 0,
        }
    }

    fn time_limit(&self) -> Option<u64> {
        match self.record.mode {
            ExamMode::Exam => self.test.time_limit_seconds(),
            ExamMode::Training => None,
        }
    }

    /// Timed sessions count ticks; untimed ones report wall time since start.
    fn elapsed_seconds(&self) -> u64 {
        if self.time_limit().is_some() {
            self.ticks
        } else {
            let since = Utc::now() - self.record.started_at;
            u64::try_from(since.num_seconds()).unwrap_or(0)
        }
    }

    fn current_question(&self) -> &Question {
        &self.test.questions[self.current_index]
    }

    fn selected(&self, question_id: &str) -> &[String] {
        self.answers
            .get(question_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn is_answered(&self, question_id: &str) -> bool {
        !self.selected(question_id).is_empty()
    }

    fn answered_count(&self) -> usize {
        self.answers.values().filter(|ids| !ids.is_empty()).count()
    }

    fn select(&mut self, option_id: &str) -> bool {
        let question = &self.test.questions[self.current_index];
        if !question.has_option(option_id) {
            return false;
        }
        let allow_multiple = question.allows_multiple();
        let selected = self.answers.entry(question.id.clone()).or_default();
        if allow_multiple {
            match selected.iter().position(|id| id == option_id) {
                Some(pos) => {
                    selected.remove(pos);
                }
                None => selected.push(option_id.to_string()),
            }
        } else {
            *selected = vec![option_id.to_string()];
        }
        true
    }

    fn go_to(&mut self, index: i64) -> bool {
        match usize::try_from(index) {
            Ok(index) if index < self.test.questions.len() && index != self.current_index => {
                self.current_index = index;
                true
            }
            _ => false,
        }
    }

    fn toggle_mark(&mut self) {
        let id = self.current_question().id.clone();
        if !self.marked_for_review.remove(&id) {
            self.marked_for_review.insert(id);
        }
    }
}

#[derive(Default)]
struct View {
    loading: bool,
    error: Option<ExamError>,
    state: Option<SessionState>,
    results: Option<ExamResults>,
}

/// Values frozen at the start of a submission.
struct Captured {
    test: Test,
    record: SessionRecord,
    answers: HashMap<String, Vec<String>>,
    elapsed: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ExamSession {
    config: SessionConfig,
    settings: EngineSettings,
    store: Arc<dyn ExamStore>,
    notifier: Arc<dyn Notifier>,
    lifecycle: LifecycleTracker,
    guard: SubmissionGuard,
    submitting: AtomicBool,
    initialized: AtomicBool,
    view: Mutex<View>,
    timer: Arc<Mutex<TimerSlot>>,
}

impl ExamSession {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn ExamStore>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let timer = Arc::new(Mutex::new(TimerSlot::default()));
        let lifecycle = LifecycleTracker::new();
        let slot = timer.clone();
        lifecycle.add_cleanup(move || lock(&slot).stop());

        let test_id = config.test_id.clone();
        let guard = SubmissionGuard::new(settings.submit_cooldown).with_error_handler(move |msg| {
            warn!(test_id = %test_id, "submission attempt failed: {}", msg)
        });

        Arc::new(Self {
            config,
            settings,
            store,
            notifier,
            lifecycle,
            guard,
            submitting: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            view: Mutex::new(View {
                loading: true,
                ..View::default()
            }),
            timer,
        })
    }

    /// Session with its own broadcast notifier.
    pub fn with_store(
        config: SessionConfig,
        store: Arc<dyn ExamStore>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let notifier = Arc::new(BroadcastNotifier::new(settings.event_channel_capacity));
        Self::new(config, store, notifier, settings)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.notifier.subscribe()
    }

    pub fn is_mounted(&self) -> bool {
        self.lifecycle.is_mounted()
    }

    pub fn is_submitting(&self) -> bool {
        self.guard.is_submitting() || self.submitting.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.view).state.as_ref().map(|s| s.record.id.clone())
    }

    /// The last initialization or submission failure, if it still stands.
    pub fn error(&self) -> Option<ExamError> {
        lock(&self.view).error.clone()
    }

    pub fn results(&self) -> Option<ExamResults> {
        lock(&self.view).results.clone()
    }

    /// Tears the session down: the timer stops and every later mutation or
    /// event is suppressed.
    pub fn unmount(&self) {
        if self.lifecycle.is_mounted() {
            debug!(test_id = %self.config.test_id, "exam session unmounted");
        }
        self.lifecycle.teardown();
    }

    /// Loads the test, creates the session record and starts the countdown.
    /// Failures land on the snapshot; runs at most once.
    pub async fn initialize(self: &Arc<Self>) {
        if !self.lifecycle.is_mounted() || self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.config.user_id.trim().is_empty() {
            self.fail_initialization(ExamError::Unauthorized);
            return;
        }

        match self.load().await {
            Ok(state) => {
                let session_id = state.record.id.clone();
                let question_count = state.test.questions.len();
                {
                    let mut view = lock(&self.view);
                    if !self.lifecycle.is_mounted() {
                        return;
                    }
                    view.loading = false;
                    view.state = Some(state);
                }
                info!(
                    session_id = %session_id,
                    test_id = %self.config.test_id,
                    mode = self.config.mode.as_str(),
                    question_count,
                    "exam session started"
                );
                self.start_timer();
                self.publish_snapshot(events::EVENT_INITIALIZED);
            }
            Err(err) => self.fail_initialization(err),
        }
    }

    async fn load(&self) -> Result<SessionState, ExamError> {
        let mut test = self
            .store
            .load_published_test(&self.config.test_id)
            .await
            .map_err(|e| ExamError::persistence(e.context("load test")))?
            .ok_or(ExamError::NotFound)?;
        if test.questions.is_empty() {
            return Err(ExamError::NoQuestions);
        }
        test.sort_for_presentation();

        let record = self
            .store
            .create_session(NewSession {
                user_id: self.config.user_id.clone(),
                test_id: test.id.clone(),
                mode: self.config.mode,
                question_count: test.questions.len(),
            })
            .await
            .map_err(|e| ExamError::persistence(e.context("create session")))?;
        Ok(SessionState::new(test, record))
    }

    fn fail_initialization(&self, err: ExamError) {
        warn!(
            test_id = %self.config.test_id,
            code = err.code(),
            "exam session failed to start: {}",
            err
        );
        {
            let mut view = lock(&self.view);
            if !self.lifecycle.is_mounted() {
                return;
            }
            view.loading = false;
            view.error = Some(err.clone());
        }
        self.emit(
            events::EVENT_INIT_FAILED,
            json!({ "code": err.code(), "message": err.to_string() }),
        );
    }

    /// Selects `option_id` on the current question: toggles it when the
    /// question has several correct options, replaces the selection otherwise.
    pub fn select_answer(&self, option_id: &str) {
        self.mutate(|state| state.select(option_id));
    }

    pub fn go_to_next(&self) {
        self.mutate(|state| state.go_to(state.current_index as i64 + 1));
    }

    pub fn go_to_previous(&self) {
        self.mutate(|state| state.go_to(state.current_index as i64 - 1));
    }

    /// Out-of-range indices are ignored.
    pub fn go_to_question(&self, index: i64) {
        self.mutate(|state| state.go_to(index));
    }

    pub fn toggle_mark_for_review(&self) {
        self.mutate(|state| {
            state.toggle_mark();
            true
        });
    }

    fn mutate<F>(&self, action: F)
    where
        F: FnOnce(&mut SessionState) -> bool,
    {
        let changed = {
            let mut view = lock(&self.view);
            if !self.lifecycle.is_mounted() || view.results.is_some() {
                return;
            }
            match view.state.as_mut() {
                Some(state) => action(state),
                None => return,
            }
        };
        if changed {
            self.publish_snapshot(events::EVENT_STATE_CHANGED);
        }
    }

    fn start_timer(self: &Arc<Self>) {
        let limit = match lock(&self.view).state.as_ref().and_then(SessionState::time_limit) {
            Some(limit) => limit,
            None => return,
        };
        if !self.lifecycle.is_mounted() {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = timer::spawn_ticker(self.settings.tick_interval, move || match weak.upgrade() {
            Some(session) => session.on_tick(limit),
            None => TickControl::Stop,
        });
        lock(&self.timer).replace(handle);
    }

    fn on_tick(self: &Arc<Self>, limit: u64) -> TickControl {
        let elapsed = {
            let mut view = lock(&self.view);
            if !self.lifecycle.is_mounted()
                || view.results.is_some()
                || self.submitting.load(Ordering::SeqCst)
            {
                return TickControl::Stop;
            }
            let Some(state) = view.state.as_mut() else {
                return TickControl::Stop;
            };
            if state.ticks < limit {
                state.ticks += 1;
            }
            state.ticks
        };
        self.emit(
            events::EVENT_TICK,
            json!({ "timeElapsed": elapsed, "timeRemaining": limit.saturating_sub(elapsed) }),
        );

        // Keeps firing once per tick until a submission takes over; attempts
        // dropped by the guard's cooldown are retried on the next tick.
        if elapsed >= limit {
            info!(test_id = %self.config.test_id, limit, "time limit reached, submitting");
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session.submit(SubmitTrigger::Timeout).await;
            });
        }
        TickControl::Continue
    }

    /// Grades and persists the attempt. Duplicate, concurrent, stale and
    /// cooling-down calls are ignored; failures land on the snapshot and can
    /// be retried with the same answers.
    pub async fn submit_exam(self: &Arc<Self>) {
        self.submit(SubmitTrigger::Manual).await;
    }

    async fn submit(self: &Arc<Self>, trigger: SubmitTrigger) {
        let session = Arc::clone(self);
        let attempt = move || async move {
            // Runs detached: dropping the caller never cancels the store
            // writes or strands the submitting flag.
            tokio::spawn(async move { session.run_submission(trigger).await })
                .await
                .unwrap_or_else(|err| {
                    Err(ExamError::Persistence(format!("submission task failed: {err}")))
                })
        };
        match self.guard.run(attempt).await {
            None => debug!(?trigger, "submission ignored by guard"),
            Some(Ok(None)) => debug!(?trigger, "stale submission ignored"),
            Some(Ok(Some(_))) | Some(Err(_)) => {}
        }
    }

    async fn run_submission(
        self: &Arc<Self>,
        trigger: SubmitTrigger,
    ) -> Result<Option<ExamResults>, ExamError> {
        if !self.lifecycle.is_mounted() {
            return Ok(None);
        }
        if self
            .submitting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }

        let captured = {
            let mut view = lock(&self.view);
            let captured = match (&view.results, view.state.as_ref()) {
                (None, Some(state)) => Some(Captured {
                    test: state.test.clone(),
                    record: state.record.clone(),
                    answers: state.answers.clone(),
                    elapsed: state.elapsed_seconds(),
                }),
                _ => None,
            };
            if captured.is_some() && self.lifecycle.is_mounted() {
                view.error = None;
            }
            captured
        };
        let Some(captured) = captured else {
            self.submitting.store(false, Ordering::SeqCst);
            return Ok(None);
        };

        lock(&self.timer).stop();
        info!(
            session_id = %captured.record.id,
            ?trigger,
            answered = captured.answers.values().filter(|ids| !ids.is_empty()).count(),
            "submitting exam"
        );
        self.publish_snapshot(events::EVENT_SUBMITTING);

        match self.grade_and_persist(&captured).await {
            Ok(results) => {
                {
                    let mut view = lock(&self.view);
                    if !self.lifecycle.is_mounted() {
                        info!(session_id = %captured.record.id, "exam finalized after teardown");
                        return Ok(Some(results));
                    }
                    if let Some(state) = view.state.as_mut() {
                        state.record = results.session.clone();
                    }
                    view.results = Some(results.clone());
                }
                info!(
                    session_id = %captured.record.id,
                    score = results.score_percentage,
                    passed = results.passed,
                    "exam completed"
                );
                match serde_json::to_value(&results) {
                    Ok(payload) => self.emit(events::EVENT_COMPLETED, payload),
                    Err(err) => warn!("failed to encode results: {}", err),
                }
                Ok(Some(results))
            }
            Err(err) => {
                error!(session_id = %captured.record.id, code = err.code(), "exam submission failed: {}", err);
                {
                    let mut view = lock(&self.view);
                    if self.lifecycle.is_mounted() {
                        view.error = Some(err.clone());
                    }
                }
                self.submitting.store(false, Ordering::SeqCst);
                if self.lifecycle.is_mounted() {
                    self.start_timer();
                    self.emit(
                        events::EVENT_SUBMISSION_FAILED,
                        json!({ "code": err.code(), "message": err.to_string() }),
                    );
                }
                Err(err)
            }
        }
    }

    async fn grade_and_persist(&self, captured: &Captured) -> Result<ExamResults, ExamError> {
        let report = scoring::score(&captured.test.questions, &captured.answers);
        let score_percentage = report.score_percentage();
        let passing_score = captured
            .test
            .passing_threshold(self.settings.default_passing_score);
        let passed = score_percentage >= passing_score;
        let session_id = captured.record.id.clone();

        let rows = report
            .per_question
            .iter()
            .map(|r| AnswerRecord {
                session_id: session_id.clone(),
                question_id: r.question_id.clone(),
                selected_option_ids: r.selected_option_ids.clone(),
                is_correct: r.is_correct,
                points_earned: r.points_earned,
            })
            .collect();
        self.store
            .batch_insert_answers(rows)
            .await
            .map_err(|e| ExamError::persistence(e.context("save answers")))?;

        let summary = SessionResults {
            completed_at: Utc::now(),
            time_spent_seconds: captured.elapsed,
            correct_answers: report.correct_count,
            total_questions: captured.test.questions.len(),
            score_percentage,
            passed,
        };
        self.store
            .finalize_session(&session_id, summary.clone())
            .await
            .map_err(|e| ExamError::persistence(e.context("finalize session")))?;

        let mut session = captured.record.clone();
        session.apply_results(&summary);
        Ok(ExamResults {
            session,
            correct_answers: report.correct_count,
            incorrect_answers: report.incorrect_count,
            total_questions: summary.total_questions,
            total_points: report.total_points,
            earned_points: report.earned_points,
            score_percentage,
            passing_score,
            passed,
            time_spent_seconds: summary.time_spent_seconds,
            questions: report.per_question,
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let view = lock(&self.view);
        let completed = view.results.is_some();
        let is_submitting = !completed && self.is_submitting();
        let phase = if view.loading {
            SessionPhase::Loading
        } else if completed {
            SessionPhase::Completed
        } else if is_submitting {
            SessionPhase::Submitting
        } else if view.error.is_some() || view.state.is_none() {
            SessionPhase::Error
        } else {
            SessionPhase::Active
        };

        let mut snapshot = SessionSnapshot {
            loading: view.loading,
            phase,
            error: view.error.as_ref().map(ToString::to_string),
            error_code: view.error.as_ref().map(|e| e.code().to_string()),
            session: None,
            test_title: None,
            current_index: 0,
            current_question: None,
            selected_answer: Vec::new(),
            is_marked_for_review: false,
            progress: Progress {
                current: 0,
                total: 0,
                answered: 0,
                marked_for_review: 0,
            },
            question_grid: Vec::new(),
            time_elapsed: 0,
            time_remaining: None,
            is_submitting,
            feedback: None,
            results: view.results.clone(),
        };
        let Some(state) = view.state.as_ref() else {
            return snapshot;
        };

        let question = state.current_question();
        let selected = state.selected(&question.id);
        let show_feedback = state.record.mode == ExamMode::Training
            && state.test.show_answers_immediately
            && !selected.is_empty();
        let time_elapsed = view
            .results
            .as_ref()
            .map(|r| r.time_spent_seconds)
            .unwrap_or_else(|| state.elapsed_seconds());

        snapshot.session = Some(state.record.clone());
        snapshot.test_title = Some(state.test.title.clone());
        snapshot.current_index = state.current_index;
        snapshot.current_question = Some(QuestionView::new(question, completed || show_feedback));
        snapshot.selected_answer = selected.to_vec();
        snapshot.is_marked_for_review = state.marked_for_review.contains(&question.id);
        snapshot.progress = Progress {
            current: state.current_index + 1,
            total: state.test.questions.len(),
            answered: state.answered_count(),
            marked_for_review: state.marked_for_review.len(),
        };
        snapshot.question_grid = state
            .test
            .questions
            .iter()
            .enumerate()
            .map(|(index, q)| GridCell {
                index,
                question_id: q.id.clone(),
                answered: state.is_answered(&q.id),
                marked: state.marked_for_review.contains(&q.id),
            })
            .collect();
        snapshot.time_elapsed = time_elapsed;
        snapshot.time_remaining = state.time_limit().map(|l| l.saturating_sub(time_elapsed));
        if show_feedback {
            let correct_option_ids = question.correct_option_ids();
            snapshot.feedback = Some(AnswerFeedback {
                question_id: question.id.clone(),
                is_correct: scoring::is_correct(selected, &correct_option_ids),
                correct_option_ids,
                explanation: question.explanation.clone(),
            });
        }
        snapshot
    }

    fn publish_snapshot(&self, event: &str) {
        if !self.lifecycle.is_mounted() {
            return;
        }
        match serde_json::to_value(self.snapshot()) {
            Ok(payload) => self.emit(event, payload),
            Err(err) => warn!("failed to encode session snapshot: {}", err),
        }
    }

    fn emit(&self, event: &str, payload: Value) {
        if !self.lifecycle.is_mounted() {
            return;
        }
        self.notifier
            .publish(EventEnvelope::now(event, self.session_id(), payload));
    }
}
