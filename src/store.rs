use crate::error::ExamError;
use crate::models::{
    validate_test, AnswerRecord, NewSession, SessionRecord, SessionResults, Test, TestSummary,
    ValidationIssue,
};
use anyhow::Context;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// The narrow persistence contract the session engine depends on.
pub trait ExamStore: Send + Sync {
    /// `Ok(None)` when the test is missing or unpublished.
    fn load_published_test(&self, test_id: &str) -> BoxFuture<'static, anyhow::Result<Option<Test>>>;

    fn create_session(&self, new_session: NewSession) -> BoxFuture<'static, anyhow::Result<SessionRecord>>;

    /// Writes all answers of one submission in a single call.
    fn batch_insert_answers(&self, answers: Vec<AnswerRecord>) -> BoxFuture<'static, anyhow::Result<()>>;

    fn finalize_session(
        &self,
        session_id: &str,
        results: SessionResults,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

#[derive(Default)]
pub struct InMemoryDb {
    pub tests: RwLock<HashMap<String, Test>>,
    pub sessions: RwLock<HashMap<String, SessionRecord>>,
    pub answers: RwLock<HashMap<String, Vec<AnswerRecord>>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistentSnapshot {
    tests: HashMap<String, Test>,
    sessions: HashMap<String, SessionRecord>,
    answers: HashMap<String, Vec<AnswerRecord>>,
}

#[derive(Debug, Deserialize)]
struct TestDocument {
    tests: Vec<Test>,
}

impl InMemoryDb {
    fn from_snapshot(snapshot: PersistentSnapshot) -> Self {
        Self {
            tests: RwLock::new(snapshot.tests),
            sessions: RwLock::new(snapshot.sessions),
            answers: RwLock::new(snapshot.answers),
        }
    }

    async fn snapshot(&self) -> PersistentSnapshot {
        PersistentSnapshot {
            tests: self.tests.read().await.clone(),
            sessions: self.sessions.read().await.clone(),
            answers: self.answers.read().await.clone(),
        }
    }
}

/// In-process store with optional JSON snapshot persistence.
#[derive(Clone)]
pub struct InMemoryStore {
    db: Arc<InMemoryDb>,
    snapshot_path: Option<PathBuf>,
}

const TEST_SCHEMA: &str = include_str!("../contracts/test.schema.json");

/// Compiles the bundled import schema. A broken schema rejects every import.
fn compile_test_schema() -> Result<jsonschema::Validator, ExamError> {
    let schema: serde_json::Value = serde_json::from_str(TEST_SCHEMA).map_err(|e| {
        error!("bundled test schema is not valid json: {}", e);
        ExamError::Persistence(format!("test schema unreadable: {e}"))
    })?;
    jsonschema::draft202012::new(&schema).map_err(|e| {
        error!("bundled test schema does not compile: {}", e);
        ExamError::Persistence(format!("schema build failed: {e}"))
    })
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_db(InMemoryDb::default(), None)
    }

    /// Loads the snapshot at `path` if one exists; later writes go back to it.
    pub fn open(path: Option<&str>) -> Self {
        let snapshot = path.and_then(|path| {
            let raw = fs::read_to_string(path).ok()?;
            match serde_json::from_str::<PersistentSnapshot>(&raw) {
                Ok(s) => Some(s),
                Err(err) => {
                    warn!("failed to read local snapshot {}: {}", path, err);
                    None
                }
            }
        });
        let db = snapshot.map(InMemoryDb::from_snapshot).unwrap_or_default();
        Self::with_db(db, path.map(PathBuf::from))
    }

    fn with_db(db: InMemoryDb, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            db: Arc::new(db),
            snapshot_path,
        }
    }

    pub async fn upsert_test(&self, test: Test) -> Result<(), ExamError> {
        validate_test(&test).map_err(ExamError::InvalidTest)?;
        self.db.tests.write().await.insert(test.id.clone(), test);
        Ok(())
    }

    pub async fn set_published(&self, test_id: &str, published: bool) -> bool {
        let mut tests = self.db.tests.write().await;
        match tests.get_mut(test_id) {
            Some(test) => {
                test.is_published = published;
                true
            }
            None => false,
        }
    }

    pub async fn published_tests(&self) -> Vec<TestSummary> {
        let tests = self.db.tests.read().await;
        let mut items: Vec<TestSummary> = tests
            .values()
            .filter(|t| t.is_published)
            .map(TestSummary::from)
            .collect();
        items.sort_by(|a, b| a.title.cmp(&b.title));
        items
    }

    pub async fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.db.sessions.read().await.get(session_id).cloned()
    }

    pub async fn answers_for(&self, session_id: &str) -> Vec<AnswerRecord> {
        self.db
            .answers
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Imports a `{"tests": [...]}` document. The document is checked against
    /// the bundled JSON schema first, then every test against
    /// [`validate_test`]. Nothing is inserted unless all tests pass.
    pub async fn import_tests_json(&self, raw: &str) -> Result<usize, ExamError> {
        let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
            ExamError::InvalidTest(vec![ValidationIssue {
                field: "$".into(),
                issue: format!("not valid json: {e}"),
            }])
        })?;

        let compiled = compile_test_schema()?;
        if !compiled.is_valid(&value) {
            let issues = compiled
                .iter_errors(&value)
                .map(|e| ValidationIssue {
                    field: e.instance_path.to_string(),
                    issue: e.to_string(),
                })
                .collect();
            return Err(ExamError::InvalidTest(issues));
        }

        let document: TestDocument = serde_json::from_value(value).map_err(|e| {
            ExamError::InvalidTest(vec![ValidationIssue {
                field: "tests".into(),
                issue: format!("cannot decode tests: {e}"),
            }])
        })?;

        let mut issues = Vec::new();
        for (i, test) in document.tests.iter().enumerate() {
            if let Err(found) = validate_test(test) {
                issues.extend(found.into_iter().map(|issue| ValidationIssue {
                    field: format!("tests[{i}].{}", issue.field),
                    issue: issue.issue,
                }));
            }
        }
        if !issues.is_empty() {
            return Err(ExamError::InvalidTest(issues));
        }

        let count = document.tests.len();
        {
            let mut tests = self.db.tests.write().await;
            for test in document.tests {
                tests.insert(test.id.clone(), test);
            }
        }
        info!(count, "imported tests");
        Ok(count)
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        persist_snapshot(&self.db, self.snapshot_path.as_deref()).await
    }
}

async fn persist_snapshot(db: &InMemoryDb, path: Option<&Path>) -> anyhow::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let snapshot = db.snapshot().await;
    let serialized = serde_json::to_vec_pretty(&snapshot)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    tokio::fs::write(path, serialized)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

impl ExamStore for InMemoryStore {
    fn load_published_test(&self, test_id: &str) -> BoxFuture<'static, anyhow::Result<Option<Test>>> {
        let db = self.db.clone();
        let test_id = test_id.to_string();
        Box::pin(async move {
            let tests = db.tests.read().await;
            Ok(tests.get(&test_id).filter(|t| t.is_published).cloned())
        })
    }

    fn create_session(&self, new_session: NewSession) -> BoxFuture<'static, anyhow::Result<SessionRecord>> {
        let db = self.db.clone();
        let path = self.snapshot_path.clone();
        Box::pin(async move {
            let record = SessionRecord::start(uuid::Uuid::new_v4().to_string(), new_session);
            db.sessions.write().await.insert(record.id.clone(), record.clone());
            debug!(session_id = %record.id, test_id = %record.test_id, "session created");
            if let Err(err) = persist_snapshot(&db, path.as_deref()).await {
                warn!("failed to persist local state after create_session: {:#}", err);
            }
            Ok(record)
        })
    }

    fn batch_insert_answers(&self, answers: Vec<AnswerRecord>) -> BoxFuture<'static, anyhow::Result<()>> {
        let db = self.db.clone();
        let path = self.snapshot_path.clone();
        Box::pin(async move {
            {
                let mut stored = db.answers.write().await;
                for answer in answers {
                    let rows = stored.entry(answer.session_id.clone()).or_default();
                    // A retried submission overwrites the rows of the failed attempt.
                    match rows.iter_mut().find(|r| r.question_id == answer.question_id) {
                        Some(existing) => *existing = answer,
                        None => rows.push(answer),
                    }
                }
            }
            if let Err(err) = persist_snapshot(&db, path.as_deref()).await {
                warn!("failed to persist local state after batch_insert_answers: {:#}", err);
            }
            Ok(())
        })
    }

    fn finalize_session(
        &self,
        session_id: &str,
        results: SessionResults,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let db = self.db.clone();
        let path = self.snapshot_path.clone();
        let session_id = session_id.to_string();
        Box::pin(async move {
            {
                let mut sessions = db.sessions.write().await;
                let record = sessions
                    .get_mut(&session_id)
                    .with_context(|| format!("session {session_id} not found"))?;
                if record.is_completed() {
                    anyhow::bail!("session {session_id} is already finalized");
                }
                record.apply_results(&results);
            }
            if let Err(err) = persist_snapshot(&db, path.as_deref()).await {
                warn!("failed to persist local state after finalize_session: {:#}", err);
            }
            Ok(())
        })
    }
}
