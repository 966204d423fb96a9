#![allow(clippy::result_large_err)]

//! SQLite-backed repositories. WAL journal mode with a busy timeout; reports
//! and their matches move in single transactions.

use crate::core::catalog::{Technique, TechniqueIndex};
use crate::core::error::AppError;
use crate::core::matching::{EvalMatch, MatchSource};
use crate::core::report::{Report, ReportSummary};
use crate::core::storage::{
    ContextStore, ReportListItem, ReportPage, ReportQuery, ReportSortBy, ReportStore, SortOrder,
    TaskRunRow, TechniqueStore,
};
use crate::core::types::{ErrorCategory, WorkflowStatus};
use crate::core::workflow::{TaskErrorRecord, WorkflowContext};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use serde_json::json;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    source_url TEXT,
    document_id TEXT,
    current_step TEXT,
    error TEXT,
    completion_time TEXT,
    state_blob TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);

CREATE TABLE IF NOT EXISTS task_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
    task_name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    result_data TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_results_workflow ON task_results(workflow_id);

CREATE TABLE IF NOT EXISTS reports (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    url TEXT,
    created_at TEXT NOT NULL,
    mitre_version TEXT NOT NULL,
    summary_data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reports_workflow ON reports(workflow_id);

CREATE TABLE IF NOT EXISTS matches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    report_id TEXT NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
    technique_id TEXT NOT NULL,
    technique_name TEXT NOT NULL,
    confidence_score REAL NOT NULL,
    context_text TEXT,
    matched_text TEXT NOT NULL,
    start_char INTEGER NOT NULL,
    end_char INTEGER NOT NULL,
    multi_source INTEGER NOT NULL,
    dominant_source TEXT NOT NULL,
    tactics TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_matches_report ON matches(report_id);
CREATE INDEX IF NOT EXISTS idx_matches_technique ON matches(technique_id);

CREATE TABLE IF NOT EXISTS mitre_techniques (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    tactics TEXT NOT NULL,
    data_sources TEXT NOT NULL,
    platforms TEXT NOT NULL,
    detection TEXT NOT NULL,
    mitigations TEXT NOT NULL,
    url TEXT NOT NULL,
    keywords TEXT NOT NULL,
    version TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<(), AppError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _: String = conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "on")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection lock")
    }
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| {
            AppError::new(
                ErrorCategory::StorageError,
                format!("invalid stored timestamp {:?}: {}", value, err),
            )
        })
}

fn save_context_with(conn: &Connection, context: &WorkflowContext) -> Result<(), AppError> {
    let blob = serde_json::to_string(context)?;
    let error = context.last_error().map(|(_, record)| record.message.clone());
    let completion_time = context.status.is_terminal().then(|| ts(&context.updated_at));
    conn.execute(
        "INSERT OR REPLACE INTO workflows
             (id, type, status, created_at, updated_at, source_url, document_id,
              current_step, error, completion_time, state_blob)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            context.workflow_id.to_string(),
            context.workflow_type,
            context.status.as_str(),
            ts(&context.started_at),
            ts(&context.updated_at),
            context.metadata.source_url,
            context.metadata.source_filename,
            context.current_task,
            error,
            completion_time,
            blob,
        ],
    )?;
    Ok(())
}

fn context_from_blob(blob: &str) -> Result<WorkflowContext, AppError> {
    serde_json::from_str(blob).map_err(|err| {
        AppError::new(
            ErrorCategory::StorageError,
            format!("corrupt workflow state blob: {}", err),
        )
    })
}

impl ContextStore for SqliteStore {
    fn save_context(&self, context: &WorkflowContext) -> Result<(), AppError> {
        let conn = self.lock();
        save_context_with(&conn, context)
    }

    fn load_context(&self, workflow_id: &Uuid) -> Result<Option<WorkflowContext>, AppError> {
        let conn = self.lock();
        let blob: Option<String> = conn
            .query_row(
                "SELECT state_blob FROM workflows WHERE id = ?1",
                params![workflow_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|blob| context_from_blob(&blob)).transpose()
    }

    fn list_contexts(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowContext>, AppError> {
        let conn = self.lock();
        let mut contexts = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT state_blob FROM workflows WHERE status = ?1
                     ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![status.as_str()], |row| {
                    row.get::<_, String>(0)
                })?;
                for blob in rows {
                    contexts.push(context_from_blob(&blob?)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT state_blob FROM workflows ORDER BY created_at DESC")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                for blob in rows {
                    contexts.push(context_from_blob(&blob?)?);
                }
            }
        }
        Ok(contexts)
    }

    fn record_task_run(&self, run: &TaskRunRow) -> Result<(), AppError> {
        let conn = self.lock();
        let result_data = run
            .result_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO task_results
                 (workflow_id, task_name, status, started_at, completed_at, result_data, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.workflow_id.to_string(),
                run.task_name,
                run.status.as_str(),
                ts(&run.started_at),
                run.completed_at.as_ref().map(ts),
                result_data,
                run.error,
            ],
        )?;
        Ok(())
    }

    fn recover_crashed(&self, grace: chrono::Duration) -> Result<usize, AppError> {
        let cutoff = ts(&(Utc::now() - grace));
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let blobs: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT state_blob FROM workflows
                 WHERE status = 'running' AND updated_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut recovered = 0usize;
        for blob in blobs {
            let mut context = context_from_blob(&blob)?;
            context.status = WorkflowStatus::Failed;
            let task = context
                .current_task
                .clone()
                .unwrap_or_else(|| "workflow".to_string());
            context.errors.insert(
                task,
                TaskErrorRecord {
                    category: format!("{:?}", ErrorCategory::Crashed),
                    code: "WF-CRASH-001".to_string(),
                    message: "workflow exceeded the recovery grace window without progress"
                        .to_string(),
                    retriable: false,
                },
            );
            context.current_task = None;
            context.touch();
            save_context_with(&tx, &context)?;
            recovered += 1;
        }
        tx.commit()?;
        Ok(recovered)
    }
}

fn match_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvalMatch> {
    let score: f64 = row.get("confidence_score")?;
    let tactics_json: String = row.get("tactics")?;
    let source: String = row.get("dominant_source")?;
    Ok(EvalMatch {
        technique_id: row.get("technique_id")?,
        technique_name: row.get("technique_name")?,
        tactics: serde_json::from_str(&tactics_json).unwrap_or_default(),
        score: score.clamp(0.0, 100.0) as u8,
        matched_text: row.get("matched_text")?,
        context: row.get::<_, Option<String>>("context_text")?.unwrap_or_default(),
        start_char: row.get::<_, i64>("start_char")? as usize,
        end_char: row.get::<_, i64>("end_char")? as usize,
        matched_by_multiple: row.get::<_, i64>("multi_source")? != 0,
        dominant_source: MatchSource::parse(&source).unwrap_or(MatchSource::Keyword),
    })
}

impl ReportStore for SqliteStore {
    fn insert_report(&self, report: &Report) -> Result<(), AppError> {
        let summary_data = serde_json::to_string(&json!({
            "summary": report.summary,
            "sourceFilename": report.source_filename,
        }))?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO reports (id, workflow_id, url, created_at, mitre_version, summary_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.id.to_string(),
                report.workflow_id.to_string(),
                report.source_url,
                ts(&report.created_at),
                report.mitre_version,
                summary_data,
            ],
        )?;
        for m in &report.matches {
            tx.execute(
                "INSERT INTO matches
                     (report_id, technique_id, technique_name, confidence_score, context_text,
                      matched_text, start_char, end_char, multi_source, dominant_source, tactics)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    report.id.to_string(),
                    m.technique_id,
                    m.technique_name,
                    m.score as f64,
                    m.context,
                    m.matched_text,
                    m.start_char as i64,
                    m.end_char as i64,
                    m.matched_by_multiple as i64,
                    m.dominant_source.as_str(),
                    serde_json::to_string(&m.tactics)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_report(&self, report_id: &Uuid) -> Result<Option<Report>, AppError> {
        let conn = self.lock();
        let header = conn
            .query_row(
                "SELECT workflow_id, url, created_at, mitre_version, summary_data
                 FROM reports WHERE id = ?1",
                params![report_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((workflow_id, url, created_at, mitre_version, summary_data)) = header else {
            return Ok(None);
        };

        let summary_value: serde_json::Value = serde_json::from_str(&summary_data)?;
        let summary: ReportSummary =
            serde_json::from_value(summary_value["summary"].clone())?;
        let source_filename: Option<String> =
            serde_json::from_value(summary_value["sourceFilename"].clone()).unwrap_or(None);

        let mut stmt = conn.prepare(
            "SELECT technique_id, technique_name, confidence_score, context_text, matched_text,
                    start_char, end_char, multi_source, dominant_source, tactics
             FROM matches WHERE report_id = ?1
             ORDER BY confidence_score DESC, technique_id ASC",
        )?;
        let matches: Vec<EvalMatch> = stmt
            .query_map(params![report_id.to_string()], match_from_row)?
            .collect::<Result<_, _>>()?;

        Ok(Some(Report {
            id: *report_id,
            workflow_id: Uuid::parse_str(&workflow_id).map_err(|err| {
                AppError::new(
                    ErrorCategory::StorageError,
                    format!("invalid workflow id on report row: {}", err),
                )
            })?,
            source_url: url,
            source_filename,
            created_at: parse_ts(&created_at)?,
            mitre_version,
            summary,
            matches,
        }))
    }

    fn delete_report(&self, report_id: &Uuid) -> Result<bool, AppError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM matches WHERE report_id = ?1",
            params![report_id.to_string()],
        )?;
        let deleted = tx.execute(
            "DELETE FROM reports WHERE id = ?1",
            params![report_id.to_string()],
        )?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn list_reports(&self, query: &ReportQuery) -> Result<ReportPage, AppError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(from) = &query.date_from {
            clauses.push("created_at >= ?".to_string());
            values.push(Box::new(ts(from)));
        }
        if let Some(to) = &query.date_to {
            clauses.push("created_at <= ?".to_string());
            values.push(Box::new(ts(to)));
        }
        if let Some(url) = &query.url_contains {
            clauses.push("url LIKE '%' || ? || '%'".to_string());
            values.push(Box::new(url.clone()));
        }
        if let Some(min_matches) = query.min_matches {
            clauses.push(
                "(SELECT COUNT(*) FROM matches m WHERE m.report_id = reports.id) >= ?".to_string(),
            );
            values.push(Box::new(min_matches as i64));
        }
        if !query.techniques.is_empty() {
            let placeholders = vec!["?"; query.techniques.len()].join(", ");
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM matches m WHERE m.report_id = reports.id \
                 AND m.technique_id IN ({}))",
                placeholders
            ));
            for technique in &query.techniques {
                values.push(Box::new(technique.clone()));
            }
        }
        if !query.tactics.is_empty() {
            // Tactics live as a JSON array on each match row; substring match
            // against the quoted value is exact enough for short-name tags.
            let likes = vec!["m.tactics LIKE '%' || ? || '%'"; query.tactics.len()].join(" OR ");
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM matches m WHERE m.report_id = reports.id AND ({}))",
                likes
            ));
            for tactic in &query.tactics {
                values.push(Box::new(format!("\"{}\"", tactic)));
            }
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order_column = match query.sort_by {
            ReportSortBy::Timestamp => "created_at",
            ReportSortBy::Url => "url",
            ReportSortBy::MatchCount => "match_count",
        };
        let order_direction = match query.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let limit = query.limit.clamp(1, 100);
        let offset = query.page.saturating_sub(1) * limit;

        let conn = self.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM reports {}", where_clause),
            params_from_iter(values.iter().map(|v| v.as_ref())),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT id, workflow_id, url, created_at, mitre_version, summary_data,
                    (SELECT COUNT(*) FROM matches m WHERE m.report_id = reports.id) AS match_count
             FROM reports {}
             ORDER BY {} {}
             LIMIT {} OFFSET {}",
            where_clause, order_column, order_direction, limit, offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(values.iter().map(|v| v.as_ref())),
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )?;

        let mut items = Vec::new();
        for row in rows {
            let (id, workflow_id, url, created_at, mitre_version, summary_data, match_count) =
                row?;
            let summary_value: serde_json::Value =
                serde_json::from_str(&summary_data).unwrap_or_default();
            let source_filename = summary_value
                .get("sourceFilename")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            items.push(ReportListItem {
                id: Uuid::parse_str(&id).map_err(|err| {
                    AppError::new(
                        ErrorCategory::StorageError,
                        format!("invalid report id: {}", err),
                    )
                })?,
                workflow_id: Uuid::parse_str(&workflow_id).map_err(|err| {
                    AppError::new(
                        ErrorCategory::StorageError,
                        format!("invalid workflow id: {}", err),
                    )
                })?,
                source_url: url,
                source_filename,
                created_at: parse_ts(&created_at)?,
                mitre_version,
                match_count: match_count as usize,
            });
        }

        Ok(ReportPage {
            items,
            total: total as usize,
            page: query.page.max(1),
            limit,
        })
    }
}

impl TechniqueStore for SqliteStore {
    fn upsert_techniques(&self, version: &str, index: &TechniqueIndex) -> Result<usize, AppError> {
        let now = ts(&Utc::now());
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut count = 0usize;
        for technique in index.techniques() {
            tx.execute(
                "INSERT OR REPLACE INTO mitre_techniques
                     (id, name, description, tactics, data_sources, platforms, detection,
                      mitigations, url, keywords, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    technique.id,
                    technique.name,
                    technique.description,
                    serde_json::to_string(&technique.tactics)?,
                    serde_json::to_string(&technique.data_sources)?,
                    serde_json::to_string(&technique.platforms)?,
                    technique.detection,
                    serde_json::to_string(&technique.mitigations)?,
                    technique.url,
                    serde_json::to_string(&technique.keywords)?,
                    version,
                    now,
                ],
            )?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    }

    fn load_techniques(&self) -> Result<Option<(String, Vec<Technique>)>, AppError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, tactics, data_sources, platforms, detection,
                    mitigations, url, keywords, version
             FROM mitre_techniques ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;

        let mut version: Option<String> = None;
        let mut techniques: Vec<Technique> = Vec::new();
        for row in rows {
            let (id, name, description, tactics, data_sources, platforms, detection, mitigations, url, keywords, row_version) = row?;
            version.get_or_insert(row_version);
            let parent_id = id.find('.').map(|dot| id[..dot].to_string());
            techniques.push(Technique {
                id,
                name,
                description,
                tactics: serde_json::from_str(&tactics).unwrap_or_default(),
                platforms: serde_json::from_str(&platforms).unwrap_or_default(),
                data_sources: serde_json::from_str(&data_sources).unwrap_or_default(),
                detection,
                mitigations: serde_json::from_str(&mitigations).unwrap_or_default(),
                url,
                keywords: serde_json::from_str(&keywords).unwrap_or_default(),
                parent_id,
                sub_techniques: Vec::new(),
            });
        }
        if techniques.is_empty() {
            return Ok(None);
        }

        // Rebuild sub-technique grouping from the id structure.
        let child_ids: Vec<(String, String)> = techniques
            .iter()
            .filter_map(|t| t.parent_id.clone().map(|p| (p, t.id.clone())))
            .collect();
        for technique in techniques.iter_mut() {
            let mut subs: Vec<String> = child_ids
                .iter()
                .filter(|(parent, _)| parent == &technique.id)
                .map(|(_, child)| child.clone())
                .collect();
            subs.sort();
            technique.sub_techniques = subs;
        }

        Ok(version.map(|version| (version, techniques)))
    }
}
