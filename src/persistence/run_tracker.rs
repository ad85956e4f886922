//! SQLite recording of pipeline runs, violations, fixes, and aggregate
//! scan-code statistics across runs.

use buildsmith_models::Violation;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// Persistence schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// One aggregated row of `scan_code_stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCodeStat {
    pub scan_code: String,
    pub tech_stack: String,
    pub occurrence_count: u32,
    pub fix_success_rate: f64,
    pub avg_fix_cost: f64,
    pub promotion_candidate: bool,
}

/// Tracks pipeline runs, violations, and fix patterns in SQLite.
///
/// Every public method is independently guarded: on any database failure
/// it logs a warning and returns a safe default. An unopenable database
/// puts the tracker into degraded mode where every call is a no-op.
pub struct RunTracker {
    conn: Option<Mutex<Connection>>,
}

impl RunTracker {
    pub fn open(db_path: &Path) -> Self {
        let conn = (|| -> anyhow::Result<Connection> {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(db_path)?;
            // Writes are short single-row inserts; WAL keeps builder-side
            // pattern recording from blocking stats recomputation.
            let _ = conn.pragma_update(None, "journal_mode", "WAL");
            init_schema(&conn)?;
            Ok(conn)
        })();
        match conn {
            Ok(conn) => Self {
                conn: Some(Mutex::new(conn)),
            },
            Err(e) => {
                warn!("RunTracker init failed (degraded mode): {e:#}");
                Self { conn: None }
            }
        }
    }

    pub fn open_in_memory() -> Self {
        match Connection::open_in_memory() {
            Ok(conn) => {
                if let Err(e) = init_schema(&conn) {
                    warn!("RunTracker schema init failed (degraded mode): {e:#}");
                    return Self { conn: None };
                }
                Self {
                    conn: Some(Mutex::new(conn)),
                }
            }
            Err(e) => {
                warn!("RunTracker init failed (degraded mode): {e:#}");
                Self { conn: None }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    /// Record a completed pipeline run.
    pub fn record_run(
        &self,
        pipeline_id: &str,
        prd_hash: &str,
        verdict: &str,
        service_count: u32,
        cost: f64,
    ) {
        self.guarded("record_run", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO pipeline_runs
                    (run_id, prd_hash, overall_verdict, service_count, total_cost)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![pipeline_id, prd_hash, verdict, service_count, cost],
            )?;
            Ok(())
        });
    }

    /// Record one observed violation; returns the generated violation id.
    pub fn record_violation(
        &self,
        run_id: &str,
        violation: &Violation,
        service_name: &str,
        tech_stack: &str,
    ) -> String {
        let violation_id = uuid::Uuid::new_v4().to_string();
        let id = violation_id.clone();
        self.guarded("record_violation", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO violations_observed
                    (violation_id, run_id, scan_code, file_path, line,
                     message, severity, service_name, service_tech_stack)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    run_id,
                    violation.code,
                    violation.file_path,
                    violation.line,
                    violation.message,
                    violation.severity,
                    service_name,
                    tech_stack,
                ],
            )?;
            Ok(())
        });
        violation_id
    }

    /// Record a fix pattern applied to a violation.
    pub fn record_fix(
        &self,
        violation_id: &str,
        code_before: &str,
        code_after: &str,
        diff: &str,
        description: &str,
    ) {
        let fix_id = uuid::Uuid::new_v4().to_string();
        self.guarded("record_fix", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO fix_patterns
                    (fix_id, violation_id, code_before, code_after, diff, fix_description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![fix_id, violation_id, code_before, code_after, diff, description],
            )?;
            Ok(())
        });
    }

    /// Mark a violation as fixed and record the fix cost.
    pub fn mark_fixed(&self, violation_id: &str, fix_cost: f64) {
        self.guarded("mark_fixed", move |conn| {
            conn.execute(
                "UPDATE violations_observed SET was_fixed = 1, fix_cost = ?1
                 WHERE violation_id = ?2",
                params![fix_cost, violation_id],
            )?;
            Ok(())
        });
    }

    /// Aggregated stats for a tech stack, ordered by occurrence count
    /// descending. Empty on any failure.
    pub fn get_stats_for_stack(&self, tech_stack: &str) -> Vec<ScanCodeStat> {
        let Some(conn) = &self.conn else {
            return Vec::new();
        };
        let result = (|| -> rusqlite::Result<Vec<ScanCodeStat>> {
            let conn = conn.lock().expect("run tracker lock poisoned");
            let mut stmt = conn.prepare(
                "SELECT scan_code, tech_stack, occurrence_count,
                        fix_success_rate, avg_fix_cost, promotion_candidate
                 FROM scan_code_stats
                 WHERE tech_stack = ?1
                 ORDER BY occurrence_count DESC",
            )?;
            let rows = stmt.query_map(params![tech_stack], |row| {
                Ok(ScanCodeStat {
                    scan_code: row.get(0)?,
                    tech_stack: row.get(1)?,
                    occurrence_count: row.get::<_, i64>(2)? as u32,
                    fix_success_rate: row.get(3)?,
                    avg_fix_cost: row.get(4)?,
                    promotion_candidate: row.get::<_, i64>(5)? != 0,
                })
            })?;
            rows.collect()
        })();
        match result {
            Ok(stats) => stats,
            Err(e) => {
                warn!("RunTracker.get_stats_for_stack failed (non-blocking): {e}");
                Vec::new()
            }
        }
    }

    /// Recompute aggregate `scan_code_stats` across every run.
    pub fn update_scan_code_stats(&self, _run_id: &str) {
        self.guarded("update_scan_code_stats", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO scan_code_stats
                    (scan_code, tech_stack, occurrence_count,
                     fix_success_rate, avg_fix_cost, promotion_candidate)
                 SELECT
                     scan_code,
                     service_tech_stack,
                     COUNT(*) AS occurrence_count,
                     CASE WHEN COUNT(*) > 0
                          THEN CAST(SUM(was_fixed) AS REAL) / COUNT(*)
                          ELSE 0.0
                     END AS fix_success_rate,
                     CASE WHEN SUM(was_fixed) > 0
                          THEN SUM(fix_cost) / SUM(was_fixed)
                          ELSE 0.0
                     END AS avg_fix_cost,
                     CASE WHEN COUNT(*) >= 10 THEN 1 ELSE 0 END AS promotion_candidate
                 FROM violations_observed
                 WHERE scan_code IS NOT NULL
                   AND service_tech_stack IS NOT NULL
                 GROUP BY scan_code, service_tech_stack",
                [],
            )?;
            Ok(())
        });
    }

    fn guarded<F>(&self, method: &str, op: F)
    where
        F: FnOnce(&Connection) -> rusqlite::Result<()>,
    {
        let Some(conn) = &self.conn else { return };
        let conn = conn.lock().expect("run tracker lock poisoned");
        if let Err(e) = op(&conn) {
            warn!("RunTracker.{method} failed (non-blocking): {e}");
        }
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_id TEXT PRIMARY KEY,
            prd_hash TEXT,
            timestamp TEXT NOT NULL DEFAULT (datetime('now')),
            overall_verdict TEXT,
            service_count INTEGER NOT NULL DEFAULT 0,
            total_cost REAL NOT NULL DEFAULT 0.0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS violations_observed (
            violation_id TEXT PRIMARY KEY,
            run_id TEXT REFERENCES pipeline_runs(run_id),
            scan_code TEXT,
            file_path TEXT,
            line INTEGER NOT NULL DEFAULT 0,
            message TEXT,
            severity TEXT,
            service_name TEXT,
            service_tech_stack TEXT,
            was_fixed INTEGER NOT NULL DEFAULT 0,
            fix_cost REAL NOT NULL DEFAULT 0.0
        );
        CREATE INDEX IF NOT EXISTS idx_vo_scan_stack
            ON violations_observed(scan_code, service_tech_stack);
        CREATE INDEX IF NOT EXISTS idx_vo_run
            ON violations_observed(run_id);

        CREATE TABLE IF NOT EXISTS fix_patterns (
            fix_id TEXT PRIMARY KEY,
            violation_id TEXT REFERENCES violations_observed(violation_id),
            code_before TEXT NOT NULL DEFAULT '',
            code_after TEXT NOT NULL DEFAULT '',
            diff TEXT NOT NULL DEFAULT '',
            fix_description TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_fp_violation
            ON fix_patterns(violation_id);

        CREATE TABLE IF NOT EXISTS scan_code_stats (
            scan_code TEXT NOT NULL,
            tech_stack TEXT NOT NULL,
            occurrence_count INTEGER NOT NULL DEFAULT 0,
            fix_success_rate REAL NOT NULL DEFAULT 0.0,
            avg_fix_cost REAL NOT NULL DEFAULT 0.0,
            promotion_candidate INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (scan_code, tech_stack)
        );
        ",
    )?;

    let count: i64 = conn.query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))?;
    if count == 0 {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(code: &str, message: &str) -> Violation {
        Violation::new(code, "error", message)
    }

    #[test]
    fn record_and_aggregate_stats() {
        let tracker = RunTracker::open_in_memory();
        tracker.record_run("run-1", "abc123", "failed", 3, 1.5);

        let v1 = tracker.record_violation(
            "run-1",
            &violation("SEC-001", "secret in env"),
            "auth-service",
            "python/fastapi",
        );
        tracker.record_violation(
            "run-1",
            &violation("SEC-001", "another secret"),
            "auth-service",
            "python/fastapi",
        );
        tracker.record_violation(
            "run-1",
            &violation("LINT-002", "unused import"),
            "order-service",
            "node/express",
        );

        tracker.mark_fixed(&v1, 0.25);
        tracker.update_scan_code_stats("run-1");

        let stats = tracker.get_stats_for_stack("python/fastapi");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].scan_code, "SEC-001");
        assert_eq!(stats[0].occurrence_count, 2);
        assert!((stats[0].fix_success_rate - 0.5).abs() < 1e-9);
        assert!((stats[0].avg_fix_cost - 0.25).abs() < 1e-9);
        assert!(!stats[0].promotion_candidate);

        assert_eq!(tracker.get_stats_for_stack("node/express").len(), 1);
        assert!(tracker.get_stats_for_stack("go/gin").is_empty());
    }

    #[test]
    fn stats_are_ordered_by_occurrence_desc() {
        let tracker = RunTracker::open_in_memory();
        for _ in 0..3 {
            tracker.record_violation(
                "run-1",
                &violation("FREQ-HIGH", "often"),
                "svc",
                "python/fastapi",
            );
        }
        tracker.record_violation(
            "run-1",
            &violation("FREQ-LOW", "rarely"),
            "svc",
            "python/fastapi",
        );
        tracker.update_scan_code_stats("run-1");

        let stats = tracker.get_stats_for_stack("python/fastapi");
        assert_eq!(stats[0].scan_code, "FREQ-HIGH");
        assert_eq!(stats[1].scan_code, "FREQ-LOW");
    }

    #[test]
    fn record_violation_returns_fresh_uuid() {
        let tracker = RunTracker::open_in_memory();
        let a = tracker.record_violation("r", &violation("X", "m"), "s", "t");
        let b = tracker.record_violation("r", &violation("X", "m"), "s", "t");
        assert_ne!(a, b);
    }

    #[test]
    fn degraded_tracker_never_panics() {
        // Point at an unopenable path: a directory where a file must be.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let tracker = RunTracker::open(&blocker.join("runs.db"));

        assert!(!tracker.is_available());
        tracker.record_run("r", "h", "passed", 1, 0.1);
        let id = tracker.record_violation("r", &violation("X", "m"), "s", "t");
        assert!(!id.is_empty());
        tracker.mark_fixed(&id, 0.1);
        tracker.update_scan_code_stats("r");
        assert!(tracker.get_stats_for_stack("t").is_empty());
    }

    #[test]
    fn record_fix_links_to_violation() {
        let tracker = RunTracker::open_in_memory();
        let vid = tracker.record_violation("run-1", &violation("X", "m"), "svc", "stack");
        tracker.record_fix(&vid, "before", "after", "--- diff", "renamed the env var");

        let conn = tracker.conn.as_ref().unwrap().lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM fix_patterns WHERE violation_id = ?1",
                params![vid],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn schema_version_is_seeded_once() {
        let tracker = RunTracker::open_in_memory();
        let conn = tracker.conn.as_ref().unwrap().lock().unwrap();
        let version: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
