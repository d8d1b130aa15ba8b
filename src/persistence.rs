//! Durable attendance and participation counts.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::Result;
use crate::roster::{Roster, RosterEntry, StudentId};

/// One student's counters as captured at flush time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRow {
    pub student_id: StudentId,
    pub assistance: bool,
    pub assistance_sent: bool,
    pub participation: i64,
}

impl From<&RosterEntry> for AttendanceRow {
    fn from(entry: &RosterEntry) -> Self {
        AttendanceRow {
            student_id: entry.id.clone(),
            assistance: entry.assistance,
            assistance_sent: entry.assistance_sent,
            participation: entry.participation_counter,
        }
    }
}

/// Sink for flushed counters.
///
/// Attendance is written only for rows not yet sent; participation is added
/// to whatever was already recorded for the date.
pub trait AttendanceLedger: Send + Sync {
    fn record(&self, course_id: u64, date: &str, rows: &[AttendanceRow]) -> Result<()>;
}

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS assistance (
                student_id TEXT NOT NULL,
                course_id INTEGER NOT NULL,
                date TEXT NOT NULL,
                assistance_count INTEGER NOT NULL,
                PRIMARY KEY (student_id, course_id, date)
            );
            CREATE TABLE IF NOT EXISTS participation (
                student_id TEXT NOT NULL,
                course_id INTEGER NOT NULL,
                date TEXT NOT NULL,
                participation_count INTEGER NOT NULL,
                PRIMARY KEY (student_id, course_id, date)
            );",
        )?;
        Ok(SqliteLedger { conn: Mutex::new(conn) })
    }

    pub fn assistance(&self, course_id: u64, date: &str, student_id: &str) -> Result<Option<i64>> {
        self.query_count(
            "SELECT assistance_count FROM assistance WHERE course_id = ?1 AND date = ?2 AND student_id = ?3",
            course_id,
            date,
            student_id,
        )
    }

    pub fn participation(&self, course_id: u64, date: &str, student_id: &str) -> Result<Option<i64>> {
        self.query_count(
            "SELECT participation_count FROM participation WHERE course_id = ?1 AND date = ?2 AND student_id = ?3",
            course_id,
            date,
            student_id,
        )
    }

    fn query_count(&self, sql: &str, course_id: u64, date: &str, student_id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params![course_id as i64, date, student_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

impl AttendanceLedger for SqliteLedger {
    fn record(&self, course_id: u64, date: &str, rows: &[AttendanceRow]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        for row in rows {
            if !row.assistance_sent {
                tx.execute(
                    "INSERT INTO assistance (student_id, course_id, date, assistance_count)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(student_id, course_id, date)
                     DO UPDATE SET assistance_count = excluded.assistance_count",
                    params![row.student_id, course_id as i64, date, row.assistance as i64],
                )?;
            }
            tx.execute(
                "INSERT INTO participation (student_id, course_id, date, participation_count)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(student_id, course_id, date)
                 DO UPDATE SET participation_count = participation_count + excluded.participation_count",
                params![row.student_id, course_id as i64, date, row.participation],
            )?;
        }
        tx.commit()?;
        debug!("Flushed {} roster entries for course {} on {}", rows.len(), course_id, date);
        Ok(())
    }
}

/// Ledger kept in memory; every batch is appended.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    batches: Arc<Mutex<Vec<(u64, String, Vec<AttendanceRow>)>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<(u64, String, Vec<AttendanceRow>)> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Participation summed over every batch.
    pub fn total_participation(&self, student_id: &str) -> i64 {
        self.batches()
            .iter()
            .flat_map(|(_, _, rows)| rows)
            .filter(|r| r.student_id == student_id)
            .map(|r| r.participation)
            .sum()
    }
}

impl AttendanceLedger for MemoryLedger {
    fn record(&self, course_id: u64, date: &str, rows: &[AttendanceRow]) -> Result<()> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((course_id, date.to_string(), rows.to_vec()));
        Ok(())
    }
}

/// Take a snapshot of the roster and clear the per-interval counters:
/// participation goes back to 0 and present students are marked as sent.
pub fn snapshot_for_flush(roster: &Roster) -> Result<Vec<AttendanceRow>> {
    let entries = roster.entries()?;
    let rows: Vec<AttendanceRow> = entries.iter().map(AttendanceRow::from).collect();
    for entry in &entries {
        if let Err(e) = roster.reset_participation(&entry.id) {
            error!("Failed to reset participation of student {}: {}", entry.id, e);
        }
        if entry.assistance {
            if let Err(e) = roster.mark_assistance_sent(&entry.id) {
                error!("Failed to mark assistance of student {} as sent: {}", entry.id, e);
            }
        }
    }
    Ok(rows)
}

/// Write `rows` on a background thread. Failures are logged and dropped.
pub fn flush_in_background(
    ledger: Arc<dyn AttendanceLedger>,
    course_id: u64,
    date: String,
    rows: Vec<AttendanceRow>,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("attendance-flush".to_string())
        .spawn(move || {
            if let Err(e) = ledger.record(course_id, &date, &rows) {
                error!("Failed to flush attendance for course {}: {}", course_id, e);
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Could not start attendance flush: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::{MemoryRosterStore, Namespace, StudentRecord};
    use tempfile::tempdir;

    fn row(id: &str, assistance: bool, sent: bool, participation: i64) -> AttendanceRow {
        AttendanceRow { student_id: id.into(), assistance, assistance_sent: sent, participation }
    }

    #[test]
    fn test_sqlite_ledger_accumulates_participation() {
        let dir = tempdir().unwrap();
        let ledger = SqliteLedger::open(dir.path().join("attendance.db")).unwrap();

        ledger.record(3, "2024-05-02", &[row("1", true, false, 2), row("2", false, false, 0)]).unwrap();
        ledger.record(3, "2024-05-02", &[row("1", true, true, 3), row("2", true, false, 1)]).unwrap();

        assert_eq!(ledger.participation(3, "2024-05-02", "1").unwrap(), Some(5));
        assert_eq!(ledger.participation(3, "2024-05-02", "2").unwrap(), Some(1));
        assert_eq!(ledger.assistance(3, "2024-05-02", "1").unwrap(), Some(1));
        assert_eq!(ledger.assistance(3, "2024-05-02", "2").unwrap(), Some(1));
        assert_eq!(ledger.assistance(3, "2024-05-03", "1").unwrap(), None);
    }

    #[test]
    fn test_sent_rows_skip_assistance() {
        let ledger = SqliteLedger::in_memory().unwrap();
        ledger.record(1, "d", &[row("1", true, true, 0)]).unwrap();
        assert_eq!(ledger.assistance(1, "d", "1").unwrap(), None);
        assert_eq!(ledger.participation(1, "d", "1").unwrap(), Some(0));
    }

    #[test]
    fn test_snapshot_resets_interval_counters() {
        let roster = Roster::new(Arc::new(MemoryRosterStore::new()), Namespace::new(1, 1));
        let students: Vec<StudentRecord> = ["1", "2"]
            .iter()
            .map(|id| StudentRecord { id: id.to_string(), name: id.to_string(), email: String::new(), template: None })
            .collect();
        roster.seed(&students).unwrap();
        roster.mark_present("1").unwrap();
        roster.record_participation("1").unwrap();
        roster.record_participation("1").unwrap();

        let mut rows = snapshot_for_flush(&roster).unwrap();
        rows.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        assert_eq!(rows, vec![row("1", true, false, 2), row("2", false, false, 0)]);

        let one = roster.entry("1").unwrap().unwrap();
        assert_eq!(one.participation_counter, 0);
        assert!(one.assistance_sent);
        assert!(!roster.entry("2").unwrap().unwrap().assistance_sent);
    }

    #[test]
    fn test_background_flush_reaches_ledger() {
        let ledger = MemoryLedger::new();
        let handle = flush_in_background(Arc::new(ledger.clone()), 9, "d".into(), vec![row("1", true, false, 4)]);
        handle.unwrap().join().unwrap();
        assert_eq!(ledger.batches().len(), 1);
        assert_eq!(ledger.total_participation("1"), 4);
    }
}
