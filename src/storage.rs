use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;

use crate::report::Feedback;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a [`ReportStore::save_report`] call. Duplicate submissions
/// succeed without writing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub id: i64,
    pub report_id: String,
    pub org_name: String,
    pub domain: String,
    pub date_begin: i64,
    pub date_end: i64,
    pub total_messages: i64,
    pub compliant_messages: i64,
    pub compliance_rate: f64,
    pub policy: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub total_reports: i64,
    pub total_messages: i64,
    pub compliant_messages: i64,
    pub compliance_rate: f64,
    pub unique_source_ips: i64,
    pub unique_domains: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopSourceIp {
    pub source_ip: String,
    pub count: i64,
    pub pass_count: i64,
    pub fail_count: i64,
}

/// Durable, deduplicating repository of parsed reports.
///
/// `report_id` is the natural key: the first write wins and every later
/// write with the same id is a no-op, child rows included. All mutation
/// goes through a single connection behind a mutex, and each report is
/// written inside one transaction, so readers never observe a partially
/// ingested report.
pub struct ReportStore {
    conn: Mutex<Connection>,
}

impl ReportStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                report_id TEXT UNIQUE NOT NULL,
                org_name TEXT NOT NULL,
                email TEXT,
                domain TEXT NOT NULL,
                date_begin INTEGER NOT NULL,
                date_end INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                policy_p TEXT,
                policy_sp TEXT,
                policy_pct INTEGER,
                total_messages INTEGER NOT NULL,
                compliant_messages INTEGER NOT NULL,
                raw_report TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                report_id INTEGER NOT NULL,
                source_ip TEXT NOT NULL,
                count INTEGER NOT NULL,
                disposition TEXT,
                dkim_result TEXT,
                spf_result TEXT,
                header_from TEXT,
                envelope_from TEXT,
                dkim_domains TEXT,
                spf_domains TEXT,
                FOREIGN KEY (report_id) REFERENCES reports(id)
            );

            CREATE INDEX IF NOT EXISTS idx_reports_date_begin ON reports(date_begin);
            CREATE INDEX IF NOT EXISTS idx_reports_domain ON reports(domain);
            CREATE INDEX IF NOT EXISTS idx_records_report_id ON records(report_id);
            CREATE INDEX IF NOT EXISTS idx_records_source_ip ON records(source_ip);",
        )?;
        Ok(())
    }

    /// Idempotent insert keyed by `report_id`.
    ///
    /// The aggregate columns are snapshotted here at write time; a later
    /// change to the compliance rule does not rewrite history.
    pub fn save_report(&self, feedback: &Feedback) -> Result<SaveOutcome, StorageError> {
        let raw_report = serde_json::to_string(feedback)?;
        let total_messages = feedback.total_messages() as i64;
        let compliant_messages = feedback.compliant_message_count() as i64;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM reports WHERE report_id = ?1",
                params![feedback.report_metadata.report_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(SaveOutcome::Duplicate);
        }

        tx.execute(
            "INSERT INTO reports (
                report_id, org_name, email, domain,
                date_begin, date_end, created_at,
                policy_p, policy_sp, policy_pct,
                total_messages, compliant_messages,
                raw_report
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                feedback.report_metadata.report_id,
                feedback.report_metadata.org_name,
                feedback.report_metadata.email,
                feedback.policy_published.domain,
                feedback.report_metadata.date_range.begin,
                feedback.report_metadata.date_range.end,
                Utc::now().timestamp(),
                feedback.policy_published.p.as_str(),
                feedback.policy_published.sp.map(|sp| sp.as_str()),
                feedback.policy_published.pct,
                total_messages,
                compliant_messages,
                raw_report,
            ],
        )?;
        let report_row_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO records (
                    report_id, source_ip, count,
                    disposition, dkim_result, spf_result,
                    header_from, envelope_from,
                    dkim_domains, spf_domains
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for record in &feedback.records {
                let dkim_domains = serde_json::to_string(&record.auth_results.dkim)?;
                let spf_domains = serde_json::to_string(&record.auth_results.spf)?;
                stmt.execute(params![
                    report_row_id,
                    record.row.source_ip.to_string(),
                    record.row.count as i64,
                    record.row.policy_evaluated.disposition.as_str(),
                    record.row.policy_evaluated.dkim.as_str(),
                    record.row.policy_evaluated.spf.as_str(),
                    record.identifiers.header_from,
                    record.identifiers.envelope_from,
                    dkim_domains,
                    spf_domains,
                ])?;
            }
        }

        tx.commit()?;
        Ok(SaveOutcome::Inserted)
    }

    /// Stored reports, most recent first by report begin date.
    pub fn get_reports(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ReportSummary>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, report_id, org_name, domain,
                    date_begin, date_end,
                    total_messages, compliant_messages,
                    policy_p
             FROM reports
             ORDER BY date_begin DESC
             LIMIT ?1 OFFSET ?2",
        )?;

        let reports = stmt
            .query_map(params![limit, offset], |row| {
                let total_messages: i64 = row.get(6)?;
                let compliant_messages: i64 = row.get(7)?;
                Ok(ReportSummary {
                    id: row.get(0)?,
                    report_id: row.get(1)?,
                    org_name: row.get(2)?,
                    domain: row.get(3)?,
                    date_begin: row.get(4)?,
                    date_end: row.get(5)?,
                    total_messages,
                    compliant_messages,
                    compliance_rate: compliance_rate(compliant_messages, total_messages),
                    policy: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(reports)
    }

    /// Full normalized report by store row id.
    pub fn get_report_by_id(&self, id: i64) -> Result<Option<Feedback>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT raw_report FROM reports WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Global rollups, computed by aggregate query at call time.
    pub fn get_statistics(&self) -> Result<Statistics, StorageError> {
        let conn = self.conn.lock().unwrap();

        let (total_reports, total_messages, compliant_messages) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(total_messages), 0),
                    COALESCE(SUM(compliant_messages), 0)
             FROM reports",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let unique_source_ips =
            conn.query_row("SELECT COUNT(DISTINCT source_ip) FROM records", [], |row| {
                row.get(0)
            })?;
        let unique_domains =
            conn.query_row("SELECT COUNT(DISTINCT domain) FROM reports", [], |row| {
                row.get(0)
            })?;

        Ok(Statistics {
            total_reports,
            total_messages,
            compliant_messages,
            compliance_rate: compliance_rate(compliant_messages, total_messages),
            unique_source_ips,
            unique_domains,
        })
    }

    /// Source IPs ranked by total message count descending.
    ///
    /// `pass_count` and `fail_count` partition `count` for every row.
    pub fn get_top_source_ips(&self, limit: u32) -> Result<Vec<TopSourceIp>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_ip,
                    SUM(count),
                    SUM(CASE WHEN (dkim_result = 'pass' OR spf_result = 'pass')
                             THEN count ELSE 0 END),
                    SUM(CASE WHEN (dkim_result != 'pass' AND spf_result != 'pass')
                             THEN count ELSE 0 END)
             FROM records
             GROUP BY source_ip
             ORDER BY SUM(count) DESC
             LIMIT ?1",
        )?;

        let sources = stmt
            .query_map(params![limit], |row| {
                Ok(TopSourceIp {
                    source_ip: row.get(0)?,
                    count: row.get(1)?,
                    pass_count: row.get(2)?,
                    fail_count: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sources)
    }
}

fn compliance_rate(compliant: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    compliant as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::parse_report;
    use std::sync::Arc;

    fn sample_report(report_id: &str, begin: i64, records: &str) -> Feedback {
        let xml = format!(
            r#"<?xml version="1.0"?>
<feedback>
  <report_metadata>
    <org_name>google.com</org_name>
    <email>noreply@google.com</email>
    <report_id>{report_id}</report_id>
    <date_range><begin>{begin}</begin><end>{end}</end></date_range>
  </report_metadata>
  <policy_published>
    <domain>example.com</domain>
    <p>none</p>
  </policy_published>
  {records}
</feedback>"#,
            report_id = report_id,
            begin = begin,
            end = begin + 86400,
            records = records,
        );
        parse_report(xml.as_bytes()).unwrap()
    }

    fn record(source_ip: &str, count: u64, dkim: &str, spf: &str) -> String {
        format!(
            r#"<record>
    <row>
      <source_ip>{source_ip}</source_ip>
      <count>{count}</count>
      <policy_evaluated>
        <disposition>none</disposition>
        <dkim>{dkim}</dkim>
        <spf>{spf}</spf>
      </policy_evaluated>
    </row>
    <identifiers><header_from>example.com</header_from></identifiers>
  </record>"#
        )
    }

    fn row_counts(store: &ReportStore) -> (i64, i64) {
        let conn = store.conn.lock().unwrap();
        let reports =
            conn.query_row("SELECT COUNT(*) FROM reports", [], |r| r.get(0)).unwrap();
        let records =
            conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0)).unwrap();
        (reports, records)
    }

    #[test]
    fn save_is_idempotent_per_report_id() {
        let store = ReportStore::open_in_memory().unwrap();
        let feedback = sample_report(
            "rpt-1",
            1609459200,
            &record("192.0.2.1", 10, "pass", "fail"),
        );

        assert_eq!(store.save_report(&feedback).unwrap(), SaveOutcome::Inserted);
        let before = row_counts(&store);

        assert_eq!(store.save_report(&feedback).unwrap(), SaveOutcome::Duplicate);
        assert_eq!(row_counts(&store), before);
    }

    #[test]
    fn concurrent_saves_insert_exactly_once() {
        let store = Arc::new(ReportStore::open_in_memory().unwrap());
        let feedback = sample_report(
            "rpt-race",
            1609459200,
            &record("192.0.2.1", 5, "pass", "pass"),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let feedback = feedback.clone();
            handles.push(std::thread::spawn(move || {
                store.save_report(&feedback).unwrap()
            }));
        }

        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| *outcome == SaveOutcome::Inserted)
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(row_counts(&store), (1, 1));
    }

    #[test]
    fn end_to_end_statistics() {
        let store = ReportStore::open_in_memory().unwrap();
        let feedback = sample_report(
            "12345678901234567890",
            1609459200,
            &record("192.0.2.1", 100, "pass", "pass"),
        );
        assert_eq!(feedback.total_messages(), 100);
        assert_eq!(feedback.compliant_message_count(), 100);

        store.save_report(&feedback).unwrap();

        let stats = store.get_statistics().unwrap();
        assert_eq!(stats.total_reports, 1);
        assert_eq!(stats.total_messages, 100);
        assert_eq!(stats.compliant_messages, 100);
        assert_eq!(stats.compliance_rate, 100.0);
        assert_eq!(stats.unique_source_ips, 1);
        assert_eq!(stats.unique_domains, 1);
    }

    #[test]
    fn compliance_rate_is_zero_for_empty_report() {
        let store = ReportStore::open_in_memory().unwrap();
        let feedback = sample_report("rpt-empty", 1609459200, "");
        store.save_report(&feedback).unwrap();

        let reports = store.get_reports(10, 0).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].total_messages, 0);
        assert_eq!(reports[0].compliance_rate, 0.0);

        let stats = store.get_statistics().unwrap();
        assert_eq!(stats.compliance_rate, 0.0);
    }

    #[test]
    fn compliance_rate_stays_within_bounds() {
        let store = ReportStore::open_in_memory().unwrap();
        let records = format!(
            "{}{}",
            record("192.0.2.1", 30, "pass", "fail"),
            record("198.51.100.7", 70, "fail", "fail"),
        );
        store
            .save_report(&sample_report("rpt-mixed", 1609459200, &records))
            .unwrap();

        let reports = store.get_reports(10, 0).unwrap();
        assert!(reports[0].compliance_rate >= 0.0 && reports[0].compliance_rate <= 100.0);
        assert_eq!(reports[0].compliance_rate, 30.0);
    }

    #[test]
    fn reports_are_ordered_most_recent_first() {
        let store = ReportStore::open_in_memory().unwrap();
        let older = sample_report("rpt-old", 1609459200, "");
        let newer = sample_report("rpt-new", 1612137600, "");

        // Ingestion order is the reverse of report date order.
        store.save_report(&older).unwrap();
        store.save_report(&newer).unwrap();

        let reports = store.get_reports(10, 0).unwrap();
        assert_eq!(reports[0].report_id, "rpt-new");
        assert_eq!(reports[1].report_id, "rpt-old");

        let page = store.get_reports(1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].report_id, "rpt-old");
    }

    #[test]
    fn report_round_trips_through_snapshot() {
        let store = ReportStore::open_in_memory().unwrap();
        let feedback = sample_report(
            "rpt-roundtrip",
            1609459200,
            &record("192.0.2.1", 42, "pass", "fail"),
        );
        store.save_report(&feedback).unwrap();

        let id = store.get_reports(1, 0).unwrap()[0].id;
        let restored = store.get_report_by_id(id).unwrap().unwrap();
        assert_eq!(restored.report_metadata.report_id, "rpt-roundtrip");
        assert_eq!(restored.records.len(), 1);
        assert_eq!(restored.records[0].row.count, 42);

        assert!(store.get_report_by_id(9999).unwrap().is_none());
    }

    #[test]
    fn top_source_ips_partition_pass_and_fail() {
        let store = ReportStore::open_in_memory().unwrap();
        let records = format!(
            "{}{}{}",
            record("192.0.2.1", 60, "pass", "fail"),
            record("192.0.2.1", 40, "fail", "fail"),
            record("198.51.100.7", 25, "fail", "pass"),
        );
        store
            .save_report(&sample_report("rpt-top", 1609459200, &records))
            .unwrap();

        let top = store.get_top_source_ips(10).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].source_ip, "192.0.2.1");
        assert_eq!(top[0].count, 100);
        assert_eq!(top[0].pass_count, 60);
        assert_eq!(top[0].fail_count, 40);

        for source in &top {
            assert_eq!(source.pass_count + source.fail_count, source.count);
        }
    }

    #[test]
    fn open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dmarc.db");

        let store = ReportStore::open(&path).unwrap();
        store
            .save_report(&sample_report("rpt-disk", 1609459200, ""))
            .unwrap();
        drop(store);

        let reopened = ReportStore::open(&path).unwrap();
        assert_eq!(reopened.get_statistics().unwrap().total_reports, 1);
    }
}
