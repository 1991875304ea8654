use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::MailboxConfig;
use crate::mailbox::{MailboxError, MailboxSource};
use crate::report;
use crate::storage::{ReportStore, SaveOutcome};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no mailboxes configured")]
    NoMailboxes,
    #[error("all {} configured mailbox(es) failed", .0.len())]
    AllMailboxesFailed(Vec<MailboxFailure>),
}

#[derive(Debug)]
pub struct MailboxFailure {
    pub mailbox: String,
    pub error: MailboxError,
}

/// Result of one fetch cycle across all configured mailboxes.
#[derive(Debug, Default)]
pub struct FetchSummary {
    pub processed_count: usize,
    pub errors: Vec<MailboxFailure>,
}

struct MailboxOutcome {
    mailbox: String,
    result: Result<usize, MailboxError>,
}

/// Filename heuristic for report-bearing attachments.
pub fn is_report_attachment(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    lower.ends_with(".xml")
        || lower.ends_with(".xml.gz")
        || lower.ends_with(".zip")
        || lower.contains("dmarc")
}

/// Fetches unseen reports from every configured mailbox concurrently.
///
/// Each mailbox runs its own retrieval-parse-store pipeline in a worker;
/// a failing mailbox contributes an entry to `FetchSummary::errors` and
/// never blocks the others. The call as a whole fails only when every
/// mailbox failed. There is no retry within a cycle - the caller's next
/// periodic invocation re-fetches whatever is still unseen.
pub async fn fetch_all<S>(
    source: Arc<S>,
    configs: Vec<MailboxConfig>,
    store: Arc<ReportStore>,
) -> Result<FetchSummary, FetchError>
where
    S: MailboxSource + Send + Sync + 'static,
{
    if configs.is_empty() {
        return Err(FetchError::NoMailboxes);
    }
    let mailbox_count = configs.len();
    info!("Fetching from {mailbox_count} mailbox(es)");

    let mut workers = Vec::with_capacity(mailbox_count);
    for config in configs {
        let source = Arc::clone(&source);
        let store = Arc::clone(&store);
        let label = config.label();
        let handle =
            tokio::task::spawn_blocking(move || fetch_mailbox(&*source, &config, &store));
        workers.push((label, handle));
    }

    // Workers report back through their join handles; the summary is
    // reduced here once all of them have finished.
    let mut summary = FetchSummary::default();
    for (label, handle) in workers {
        match handle.await {
            Ok(outcome) => match outcome.result {
                Ok(processed) => summary.processed_count += processed,
                Err(error) => {
                    warn!("Mailbox {} failed: {error}", outcome.mailbox);
                    summary.errors.push(MailboxFailure {
                        mailbox: outcome.mailbox,
                        error,
                    });
                }
            },
            Err(e) => {
                warn!("Worker for {label} did not finish: {e}");
                summary.errors.push(MailboxFailure {
                    mailbox: label,
                    error: MailboxError::Retrieval(format!("worker aborted: {e}")),
                });
            }
        }
    }

    if summary.errors.len() == mailbox_count {
        return Err(FetchError::AllMailboxesFailed(summary.errors));
    }

    info!(
        "Processed {} report(s) across {} mailbox(es), {} error(s)",
        summary.processed_count,
        mailbox_count,
        summary.errors.len()
    );
    Ok(summary)
}

/// One mailbox's pipeline: connect, list, parse, store.
///
/// Parse and storage failures are absorbed per attachment - a bad report
/// never aborts its siblings. The connection is released on every exit
/// path once it exists.
fn fetch_mailbox<S: MailboxSource>(
    source: &S,
    config: &MailboxConfig,
    store: &ReportStore,
) -> MailboxOutcome {
    let mailbox = config.label();
    debug!("[{mailbox}] connecting");

    let mut conn = match source.connect(config) {
        Ok(conn) => conn,
        Err(error) => {
            return MailboxOutcome {
                mailbox,
                result: Err(error),
            }
        }
    };

    let listed = source.list_unseen_attachments(&mut conn);
    source.disconnect(conn);

    let attachments = match listed {
        Ok(attachments) => attachments,
        Err(error) => {
            return MailboxOutcome {
                mailbox,
                result: Err(error),
            }
        }
    };

    let mut processed = 0;
    for attachment in &attachments {
        if !is_report_attachment(&attachment.filename) {
            debug!("[{mailbox}] ignoring attachment {}", attachment.filename);
            continue;
        }

        let feedback = match report::parse_report(&attachment.data) {
            Ok(feedback) => feedback,
            Err(e) => {
                warn!("[{mailbox}] failed to parse {}: {e}", attachment.filename);
                continue;
            }
        };

        match store.save_report(&feedback) {
            Ok(SaveOutcome::Inserted) => {
                info!(
                    "[{mailbox}] saved report {} from {} (domain {}, {} message(s))",
                    feedback.report_metadata.report_id,
                    feedback.report_metadata.org_name,
                    feedback.policy_published.domain,
                    feedback.total_messages()
                );
                processed += 1;
            }
            Ok(SaveOutcome::Duplicate) => {
                debug!(
                    "[{mailbox}] report {} already stored",
                    feedback.report_metadata.report_id
                );
                processed += 1;
            }
            Err(e) => {
                warn!(
                    "[{mailbox}] failed to save report {}: {e}",
                    feedback.report_metadata.report_id
                );
            }
        }
    }

    MailboxOutcome {
        mailbox,
        result: Ok(processed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::Attachment;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_report_xml(report_id: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<feedback>
  <report_metadata>
    <org_name>google.com</org_name>
    <email>noreply@google.com</email>
    <report_id>{report_id}</report_id>
    <date_range><begin>1609459200</begin><end>1609545600</end></date_range>
  </report_metadata>
  <policy_published>
    <domain>example.com</domain>
    <p>none</p>
  </policy_published>
  <record>
    <row>
      <source_ip>192.0.2.1</source_ip>
      <count>10</count>
      <policy_evaluated>
        <disposition>none</disposition>
        <dkim>pass</dkim>
        <spf>pass</spf>
      </policy_evaluated>
    </row>
    <identifiers><header_from>example.com</header_from></identifiers>
  </record>
</feedback>"#
        )
    }

    fn xml_attachment(name: &str, report_id: &str) -> Attachment {
        Attachment {
            filename: name.to_string(),
            data: sample_report_xml(report_id).into_bytes(),
        }
    }

    fn mailbox_config(host: &str) -> MailboxConfig {
        MailboxConfig {
            host: host.to_string(),
            port: 993,
            username: "reports".to_string(),
            password: "secret".to_string(),
            mailbox: "INBOX".to_string(),
            use_tls: true,
        }
    }

    #[derive(Default)]
    struct MockSource {
        attachments: HashMap<String, Vec<Attachment>>,
        fail_connect: HashSet<String>,
        fail_retrieval: HashSet<String>,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl MailboxSource for MockSource {
        type Connection = String;

        fn connect(&self, config: &MailboxConfig) -> Result<String, MailboxError> {
            if self.fail_connect.contains(&config.host) {
                return Err(MailboxError::Connection("connection refused".to_string()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(config.host.clone())
        }

        fn list_unseen_attachments(
            &self,
            conn: &mut String,
        ) -> Result<Vec<Attachment>, MailboxError> {
            if self.fail_retrieval.contains(conn.as_str()) {
                return Err(MailboxError::Retrieval("select failed".to_string()));
            }
            Ok(self.attachments.get(conn.as_str()).cloned().unwrap_or_default())
        }

        fn disconnect(&self, _conn: String) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn store() -> Arc<ReportStore> {
        Arc::new(ReportStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn one_failing_mailbox_does_not_block_the_others() {
        let mut source = MockSource::default();
        source
            .attachments
            .insert("one".to_string(), vec![xml_attachment("r1.xml", "rpt-1")]);
        source.fail_connect.insert("two".to_string());
        source
            .attachments
            .insert("three".to_string(), vec![xml_attachment("r3.xml", "rpt-3")]);

        let store = store();
        let configs = vec![
            mailbox_config("one"),
            mailbox_config("two"),
            mailbox_config("three"),
        ];

        let summary = fetch_all(Arc::new(source), configs, Arc::clone(&store))
            .await
            .unwrap();

        assert_eq!(summary.processed_count, 2);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].mailbox.contains("two"));
        assert_eq!(store.get_statistics().unwrap().total_reports, 2);
    }

    #[tokio::test]
    async fn all_failing_mailboxes_propagate() {
        let mut source = MockSource::default();
        for host in ["one", "two", "three"] {
            source.fail_connect.insert(host.to_string());
        }

        let configs = vec![
            mailbox_config("one"),
            mailbox_config("two"),
            mailbox_config("three"),
        ];

        let err = fetch_all(Arc::new(source), configs, store())
            .await
            .unwrap_err();
        match err {
            FetchError::AllMailboxesFailed(failures) => assert_eq!(failures.len(), 3),
            other => panic!("expected AllMailboxesFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_config_is_rejected() {
        let err = fetch_all(Arc::new(MockSource::default()), Vec::new(), store())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoMailboxes));
    }

    #[tokio::test]
    async fn malformed_attachment_is_skipped_not_fatal() {
        let mut source = MockSource::default();
        source.attachments.insert(
            "one".to_string(),
            vec![
                Attachment {
                    filename: "broken.xml".to_string(),
                    data: b"not really xml".to_vec(),
                },
                xml_attachment("good.xml", "rpt-good"),
                Attachment {
                    filename: "invoice.pdf".to_string(),
                    data: b"%PDF".to_vec(),
                },
            ],
        );

        let store = store();
        let summary = fetch_all(
            Arc::new(source),
            vec![mailbox_config("one")],
            Arc::clone(&store),
        )
        .await
        .unwrap();

        assert_eq!(summary.processed_count, 1);
        assert!(summary.errors.is_empty());
        assert_eq!(store.get_statistics().unwrap().total_reports, 1);
    }

    #[tokio::test]
    async fn duplicate_reports_across_mailboxes_store_once() {
        let mut source = MockSource::default();
        source
            .attachments
            .insert("one".to_string(), vec![xml_attachment("r.xml", "rpt-dup")]);
        source
            .attachments
            .insert("two".to_string(), vec![xml_attachment("r.xml", "rpt-dup")]);

        let store = store();
        let summary = fetch_all(
            Arc::new(source),
            vec![mailbox_config("one"), mailbox_config("two")],
            Arc::clone(&store),
        )
        .await
        .unwrap();

        // Both mailboxes processed the report; only one copy is stored.
        assert_eq!(summary.processed_count, 2);
        assert_eq!(store.get_statistics().unwrap().total_reports, 1);
    }

    #[tokio::test]
    async fn connection_is_released_even_when_retrieval_fails() {
        let mut source = MockSource::default();
        source
            .attachments
            .insert("good".to_string(), vec![xml_attachment("r.xml", "rpt-1")]);
        source.fail_retrieval.insert("flaky".to_string());
        let source = Arc::new(source);

        let summary = fetch_all(
            Arc::clone(&source),
            vec![mailbox_config("good"), mailbox_config("flaky")],
            store(),
        )
        .await
        .unwrap();

        assert_eq!(summary.errors.len(), 1);
        assert_eq!(source.connects.load(Ordering::SeqCst), 2);
        assert_eq!(source.disconnects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn report_attachment_heuristic() {
        assert!(is_report_attachment(
            "google.com!example.com!1609459200!1609545600.xml"
        ));
        assert!(is_report_attachment("report.xml.gz"));
        assert!(is_report_attachment("report.zip"));
        assert!(is_report_attachment("DMARC-summary.txt"));
        assert!(!is_report_attachment("invoice.pdf"));
        assert!(!is_report_attachment("notes.txt"));
    }
}
