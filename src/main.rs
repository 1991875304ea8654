use clap::{Arg, Command};
use dmarc_monitor::fetcher::{self, FetchError};
use dmarc_monitor::mailbox::ImapSource;
use dmarc_monitor::storage::ReportStore;
use dmarc_monitor::Config;
use log::LevelFilter;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let matches = Command::new("dmarc-monitor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fetch, parse and aggregate DMARC reports from IMAP mailboxes")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/dmarc-monitor.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("fetch-once")
                .long("fetch-once")
                .help("Run a single fetch cycle and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("fetch-interval")
                .long("fetch-interval")
                .value_name("SECONDS")
                .help("Override the configured interval between fetch cycles")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show aggregate statistics and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("top")
                .long("top")
                .value_name("N")
                .help("Number of top source IPs shown with --stats")
                .default_value("10"),
        )
        .arg(
            Arg::new("test-report")
                .long("test-report")
                .value_name("FILE")
                .help("Parse a report attachment file and print its summary")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    if let Some(report_path) = matches.get_one::<String>("test-report") {
        test_report_file(report_path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        match config.validate() {
            Ok(()) => {
                println!(
                    "Configuration valid: {} mailbox(es), database at {}",
                    config.mailbox_configs().len(),
                    config.database.path
                );
                return;
            }
            Err(e) => {
                eprintln!("Configuration invalid: {e}");
                process::exit(1);
            }
        }
    }

    let store = match ReportStore::open(&config.database.path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Failed to open report database: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("stats") {
        let top = matches
            .get_one::<String>("top")
            .and_then(|n| n.parse().ok())
            .unwrap_or(10);
        show_stats(&store, top);
        return;
    }

    if let Err(e) = config.validate() {
        eprintln!("Configuration invalid: {e}");
        process::exit(1);
    }

    let interval_seconds = matches
        .get_one::<String>("fetch-interval")
        .and_then(|s| s.parse().ok())
        .unwrap_or(config.fetch_interval_seconds);

    let source = Arc::new(ImapSource::new());

    if matches.get_flag("fetch-once") {
        if let Err(e) = run_fetch_cycle(&source, &config, &store).await {
            log::error!("Fetch failed: {e}");
            process::exit(1);
        }
        log::info!("Fetch complete");
        return;
    }

    log::info!("Starting continuous fetch mode (interval: {interval_seconds}s)");
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));

    loop {
        tokio::select! {
            // The first tick fires immediately, so the initial fetch
            // happens before the interval starts counting.
            _ = ticker.tick() => {
                if let Err(e) = run_fetch_cycle(&source, &config, &store).await {
                    log::error!("Fetch failed: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                break;
            }
        }
    }
}

async fn run_fetch_cycle(
    source: &Arc<ImapSource>,
    config: &Config,
    store: &Arc<ReportStore>,
) -> Result<(), FetchError> {
    let summary = fetcher::fetch_all(
        Arc::clone(source),
        config.mailbox_configs(),
        Arc::clone(store),
    )
    .await?;

    for failure in &summary.errors {
        log::warn!("Mailbox {} reported: {}", failure.mailbox, failure.error);
    }
    Ok(())
}

fn generate_default_config(path: &str) {
    match Config::default().to_file(path) {
        Ok(()) => println!("Sample configuration written to {path}"),
        Err(e) => {
            eprintln!("Failed to write configuration: {e}");
            process::exit(1);
        }
    }
}

fn test_report_file(path: &str) {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Failed to read {path}: {e}");
            process::exit(1);
        }
    };

    match dmarc_monitor::parse_report(&data) {
        Ok(feedback) => {
            println!("Report:      {}", feedback.report_metadata.report_id);
            println!("Org:         {}", feedback.report_metadata.org_name);
            println!("Domain:      {}", feedback.policy_published.domain);
            println!("Policy:      {}", feedback.policy_published.p.as_str());
            if let Some((begin, end)) = feedback.date_range() {
                println!("Date range:  {begin} - {end}");
            }
            println!("Records:     {}", feedback.records.len());
            println!("Messages:    {}", feedback.total_messages());
            println!("Compliant:   {}", feedback.compliant_message_count());
        }
        Err(e) => {
            eprintln!("Failed to parse {path}: {e}");
            process::exit(1);
        }
    }
}

fn show_stats(store: &ReportStore, top: u32) {
    let stats = match store.get_statistics() {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("Failed to read statistics: {e}");
            process::exit(1);
        }
    };

    println!("📊 DMARC report statistics");
    println!("══════════════════════════");
    println!("Reports:            {}", stats.total_reports);
    println!("Messages:           {}", stats.total_messages);
    println!("Compliant:          {}", stats.compliant_messages);
    println!("Compliance rate:    {:.1}%", stats.compliance_rate);
    println!("Unique source IPs:  {}", stats.unique_source_ips);
    println!("Unique domains:     {}", stats.unique_domains);

    match store.get_top_source_ips(top) {
        Ok(sources) if sources.is_empty() => {}
        Ok(sources) => {
            println!();
            println!("Top source IPs:");
            for source in sources {
                println!(
                    "  {:<40} {:>8} total  {:>8} pass  {:>8} fail",
                    source.source_ip, source.count, source.pass_count, source.fail_count
                );
            }
        }
        Err(e) => {
            eprintln!("Failed to read top sources: {e}");
            process::exit(1);
        }
    }
}
