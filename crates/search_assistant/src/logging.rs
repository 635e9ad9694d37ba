use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

/// Map verbosity count to filters
fn verbosity_filter(verbose_level: u8) -> &'static str {
    match verbose_level {
        0 => "warn,search_assistant=info,llm=info",
        1 => "info,search_assistant=debug,llm=debug",
        _ => "debug,search_assistant=trace,llm=trace",
    }
}

/// Logs go to stderr (or `log_file`) so answers on stdout stay clean.
pub fn setup_logging(verbose_level: u8, log_file: Option<PathBuf>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        // Use RUST_LOG if set
        tracing_subscriber::EnvFilter::from_default_env()
    } else {
        tracing_subscriber::EnvFilter::new(verbosity_filter(verbose_level))
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    if let Some(log_file_path) = log_file {
        if let Some(parent) = log_file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)
        {
            Ok(file) => {
                subscriber
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!(
                "Warning: Could not open log file {:?} ({}), falling back to stderr",
                log_file_path, e
            ),
        }
    }

    subscriber.with_writer(std::io::stderr).init();
}
