//! Core of the `rb` backup tool.
//!
//! A backup runs in phases that communicate through files in a project directory so that every
//! phase can be resumed or re-run on its own:
//!
//! 1. [`list`] walks the source and writes directory, file and error lists;
//! 2. [`skeleton`] recreates the directory tree on the target;
//! 3. [`slice`] splits the file list into numbered batches in a `todo` queue;
//! 4. [`schedule`] drains the queue through the copy worker [`pool`], logging every file to a
//!    per-batch CSV and moving finished batches to `done`.
//!
//! [`run`] sets up logging and the tokio runtime for the command line tool.

pub mod backup;
pub mod config;
pub mod lines;
pub mod list;
pub mod oplog;
pub mod pool;
pub mod project;
pub mod schedule;
pub mod skeleton;
pub mod slice;
pub mod throttle;
pub mod timefmt;
pub mod waitgroup;

#[cfg(test)]
mod testutils;

pub use config::{BackupConfig, ConfigFile, OutputConfig, RuntimeConfig};

fn log_level(output: &OutputConfig) -> &'static str {
    match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(output: &OutputConfig) {
    if output.quiet {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level(output)));
    // a subscriber may already be installed (e.g. by a test harness)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Runs `func` on a fresh tokio runtime.
///
/// Returns `None` if the runtime could not be built or `func` failed; the error has been logged
/// by then. With `print_summary` set the summary is printed to stdout.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display + std::fmt::Debug,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to create the tokio runtime: {}", &error);
            return None;
        }
    };
    match tokio_runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", &error);
            None
        }
    }
}
