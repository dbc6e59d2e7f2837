use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rb",
    version,
    about = "Recursive backup over unreliable connections",
    long_about = "`rb` copies a directory tree in resumable steps. Every step writes its results into a \
project directory so it can be inspected, retried or resumed after an interruption.

EXAMPLE:
    # One-shot full backup
    rb full /data/src /mnt/backup

    # The same, step by step
    rb init
    rb ls -p rb_20240131T235959 /data/src
    rb skeleton -p rb_20240131T235959 -d rb_20240131T235959/list/list_dirs_<ts>.log /data/src /mnt/backup
    rb slice -p rb_20240131T235959 -f rb_20240131T235959/list/list_files_<ts>.log
    rb cp -p rb_20240131T235959 -b rb_20240131T235959/slice/batches_<ts> /data/src /mnt/backup

Re-running `rb cp` on the same batches directory only copies the batches that are still pending."
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Configuration
    /// JSON configuration file, defaults to `rb.json` in the current directory if present
    #[arg(long, value_name = "PATH", global = true, help_heading = "Configuration")]
    config: Option<std::path::PathBuf>,

    // Performance & throttling
    /// Maximum number of open files, 0 means no limit (default: no limit)
    #[arg(long, value_name = "N", global = true, help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(long, value_name = "N", global = true, help_heading = "Advanced settings")]
    max_workers: Option<usize>,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(long, value_name = "N", global = true, help_heading = "Advanced settings")]
    max_blocking_threads: Option<usize>,
}

#[derive(clap::Args, Debug, Clone)]
struct CopyOptions {
    /// Number of copy workers [default: 200]
    #[arg(short = 'w', long, value_name = "N")]
    workers: Option<usize>,

    /// Capacity of the copy request queue [default: 200]
    #[arg(short = 'q', long, value_name = "N")]
    queue_len: Option<usize>,
}

#[derive(clap::Args, Debug, Clone)]
struct PipelineOptions {
    /// Existing project directory; a new one is created in the current directory if omitted
    #[arg(short = 'p', long, value_name = "DIR")]
    project: Option<std::path::PathBuf>,

    /// How to treat listed source directories that no longer exist [default: report]
    #[arg(short = 'm', long, value_name = "MODE")]
    validation_mode: Option<common::skeleton::ValidationMode>,

    /// Maximum number of files per batch [default: 1000]
    #[arg(short = 's', long, value_name = "N")]
    batch_size: Option<u64>,

    #[command(flatten)]
    copy: CopyOptions,

    /// Source directory
    source: std::path::PathBuf,

    /// Target directory
    target: std::path::PathBuf,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Create a project directory `rb_<timestamp>`
    Init {
        /// Directory to create the project in (default: current directory)
        #[arg(long, value_name = "DIR")]
        project_parent: Option<std::path::PathBuf>,
    },
    /// List all directories and files of the source
    Ls {
        #[arg(short = 'p', long, value_name = "DIR")]
        project: std::path::PathBuf,
        /// Source directory
        source: std::path::PathBuf,
    },
    /// List directories and files of the source modified after a reference time
    Lt {
        #[arg(short = 'p', long, value_name = "DIR")]
        project: std::path::PathBuf,
        /// Reference time in local time, format YYYYMMDDThhmmss
        #[arg(short = 't', long, value_name = "TIME")]
        time: String,
        /// Source directory
        source: std::path::PathBuf,
    },
    /// Recreate the listed directory tree under the target
    Skeleton {
        #[arg(short = 'p', long, value_name = "DIR")]
        project: std::path::PathBuf,
        /// Directory list produced by `rb ls` or `rb lt`
        #[arg(short = 'd', long, value_name = "FILE")]
        dirs_list: std::path::PathBuf,
        /// How to treat listed source directories that no longer exist [default: report]
        #[arg(short = 'm', long, value_name = "MODE")]
        validation_mode: Option<common::skeleton::ValidationMode>,
        /// Source directory
        source: std::path::PathBuf,
        /// Target directory
        target: std::path::PathBuf,
    },
    /// Split a file list into batches
    Slice {
        #[arg(short = 'p', long, value_name = "DIR")]
        project: std::path::PathBuf,
        /// File list produced by `rb ls` or `rb lt`
        #[arg(short = 'f', long, value_name = "FILE")]
        files_list: std::path::PathBuf,
        /// Maximum number of files per batch [default: 1000]
        #[arg(short = 's', long, value_name = "N")]
        batch_size: Option<u64>,
    },
    /// Copy every pending batch
    Cp {
        #[arg(short = 'p', long, value_name = "DIR")]
        project: std::path::PathBuf,
        /// Batches directory produced by `rb slice`
        #[arg(short = 'b', long, value_name = "DIR")]
        batches_dir: std::path::PathBuf,
        #[command(flatten)]
        copy: CopyOptions,
        /// Source directory
        source: std::path::PathBuf,
        /// Target directory
        target: std::path::PathBuf,
    },
    /// Full backup: init (unless a project is given), ls, skeleton, slice and cp
    Full {
        #[command(flatten)]
        pipeline: PipelineOptions,
    },
    /// Differential backup: like `full` but only entries modified after a reference time
    Diff {
        /// Reference time in local time, format YYYYMMDDThhmmss
        #[arg(short = 't', long, value_name = "TIME")]
        time: String,
        #[command(flatten)]
        pipeline: PipelineOptions,
    },
    /// Remove pending batches that were already moved to done
    Clean {
        /// Batches directory produced by `rb slice`
        #[arg(short = 'b', long, value_name = "DIR")]
        batches_dir: std::path::PathBuf,
    },
}

fn backup_config(
    file: &common::ConfigFile,
    args: &Args,
    copy: Option<&CopyOptions>,
    validation_mode: Option<common::skeleton::ValidationMode>,
    batch_size: Option<u64>,
) -> Result<common::BackupConfig> {
    let mut config = common::BackupConfig::from_file(file);
    if let Some(copy) = copy {
        config.num_workers = copy.workers.unwrap_or(config.num_workers);
        config.queue_len = copy.queue_len.unwrap_or(config.queue_len);
    }
    config.dir_validation_mode = validation_mode.unwrap_or(config.dir_validation_mode);
    config.batch_size = batch_size.unwrap_or(config.batch_size);
    config.max_open_files = args.max_open_files.or(config.max_open_files);
    config.validate().map_err(|error| anyhow!(error))?;
    Ok(config)
}

async fn async_main(args: Args, config: common::BackupConfig) -> Result<commands::Summary> {
    match args.command {
        Command::Init { project_parent } => commands::init(project_parent.as_deref()).await,
        Command::Ls { project, source } => commands::ls(&project, &source, None).await,
        Command::Lt {
            project,
            time,
            source,
        } => commands::ls(&project, &source, Some(&time)).await,
        Command::Skeleton {
            project,
            dirs_list,
            source,
            target,
            ..
        } => {
            commands::skeleton(
                &project,
                &dirs_list,
                &source,
                &target,
                config.dir_validation_mode,
            )
            .await
        }
        Command::Slice {
            project,
            files_list,
            ..
        } => commands::slice(&project, &files_list, config.batch_size).await,
        Command::Cp {
            project,
            batches_dir,
            source,
            target,
            ..
        } => {
            commands::cp(
                &project,
                &batches_dir,
                &source,
                &target,
                &config,
                args.summary,
            )
            .await
        }
        Command::Full { pipeline } => {
            commands::pipeline(
                pipeline.project.as_deref(),
                &pipeline.source,
                &pipeline.target,
                None,
                &config,
                args.summary,
            )
            .await
        }
        Command::Diff { time, pipeline } => {
            commands::pipeline(
                pipeline.project.as_deref(),
                &pipeline.source,
                &pipeline.target,
                Some(&time),
                &config,
                args.summary,
            )
            .await
        }
        Command::Clean { batches_dir } => commands::clean(&batches_dir).await,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let file = common::ConfigFile::load(args.config.as_deref())?;
    let config = match &args.command {
        Command::Skeleton {
            validation_mode, ..
        } => backup_config(&file, &args, None, *validation_mode, None)?,
        Command::Slice { batch_size, .. } => backup_config(&file, &args, None, None, *batch_size)?,
        Command::Cp { copy, .. } => backup_config(&file, &args, Some(copy), None, None)?,
        Command::Full { pipeline } | Command::Diff { pipeline, .. } => backup_config(
            &file,
            &args,
            Some(&pipeline.copy),
            pipeline.validation_mode,
            pipeline.batch_size,
        )?,
        _ => backup_config(&file, &args, None, None, None)?,
    };
    let func = {
        let args = args.clone();
        || async_main(args, config)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers.or(file.max_workers).unwrap_or(0),
        max_blocking_threads: args
            .max_blocking_threads
            .or(file.max_blocking_threads)
            .unwrap_or(0),
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
