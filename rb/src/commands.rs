use anyhow::{Context, Result, anyhow};
use tracing::instrument;

use common::oplog::OpLog;
use common::project::{BatchesDir, Project};
use common::{list, schedule, skeleton, slice, timefmt};

/// Results of all phases of a full or differential backup.
#[derive(Debug, Default)]
pub struct PipelineSummary {
    pub project: std::path::PathBuf,
    pub list: list::Summary,
    pub skeleton: skeleton::Summary,
    pub slice: slice::Summary,
    pub copy: schedule::Summary,
}

impl std::fmt::Display for PipelineSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "project: {}\n{}\n{}\n{}\n{}",
            self.project.display(),
            &self.list,
            &self.skeleton,
            &self.slice,
            &self.copy,
        )
    }
}

#[derive(Debug)]
pub enum Summary {
    Init(std::path::PathBuf),
    List(list::Summary),
    Skeleton(skeleton::Summary),
    Slice(slice::Summary),
    Copy(schedule::Summary),
    Pipeline(Box<PipelineSummary>),
    Clean(common::project::CleanSummary),
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Summary::Init(root) => write!(f, "project: {}", root.display()),
            Summary::List(summary) => write!(f, "{summary}"),
            Summary::Skeleton(summary) => write!(f, "{summary}"),
            Summary::Slice(summary) => write!(f, "{summary}"),
            Summary::Copy(summary) => write!(f, "{summary}"),
            Summary::Pipeline(summary) => write!(f, "{summary}"),
            Summary::Clean(summary) => write!(f, "{summary}"),
        }
    }
}

fn absolute(path: &std::path::Path) -> Result<std::path::PathBuf> {
    std::path::absolute(path).with_context(|| format!("failed to make {path:?} absolute"))
}

async fn create_file(path: &std::path::Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {parent:?}"))?;
    }
    tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {path:?}"))
}

#[instrument]
pub async fn init(project_parent: Option<&std::path::Path>) -> Result<Summary> {
    let parent = match project_parent {
        Some(parent) => parent.to_path_buf(),
        None => std::env::current_dir().context("failed to read the current directory")?,
    };
    let project = Project::init(&parent, &timefmt::now_stamp()).await?;
    OpLog::new(project.oplog_path()).write("init").await?;
    println!("project directory: {}", project.root().display());
    println!(
        "next: rb ls -p {} <SOURCE>  (or rb lt -p {} -t <TIME> <SOURCE>)",
        project.root().display(),
        project.root().display()
    );
    Ok(Summary::Init(project.root().to_path_buf()))
}

async fn run_list(
    project: &Project,
    source: &std::path::Path,
    reference_time: Option<&str>,
) -> Result<(list::Summary, common::project::ListFiles)> {
    let reference_time = reference_time
        .map(|time| timefmt::parse_reference_time(time, chrono::Local::now()))
        .transpose()?;
    let oplog = OpLog::new(project.oplog_path());
    let command = match reference_time {
        Some(time) => format!("lt {} {}", source.display(), timefmt::format(&time)),
        None => format!("ls {}", source.display()),
    };
    let outputs = project.list_files(&timefmt::now_stamp());
    oplog.write(&format!("{command} start")).await?;
    let summary = match list::list_to_files(source, &outputs, reference_time).await {
        Ok(summary) => summary,
        Err(error) => {
            oplog.record(&format!("{command} failed")).await;
            return Err(error);
        }
    };
    oplog.write(&format!("{command} end")).await?;
    println!("directories list: {}", outputs.dirs.display());
    println!("files list: {}", outputs.files.display());
    println!("errors list: {}", outputs.errors.display());
    Ok((summary, outputs))
}

#[instrument]
pub async fn ls(
    project: &std::path::Path,
    source: &std::path::Path,
    reference_time: Option<&str>,
) -> Result<Summary> {
    let project = Project::open(project).await?;
    let source = absolute(source)?;
    let (summary, outputs) = run_list(&project, &source, reference_time).await?;
    println!(
        "next: rb skeleton -p {} -d {} {} <TARGET>",
        project.root().display(),
        outputs.dirs.display(),
        source.display()
    );
    println!(
        "      rb slice -p {} -f {}",
        project.root().display(),
        outputs.files.display()
    );
    Ok(Summary::List(summary))
}

async fn run_skeleton(
    project: &Project,
    dirs_list: &std::path::Path,
    source: &std::path::Path,
    target: &std::path::Path,
    mode: skeleton::ValidationMode,
) -> Result<skeleton::Summary> {
    let oplog = OpLog::new(project.oplog_path());
    let command = format!("skeleton {} {} {}", source.display(), target.display(), mode);
    oplog.write(&format!("{command} start")).await?;
    let reader = tokio::fs::File::open(dirs_list)
        .await
        .with_context(|| format!("cannot open directory list {dirs_list:?}"))?;
    let outcome = skeleton::Skeleton::new(source, target, mode)
        .build(reader)
        .await?;
    let outputs = project.skeleton_files(&timefmt::now_stamp());
    let mut created = tokio::io::BufWriter::new(create_file(&outputs.dirs).await?);
    outcome
        .write_created(&mut created)
        .await
        .with_context(|| format!("failed writing {:?}", &outputs.dirs))?;
    let mut errors = tokio::io::BufWriter::new(create_file(&outputs.errors).await?);
    outcome
        .write_errors(&mut errors)
        .await
        .with_context(|| format!("failed writing {:?}", &outputs.errors))?;
    println!("created directories: {}", outputs.dirs.display());
    println!("skeleton errors: {}", outputs.errors.display());
    if outcome.is_blocked() {
        oplog.record(&format!("{command} blocked")).await;
        return Err(anyhow!(
            "{} listed source directories are missing, see {:?}",
            outcome.missed(),
            &outputs.errors
        ));
    }
    oplog.write(&format!("{command} end")).await?;
    Ok(outcome.summary())
}

#[instrument]
pub async fn skeleton(
    project: &std::path::Path,
    dirs_list: &std::path::Path,
    source: &std::path::Path,
    target: &std::path::Path,
    mode: skeleton::ValidationMode,
) -> Result<Summary> {
    let project = Project::open(project).await?;
    let summary = run_skeleton(&project, dirs_list, &absolute(source)?, &absolute(target)?, mode)
        .await?;
    Ok(Summary::Skeleton(summary))
}

async fn run_slice(
    project: &Project,
    files_list: &std::path::Path,
    batch_size: u64,
) -> Result<(slice::Summary, BatchesDir)> {
    let oplog = OpLog::new(project.oplog_path());
    let stamp = timefmt::now_stamp();
    let batches = project.batches_dir(&stamp);
    batches.create().await?;
    let errors_file = project.slice_errors_file(&stamp);
    let errors = create_file(&errors_file).await?;
    let command = format!("slice {} {}", files_list.display(), batch_size);
    oplog.write(&format!("{command} start")).await?;
    let summary = match slice::slice(
        files_list,
        batch_size,
        &batches.todo(),
        &batches.done(),
        errors,
    )
    .await
    {
        Ok(summary) => summary,
        Err(error) => {
            oplog.record(&format!("{command} failed")).await;
            return Err(error);
        }
    };
    oplog.write(&format!("{command} end")).await?;
    println!("batches directory: {}", batches.root().display());
    println!("slice errors: {}", errors_file.display());
    Ok((summary, batches))
}

#[instrument]
pub async fn slice(
    project: &std::path::Path,
    files_list: &std::path::Path,
    batch_size: u64,
) -> Result<Summary> {
    let project = Project::open(project).await?;
    let (summary, batches) = run_slice(&project, files_list, batch_size).await?;
    println!(
        "next: rb cp -p {} -b {} <SOURCE> <TARGET>",
        project.root().display(),
        batches.root().display()
    );
    Ok(Summary::Slice(summary))
}

async fn run_cp(
    project: &Project,
    batches: BatchesDir,
    source: &std::path::Path,
    target: &std::path::Path,
    config: &common::BackupConfig,
) -> Result<(schedule::Summary, std::path::PathBuf)> {
    let oplog = OpLog::new(project.oplog_path());
    let copy_log_dir = project.copy_log_dir(&timefmt::now_stamp());
    let command = format!(
        "cp {} {} {}",
        batches.root().display(),
        source.display(),
        target.display()
    );
    oplog.write(&format!("{command} start")).await?;
    let settings = schedule::Settings {
        num_workers: config.num_workers,
        queue_len: config.queue_len,
        open_files: common::throttle::OpenFiles::new(config.max_open_files),
    };
    let scheduler = schedule::Scheduler::new(source, target, batches, &copy_log_dir, settings)
        .with_oplog(oplog.clone());
    let summary = match scheduler.run().await {
        Ok(summary) => summary,
        Err(error) => {
            oplog.record(&format!("{command} failed")).await;
            return Err(error);
        }
    };
    oplog.write(&format!("{command} end")).await?;
    println!("copy logs: {}", copy_log_dir.display());
    Ok((summary, copy_log_dir))
}

fn check_copy(
    summary: &schedule::Summary,
    copy_log_dir: &std::path::Path,
    batches: &std::path::Path,
    print_summary: bool,
    report: &dyn std::fmt::Display,
) -> Result<()> {
    if summary.files_failed == 0 && summary.batches_failed == 0 {
        return Ok(());
    }
    let message = format!(
        "rb encountered errors: {} files failed (see {:?}), {} batches left pending in {:?}",
        summary.files_failed,
        copy_log_dir,
        summary.batches_failed,
        batches.join(common::project::TODO_DIR),
    );
    if print_summary {
        return Err(anyhow!("{}\n\n{}", message, report));
    }
    Err(anyhow!("{}", message))
}

#[instrument]
pub async fn cp(
    project: &std::path::Path,
    batches_dir: &std::path::Path,
    source: &std::path::Path,
    target: &std::path::Path,
    config: &common::BackupConfig,
    print_summary: bool,
) -> Result<Summary> {
    let project = Project::open(project).await?;
    let batches = BatchesDir::open(batches_dir).await?;
    let (summary, copy_log_dir) = run_cp(
        &project,
        batches,
        &absolute(source)?,
        &absolute(target)?,
        config,
    )
    .await?;
    check_copy(&summary, &copy_log_dir, batches_dir, print_summary, &summary)?;
    Ok(Summary::Copy(summary))
}

/// Runs every phase in order, stopping at the first phase that fails.
#[instrument]
pub async fn pipeline(
    project: Option<&std::path::Path>,
    source: &std::path::Path,
    target: &std::path::Path,
    reference_time: Option<&str>,
    config: &common::BackupConfig,
    print_summary: bool,
) -> Result<Summary> {
    // a bad reference time must fail before anything is created
    if let Some(time) = reference_time {
        timefmt::parse_reference_time(time, chrono::Local::now())?;
    }
    let source = absolute(source)?;
    let target = absolute(target)?;
    let project = match project {
        Some(project) => Project::open(project).await?,
        None => {
            let parent = std::env::current_dir().context("failed to read the current directory")?;
            let project = Project::init(&parent, &timefmt::now_stamp()).await?;
            OpLog::new(project.oplog_path()).write("init").await?;
            println!("project directory: {}", project.root().display());
            project
        }
    };
    let mut summary = PipelineSummary {
        project: project.root().to_path_buf(),
        ..Default::default()
    };
    let (list_summary, lists) = run_list(&project, &source, reference_time).await?;
    summary.list = list_summary;
    summary.skeleton = run_skeleton(
        &project,
        &lists.dirs,
        &source,
        &target,
        config.dir_validation_mode,
    )
    .await?;
    let (slice_summary, batches) = run_slice(&project, &lists.files, config.batch_size).await?;
    summary.slice = slice_summary;
    let batches_root = batches.root().to_path_buf();
    let (copy_summary, copy_log_dir) = run_cp(&project, batches, &source, &target, config).await?;
    summary.copy = copy_summary;
    check_copy(
        &summary.copy,
        &copy_log_dir,
        &batches_root,
        print_summary,
        &summary,
    )?;
    Ok(Summary::Pipeline(Box::new(summary)))
}

#[instrument]
pub async fn clean(batches_dir: &std::path::Path) -> Result<Summary> {
    let batches = BatchesDir::open(batches_dir).await?;
    let summary = batches.clean().await?;
    println!(
        "removed {} pending batches already in {}",
        summary.removed,
        batches.done().display()
    );
    if summary.failed > 0 {
        return Err(anyhow!(
            "failed to remove {} pending batches from {:?}",
            summary.failed,
            batches.todo()
        ));
    }
    Ok(Summary::Clean(summary))
}
