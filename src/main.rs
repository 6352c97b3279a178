use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use gdfs_rs::auth::TokenStore;
use gdfs_rs::config::Config;
use gdfs_rs::drive::{spawn_workers, Drive};
use gdfs_rs::fuse;
use gdfs_rs::logging::{self, Level};

#[derive(Parser, Debug)]
#[command(name = "gdfs", version, about = "Mount Google Drive as a POSIX filesystem")]
struct Cli {
    /// Mount point directory
    #[arg(short = 'm', long = "mount")]
    mount_point: PathBuf,

    /// Directory for the log file (defaults to the gdfs conf directory)
    #[arg(short = 'l', long = "log-dir")]
    log_dir: Option<PathBuf>,

    /// Log level: ERROR, WARNING, INFO or DEBUG
    #[arg(short = 'e', long = "log-level", default_value = "ERROR")]
    log_level: String,

    /// Extra FUSE mount options (repeatable)
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,

    /// Debug mode (forces DEBUG log level)
    #[arg(short = 'd', long = "debug", default_value_t = false)]
    debug: bool,

    /// Stay in the foreground and mirror the log to stdout
    #[arg(short = 'f', long = "foreground", default_value_t = false)]
    foreground: bool,

    /// Single-threaded session loop (accepted for compatibility)
    #[arg(short = 's', long = "single-threaded", default_value_t = false)]
    single_threaded: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[ERROR] {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cfg = Config::load(None).context("load configuration")?;

    let level = if cli.debug {
        Level::Debug
    } else {
        Level::parse(&cli.log_level)
            .with_context(|| format!("invalid log level {:?}", cli.log_level))?
    };
    let log_path = cfg.log_file(cli.log_dir.as_deref());
    logging::init_log_file(&log_path, level, cli.foreground).context("open log file")?;

    if !cli.mount_point.is_dir() {
        anyhow::bail!("mount point {} is not a directory", cli.mount_point.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;

    let (drive, workers) = runtime.block_on(async {
        let tokens = Arc::new(TokenStore::load(&cfg).context("load auth file")?);
        // Fail before mounting when the refresh token is unusable.
        let probe = reqwest::Client::new();
        tokens
            .access_token(&probe)
            .await
            .context("initial token check")?;

        let drive = Arc::new(Drive::new(cfg.clone(), tokens).context("initialize drive state")?);
        drive.get_root().await.context("fetch account quota")?;
        drive.generate_file_id();
        let workers = spawn_workers(&drive);
        Ok::<_, anyhow::Error>((drive, workers))
    })?;

    logging::info_kv(
        "gdfs mount",
        &[
            ("version", env!("CARGO_PKG_VERSION")),
            ("mount", &cli.mount_point.display().to_string()),
            ("log", &log_path.display().to_string()),
        ],
    );

    let mount_result = fuse::mount(
        drive.clone(),
        runtime.handle().clone(),
        &cli.mount_point,
        &cli.options,
    );

    // Unmounted: stop the workers; whatever is still queued is discarded.
    drive.queue.shutdown();
    runtime.block_on(async {
        for worker in workers {
            let _ = worker.await;
        }
    });
    mount_result.context("mount filesystem")?;
    Ok(())
}
