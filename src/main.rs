//! openocd-launch — Main Entry Point

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

use openocd_launch::config::{self, Args};
use openocd_launch::error::{ConfigError, LaunchError, Result};
use openocd_launch::executor::{self, Controller};
use openocd_launch::plan::{self, SubstitutionContext};
use openocd_launch::template;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    match run(args).await {
        Ok(()) => {}
        // A user-requested interrupt is a clean abort, not a failure.
        Err(LaunchError::Cancelled) => info!("interrupted"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let dir = config::config_dir()?;
    config::create_default_config(&dir)?;

    let section = args
        .section
        .as_deref()
        .ok_or(ConfigError::SectionNotSpecified)?;
    let config_file = match &args.config {
        Some(path) => path.clone(),
        None => config::default_config_file(&dir)?,
    };
    if !config_file.is_file() {
        return Err(ConfigError::CannotOpenConfig(config_file.display().to_string()).into());
    }
    let image = match &args.elf {
        Some(path) => {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.display().to_string()).into());
            }
            path.display().to_string()
        }
        None => String::new(),
    };
    let config_dir = match config_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.display().to_string(),
        _ => ".".to_string(),
    };

    let content = std::fs::read_to_string(&config_file)?;
    let pairs = template::parse_section(&content, section)?;
    let ctx = SubstitutionContext {
        config_dir,
        image,
        fcpu: args.fcpu,
    };
    let plan = plan::resolve(&pairs, &ctx)?;

    if args.dry_run {
        println!();
        print!("{}", executor::dry_run_description(&plan));
        return Ok(());
    }

    let mode = plan::validate_configuration(&plan, section)?;
    plan::validate_files(&plan)?;
    info!("executing section [{}] in {} mode", section, mode.as_str());

    let cancel = CancellationToken::new();
    spawn_interrupt_watcher(cancel.clone());

    let controller = Controller::from_plan(&plan)?;
    controller.execute(&plan, mode, &cancel).await
}

/// Absorb Ctrl-C for the lifetime of the invocation. Local foreground
/// children receive the terminal signal directly; remote streams are
/// cancelled through the token so the CLI exits promptly.
fn spawn_interrupt_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            debug!("interrupt received");
            cancel.cancel();
        }
    });
}

/// Initialize logging system
fn init_logging(args: &Args) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    debug!("logging initialized with level: {}", args.log_level);
    Ok(())
}
