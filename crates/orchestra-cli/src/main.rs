//! Command line front end for Device Orchestra.
//!
//! ```bash
//! orchestra status
//! orchestra test motor1
//! orchestra run-pipeline pipelines/scan.json --dry-run
//! orchestra debug thermo1 --log-level debug
//! ```
//!
//! Devices are read from `<config-dir>/devices.json`; application settings
//! from `<config-dir>/orchestra.toml` and `ORCHESTRA__*` environment
//! variables.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use orchestra_core::config::{Config, ConfigBuilder, DeviceConfigLoader, LoggingConfig};
use orchestra_core::event::SharedEventBus;
use orchestra_core::logging;
use orchestra_core::types::{Params, Value};
use orchestra_core::utils::millis_to_duration;
use orchestra_devices::{builtin_factories, ChannelFactory, Device, DeviceRegistry};
use orchestra_engine::{
    DeviceTester, Error as EngineError, Pipeline, PipelineResult, PipelineRunner, RunOptions,
    RunnerOptions, StartPolicy,
};

/// Settings file inside the config directory
const SETTINGS_FILE: &str = "orchestra.toml";

#[derive(Parser)]
#[command(name = "orchestra")]
#[command(
    about = "Control heterogeneous devices and run pipelines against them",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Directory holding orchestra.toml and the device inventory
    #[arg(long, global = true, default_value = "config")]
    config_dir: PathBuf,

    /// Log level or filter (overrides the configured level)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show every configured device with its status
    Status,

    /// Run smoke tests against a device
    Test {
        /// Device id
        device_id: String,
    },

    /// Validate and execute a pipeline file
    RunPipeline {
        /// Path to the pipeline JSON file
        pipeline_file: PathBuf,

        /// Simulate every step without touching devices
        #[arg(long)]
        dry_run: bool,

        /// Write the result as JSON to this file
        #[arg(long)]
        save_result: Option<PathBuf>,

        /// How referenced devices are started: best-effort, abort or skip
        #[arg(long)]
        start_policy: Option<String>,
    },

    /// Send commands to a device interactively
    Debug {
        /// Device id
        device_id: String,
    },
}

/// Everything a command needs
struct App {
    config: Config,
    event_bus: SharedEventBus,
    registry: Arc<DeviceRegistry>,
}

impl App {
    fn load(cli: &Cli) -> Result<Self> {
        let config = ConfigBuilder::new()
            .with_config_file(cli.config_dir.join(SETTINGS_FILE))
            .with_environment_prefix("orchestra")
            .build()
            .context("loading settings")?;

        let level = match (&cli.log_level, &cli.command) {
            (Some(level), _) => level.clone(),
            (None, Commands::Debug { .. }) => "debug".to_string(),
            (None, _) => config.logging.level.clone(),
        };
        logging::init_from_config(&LoggingConfig {
            level,
            with_target: config.logging.with_target,
        })?;

        let event_bus = SharedEventBus::new();
        let channels = ChannelFactory::new()
            .with_default_timeout(millis_to_duration(config.channels.default_timeout_ms));
        let (devices, _channels) = builtin_factories(event_bus.clone(), channels)?;

        let registry = DeviceRegistry::with_event_bus(event_bus.clone());
        let loader = DeviceConfigLoader::new(&cli.config_dir);
        let inventory = loader.load(&config.general.devices_file);
        registry.load_from_configs(&devices, &inventory);
        info!(
            app = %config.general.app_name,
            devices = registry.len(),
            config_dir = %cli.config_dir.display(),
            "inventory loaded"
        );

        Ok(Self {
            config,
            event_bus,
            registry: Arc::new(registry),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run the selected command; `Ok(false)` means it ran but did not succeed
async fn run(cli: Cli) -> Result<bool> {
    let app = App::load(&cli)?;
    let outcome = match cli.command {
        Commands::Status => status(&app).await,
        Commands::Test { device_id } => test_device(&app, &device_id).await,
        Commands::RunPipeline {
            pipeline_file,
            dry_run,
            save_result,
            start_policy,
        } => {
            run_pipeline(
                &app,
                &pipeline_file,
                dry_run,
                save_result.as_deref(),
                start_policy.as_deref(),
            )
            .await
        }
        Commands::Debug { device_id } => debug_device(&app, &device_id).await,
    };

    if let Err(e) = app.registry.stop_all().await {
        warn!(error = %e, "shutdown did not stop every device");
    }
    outcome
}

async fn status(app: &App) -> Result<bool> {
    let devices = app.registry.list().await?;
    println!("{} device status:", app.config.general.app_name);
    println!("{}", "-".repeat(50));
    if devices.is_empty() {
        println!("No devices configured");
        return Ok(true);
    }
    for device in devices {
        println!("ID:     {}", device.id);
        println!("Type:   {}", device.device_type);
        println!("Status: {}", device.status);
        println!("{}", "-".repeat(30));
    }
    Ok(true)
}

async fn test_device(app: &App, device_id: &str) -> Result<bool> {
    if !app.registry.contains(device_id) {
        bail!("device '{}' not found", device_id);
    }

    println!("Testing device: {}", device_id);
    println!("{}", "-".repeat(40));
    let results = DeviceTester::new(app.registry.clone()).test_device(device_id).await;
    for result in &results {
        let mark = if result.success { "ok" } else { "FAILED" };
        println!("{:<12} {:<7} {:.3}s", result.test_name, mark, result.duration);
        if let Some(message) = &result.error_message {
            println!("    {}", message);
        }
    }

    let passed = results.iter().filter(|r| r.success).count();
    println!("\n{}/{} tests passed", passed, results.len());
    Ok(passed == results.len())
}

async fn run_pipeline(
    app: &App,
    pipeline_file: &Path,
    dry_run: bool,
    save_result: Option<&Path>,
    start_policy: Option<&str>,
) -> Result<bool> {
    if !pipeline_file.exists() {
        bail!("pipeline file not found: {}", pipeline_file.display());
    }
    let pipeline = Pipeline::load(pipeline_file)
        .await
        .with_context(|| format!("loading {}", pipeline_file.display()))?;
    let start_policy: StartPolicy = start_policy
        .unwrap_or(app.config.pipeline.start_policy.as_str())
        .parse()?;

    if dry_run {
        println!("Dry run: devices will not be touched");
    }
    println!("Running pipeline: {} ({} steps)", pipeline_file.display(), pipeline.len());
    println!("{}", "-".repeat(50));

    let runner = PipelineRunner::new(app.registry.clone())
        .with_event_bus(app.event_bus.clone())
        .with_options(RunnerOptions::from(&app.config.pipeline));
    let result = match runner.run(&pipeline, RunOptions { dry_run, start_policy }).await {
        Ok(result) => result,
        Err(EngineError::Validation(errors)) => {
            println!("Validation failed:");
            for error in errors {
                println!("  - {}", error);
            }
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    print_summary(&result);
    if let Some(path) = save_result {
        result
            .save(path)
            .await
            .with_context(|| format!("saving result to {}", path.display()))?;
        println!("\nResult saved to {}", path.display());
    }
    Ok(result.failed_steps == 0)
}

fn print_summary(result: &PipelineResult) {
    println!("\n{}", "=".repeat(50));
    println!("PIPELINE RESULT");
    println!("{}", "=".repeat(50));
    println!("Total steps:    {}", result.total_steps);
    println!("Executed:       {}", result.executed_steps);
    println!("Successful:     {}", result.successful_steps);
    println!("Failed:         {}", result.failed_steps);
    println!("Duration:       {:.3}s", result.total_duration);

    if !result.errors.is_empty() {
        println!("\nErrors:");
        for failure in &result.errors {
            println!(
                "  Step {}: {}",
                failure.step_index,
                failure.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

async fn debug_device(app: &App, device_id: &str) -> Result<bool> {
    let device = app.registry.get(device_id)?;
    app.registry.start(device_id).await?;
    println!("Debugging {} ({}); type 'quit' to exit", device_id, device.device_type());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(format!("{}> ", device_id).as_bytes()).await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if matches!(line, "quit" | "exit" | "q") {
            break;
        }
        let Some((command, args)) = parse_command_line(line) else {
            continue;
        };
        match device.send_command(&command, args).await {
            Ok(result) => println!("Result: {}", result),
            Err(e) => println!("Command failed: {}", e),
        }
    }

    app.registry.stop(device_id).await?;
    println!("Device stopped");
    Ok(true)
}

/// Split `cmd key=value ...` into a command and its arguments
///
/// Values containing a `.` are read as floats, others as integers, falling
/// back to strings. Tokens without `=` are ignored.
fn parse_command_line(line: &str) -> Option<(String, Params)> {
    let mut parts = line.split_whitespace();
    let command = parts.next()?.to_string();
    let args = parts
        .filter_map(|part| part.split_once('='))
        .map(|(key, raw)| (key.to_string(), parse_value(raw)))
        .collect();
    Some((command, args))
}

fn parse_value(raw: &str) -> Value {
    let parsed = if raw.contains('.') {
        raw.parse::<f64>().ok().map(Value::Float)
    } else {
        raw.parse::<i64>().ok().map(Value::Integer)
    };
    parsed.unwrap_or_else(|| Value::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let (command, args) =
            parse_command_line("move steps=200 speed=1.5 mode=fast junk").unwrap();
        assert_eq!(command, "move");
        assert_eq!(args.len(), 3);
        assert_eq!(args.get("steps"), Some(&Value::Integer(200)));
        assert_eq!(args.get("speed"), Some(&Value::Float(1.5)));
        assert_eq!(args.get("mode"), Some(&Value::from("fast")));
    }

    #[test]
    fn test_parse_blank_line() {
        assert!(parse_command_line("   ").is_none());
        let (command, args) = parse_command_line("home").unwrap();
        assert_eq!(command, "home");
        assert!(args.is_empty());
    }

    #[test]
    fn test_parse_value_fallbacks() {
        assert_eq!(parse_value("1.2.3"), Value::from("1.2.3"));
        assert_eq!(parse_value("-7"), Value::Integer(-7));
        assert_eq!(parse_value("abc"), Value::from("abc"));
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::parse_from([
            "orchestra",
            "run-pipeline",
            "p.json",
            "--dry-run",
            "--start-policy",
            "skip",
            "--config-dir",
            "conf",
        ]);
        assert_eq!(cli.config_dir, PathBuf::from("conf"));
        match cli.command {
            Commands::RunPipeline { dry_run, start_policy, .. } => {
                assert!(dry_run);
                assert_eq!(start_policy.as_deref(), Some("skip"));
            }
            _ => panic!("expected run-pipeline"),
        }
    }
}
