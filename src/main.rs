//! resistance_daq - command line front end
//!
//! Runs recipes against the simulated rig, validates recipe files, expands
//! stage programs into recipes, calibrates the excitation level and records
//! I-V curves.
//!
//! ```text
//! resistance_daq run recipes/cooldown.toml --output data/
//! resistance_daq validate recipes/cooldown.toml
//! resistance_daq expand recipes/stages.toml --from 300 --output recipes/sweep.toml
//! resistance_daq calibrate --max 1e-4
//! resistance_daq iv --min 1e-8 --max 1e-4 --output iv.csv
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use resistance_daq::config::EngineConfig;
use resistance_daq::data::storage::{shared, write_iv_curve, BufferedSink, CsvSink, TracingSink};
use resistance_daq::experiment::{
    CalibrationParams, IvCurveParams, RampProgram, RunEngine, RunEvent, RunRecipe, RunStatus,
    SafetyLimits,
};
use resistance_daq::hardware::mock::simulated_hardware;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "resistance_daq")]
#[command(about = "Temperature-dependent resistance measurement runs", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a recipe on the simulated rig
    Run {
        /// Recipe file (.toml or .json)
        recipe: PathBuf,
        /// Output directory, defaults to `application.data_dir`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check a recipe without running it
    Validate { recipe: PathBuf },
    /// Expand a stage program into a recipe
    Expand {
        /// Stage program file (.toml or .json)
        program: PathBuf,
        /// Start temperature in kelvin, overriding the program's
        #[arg(long)]
        from: Option<f64>,
        /// Write the recipe here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Find the smallest excitation with an acceptable spread
    Calibrate {
        #[arg(long, default_value_t = 50e-12)]
        min: f64,
        #[arg(long, default_value_t = 1e-3)]
        max: f64,
        /// Accepted relative spread
        #[arg(long, default_value_t = 0.05)]
        limit: f64,
        #[arg(long, default_value_t = 10)]
        readings: u32,
    },
    /// Record an I-V curve over a geometric excitation ramp
    Iv {
        #[arg(long, default_value_t = 1e-9)]
        min: f64,
        #[arg(long, default_value_t = 1e-4)]
        max: f64,
        /// Multiplier between levels
        #[arg(long, default_value_t = 10.0)]
        step: f64,
        /// Readings per polarity and level
        #[arg(long, default_value_t = 10)]
        readings: u32,
        /// Write the points as CSV instead of JSON on stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    init_tracing(&config.application.log_level, cli.json_logs);
    let config = Arc::new(config);

    match cli.command {
        Command::Run { recipe, output } => run(config, &recipe, output).await,
        Command::Validate { recipe } => validate(&recipe),
        Command::Expand {
            program,
            from,
            output,
        } => expand(&program, from, output.as_deref()),
        Command::Calibrate {
            min,
            max,
            limit,
            readings,
        } => {
            let params = CalibrationParams {
                min_excitation: min,
                max_excitation: max,
                spread_limit: limit,
                readings_per_polarity: readings,
                ..CalibrationParams::default()
            };
            calibrate(config, params).await
        }
        Command::Iv {
            min,
            max,
            step,
            readings,
            output,
        } => {
            let params = IvCurveParams {
                min_excitation: min,
                max_excitation: max,
                step_factor: step,
                readings_per_polarity: readings,
                ..IvCurveParams::default()
            };
            iv_curve(config, params, output.as_deref()).await
        }
    }
}

fn init_tracing(log_level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_level.into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Aborts through `engine` on Ctrl-C.
fn abort_on_ctrl_c(engine: Arc<RunEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, aborting");
            engine.abort("interrupted by operator");
        }
    })
}

async fn run(config: Arc<EngineConfig>, recipe_path: &Path, output: Option<PathBuf>) -> Result<()> {
    let recipe = RunRecipe::load(recipe_path)?;
    let output_dir = output.unwrap_or_else(|| config.application.data_dir.clone());

    let csv = CsvSink::create(&output_dir, &recipe.name, &recipe.metadata)?;
    info!("Writing samples to {}", csv.path().display());
    let sink = shared(BufferedSink::spawn(csv));

    let engine = Arc::new(RunEngine::new(
        simulated_hardware(&config.simulation),
        sink.clone(),
        config.clone(),
    ));
    let progress = engine.add_listener(|event| match event {
        RunEvent::SetpointCompleted {
            setpoint_index,
            samples,
            estimated_remaining,
            ..
        } => info!(
            setpoint = setpoint_index,
            samples,
            remaining = ?estimated_remaining,
            "Setpoint done"
        ),
        RunEvent::SetpointSkipped {
            setpoint_index,
            reason,
        } => warn!(setpoint = setpoint_index, "Setpoint skipped: {}", reason),
        _ => {}
    });

    let run_uid = engine.start(&recipe)?;
    info!(run_uid = %run_uid, "Run started, press Ctrl-C to abort");
    let ctrl_c = abort_on_ctrl_c(engine.clone());

    let state = engine.wait().await;
    ctrl_c.abort();
    progress.abort();

    let writer = sink.lock().shutdown();
    if let Some(writer) = writer {
        writer
            .await
            .context("Data writer task failed")?
            .context("Failed to write run data")?;
    }

    match state.status {
        RunStatus::Completed => {
            info!(samples = state.samples_emitted, "Run completed");
            Ok(())
        }
        status => {
            let cause = state
                .last_error
                .map(|failure| failure.to_string())
                .unwrap_or_else(|| format!("run ended as {}", status));
            error!("{}", cause);
            Err(anyhow!("Run {} failed: {}", run_uid, cause))
        }
    }
}

fn validate(recipe_path: &Path) -> Result<()> {
    let recipe = RunRecipe::load(recipe_path)?;
    recipe
        .validate()
        .map_err(|e| anyhow!("Invalid recipe {:?}: {}", recipe_path, e))?;
    println!(
        "{}: {} setpoints, {} samples expected",
        recipe.name,
        recipe.setpoints.len(),
        recipe.expected_samples()
    );
    Ok(())
}

fn load_program(path: &Path) -> Result<RampProgram> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read stage program {:?}", path))?;
    let program = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse stage program {:?}", path))?,
        _ => toml::from_str(&text)
            .with_context(|| format!("Failed to parse stage program {:?}", path))?,
    };
    Ok(program)
}

fn expand(program_path: &Path, from: Option<f64>, output: Option<&Path>) -> Result<()> {
    let mut program = load_program(program_path)?;
    if let Some(start) = from {
        program.start_temperature = start;
    }
    let recipe = program
        .expand()
        .map_err(|e| anyhow!("Cannot expand {:?}: {}", program_path, e))?;

    match output {
        Some(path) => {
            recipe.save(path)?;
            info!(
                setpoints = recipe.setpoints.len(),
                "Recipe written to {}",
                path.display()
            );
        }
        None => print!(
            "{}",
            toml::to_string_pretty(&recipe).context("Failed to serialize recipe")?
        ),
    }
    Ok(())
}

async fn calibrate(config: Arc<EngineConfig>, params: CalibrationParams) -> Result<()> {
    let sink = shared(TracingSink);
    let engine = Arc::new(RunEngine::new(
        simulated_hardware(&config.simulation),
        sink,
        config,
    ));
    let ctrl_c = abort_on_ctrl_c(engine.clone());
    let result = engine.calibrate(params, SafetyLimits::default()).await;
    ctrl_c.abort();

    let result = result?;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize calibration")?
    );
    Ok(())
}

async fn iv_curve(
    config: Arc<EngineConfig>,
    params: IvCurveParams,
    output: Option<&Path>,
) -> Result<()> {
    let engine = Arc::new(RunEngine::new(
        simulated_hardware(&config.simulation),
        shared(TracingSink),
        config,
    ));
    let ctrl_c = abort_on_ctrl_c(engine.clone());
    let result = engine.iv_curve(params, SafetyLimits::default()).await;
    ctrl_c.abort();

    let points = result?;
    match output {
        Some(path) => write_iv_curve(path, &points)?,
        None => println!(
            "{}",
            serde_json::to_string_pretty(&points).context("Failed to serialize I-V curve")?
        ),
    }
    Ok(())
}
