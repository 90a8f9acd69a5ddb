//! LANDMARK PF: run and analyze the landmark particle filter on recorded or synthetic scenarios.
//!
//! - `run`: load a scenario directory, run the filter cycle over every step, and write one CSV row
//!   per step with the estimate, the best particle's associations, and the error against ground
//!   truth when it is available.
//! - `generate`: simulate a drive through a landmark map and write it as a scenario directory.
//! - `config`: write a template simulation configuration file (TOML/JSON/YAML).

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use std::path::{Path, PathBuf};

use landmark_pf::config::DEFAULT_NUM_PARTICLES;
use landmark_pf::map::{Landmark, Map};
use landmark_pf::measurements::AssociationGating;
use landmark_pf::motion::ControlInput;
use landmark_pf::particle::{DegenerateWeightPolicy, ParticleResamplingStrategy};
use landmark_pf::sim::{
    Scenario, SimulationConfig, StepResult, generate_scenario, read_map, run_scenario, summarize,
};

const LONG_ABOUT: &str = "LANDMARK PF: A particle filter for 2-D localization against a known landmark map.

Each sensor cycle the filter predicts every particle with a unicycle motion model, weighs it by
the likelihood of the observed landmarks, and resamples in proportion to weight.

Scenario directories hold landmarks.csv (id,x,y), controls.csv (velocity,yaw_rate),
observations.csv (step,id,x,y) and optionally ground_truth.csv (x,y,theta).";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "A particle filter for 2-D localization against a known landmark map.", long_about = LONG_ABOUT)]
struct Cli {
    /// Command to execute
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(name = "run", about = "Run the particle filter over a scenario directory")]
    Run(RunArgs),
    #[command(
        name = "generate",
        about = "Generate a synthetic scenario directory",
        long_about = "Simulate a vehicle driving with constant velocity and yaw rate through a landmark map. If no landmark file is given, a square grid of landmarks is used."
    )]
    Generate(GenerateArgs),
    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Scenario directory
    #[arg(short, long, value_parser)]
    input: PathBuf,

    /// Output CSV file path
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Simulation configuration file (TOML/JSON/YAML); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of particles
    #[arg(short = 'n', long)]
    particles: Option<usize>,

    /// Random seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Resampling scheme
    #[arg(long, value_enum)]
    resampling: Option<ParticleResamplingStrategy>,

    /// Restrict association candidates to the sensor range
    #[arg(long, value_enum)]
    gating: Option<AssociationGating>,

    /// Behaviour when every particle weight is zero
    #[arg(long, value_enum)]
    degenerate_weights: Option<DegenerateWeightPolicy>,

    /// Weigh particles in parallel
    #[arg(long)]
    parallel: bool,
}

#[derive(Args, Clone, Debug)]
struct GenerateArgs {
    /// Output scenario directory
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Landmark CSV file (id,x,y); defaults to a grid
    #[arg(short, long)]
    landmarks: Option<PathBuf>,

    /// Number of steps
    #[arg(long, default_value_t = 500)]
    steps: usize,

    /// Forward velocity (m/s)
    #[arg(long, default_value_t = 5.0)]
    velocity: f64,

    /// Yaw rate (rad/s)
    #[arg(long, default_value_t = 0.05)]
    yaw_rate: f64,

    /// Simulation configuration file providing delta_t, sensor range and landmark noise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Random seed for the observation noise
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output file path for the config file
    /// File extension determines format: .json, .yaml/.yml, or .toml (recommended)
    #[arg(short, long, value_parser)]
    output: PathBuf,
}

/// Initialize the logger with the specified configuration.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SimulationConfig> {
    match path {
        Some(p) => SimulationConfig::from_file(p)
            .with_context(|| format!("failed to read configuration {}", p.display())),
        None => Ok(SimulationConfig::default()),
    }
}

fn run(args: &RunArgs) -> Result<()> {
    if !args.input.is_dir() {
        bail!("Input path '{}' is not a directory.", args.input.display());
    }
    let mut config = load_config(args.config.as_deref())?;
    if let Some(n) = args.particles {
        config.filter.num_particles = n;
    }
    if args.seed.is_some() {
        config.filter.seed = args.seed;
    }
    if let Some(strategy) = args.resampling {
        config.filter.resampling_strategy = strategy;
    }
    if let Some(gating) = args.gating {
        config.filter.association_gating = gating;
    }
    if let Some(policy) = args.degenerate_weights {
        config.filter.degenerate_weights = policy;
    }
    config.filter.parallel_weighting |= args.parallel;

    let scenario = Scenario::from_dir(&args.input)?;
    info!(
        "Running {} particles over {} steps",
        config.filter.num_particles,
        scenario.len()
    );
    let results = run_scenario(&scenario, &config)?;
    StepResult::to_csv(&results, &args.output)?;
    info!("Results written to {}", args.output.display());
    if let Some(summary) = summarize(&results) {
        println!(
            "RMSE over {} steps: x {:.4} m, y {:.4} m, theta {:.5} rad",
            summary.steps, summary.rmse_x, summary.rmse_y, summary.rmse_theta
        );
    }
    Ok(())
}

fn grid_map(spacing: f64, count: usize) -> Map {
    let half = (count as f64 - 1.0) * spacing / 2.0;
    (0..count * count)
        .map(|k| {
            let (i, j) = (k / count, k % count);
            Landmark::new(
                k as i32 + 1,
                i as f64 * spacing - half,
                j as f64 * spacing - half,
            )
        })
        .collect()
}

fn generate(args: &GenerateArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let map = match &args.landmarks {
        Some(path) => read_map(path)?,
        None => grid_map(20.0, 11),
    };
    let controls = vec![ControlInput::new(args.velocity, args.yaw_rate); args.steps];
    let start = config.initial_pose.unwrap_or_default();
    let scenario = generate_scenario(&map, &controls, start, &config, args.seed)?;
    scenario.to_dir(&args.output)?;
    info!(
        "Wrote {} steps over {} landmarks to {}",
        scenario.len(),
        map.len(),
        args.output.display()
    );
    Ok(())
}

fn create_config(args: &CreateConfigArgs) -> Result<()> {
    let config = SimulationConfig::default();
    config
        .to_file(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(
        "Template configuration ({} particles) written to {}",
        DEFAULT_NUM_PARTICLES,
        args.output.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    let outcome = match &cli.command {
        Command::Run(args) => run(args),
        Command::Generate(args) => generate(args),
        Command::CreateConfig(args) => create_config(args),
    };
    if let Err(e) = &outcome {
        error!("{e:#}");
    }
    outcome
}
