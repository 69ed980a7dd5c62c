use trellis_core::config::TrellisConfig;
use trellis_core::engine::Engine;
use trellis_core::executor::CommandBackend;
use trellis_core::shutdown::Shutdown;

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration; `trellis.toml` is used when present.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Directory the fuzzer writes initial inputs to.
    #[clap(long)]
    input_dir: Option<PathBuf>,
    /// Directory interesting inputs are exported to.
    #[clap(long)]
    export_dir: Option<PathBuf>,
    /// Backend command line, split on whitespace.
    #[clap(long)]
    oracle_command: Option<String>,
    /// Explore rounds per cycle.
    #[clap(short = 'i', long)]
    max_iterations: Option<u64>,
    /// Stop after this many cycles instead of running until interrupted.
    #[clap(long)]
    max_cycles: Option<u64>,
    /// Print the effective configuration as TOML and exit.
    #[clap(long)]
    dump_config: bool,
}

fn load_config(cli: &Cli) -> Result<TrellisConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(config_path) => {
            log::info!("Loading configuration from specified path: {config_path:?}");
            TrellisConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("trellis.toml");
            if default_config_path.exists() {
                log::info!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                TrellisConfig::load_from_file(&default_config_path)?
            } else {
                log::info!(
                    "No config file specified and default 'trellis.toml' not found, using built-in defaults."
                );
                TrellisConfig::default()
            }
        }
    };

    if let Some(dir) = &cli.input_dir {
        config.engine.input_dir = dir.clone();
    }
    if let Some(dir) = &cli.export_dir {
        config.engine.export_dir = dir.clone();
    }
    if let Some(command) = &cli.oracle_command {
        config.oracle.command = command.split_whitespace().map(str::to_string).collect();
    }
    if let Some(iterations) = cli.max_iterations {
        config.engine.max_inner_iterations = iterations;
    }
    if cli.max_cycles.is_some() {
        config.engine.max_cycles = cli.max_cycles;
    }
    Ok(config)
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    if cli.dump_config {
        print!("{}", toml::to_string(&config)?);
        return Ok(());
    }
    config.validate()?;
    log::debug!("Effective configuration: {config:#?}");

    let shutdown = Shutdown::new();
    let handler_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("interrupt received, finishing the current run");
        handler_signal.trigger();
    })?;

    let backend = CommandBackend::new(config.backend_config())?;
    let mut engine = Engine::new(
        &config,
        Box::new(backend.clone()),
        Box::new(backend),
        shutdown,
    )?;

    let totals = engine.run()?;
    println!(
        "Cycles: {}, Imported: {}, Explored nodes: {}, Generated: {}, Exported: {}, Best cost: {}",
        totals.cycles,
        totals.imported,
        totals.explored_nodes,
        totals.generated,
        totals.exported,
        engine
            .trie()
            .best_cost()
            .map_or_else(|| "none".to_string(), |c| c.to_string())
    );
    Ok(())
}
