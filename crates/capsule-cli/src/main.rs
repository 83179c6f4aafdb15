use anyhow::{Context, Result};
use capsule_cli::config::{read_source, CliConfig, Format, LowerFlags, DEFAULT_LOG_FILTER};
use capsule_cli::eval::{run_unit, Value};
use capsule_lower::{bind_module, lower_unit, LoweredUnit};
use capsule_parse::parse_str;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "capsule")]
#[command(about = "Capsule: closure-environment synthesis for a small expression language")]
struct Cli {
    /// Log filter (overrides CAPSULE_LOG), e.g. `debug` or `capsule_lower=trace`
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse a source file and dump the AST
    Parse {
        /// Path to .cap source file
        file: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Pretty)]
        format: Format,
    },

    /// Lower a source file and print the synthesized environments and bodies
    Lower {
        /// Path to .cap source file
        file: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Pretty)]
        format: Format,

        #[command(flatten)]
        flags: LowerFlags,
    },

    /// Lower a source file and run its main()
    Run {
        /// Path to .cap source file
        file: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Pretty)]
        format: Format,

        #[command(flatten)]
        flags: LowerFlags,
    },
}

#[derive(Serialize)]
struct RunOutput<'a> {
    unit: &'a str,
    generation: u32,
    result: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Parse { file, format } => {
            let config = CliConfig::from_args(cli.log.as_deref(), &LowerFlags::default());
            init_logging(&config.log_filter);
            cmd_parse(&file, format)
        }
        Commands::Lower {
            file,
            format,
            flags,
        } => {
            let config = CliConfig::from_args(cli.log.as_deref(), &flags);
            init_logging(&config.log_filter);
            cmd_lower(&file, format, &config)
        }
        Commands::Run {
            file,
            format,
            flags,
        } => {
            let config = CliConfig::from_args(cli.log.as_deref(), &flags);
            init_logging(&config.log_filter);
            cmd_run(&file, format, &config)
        }
    }
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn unit_name(file: &Path) -> &str {
    file.file_stem().and_then(|s| s.to_str()).unwrap_or("main")
}

fn lower_file(file: &Path, config: &CliConfig) -> Result<LoweredUnit> {
    let src = read_source(file)?;
    let module = parse_str(&file.to_string_lossy(), &src)?;
    let tree = bind_module(&module, unit_name(file))?;
    let baseline = config.load_baseline()?;
    let unit = lower_unit(&tree, &config.options, baseline.as_ref())?;
    for d in &unit.report.degraded {
        info!(
            identity = %d.identity,
            previous = %d.previous,
            replacement = %d.replacement,
            dependents = d.dependents.len(),
            "rebuilt environment"
        );
    }
    if let Some(path) = &config.emit_baseline {
        let json = unit.next_baseline().to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write baseline '{}'", path.display()))?;
    }
    Ok(unit)
}

fn cmd_parse(file: &Path, format: Format) -> Result<()> {
    let src = read_source(file)?;
    let module = parse_str(&file.to_string_lossy(), &src)?;

    match format {
        Format::Pretty => println!("{:#?}", module),
        Format::Json => println!("{}", serde_json::to_string_pretty(&module)?),
    }
    Ok(())
}

fn cmd_lower(file: &Path, format: Format, config: &CliConfig) -> Result<()> {
    let unit = lower_file(file, config)?;

    match format {
        Format::Pretty => print!("{}", unit),
        Format::Json => println!("{}", serde_json::to_string_pretty(&unit)?),
    }
    Ok(())
}

fn cmd_run(file: &Path, format: Format, config: &CliConfig) -> Result<()> {
    let unit = lower_file(file, config)?;
    let result = run_unit(&unit)?;

    match format {
        Format::Pretty => match result {
            Value::Unit => println!("Program completed successfully."),
            other => println!("main() = {}", other),
        },
        Format::Json => {
            let out = RunOutput {
                unit: &unit.unit,
                generation: unit.generation,
                result: result.to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}
