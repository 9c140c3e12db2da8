use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{Table, presets::UTF8_FULL};
use cryptoki_sys::{CK_SLOT_ID, CK_ULONG};
use p11test_core::{
    CaseFilter, CaseOutcome, Cryptoki, Pkcs11Module, RunReport, SimulatedToken, Suite,
    SuiteConfig, mechanism::mechanism_name, session::Library,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "PKCS#11 signing and verification conformance suite",
    propagate_version = true
)]
struct Cli {
    /// Configuration file (TOML). Defaults to the per-user config if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// PKCS#11 shared library under test (env: P11TEST_MODULE).
    #[arg(long, global = true, env = "P11TEST_MODULE")]
    module: Option<PathBuf>,

    /// Run against the built-in simulated token. Takes precedence over --module.
    #[arg(long, global = true)]
    simulated: bool,

    /// Slot to test; the first slot with a token when omitted.
    #[arg(long, global = true)]
    slot: Option<CK_SLOT_ID>,

    /// Normal user PIN (env: P11TEST_USER_PIN).
    #[arg(long, global = true, env = "P11TEST_USER_PIN", hide_env_values = true)]
    user_pin: Option<String>,

    /// Seed for payload generation; random when omitted.
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// RSA modulus size for generated keypairs.
    #[arg(long, global = true)]
    modulus_bits: Option<CK_ULONG>,

    /// Debug logging and hex dumps of operation outputs.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the conformance cases.
    Run {
        /// Case filter, `pos1:pos2-neg1:neg2` glob patterns.
        #[arg(long)]
        filter: Option<String>,
        /// Output format for the results.
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Also write the JSON report to this file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List case ids without running them.
    List {
        #[arg(long)]
        filter: Option<String>,
    },
    /// Show module information, slots and mechanisms.
    Info,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    init_tracing(config.verbose);

    match &cli.command {
        Commands::Run {
            filter,
            format,
            output,
        } => {
            let mut config = config;
            if filter.is_some() {
                config.filter = filter.clone();
            }
            let backend = open_backend(&cli, &config)?;
            let report = Suite::signatures()
                .run(backend.as_ref(), &config)
                .context("conformance run aborted")?;
            match format {
                OutputFormat::Text => print_report(&report),
                OutputFormat::Json => println!("{}", report.to_json()?),
            }
            if let Some(path) = output {
                write_report(&report, path)?;
            }
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Commands::List { filter } => {
            let filter = filter.as_deref().or(config.filter.as_deref()).unwrap_or("");
            let filter = CaseFilter::parse(filter).context("invalid case filter")?;
            for case in Suite::signatures().select(&filter) {
                println!("{}", case.id());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Info => {
            let backend = open_backend(&cli, &config)?;
            print_info(backend.as_ref())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

/// File values first, then flags and environment.
fn resolve_config(cli: &Cli) -> Result<SuiteConfig> {
    let mut config = SuiteConfig::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(module) = &cli.module {
        config.module = Some(module.clone());
    }
    if cli.simulated {
        config.module = None;
    }
    if let Some(slot) = cli.slot {
        config.slot = Some(slot);
    }
    if let Some(pin) = &cli.user_pin {
        config.user_pin = pin.clone();
    }
    if let Some(seed) = cli.seed {
        config.seed = Some(seed);
    }
    if let Some(bits) = cli.modulus_bits {
        config.rsa_modulus_bits = bits;
    }
    config.verbose |= cli.verbose;
    Ok(config)
}

fn open_backend(cli: &Cli, config: &SuiteConfig) -> Result<Box<dyn Cryptoki>> {
    if cli.simulated {
        info!("using the simulated token");
        let token = SimulatedToken::builder()
            .user_pin(config.user_pin.clone())
            .build();
        return Ok(Box::new(token));
    }
    let Some(path) = config.module.as_deref() else {
        bail!("no module to test: pass --module, set P11TEST_MODULE, or use --simulated");
    };
    let module = Pkcs11Module::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    Ok(Box::new(module))
}

fn print_report(report: &RunReport) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Case", "Result", "Details", "Time (ms)"]);
    for case in &report.cases {
        let details = match &case.outcome {
            CaseOutcome::Passed => String::new(),
            CaseOutcome::Skipped { reason } => reason.clone(),
            CaseOutcome::Failed { failures } => failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
        };
        table.add_row(vec![
            case.id.clone(),
            case.outcome.label().to_string(),
            details,
            case.duration_ms.to_string(),
        ]);
    }
    println!("{table}");
    println!(
        "module {} seed {}: {}",
        report.module,
        report.seed,
        report.summary()
    );
}

fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    report
        .write_json(path)
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    info!(path = %path.display(), "report written");
    Ok(())
}

fn print_info(backend: &dyn Cryptoki) -> Result<()> {
    let library = Library::open(backend).context("failed to initialize module")?;
    let info = backend
        .module_info()
        .map_err(|rv| anyhow::anyhow!("C_GetInfo returned {rv}"))?;
    println!(
        "Cryptoki {}.{}  {} ({}) v{}.{}",
        info.cryptoki_version.0,
        info.cryptoki_version.1,
        info.description,
        info.manufacturer,
        info.library_version.0,
        info.library_version.1
    );

    let slots = backend
        .slot_list(false)
        .map_err(|rv| anyhow::anyhow!("C_GetSlotList returned {rv}"))?;
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Slot", "Mechanisms"]);
    for slot in slots {
        let mechanisms = match backend.mechanism_list(slot) {
            Ok(list) => list
                .into_iter()
                .map(mechanism_name)
                .collect::<Vec<_>>()
                .join("\n"),
            Err(rv) => {
                warn!(slot, %rv, "C_GetMechanismList failed");
                format!("unavailable ({rv})")
            }
        };
        table.add_row(vec![slot.to_string(), mechanisms]);
    }
    println!("{table}");
    drop(library);
    Ok(())
}
