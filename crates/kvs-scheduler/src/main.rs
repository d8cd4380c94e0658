use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use kvs_scheduler::test_harness::{run_simulator, SimulatorConfig};
use kvs_scheduler::SchedulerConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("kvsched")
        .version(kvs_scheduler::VERSION)
        .about("Key-value scheduler reconciling desired state with a southbound")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Scheduler configuration file (TOML)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run the reconciliation simulator over an in-memory southbound")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("bridges")
                        .long("bridges")
                        .default_value("8")
                        .value_parser(value_parser!(usize))
                        .help("Number of bridges"),
                )
                .arg(
                    Arg::new("leaves")
                        .long("leaves")
                        .default_value("32")
                        .value_parser(value_parser!(usize))
                        .help("Number of leaves"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.1")
                        .value_parser(value_parser!(f64))
                        .help("Probability of a transient southbound failure per key"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output report as JSON"),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective scheduler configuration"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<Option<SchedulerConfig>> {
    matches
        .get_one::<PathBuf>("config")
        .map(|path| {
            SchedulerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))
        })
        .transpose()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));
    let scheduler_config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let defaults = SimulatorConfig::default();
            let config = SimulatorConfig {
                seed: args.get_one::<u64>("seed").copied().unwrap_or(defaults.seed),
                bridges: args.get_one::<usize>("bridges").copied().unwrap_or(defaults.bridges),
                leaves: args.get_one::<usize>("leaves").copied().unwrap_or(defaults.leaves),
                failure_rate: args
                    .get_one::<f64>("failure-rate")
                    .copied()
                    .unwrap_or(defaults.failure_rate),
                scheduler: scheduler_config.unwrap_or_else(|| defaults.scheduler.clone()),
                ..defaults
            };

            let report = run_simulator(config).await;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.generate_text());
            }

            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Some(("config", _)) => {
            let config = scheduler_config.unwrap_or_default();
            print!("{}", toml::to_string_pretty(&config)?);
        }
        _ => {
            cli().print_help()?;
        }
    }
    Ok(())
}
