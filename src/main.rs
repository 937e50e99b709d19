use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use failure_triage::{CiAction, RuleRegistry, TestUnit, TriageConfig, TriageEngine};
use log::LevelFilter;
use std::io::Read;
use std::process;

const EXIT_GATE_FAILED: i32 = 1;
const EXIT_FATAL: i32 = 2;

#[tokio::main]
async fn main() {
    let matches = Command::new("failure-triage")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Classify failed test runs and decide CI gate actions")
        .long_about(
            "Reads normalized test events, extracts failure signals, fingerprints error\n\
             messages, tracks their history, classifies each failure with rule packs and\n\
             prints a JSON batch report with a FAIL/WARN/PASS action per test.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (defaults are used when omitted)"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Load and validate configuration and rule packs, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("FILE")
                .help("JSON array of test units, or - for stdin")
                .default_value("-"),
        )
        .arg(
            Arg::new("pretty")
                .long("pretty")
                .help("Pretty-print the JSON report")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging of every pipeline step")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        init_logging(matches.get_flag("verbose"), "info");
        match TriageConfig::default().to_file(generate_path) {
            Ok(()) => println!("Default configuration written to: {generate_path}"),
            Err(e) => {
                eprintln!("Error generating configuration: {e:#}");
                process::exit(EXIT_FATAL);
            }
        }
        return;
    }

    let config = match matches.get_one::<String>("config") {
        Some(path) => match TriageConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading configuration: {e:#}");
                process::exit(EXIT_FATAL);
            }
        },
        None => TriageConfig::default(),
    };

    init_logging(matches.get_flag("verbose"), &config.logging.level);

    if matches.get_flag("test-config") {
        process::exit(test_config(&config));
    }

    match run(&matches, &config).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("Error: {e:#}");
            process::exit(EXIT_FATAL);
        }
    }
}

fn init_logging(verbose: bool, configured: &str) {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        configured.parse().unwrap_or(LevelFilter::Info)
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .target(env_logger::Target::Stderr)
        .init();
}

fn test_config(config: &TriageConfig) -> i32 {
    println!("Testing configuration...");
    if let Err(e) = config.validate() {
        println!("Configuration is invalid: {e}");
        return EXIT_FATAL;
    }

    match RuleRegistry::load(config.rules_dir()) {
        Ok(registry) => {
            let rules = registry.snapshot();
            match config.rules_dir() {
                Some(dir) => println!("Rule packs loaded from: {}", dir.display()),
                None => println!("Rule packs: built-in"),
            }
            println!("  generic: {} rules", rules.generic().rules.len());
            for framework in rules.frameworks() {
                let count = rules
                    .framework_pack(framework)
                    .map(|pack| pack.rules.len())
                    .unwrap_or(0);
                println!("  {framework}: {count} rules");
            }
            println!("Total rules: {} (digest {})", rules.rule_count(), rules.digest);
            println!("Configuration is valid");
            0
        }
        Err(e) => {
            println!("Rule packs are invalid: {e}");
            EXIT_FATAL
        }
    }
}

fn read_units(input: &str) -> anyhow::Result<Vec<TestUnit>> {
    let content = if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("reading test units from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(input).with_context(|| format!("reading test units from {input}"))?
    };
    serde_json::from_str(&content).context("parsing test units")
}

async fn run(matches: &ArgMatches, config: &TriageConfig) -> anyhow::Result<i32> {
    let input = matches
        .get_one::<String>("input")
        .map(String::as_str)
        .unwrap_or("-");
    let units = read_units(input)?;
    log::info!("Read {} test units from {}", units.len(), input);

    let engine = TriageEngine::from_config(config, None)?;
    let report = engine.run(units).await;
    engine.shutdown().await;

    let json = if matches.get_flag("pretty") {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");

    Ok(match report.summary.overall_action {
        CiAction::Fail => EXIT_GATE_FAILED,
        CiAction::Warn | CiAction::Pass => 0,
    })
}
