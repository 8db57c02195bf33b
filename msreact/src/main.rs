//! The `msreact` executable drives real-time acquisitions on an MSReact
//! instrument server. It selects one of the built-in algorithms, connects to the
//! server and runs the algorithm's acquisitions one after the other.
//!
//! The hidden `acquisition-worker` subcommand is the entry point of the worker
//! processes started for each acquisition.

mod error;
use crate::error::MsReactError;

use clap::{
    builder::{PathBufValueParser, PossibleValuesParser},
    command, value_parser, Arg, ArgAction, ArgMatches, Command,
};
use colored::Colorize;
use std::{
    env::set_var,
    fs::OpenOptions,
    io::{stdin, stdout},
    net::{SocketAddr, TcpStream},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

use msreact_client::{
    algorithm::{AlgorithmKind, AlgorithmRegistry},
    algorithms::builtin_registry,
    client::{MsReactClient, RunRequest},
    config::{ClientConfig, WorkerMode},
    executor::{AcquisitionExecutor, ProcessExecutor, ThreadExecutor},
    instruments::InstrumentModel,
    worker::{arg, Worker, WorkerArgs, WORKER_SUBCOMMAND},
};

// hack to make sure we rebuild if either Cargo.toml changes, since `clap` gets
// information from there.
#[cfg(not(debug_assertions))]
const _: &str = include_str!("../Cargo.toml");
#[cfg(not(debug_assertions))]
const _: &str = include_str!("../../Cargo.toml");

fn algorithm_arg(registry: &AlgorithmRegistry, kind: AlgorithmKind) -> Arg {
    Arg::new("algorithm")
        .help(format!("The {kind} algorithm to use during the acquisition"))
        .required(true)
        .value_parser(PossibleValuesParser::new(
            registry.names(kind).into_iter().map(String::from),
        ))
}

fn address_arg() -> Arg {
    Arg::new("address")
        .help("The address of the MSReact server")
        .required(true)
}

fn add_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration JSON file to pass into the algorithm")
                .value_parser(PathBufValueParser::new()),
        )
        .arg(
            Arg::new("instrument")
                .long("instrument")
                .help("The id of the instrument on the server")
                .value_parser(value_parser!(i64))
                .default_value("1"),
        )
        .arg(
            Arg::new("instrument-type")
                .long("instrument-type")
                .help("The instrument family: Tribrid, Exploris or Mock")
                .value_parser(|s: &str| s.parse::<InstrumentModel>())
                .default_value("Tribrid"),
        )
        .arg(
            Arg::new("shut-down-server")
                .long("shut-down-server")
                .help("[Mock only] Shut the mock server down once the algorithm is done")
                .action(ArgAction::SetTrue),
        )
}

#[must_use]
fn cmds(registry: &AlgorithmRegistry) -> Command {
    command!()
        .propagate_version(true)
        .subcommand_required(true)
        .arg(
            Arg::new("log-file")
            .short('l')
            .long("log-file")
            .required(false)
            .help("Log to the given log file path. Can be used in conjunction with `--log-socket` and `--verbose`.")
            .global(true)
            .value_parser(PathBufValueParser::new()),
        )
        .arg(
            Arg::new("log-socket")
            .short('t')
            .long("log-socket")
            .required(false)
            .help("Log to the given socket (in IPv4 or IPv6 format with port number). Can be used in conjunction with `--log-file` and `--verbose`.")
            .global(true)
            .value_parser(clap::value_parser!(SocketAddr)),
        )
        .arg(
            Arg::new("verbose")
            .short('v')
            .long("verbose")
            .required(false)
            .help("Enable logging to stderr. Can be used in conjunction with `--log-file` and `--log-socket`.")
            .global(true)
            .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-color")
                .short('n')
                .long("no-color")
                .help("Turn off ANSI color and formatting codes")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("client-config")
                .long("client-config")
                .help("Client configuration JSON file. Missing fields use their defaults.")
                .global(true)
                .value_parser(PathBufValueParser::new()),
        )
        .subcommand({
            let cmd = Command::new("run")
                .about("Run a released algorithm on an instrument")
                .arg(address_arg())
                .arg(algorithm_arg(registry, AlgorithmKind::Release))
                .arg(
                    Arg::new("sequence")
                        .short('s')
                        .long("sequence")
                        .help("CSV sequence file giving the order of the acquisitions")
                        .value_parser(PathBufValueParser::new()),
                );
            add_session_args(cmd)
        })
        .subcommand({
            let cmd = Command::new("proto")
                .about("Run an algorithm prototype")
                .subcommand_required(true)
                .arg(algorithm_arg(registry, AlgorithmKind::Prototype))
                .subcommand(
                    Command::new("inst")
                        .about("Run the prototype on an instrument")
                        .arg(address_arg()),
                );
            add_session_args(cmd)
        })
        .subcommand(Command::new("list").about("List the available algorithms"))
        .subcommand(
            Command::new(WORKER_SUBCOMMAND)
                .hide(true)
                .arg(Arg::new(arg::ALGORITHM).long(arg::ALGORITHM).required(true))
                .arg(
                    Arg::new(arg::STEP)
                        .long(arg::STEP)
                        .required(true)
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new(arg::TRANSFER_REGISTER)
                        .long(arg::TRANSFER_REGISTER)
                        .required(true)
                        .value_parser(PathBufValueParser::new()),
                )
                .arg(
                    Arg::new(arg::INTRA_JOIN_TIMEOUT_MS)
                        .long(arg::INTRA_JOIN_TIMEOUT_MS)
                        .required(true)
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new(arg::CONFIG)
                        .long(arg::CONFIG)
                        .value_parser(PathBufValueParser::new()),
                )
                .arg(Arg::new(arg::RAW_FILE_NAME).long(arg::RAW_FILE_NAME))
                .arg(Arg::new(arg::SAMPLE_NAME).long(arg::SAMPLE_NAME)),
        )
}

fn main() -> anyhow::Result<()> {
    let registry = builtin_registry();
    let matches = cmds(&registry).get_matches();

    if matches.get_flag("no-color") {
        set_var("NO_COLOR", "1");
    }

    if let Some((WORKER_SUBCOMMAND, sub_matches)) = matches.subcommand() {
        let code = acquisition_worker(&registry, sub_matches)?;
        std::process::exit(code);
    }

    init_logging(&matches)?;

    match matches.subcommand() {
        Some(("run", sub_matches)) => run(&matches, registry, sub_matches, sub_matches),
        Some(("proto", sub_matches)) => {
            let Some(("inst", mode_matches)) = sub_matches.subcommand() else {
                return Err(MsReactError::ArgParseError {
                    details: "select a mode to run the algorithm prototype".to_string(),
                }
                .into());
            };
            run(&matches, registry, sub_matches, mode_matches)
        }
        Some(("list", _)) => {
            list(&registry);
            Ok(())
        }
        _ => unreachable!("subcommand is required"),
    }
}

fn init_logging(matches: &ArgMatches) -> anyhow::Result<()> {
    #[cfg(debug_assertions)]
    const LOGFILE_LEVEL: LevelFilter = LevelFilter::TRACE;
    #[cfg(not(debug_assertions))]
    const LOGFILE_LEVEL: LevelFilter = LevelFilter::DEBUG;

    const STDERR_LEVEL: LevelFilter = LevelFilter::INFO;

    let verbose: bool = matches.get_flag("verbose");
    let log_file: Option<&PathBuf> = matches.get_one("log-file");
    let log_socket: Option<&SocketAddr> = matches.get_one("log-socket");

    if !verbose && log_file.is_none() && log_socket.is_none() {
        return Ok(());
    }

    let err = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_ansi(!matches.get_flag("no-color"))
            .with_writer(std::io::stderr)
            .with_filter(STDERR_LEVEL)
    });

    let log = match log_file {
        Some(l) => {
            let log = OpenOptions::new().append(true).create(true).open(l)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(log)
                    .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let sock = match log_socket {
        Some(s) => {
            let sock = TcpStream::connect(s)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(sock))
                    .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
                    .json(),
            )
        }
        None => None,
    };

    let logger = Registry::default()
        .with(LOGFILE_LEVEL)
        .with(err)
        .with(log)
        .with(sock);

    tracing::subscriber::set_global_default(logger)?;
    debug!("logging initialized");
    Ok(())
}

/// The worker logs only through the pipe to its parent.
fn acquisition_worker(registry: &AlgorithmRegistry, args: &ArgMatches) -> anyhow::Result<i32> {
    let worker = Worker::new();
    let logger = Registry::default()
        .with(LevelFilter::DEBUG)
        .with(worker.log_layer());
    tracing::subscriber::set_global_default(logger)?;

    let missing = |name: &str| MsReactError::ArgParseError {
        details: format!("no {name} provided"),
    };
    let mut worker_args = WorkerArgs::new(
        args.get_one::<String>(arg::ALGORITHM)
            .ok_or_else(|| missing(arg::ALGORITHM))?
            .clone(),
        *args
            .get_one::<usize>(arg::STEP)
            .ok_or_else(|| missing(arg::STEP))?,
        args.get_one::<PathBuf>(arg::TRANSFER_REGISTER)
            .ok_or_else(|| missing(arg::TRANSFER_REGISTER))?
            .clone(),
        *args
            .get_one::<u64>(arg::INTRA_JOIN_TIMEOUT_MS)
            .ok_or_else(|| missing(arg::INTRA_JOIN_TIMEOUT_MS))?,
    );
    worker_args.spec.config_path = args.get_one::<PathBuf>(arg::CONFIG).cloned();
    worker_args.spec.raw_file_name = args.get_one::<String>(arg::RAW_FILE_NAME).cloned();
    worker_args.spec.sample_name = args.get_one::<String>(arg::SAMPLE_NAME).cloned();

    Ok(worker.run(registry, &worker_args, stdin(), stdout()))
}

/// `session` holds the algorithm options, `target` the server address.
fn run(
    matches: &ArgMatches,
    registry: AlgorithmRegistry,
    session: &ArgMatches,
    target: &ArgMatches,
) -> anyhow::Result<()> {
    let config_path = matches.get_one::<PathBuf>("client-config");
    let config = ClientConfig::load(config_path.map(PathBuf::as_path)).map_err(MsReactError::from)?;

    let Some(algorithm) = session.get_one::<String>("algorithm").cloned() else {
        return Err(MsReactError::ArgParseError {
            details: "no algorithm provided".to_string(),
        }
        .into());
    };
    let mut request = RunRequest::new(target.get_one::<String>("address").cloned(), &algorithm);
    request.config = session.get_one::<PathBuf>("config").cloned();
    request.sequence = session.get_one::<PathBuf>("sequence").cloned();
    request.instrument = *session.get_one::<i64>("instrument").unwrap_or(&1);
    request.model = session
        .get_one::<InstrumentModel>("instrument-type")
        .copied()
        .unwrap_or(InstrumentModel::Tribrid);
    request.shut_down_server = session.get_flag("shut-down-server");

    let registry = Arc::new(registry);
    let executor: Arc<dyn AcquisitionExecutor> = match config.worker_mode {
        WorkerMode::Process => Arc::new(ProcessExecutor::current_exe()?),
        WorkerMode::Thread => Arc::new(ThreadExecutor::new(Arc::clone(&registry))),
    };
    info!(
        "Running {algorithm} on {} ({:?} workers)",
        request.model, config.worker_mode
    );

    let client = MsReactClient::new(config, registry, executor);
    let runtime = tokio::runtime::Runtime::new()?;
    let completed = runtime
        .block_on(client.run(&request, interrupted()))
        .map_err(MsReactError::from)?;

    if completed {
        eprintln!("{} {algorithm} completed", "Done:".green().bold());
        Ok(())
    } else {
        Err(MsReactError::RunIncomplete { algorithm }.into())
    }
}

/// Completes on Ctrl-C. Never completes if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("unable to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

fn list(registry: &AlgorithmRegistry) {
    for (command, kind) in [("run", AlgorithmKind::Release), ("proto", AlgorithmKind::Prototype)] {
        println!("{} ({command}):", format!("{kind} algorithms").bold());
        let names = registry.names(kind);
        if names.is_empty() {
            println!("  {}", "none".italic());
        }
        for name in names {
            println!("  {name}");
        }
    }
}

#[cfg(test)]
mod unit {
    use std::path::PathBuf;

    use msreact_client::{
        algorithms::builtin_registry, instruments::InstrumentModel, worker::WORKER_SUBCOMMAND,
    };

    use super::cmds;

    #[test]
    fn command_definition_is_consistent() {
        cmds(&builtin_registry()).debug_assert();
    }

    #[test]
    fn run_arguments_parse() {
        let matches = cmds(&builtin_registry())
            .try_get_matches_from([
                "msreact",
                "run",
                "10.0.0.2",
                "monitor",
                "-c",
                "monitor.json",
                "--instrument-type",
                "mock",
            ])
            .expect("should parse");
        let Some(("run", run)) = matches.subcommand() else {
            panic!("expected the run subcommand");
        };
        assert_eq!(run.get_one::<String>("address").map(String::as_str), Some("10.0.0.2"));
        assert_eq!(
            run.get_one::<PathBuf>("config"),
            Some(&PathBuf::from("monitor.json"))
        );
        assert_eq!(
            run.get_one::<InstrumentModel>("instrument-type"),
            Some(&InstrumentModel::Mock)
        );
        assert_eq!(run.get_one::<i64>("instrument"), Some(&1));
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!(cmds(&builtin_registry())
            .try_get_matches_from(["msreact", "run", "10.0.0.2", "topn"])
            .is_err());
    }

    #[test]
    fn worker_arguments_round_trip() {
        use msreact_client::worker::WorkerArgs;

        let mut args = WorkerArgs::new(
            "monitor".to_string(),
            0,
            PathBuf::from("register.json"),
            2_000,
        );
        args.spec.sample_name = Some("QC".to_string());

        let mut argv = vec!["msreact".into(), WORKER_SUBCOMMAND.into()];
        argv.extend(args.to_args());
        let matches = cmds(&builtin_registry())
            .try_get_matches_from(argv)
            .expect("should parse");
        let Some((WORKER_SUBCOMMAND, worker)) = matches.subcommand() else {
            panic!("expected the worker subcommand");
        };
        assert_eq!(worker.get_one::<usize>("step"), Some(&0));
        assert_eq!(worker.get_one::<u64>("intra-join-timeout-ms"), Some(&2_000));
        assert_eq!(worker.get_one::<String>("sample-name").map(String::as_str), Some("QC"));
        assert_eq!(worker.get_one::<String>("raw-file-name"), None);
    }
}
