use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use dbmig_core::output::{self, TableData};
use dbmig_core::{LocalState, MigrationService, StateLock};
use dbmig_kernel::clock::SystemClock;
use dbmig_kernel::collaborators::InMemoryCopyExecutor;
use dbmig_kernel::config::SupervisorConfig;
use dbmig_kernel::logging::{self, LogFormat};
use dbmig_kernel::test_harness::{MigrationSimulator, SimulatorConfig};
use dbmig_model::{
    BackendDescriptor, DatabaseKind, Installation, MigrationOperationView, MigrationRequest,
    MigrationState, MultiTenantDatabase, OperationFilter, OperationId, Paging, WorkerId,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn cli() -> Command {
    let operation_id = || {
        Arg::new("db-migration")
            .long("db-migration")
            .required(true)
            .value_parser(value_parser!(OperationId))
            .help("Migration operation ID")
    };

    Command::new("dbmig")
        .version(dbmig_core::VERSION)
        .about("Installation database migration control plane")
        .arg(
            Arg::new("state-file")
                .long("state-file")
                .global(true)
                .default_value("dbmig-state.json")
                .value_parser(value_parser!(PathBuf))
                .help("Local JSON state file"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("db-migration")
                .about("Manage installation database migrations")
                .subcommand_required(true)
                .subcommand(
                    Command::new("request")
                        .about("Request a migration to a multi-tenant database")
                        .arg(
                            Arg::new("installation")
                                .long("installation")
                                .required(true)
                                .help("Installation to migrate"),
                        )
                        .arg(
                            Arg::new("destination-db")
                                .long("destination-db")
                                .default_value(DatabaseKind::MultiTenantRdsPostgres.as_str())
                                .value_parser(value_parser!(DatabaseKind))
                                .help("Destination database kind"),
                        )
                        .arg(
                            Arg::new("multi-tenant-db")
                                .long("multi-tenant-db")
                                .help("Pin the destination instance"),
                        )
                        .arg(
                            Arg::new("dry-run")
                                .long("dry-run")
                                .action(ArgAction::SetTrue)
                                .help("Print the request without submitting it"),
                        ),
                )
                .subcommand(
                    Command::new("list")
                        .about("List migration operations, newest first")
                        .arg(
                            Arg::new("installation")
                                .long("installation")
                                .help("Only this installation"),
                        )
                        .arg(
                            Arg::new("state")
                                .long("state")
                                .value_parser(value_parser!(MigrationState))
                                .help("Only operations in this state"),
                        )
                        .arg(
                            Arg::new("page")
                                .long("page")
                                .default_value("0")
                                .value_parser(value_parser!(u32))
                                .help("Page number"),
                        )
                        .arg(
                            Arg::new("per-page")
                                .long("per-page")
                                .default_value("100")
                                .value_parser(value_parser!(u32))
                                .help("Operations per page"),
                        )
                        .arg(table_flag())
                        .arg(custom_columns()),
                )
                .subcommand(
                    Command::new("get")
                        .about("Show one migration operation")
                        .arg(operation_id())
                        .arg(table_flag())
                        .arg(custom_columns()),
                )
                .subcommand(
                    Command::new("commit")
                        .about("Commit a migrated operation")
                        .arg(operation_id()),
                )
                .subcommand(
                    Command::new("rollback")
                        .about("Roll back a migrated operation")
                        .arg(operation_id()),
                ),
        )
        .subcommand(
            Command::new("database")
                .about("Manage shared database instances")
                .subcommand_required(true)
                .subcommand(
                    Command::new("register")
                        .about("Register a multi-tenant database instance")
                        .arg(Arg::new("id").long("id").required(true).help("Instance ID"))
                        .arg(
                            Arg::new("kind")
                                .long("kind")
                                .default_value(DatabaseKind::MultiTenantRdsPostgres.as_str())
                                .value_parser(value_parser!(DatabaseKind))
                                .help("Backend kind served"),
                        )
                        .arg(
                            Arg::new("capacity")
                                .long("capacity")
                                .required(true)
                                .value_parser(value_parser!(u32))
                                .help("Total slots"),
                        )
                        .arg(
                            Arg::new("compatibility")
                                .long("compatibility")
                                .required(true)
                                .help("Schema/version compatibility tag"),
                        ),
                )
                .subcommand(Command::new("list").about("Show instance usage")),
        )
        .subcommand(
            Command::new("installation")
                .about("Manage the local installation registry")
                .subcommand_required(true)
                .subcommand(
                    Command::new("register")
                        .about("Register an installation")
                        .arg(Arg::new("id").long("id").required(true).help("Installation ID"))
                        .arg(
                            Arg::new("kind")
                                .long("kind")
                                .default_value(DatabaseKind::SingleTenantRdsPostgres.as_str())
                                .value_parser(value_parser!(DatabaseKind))
                                .help("Current backend kind"),
                        )
                        .arg(
                            Arg::new("database")
                                .long("database")
                                .help("Shared instance for multi-tenant kinds"),
                        )
                        .arg(
                            Arg::new("database-version")
                                .long("database-version")
                                .required(true)
                                .help("Schema/version tag"),
                        ),
                )
                .subcommand(Command::new("list").about("Show registered installations")),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the reconciliation supervisor against the state file")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Supervisor TOML config"),
                )
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .value_parser(value_parser!(usize))
                        .help("Override worker count"),
                )
                .arg(
                    Arg::new("poll-interval-ms")
                        .long("poll-interval-ms")
                        .value_parser(value_parser!(u64))
                        .help("Override poll interval"),
                )
                .arg(
                    Arg::new("copy-polls")
                        .long("copy-polls")
                        .default_value("2")
                        .value_parser(value_parser!(u32))
                        .help("Status polls before an in-process copy completes"),
                )
                .arg(
                    Arg::new("save-interval-ms")
                        .long("save-interval-ms")
                        .default_value("1000")
                        .value_parser(value_parser!(u64))
                        .help("How often the state file is written"),
                )
                .arg(
                    Arg::new("once")
                        .long("once")
                        .action(ArgAction::SetTrue)
                        .help("Run a single reconciliation pass and exit"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run the randomized migration simulator")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("rounds")
                        .long("rounds")
                        .default_value("60")
                        .value_parser(value_parser!(usize))
                        .help("Simulation rounds"),
                )
                .arg(
                    Arg::new("installations")
                        .long("installations")
                        .default_value("12")
                        .value_parser(value_parser!(usize))
                        .help("Installations competing for capacity"),
                )
                .arg(
                    Arg::new("databases")
                        .long("databases")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Shared instances"),
                )
                .arg(
                    Arg::new("capacity")
                        .long("capacity")
                        .default_value("3")
                        .value_parser(value_parser!(u32))
                        .help("Slots per instance"),
                )
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Concurrent supervisors"),
                )
                .arg(
                    Arg::new("copy-failure-rate")
                        .long("copy-failure-rate")
                        .default_value("0.1")
                        .value_parser(value_parser!(f64))
                        .help("Chance per round that an installation's copies fail"),
                ),
        )
}

fn table_flag() -> Arg {
    Arg::new("table")
        .long("table")
        .action(ArgAction::SetTrue)
        .help("Print a table instead of JSON")
}

fn custom_columns() -> Arg {
    Arg::new("custom-columns")
        .long("custom-columns")
        .value_name("HEADER:.Field,...")
        .help("Print a table of the given columns (implies --table)")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    logging::init(if matches.get_flag("log-json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    let state_file = arg::<PathBuf>(&matches, "state-file")?;

    match matches.subcommand() {
        Some(("db-migration", args)) => db_migration(&state_file, args).await,
        Some(("database", args)) => database(&state_file, args),
        Some(("installation", args)) => installation(&state_file, args),
        Some(("serve", args)) => serve(&state_file, args).await,
        Some(("simulate", args)) => simulate(args).await,
        _ => unreachable!("subcommand_required"),
    }
}

fn arg<T: Clone + Send + Sync + 'static>(args: &ArgMatches, name: &str) -> anyhow::Result<T> {
    args.get_one::<T>(name)
        .cloned()
        .with_context(|| format!("missing --{name}"))
}

/// Load the state file; the returned lock is held until the command is done
fn open(state_file: &Path) -> anyhow::Result<(StateLock, LocalState)> {
    let lock = StateLock::acquire(state_file)
        .with_context(|| format!("locking {}", state_file.display()))?;
    let state = LocalState::open(state_file, Arc::new(SystemClock))
        .with_context(|| format!("opening {}", state_file.display()))?;
    Ok((lock, state))
}

async fn db_migration(state_file: &Path, args: &ArgMatches) -> anyhow::Result<()> {
    let (_lock, state) = open(state_file)?;
    let service: MigrationService = state.service();

    match args.subcommand() {
        Some(("request", args)) => {
            let request = MigrationRequest::new(
                arg::<String>(args, "installation")?,
                arg::<DatabaseKind>(args, "destination-db")?,
                args.get_one::<String>("multi-tenant-db").map(|db| db.as_str().into()),
            );
            if args.get_flag("dry-run") {
                println!("{}", serde_json::to_string_pretty(&request)?);
                return Ok(());
            }
            let view = service.request_migration(request).await?;
            state.save(state_file)?;
            print_json(&view)
        }
        Some(("list", args)) => {
            let mut filter = OperationFilter::all().with_paging(Paging::new(
                arg::<u32>(args, "page")?,
                arg::<u32>(args, "per-page")?,
            ));
            if let Some(installation) = args.get_one::<String>("installation") {
                filter = filter.with_installation(installation.as_str());
            }
            if let Some(state) = args.get_one::<MigrationState>("state") {
                filter = filter.with_state(*state);
            }
            let views = service.list_operations(&filter);
            match table_columns(args) {
                Some(columns) => print_table(columns, &views),
                None => print_json(&views),
            }
        }
        Some(("get", args)) => {
            let view = service.get_operation(arg::<OperationId>(args, "db-migration")?)?;
            match table_columns(args) {
                Some(columns) => print_table(columns, std::slice::from_ref(&view)),
                None => print_json(&view),
            }
        }
        Some(("commit", args)) => {
            let view = service.commit_operation(arg::<OperationId>(args, "db-migration")?)?;
            state.save(state_file)?;
            print_json(&view)
        }
        Some(("rollback", args)) => {
            let view = service.rollback_operation(arg::<OperationId>(args, "db-migration")?)?;
            state.save(state_file)?;
            print_json(&view)
        }
        _ => unreachable!("subcommand_required"),
    }
}

fn database(state_file: &Path, args: &ArgMatches) -> anyhow::Result<()> {
    let (_lock, state) = open(state_file)?;
    match args.subcommand() {
        Some(("register", args)) => {
            state.register_database(MultiTenantDatabase::new(
                arg::<String>(args, "id")?,
                arg::<DatabaseKind>(args, "kind")?,
                arg::<u32>(args, "capacity")?,
                arg::<String>(args, "compatibility")?,
            ))?;
            state.save(state_file)?;
            Ok(())
        }
        Some(("list", _)) => {
            println!("{:<24}  {:<40}  {:>8}  {:>8}", "ID", "KIND", "OCCUPIED", "CAPACITY");
            for db in state.allocator().snapshot() {
                println!(
                    "{:<24}  {:<40}  {:>8}  {:>8}",
                    db.id.to_string(),
                    db.kind.as_str(),
                    db.occupied(),
                    db.capacity
                );
            }
            Ok(())
        }
        _ => unreachable!("subcommand_required"),
    }
}

fn installation(state_file: &Path, args: &ArgMatches) -> anyhow::Result<()> {
    let (_lock, state) = open(state_file)?;
    match args.subcommand() {
        Some(("register", args)) => {
            let kind = arg::<DatabaseKind>(args, "kind")?;
            let backend = match args.get_one::<String>("database") {
                Some(db) if kind.is_multi_tenant() => BackendDescriptor::multi_tenant(kind, db.as_str()),
                Some(_) => anyhow::bail!("--database only applies to multi-tenant kinds"),
                None if kind.is_multi_tenant() => {
                    anyhow::bail!("multi-tenant installations need --database")
                }
                None => BackendDescriptor::dedicated(kind),
            };
            state.register_installation(Installation::new(
                arg::<String>(args, "id")?,
                backend,
                arg::<String>(args, "database-version")?,
            ))?;
            state.save(state_file)?;
            Ok(())
        }
        Some(("list", _)) => print_json(&state.lifecycle().snapshot()),
        _ => unreachable!("subcommand_required"),
    }
}

async fn serve(state_file: &Path, args: &ArgMatches) -> anyhow::Result<()> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => SupervisorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SupervisorConfig::new(),
    };
    if let Some(workers) = args.get_one::<usize>("workers") {
        config = config.with_workers(*workers);
    }
    if let Some(ms) = args.get_one::<u64>("poll-interval-ms") {
        config = config.with_poll_interval_ms(*ms);
    }
    config.validate()?;

    let (lock, state) = open(state_file)?;
    drop(lock);
    let copier = Arc::new(InMemoryCopyExecutor::new().with_polls(arg::<u32>(args, "copy-polls")?));
    let supervisor = Arc::new(state.supervisor(copier, config));

    if args.get_flag("once") {
        let report = supervisor.run_once(&WorkerId::generate()).await;
        state.sync(state_file)?;
        println!(
            "examined {} advanced {} waiting {} skipped {} failures {}",
            report.examined, report.advanced, report.waiting, report.skipped, report.failures
        );
        return Ok(());
    }

    tracing::info!(
        state_file = %state_file.display(),
        workers = supervisor.config().workers,
        "supervisor starting"
    );
    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let workers = tokio::spawn(Arc::clone(&supervisor).run(shutdown));

    let mut save_ticker =
        tokio::time::interval(Duration::from_millis(arg::<u64>(args, "save-interval-ms")?));
    loop {
        tokio::select! {
            _ = save_ticker.tick() => {
                if let Err(err) = state.sync(state_file) {
                    tracing::warn!(error = %err, "failed to sync state file");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    tracing::info!("shutting down");
    if stop.send(true).is_err() {
        tracing::debug!("supervisor workers already stopped");
    }
    workers.await?;
    state.sync(state_file)?;
    Ok(())
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<()> {
    let config = SimulatorConfig {
        seed: arg(args, "seed")?,
        rounds: arg(args, "rounds")?,
        installations: arg(args, "installations")?,
        databases: arg(args, "databases")?,
        capacity: arg(args, "capacity")?,
        workers: arg(args, "workers")?,
        copy_failure_rate: arg(args, "copy-failure-rate")?,
        ..SimulatorConfig::default()
    };

    println!("Running migration simulator...");
    println!("Seed: {}", config.seed);
    println!("Rounds: {}", config.rounds);
    println!();

    let report = MigrationSimulator::new(config).run().await;
    println!("{}", report.generate_text());

    std::process::exit(if report.passed() { 0 } else { 1 });
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `Some("")` asks for the default table
fn table_columns(args: &ArgMatches) -> Option<&str> {
    match args.get_one::<String>("custom-columns") {
        Some(columns) => Some(columns.as_str()),
        None => args.get_flag("table").then_some(""),
    }
}

fn print_table(columns: &str, views: &[MigrationOperationView]) -> anyhow::Result<()> {
    let (keys, rows): TableData = if columns.is_empty() {
        output::default_table(views)
    } else {
        output::custom_table(&output::parse_columns(columns)?, views)?
    };
    print!("{}", output::render(&keys, &rows));
    Ok(())
}
