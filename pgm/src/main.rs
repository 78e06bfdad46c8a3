//! `pgm` — migration and status CLI for pg-multiverse.
//!
//! Exit codes: 0 on success, 1 on any handled error, 130 on SIGINT.

use clap::{Args, Parser, Subcommand};
use multiverse_migrate::{CreateOptions, MigrateOptions, RollbackOptions};
use pg_multiverse::{Coordinator, CoordinatorOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "pgm")]
#[command(about = "Multi-cluster PostgreSQL migrations")]
#[command(version)]
struct Cli {
    /// Cluster configuration file
    #[arg(short = 'c', long = "config", default_value = "./multiverse.config.json")]
    config: PathBuf,

    /// Migrations directory
    #[arg(short = 'm', long = "migrations", default_value = "./migrations")]
    migrations: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a migration file template
    Create(CreateArgs),

    /// Apply pending migrations
    Migrate(MigrateArgs),

    /// Undo applied migrations
    Rollback(RollbackArgs),

    /// Show applied and pending migrations per (schema, cluster)
    Status(TargetArgs),

    /// List registered migrations
    List,
}

#[derive(Args)]
struct CreateArgs {
    /// Migration name
    name: String,

    /// Target schemas
    #[arg(short = 's', long = "schemas", value_delimiter = ',', required = true)]
    schemas: Vec<String>,

    /// Restrict to these clusters
    #[arg(short = 'c', long = "clusters", value_delimiter = ',')]
    clusters: Option<Vec<String>>,

    /// Description
    #[arg(short = 'd', long)]
    description: Option<String>,
}

#[derive(Args)]
struct MigrateArgs {
    /// Stop at this version (inclusive)
    #[arg(short = 't', long = "target")]
    target: Option<String>,

    #[arg(short = 's', long = "schemas", value_delimiter = ',')]
    schemas: Option<Vec<String>>,

    #[arg(short = 'c', long = "clusters", value_delimiter = ',')]
    clusters: Option<Vec<String>>,

    /// Plan without executing
    #[arg(short = 'd', long = "dry-run")]
    dry_run: bool,

    /// Run independent (schema, cluster) lanes in parallel
    #[arg(short = 'p', long)]
    parallel: bool,
}

#[derive(Args)]
struct RollbackArgs {
    /// Roll back everything newer than this version
    #[arg(short = 't', long = "target")]
    target: Option<String>,

    /// Number of migrations to undo per target
    #[arg(short = 'n', long, default_value_t = 1)]
    steps: usize,

    #[arg(short = 's', long = "schemas", value_delimiter = ',')]
    schemas: Option<Vec<String>>,

    #[arg(short = 'c', long = "clusters", value_delimiter = ',')]
    clusters: Option<Vec<String>>,

    /// Plan without executing
    #[arg(short = 'd', long = "dry-run")]
    dry_run: bool,
}

#[derive(Args)]
struct TargetArgs {
    #[arg(short = 's', long = "schemas", value_delimiter = ',')]
    schemas: Option<Vec<String>>,

    #[arg(short = 'c', long = "clusters", value_delimiter = ',')]
    clusters: Option<Vec<String>>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn coordinator_for(cli: &Cli) -> Coordinator {
    Coordinator::new(CoordinatorOptions {
        config_path: Some(cli.config.clone()),
        migrations_path: cli.migrations.clone(),
        ..Default::default()
    })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Create(args) => {
            // Creating a template needs no database.
            let coordinator = coordinator_for(&cli);
            let path = coordinator
                .migrations()
                .create_migration(
                    &args.name,
                    CreateOptions {
                        schemas: args.schemas.clone(),
                        clusters: args.clusters.clone(),
                        description: args.description.clone(),
                    },
                )
                .await?;
            println!("created {}", path.display());
        }

        Commands::List => {
            let coordinator = coordinator_for(&cli);
            coordinator.migrations().load_directory().await?;
            let migrations = coordinator.migrations().get_migrations().await;
            if migrations.is_empty() {
                println!("no migrations registered");
            }
            for migration in migrations {
                println!(
                    "{}  {}  schemas: {}",
                    migration.version,
                    migration.name,
                    migration.target_schemas.join(",")
                );
            }
        }

        Commands::Migrate(args) => {
            let coordinator = coordinator_for(&cli);
            coordinator.initialize(None).await?;
            let result = coordinator
                .migrations()
                .migrate(&MigrateOptions {
                    target_version: args.target.clone(),
                    schemas: args.schemas.clone(),
                    clusters: args.clusters.clone(),
                    dry_run: args.dry_run,
                    parallel: args.parallel,
                    ..Default::default()
                })
                .await;
            let outcome = match result {
                Ok(status) => {
                    if args.dry_run {
                        println!("{} migration(s) pending:", status.pending_migrations.len());
                        for pending in &status.pending_migrations {
                            println!(
                                "  {}  ({} @ {})",
                                pending.version, pending.schema, pending.cluster_id
                            );
                        }
                    } else {
                        println!("applied {} migration(s)", status.applied_migrations.len());
                        for applied in &status.applied_migrations {
                            println!(
                                "  {}  ({} @ {})  {:?}",
                                applied.version,
                                applied.schema,
                                applied.cluster_id,
                                applied.execution_time
                            );
                        }
                        for issue in &status.errors {
                            eprintln!("  FAILED {}: {}", issue.version, issue.error);
                        }
                    }
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
            coordinator.close().await;
            return outcome;
        }

        Commands::Rollback(args) => {
            let coordinator = coordinator_for(&cli);
            coordinator.initialize(None).await?;
            let result = coordinator
                .migrations()
                .rollback(&RollbackOptions {
                    target_version: args.target.clone(),
                    steps: args.steps,
                    schemas: args.schemas.clone(),
                    clusters: args.clusters.clone(),
                    dry_run: args.dry_run,
                    ..Default::default()
                })
                .await;
            let outcome = match result {
                Ok(status) => {
                    if args.dry_run {
                        println!(
                            "{} migration(s) would roll back",
                            status.pending_migrations.len()
                        );
                    } else {
                        println!(
                            "rolled back {} migration(s)",
                            status.applied_migrations.len()
                        );
                        for rolled in &status.applied_migrations {
                            println!(
                                "  {}  ({} @ {})",
                                rolled.version, rolled.schema, rolled.cluster_id
                            );
                        }
                    }
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
            coordinator.close().await;
            return outcome;
        }

        Commands::Status(args) => {
            let coordinator = coordinator_for(&cli);
            coordinator.initialize(None).await?;
            let result = coordinator
                .migrations()
                .get_status(args.schemas.clone(), args.clusters.clone())
                .await;
            let outcome = match result {
                Ok(status) => {
                    println!("applied ({}):", status.applied_migrations.len());
                    for applied in &status.applied_migrations {
                        println!(
                            "  {}  ({} @ {})  batch {}",
                            applied.version, applied.schema, applied.cluster_id, applied.batch
                        );
                    }
                    println!("pending ({}):", status.pending_migrations.len());
                    for pending in &status.pending_migrations {
                        println!(
                            "  {}  ({} @ {})",
                            pending.version, pending.schema, pending.cluster_id
                        );
                    }
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
            coordinator.close().await;
            return outcome;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    tokio::select! {
        result = run(cli) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            ExitCode::from(130)
        }
    }
}
