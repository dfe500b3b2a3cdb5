//! Zato command line - quickstart cluster bootstrap

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zato_quickstart::config::{OdbKind, QuickstartSettings, DEFAULT_ZATO_ADMIN_PORT};
use zato_quickstart::odb;
use zato_quickstart::pki::RcgenAuthority;
use zato_quickstart::topology::Role;
use zato_quickstart::{Quickstart, QuickstartFailure, QuickstartReport};

/// Zato - command line interface
#[derive(Parser, Debug)]
#[command(name = "zato", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a complete quickstart cluster in an empty directory
    ///
    /// Generates a certificate authority, a load-balancer agent, a server, the
    /// ZatoAdmin web console and a security server, then registers a new
    /// cluster and its server in the ODB.
    Quickstart(QuickstartArgs),
}

/// Quickstart arguments
///
/// Flags override values read from `--config`.
#[derive(Parser, Debug)]
struct QuickstartArgs {
    /// Directory to create the cluster in, must be empty
    #[arg(default_value = ".")]
    target_dir: PathBuf,

    /// YAML settings file
    #[arg(long = "config")]
    config_file: Option<PathBuf>,

    /// ODB type: postgresql, mysql or sqlite
    #[arg(long)]
    odb_type: Option<OdbKind>,

    /// ODB host
    #[arg(long)]
    odb_host: Option<String>,

    /// ODB port, engine default when unset
    #[arg(long)]
    odb_port: Option<u16>,

    /// ODB user
    #[arg(long)]
    odb_user: Option<String>,

    /// ODB password
    #[arg(long, env = "ZATO_ODB_PASSWORD", hide_env_values = true)]
    odb_password: Option<String>,

    /// ODB database name, a file path for SQLite
    #[arg(long)]
    odb_db_name: Option<String>,

    /// ODB schema
    #[arg(long)]
    odb_schema: Option<String>,

    /// RabbitMQ host
    #[arg(long)]
    rabbitmq_host: Option<String>,

    /// RabbitMQ port
    #[arg(long)]
    rabbitmq_port: Option<u16>,

    /// RabbitMQ user
    #[arg(long)]
    rabbitmq_user: Option<String>,

    /// RabbitMQ password
    #[arg(long, env = "ZATO_RABBITMQ_PASSWORD", hide_env_values = true)]
    rabbitmq_password: Option<String>,

    /// Remove everything created by a failed run
    #[arg(long)]
    cleanup_on_failure: bool,
}

impl QuickstartArgs {
    /// Settings from the config file (or defaults) with flags applied on top
    fn into_settings(self) -> anyhow::Result<QuickstartSettings> {
        let mut settings = match &self.config_file {
            Some(path) => QuickstartSettings::from_yaml_file(path)?,
            None => QuickstartSettings::default(),
        };

        settings.target_dir = self.target_dir;
        if let Some(kind) = self.odb_type {
            settings.odb.kind = kind;
        }
        if let Some(host) = self.odb_host {
            settings.odb.host = host;
        }
        if self.odb_port.is_some() {
            settings.odb.port = self.odb_port;
        }
        if let Some(user) = self.odb_user {
            settings.odb.user = user;
        }
        if let Some(password) = self.odb_password {
            settings.odb.password = password;
        }
        if let Some(db_name) = self.odb_db_name {
            settings.odb.db_name = db_name;
        }
        if self.odb_schema.is_some() {
            settings.odb.schema = self.odb_schema;
        }
        if let Some(host) = self.rabbitmq_host {
            settings.broker.host = host;
        }
        if let Some(port) = self.rabbitmq_port {
            settings.broker.port = port;
        }
        if let Some(user) = self.rabbitmq_user {
            settings.broker.user = user;
        }
        if let Some(password) = self.rabbitmq_password {
            settings.broker.password = password;
        }
        settings.cleanup_on_failure |= self.cleanup_on_failure;

        Ok(settings)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Quickstart(args) => {
            tokio::select! {
                code = run_quickstart(args) => code,
                _ = tokio::signal::ctrl_c() => {
                    println!("\nQuitting.");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// Run the quickstart and report the outcome
async fn run_quickstart(args: QuickstartArgs) -> anyhow::Result<ExitCode> {
    let settings = match args.into_settings() {
        Ok(settings) => settings,
        Err(e) => {
            print_failure_header();
            println!("{:?}", e.context("cannot load quickstart settings"));
            return Ok(ExitCode::FAILURE);
        }
    };

    let odb = match odb::connect(&settings.odb).await {
        Ok(odb) => odb,
        Err(e) => {
            print_failure_header();
            println!("{:?}", anyhow::Error::from(e).context("cannot connect to the ODB"));
            return Ok(ExitCode::FAILURE);
        }
    };

    let quickstart = Quickstart::new(settings, odb, Box::new(RcgenAuthority));
    match quickstart.run().await {
        Ok(report) => {
            print_summary(&report);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            print_failure(failure);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_failure_header() {
    println!("\nAn exception has been caught, quitting now!\n");
}

fn print_failure(failure: QuickstartFailure) {
    print_failure_header();

    match failure.step {
        Some(step) => println!("Failed step: {}", step),
        None => println!("Failed before any step ran"),
    }
    if !failure.completed.is_empty() {
        println!("\nCompleted steps:");
        for step in &failure.completed {
            println!("  {}", step);
        }
    }
    if !failure.materialized.is_empty() {
        println!("\nCreated paths:");
        for path in &failure.materialized {
            println!("  {}", path.display());
        }
    }

    println!("\n{:?}", anyhow::Error::from(failure));
}

fn print_summary(report: &QuickstartReport) {
    let topology = &report.topology;

    println!("\n=== Quickstart complete ===");
    println!(
        "\nCluster '{}' (id {}) with server '{}' created in {}",
        report.cluster.name(),
        report.cluster.id,
        report.server.name,
        topology.target_dir().display()
    );
    println!("\nStart the components:");
    for role in [Role::Server, Role::LoadBalancer, Role::ZatoAdmin] {
        println!("  zato start {}", topology.role_dir(role).display());
    }
    println!(
        "\nThen visit http://localhost:{} to log into ZatoAdmin.",
        DEFAULT_ZATO_ADMIN_PORT
    );
}
