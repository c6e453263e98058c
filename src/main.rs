use clap::{Args, Parser, Subcommand, ValueEnum};
use coffeeshop::{
    apps::CoffeeShopApp,
    broker::{InMemoryBroker, RestBroker},
    catalog::{CatalogLoader, DirCatalogLoader},
    config::{ConfigManager, EnvConfigManager, Settings},
    connector::ConnectorRegistry,
    logger::{LogConfig, init_tracing},
    schema::write_schema,
};
use connector_plugin::Broker;
use std::{env, path::PathBuf, process, sync::Arc};
use tracing::{error, info};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "coffeeshop",
    about = "Public display orchestration for kiosk screens",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the container
    Run(RunArgs),

    /// Emit JSON-Schema for catalog files into `<root>/schemas`
    Schema,

    /// Load a catalog directory and report what it contains
    Validate { dir: PathBuf },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum BrokerKind {
    /// In-process broker, deliveries routed without HTTP
    #[default]
    Memory,
    /// External REST broker at BROKER_URL
    Http,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Log level (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    otel_endpoint: Option<String>,

    #[arg(long, value_enum, default_value_t = BrokerKind::Memory)]
    broker: BrokerKind,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            otel_endpoint: None,
            broker: BrokerKind::default(),
        }
    }
}

/// Resolve the coffeeshop root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("COFFEESHOP_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./coffeeshop")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(root, args).await,
        Commands::Schema => {
            let out_dir = root.join("schemas");
            for name in write_schema(&out_dir)? {
                println!("✅ {}", out_dir.join(name).display());
            }
            Ok(())
        }
        Commands::Validate { dir } => {
            let registry = DirCatalogLoader::new(dir.clone()).load()?;
            println!(
                "✅ Catalog `{}` is valid: default `{}`, {} running, {} available",
                dir.display(),
                registry.default_app().id,
                registry.running().len(),
                registry.available().len()
            );
            for (n, app) in registry.running().iter().enumerate() {
                println!(
                    "   {}. {} ({}, connector `{}`)",
                    n + 1,
                    app.name,
                    app.topic(),
                    app.connector()
                );
            }
            Ok(())
        }
    }
}

async fn run(root: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    let telemetry = init_tracing(&LogConfig::new(
        &args.log_level,
        root.join("logs"),
        args.otel_endpoint.clone(),
    ))?;

    info!("CoffeeShop starting up…");
    let catalog_dir = root.join("catalog");
    if !catalog_dir.exists() {
        let err = format!(
            "Catalog directory `{}` does not exist. Set COFFEESHOP_ROOT or create it first.",
            catalog_dir.display()
        );
        error!("{}", err);
        anyhow::bail!(err);
    }

    let config = ConfigManager(EnvConfigManager::new(root.join("config").join(".env")));
    let settings = Settings::load(&config).await?;
    let loader = Arc::new(DirCatalogLoader::new(catalog_dir.clone()));

    let memory = InMemoryBroker::new();
    let broker: Arc<dyn Broker> = match args.broker {
        BrokerKind::Memory => Arc::new(memory.clone()),
        BrokerKind::Http => Arc::new(RestBroker::new(Url::parse(&settings.broker_url)?)),
    };

    let mut app = match CoffeeShopApp::bootstrap(
        settings,
        loader,
        broker,
        ConnectorRegistry::with_builtin(),
    )
    .await
    {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to bootstrap CoffeeShop: {:#}", e);
            process::exit(1);
        }
    };
    if args.broker == BrokerKind::Memory {
        app.attach_memory_delivery(&memory);
    }
    app.watch_catalog(catalog_dir).await?;
    app.serve().await?;

    info!("CoffeeShop running; press Ctrl-C to exit");
    println!("CoffeeShop running; press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;

    println!("\nShutting down…");
    app.shutdown().await;
    telemetry.shutdown();
    println!("Goodbye!");
    Ok(())
}
