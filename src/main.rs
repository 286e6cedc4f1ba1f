use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bioindexr::{
    BioIndex, Config,
    config::{Registry, TablesFile},
    fetch::{Format, RecordData},
    handlers::{AppState, create_router},
    index::SqliteIndexStore,
    storage::{LocalStorage, ObjectStore, RetryPolicy, RetryingStore},
    types::QueryResult,
};

#[derive(Debug, Parser)]
#[command(name = "bioindexr")]
#[command(about = "Byte-offset index and query server for line-delimited JSON in object storage")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the REST server
    Serve {
        /// Host address to bind to
        #[arg(long, env = "BIOINDEX_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(short, long, env = "BIOINDEX_PORT", default_value = "5000")]
        port: u16,

        /// Enable CORS for all origins
        #[arg(long, env = "BIOINDEX_CORS")]
        cors: bool,
    },
    /// Build an index, or every index with `*`
    Index { name: String },
    /// Print every record matching a query, one JSON object per line
    Query { name: String, q: String },
    /// Count records matching a query (all records if omitted)
    Count { name: String, q: Option<String> },
    /// Print every record of an index
    All { name: String },
    /// List the distinct keys of a value index
    Keys {
        name: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List the keys of a value index starting with a prefix
    Match {
        name: String,
        prefix: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List configured indexes
    List,
    /// Check that source data and the index database are reachable
    Test,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let tables = TablesFile::load(&config.config)?;
    let registry = Registry::from_file(&tables)?;
    let database = config.database_path(&tables)?;
    let store = Arc::new(SqliteIndexStore::open(&database)?);
    let objects = open_objects(&config, &tables).await?;
    let engine = Arc::new(BioIndex::new(&config, registry, store, objects));

    match cli.command {
        Command::Serve { host, port, cors } => {
            let app = create_router(AppState {
                engine: Arc::clone(&engine),
            });
            let app = if cors {
                app.layer(CorsLayer::permissive())
            } else {
                app
            };

            let addr = format!("{}:{}", host, port);
            tracing::info!("Starting bioindexr server on {}", addr);
            tracing::info!("Index database: {:?}", database);

            let listener = tokio::net::TcpListener::bind(&addr).await?;
            axum::serve(listener, app).await?;
        }
        Command::Index { name } => {
            let reports = if name == "*" {
                engine.build_all().await?
            } else {
                vec![engine.build(&name).await?]
            };
            for report in reports {
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        Command::Query { name, q } => {
            let first = engine.query(&name, &q, None, Format::Row).await?;
            print_pages(&engine, first).await?;
        }
        Command::All { name } => {
            let first = engine.all(&name, None, Format::Row).await?;
            print_pages(&engine, first).await?;
        }
        Command::Count { name, q } => {
            let result = engine.count(&name, q.as_deref()).await?;
            println!("{}", result.count);
        }
        Command::Keys { name, limit } => {
            for key in engine.keys(&name, limit).await?.data {
                println!("{}", key);
            }
        }
        Command::Match {
            name,
            prefix,
            limit,
        } => {
            for key in engine.match_keys(&name, &prefix, limit).await?.data {
                println!("{}", key);
            }
        }
        Command::List => {
            for info in engine.indexes().await? {
                let state = match (info.generation, info.rows) {
                    (Some(generation), Some(rows)) => {
                        format!("generation {}, {} rows", generation, rows)
                    }
                    _ => "not built".to_string(),
                };
                println!("{}\t{}\t{}\t{}", info.index, info.schema, info.prefix, state);
            }
        }
        Command::Test => {
            for (name, objects) in engine.check().await? {
                println!("{}: {} object(s)", name, objects);
            }
            println!("OK");
        }
    }

    Ok(())
}

/// Print every record of every page as one JSON line.
async fn print_pages(engine: &BioIndex, first: QueryResult) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut page = first;
    loop {
        {
            let mut out = stdout.lock();
            match &page.data {
                RecordData::Rows(records) => {
                    for record in records {
                        writeln!(out, "{}", serde_json::to_string(record)?)?;
                    }
                }
                RecordData::Columns(columns) => {
                    writeln!(out, "{}", serde_json::to_string(columns)?)?;
                }
            }
        }

        match page.continuation.take() {
            Some(token) => page = engine.resume(&token, None).await?,
            None => return Ok(()),
        }
    }
}

async fn open_objects(config: &Config, tables: &TablesFile) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let policy = config.retry_policy();

    if let Some(dir) = &config.data_dir {
        tracing::info!("Data directory: {:?}", dir);
        return Ok(Arc::new(RetryingStore::new(
            LocalStorage::new(dir.clone()),
            policy,
        )));
    }

    let Some(bucket) = config.bucket(tables) else {
        anyhow::bail!("no source data configured: pass --data-dir or --s3-bucket, or set s3_bucket");
    };
    open_s3(config, bucket, policy).await
}

#[cfg(feature = "s3")]
async fn open_s3(
    config: &Config,
    bucket: String,
    policy: RetryPolicy,
) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let s3 = bioindexr::storage::S3Storage::new(
        bucket,
        config.region.clone(),
        config.endpoint.clone(),
    )
    .await;
    tracing::info!("Source bucket: s3://{}", s3.bucket());
    Ok(Arc::new(RetryingStore::new(s3, policy)))
}

#[cfg(not(feature = "s3"))]
async fn open_s3(
    _config: &Config,
    bucket: String,
    _policy: RetryPolicy,
) -> anyhow::Result<Arc<dyn ObjectStore>> {
    anyhow::bail!("cannot read s3://{}: built without the `s3` feature", bucket)
}
