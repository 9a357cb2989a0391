//! PostgreSQL Logical Replication Client - demo binary
//!
//! Connects to a database, ensures a replication slot exists, and streams decoded
//! pgoutput messages to stdout until interrupted.

use std::env;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use pg_logical_replica::{
    Builder, PgControlConnection, PgoutputDecoder, ReplicationSession, StdoutProcessor,
};

#[derive(Parser, Debug)]
#[command(
    name = "pg_replica_rs",
    about = "PostgreSQL Logical Replication Client",
    version = "0.1.0"
)]
struct Args {
    /// Database connection parameters (space-separated key=value pairs, or alternating
    /// key value tokens)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    connection_params: Vec<String>,

    /// Replication slot name
    #[arg(long, default_value = "sub")]
    slot_name: String,

    /// Publication name forwarded to the pgoutput plugin
    #[arg(long, default_value = "pub")]
    publication: String,

    /// Drop the slot on shutdown instead of leaving it for the next run
    #[arg(long)]
    drop_slot_on_close: bool,

    /// Seconds between unsolicited keepalive status updates; 0 disables them
    #[arg(long, default_value_t = 10)]
    status_update_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    let args = Args::parse();

    if args.connection_params.is_empty() {
        error!("No connection parameters provided!");
        error!(
            "Usage: {} user=postgres password=mypass host=localhost port=5432 dbname=mydb",
            env::args().next().unwrap_or_else(|| "pg_replica_rs".to_string())
        );
        std::process::exit(1);
    }

    let conninfo = pg_logical_replica::config::parse_connection_args(&args.connection_params);
    info!(slot = %args.slot_name, publication = %args.publication, "starting replication client");

    tokio::task::spawn_blocking(move || run(&conninfo, &args)).await??;
    Ok(())
}

fn run(conninfo: &str, args: &Args) -> Result<()> {
    let mut builder = Builder::new()
        .slot_name(&args.slot_name)
        .plugin("pgoutput")
        .drop_slot_on_close(args.drop_slot_on_close)
        .stream_params(format!("publication_names={}", args.publication));
    if args.status_update_interval_secs > 0 {
        builder = builder.status_update_interval(Duration::from_secs(args.status_update_interval_secs));
    }
    let config = builder.build()?;

    let control = Box::new(PgControlConnection::connect(conninfo)?);
    let session = ReplicationSession::open(conninfo, config, control)?;

    let decoder = Box::new(PgoutputDecoder::new(args.publication.clone()));
    let mut stream = session.start_streaming(decoder)?;

    let runtime = tokio::runtime::Handle::current();
    stream.start_keepalive(&runtime);

    let mut processor = StdoutProcessor::default();
    loop {
        runtime.block_on(stream.read(&mut processor))?;
        if let Some(lsn) = stream.last_received_lsn() {
            stream.flush_lsn(lsn)?;
        }
    }
}
