use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::{path::PathBuf, sync::Arc};
use tlite::{
    config::{parse_interval, AdmissionPolicy, ServerConfig},
    engine::{Engine, Scheduler},
    server::{serve, tls_acceptor},
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

fn cli() -> Command {
    Command::new("tlite")
        .about("Mutual-TLS key-value store over an in-memory SQLite working copy")
        .arg(Arg::new("host")
            .long("host")
            .env("TLITE_HOST")
            .value_name("ADDR")
            .default_value("0.0.0.0")
            .help("Address to listen on"))
        .arg(Arg::new("port")
            .long("port")
            .short('p')
            .env("TLITE_PORT")
            .value_name("PORT")
            .default_value("9999")
            .value_parser(clap::value_parser!(u16))
            .help("Port to listen on"))
        .arg(Arg::new("ca")
            .long("ca")
            .env("TLITE_CA")
            .value_name("FILE")
            .default_value("ca.crt")
            .help("CA certificate used to verify client certificates"))
        .arg(Arg::new("cert")
            .long("cert")
            .short('c')
            .env("TLITE_CERT")
            .value_name("FILE")
            .default_value("server.crt")
            .help("Server certificate chain (PEM)"))
        .arg(Arg::new("key")
            .long("key")
            .short('k')
            .env("TLITE_KEY")
            .value_name("FILE")
            .default_value("server.key")
            .help("Server private key (PEM)"))
        .arg(Arg::new("interval")
            .long("interval")
            .short('t')
            .alias("dt")
            .env("TLITE_INTERVAL")
            .value_name("DURATION")
            .default_value("60s")
            .help("Snapshot interval, e.g. 90, 45s, 10m, 1h30m"))
        .arg(Arg::new("dump-file")
            .long("dump-file")
            .short('l')
            .alias("load")
            .env("TLITE_DUMP_FILE")
            .value_name("FILE")
            .default_value("data.sqlite")
            .help("Snapshot file loaded at startup and rewritten on every export"))
        .arg(Arg::new("policy")
            .long("policy")
            .env("TLITE_POLICY")
            .value_name("POLICY")
            .default_value("serial")
            .help("Read admission policy: serial | concurrent-reads"))
        .arg(Arg::new("shutdown-grace")
            .long("shutdown-grace")
            .env("TLITE_SHUTDOWN_GRACE")
            .value_name("DURATION")
            .default_value("5s")
            .help("Upper bound on the final snapshot at shutdown"))
}

fn load_config(matches: &ArgMatches) -> Result<ServerConfig> {
    // Every string arg has a default, so lookups only miss on a typo here.
    let get = |name: &str| -> Result<String> {
        matches
            .get_one::<String>(name)
            .cloned()
            .with_context(|| format!("missing --{}", name))
    };
    Ok(ServerConfig {
        host: get("host")?,
        port: *matches.get_one::<u16>("port").context("missing --port")?,
        ca_path: PathBuf::from(get("ca")?),
        cert_path: PathBuf::from(get("cert")?),
        key_path: PathBuf::from(get("key")?),
        dump_path: PathBuf::from(get("dump-file")?),
        sync_interval: parse_interval(&get("interval")?).context("--interval")?,
        shutdown_grace: parse_interval(&get("shutdown-grace")?).context("--shutdown-grace")?,
        policy: get("policy")?.parse::<AdmissionPolicy>()?,
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Main entry point for the tlite server.
///
/// This function:
/// 1. Parses command-line flags (each with an environment fallback)
/// 2. Initializes structured logging with tracing
/// 3. Opens the in-memory working copy and merges the last snapshot
/// 4. Starts the command scheduler and the periodic snapshot timer
/// 5. Serves mutual-TLS connections until Ctrl-C
/// 6. Writes one final snapshot, bounded by the shutdown grace period
#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let engine = Arc::new(Engine::open(&config.dump_path).await?);
    let scheduler = Arc::new(Scheduler::start(engine.clone(), config.policy));
    let persistence = engine.persistence();
    let timer = persistence.clone().spawn_periodic(config.sync_interval);
    info!(
        path = %config.dump_path.display(),
        every = ?config.sync_interval,
        "snapshot timer started"
    );

    let acceptor = tls_acceptor(&config)?;
    serve(engine, scheduler, acceptor, &config.listen_addr(), shutdown_signal()).await?;

    timer.abort();
    info!(grace = ?config.shutdown_grace, "shutting down, writing final snapshot");
    match tokio::time::timeout(config.shutdown_grace, persistence.export()).await {
        Ok(Ok(())) => info!(path = %config.dump_path.display(), "final snapshot written"),
        Ok(Err(e)) => error!(error = %e, "final snapshot failed"),
        Err(_) => warn!("final snapshot did not finish within the grace period"),
    }
    Ok(())
}
