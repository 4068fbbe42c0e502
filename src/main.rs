use std::path::Path;
use std::process::ExitCode;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use chatkeep::config::GatewayConfig;
use chatkeep::gateway::PersistenceGateway;
use chatkeep::health;

/// Console logging plus, with `CHATKEEP_LOG_FILE` set, a plain-text log file.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file, guard) = match std::env::var("CHATKEEP_LOG_FILE") {
        Ok(path) if !path.trim().is_empty() => {
            let path = Path::new(&path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path.file_name().unwrap_or(path.as_os_str());
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry().with(console).with(file).init();
    guard
}

fn usage() {
    eprintln!("usage: chatkeep [health|self-test]");
    eprintln!("  health     check credentials, remote store and local storage (default)");
    eprintln!("  self-test  store and read back a test record");
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let command = std::env::args().nth(1).unwrap_or_else(|| "health".to_string());
    let config = GatewayConfig::from_env();
    config.validate()?;
    let gateway = PersistenceGateway::new(&config);

    eprintln!("chatkeep v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Collection: {}", config.collection);
    eprintln!("   Data dir:   {}", config.data_dir.display());

    let report = match command.as_str() {
        "health" => health::check(&gateway).await,
        "self-test" => health::self_test(&gateway).await,
        "-h" | "--help" | "help" => {
            usage();
            return Ok(ExitCode::SUCCESS);
        }
        other => {
            eprintln!("unknown command: {other}");
            usage();
            return Ok(ExitCode::from(2));
        }
    };

    println!("{report}");
    Ok(if report.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
