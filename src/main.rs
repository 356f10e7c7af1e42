// patternbank - library of reusable analysis patterns
//
// Thin binary over the library crate: load configuration, set up
// tracing, parse the command line and dispatch. All behavior lives in
// patternbank::library; the CLI is one of its callers, an agent shim
// embedding the crate is another.

use clap::Parser;
use patternbank::cli::{self, Cli};
use patternbank::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let cli = Cli::parse();
    let config = Config::from_env();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    // The guard must outlive dispatch or buffered file logs are lost
    let _appender_guard = match &config.logging.file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let filename = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "patternbank.log".to_string());
            let appender = tracing_appender::rolling::never(directory, filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    };

    if let Err(e) = cli::run(cli, &config) {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
