use reactord_core::clients::bus::BusClientFactory;
use reactord_core::config::{parse as parse_config_file, ReactordConfig};
use reactord_core::event_bus::start_event_bus;
use reactord_core::reactor::map::ReactorMapSource;
use reactord_core::reactor::renderer::{JinjaYamlRenderer, LocalFileCache, ReactionSources};
use reactord_core::reactor::{start_reactor, ReactorOptions};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, layer::SubscriberExt};

#[tokio::main]
pub async fn main() {
    // Start logging
    let log_dir = get_log_directory();
    let mut app_log_path = PathBuf::from(log_dir);
    app_log_path.push("application");

    let log_level = match env::var("reactord_log") {
        Ok(level) => match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        },

        Err(_) => Level::INFO,
    };

    let appender = tracing_appender::rolling::hourly(app_log_path.clone(), "application.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(appender);
    let stdout_writer = std::io::stdout.with_max_level(log_level);
    let json_writer = non_blocking.with_max_level(log_level);

    let subscriber = tracing_subscriber::registry()
        .with(fmt::Layer::new().with_writer(stdout_writer).pretty())
        .with(fmt::Layer::new().with_writer(json_writer).json());

    tracing::subscriber::set_global_default(subscriber).expect("Unable to set a global collector");

    info!("reactord {} started", env!("CARGO_PKG_VERSION"));
    info!("Logging to {}", app_log_path.display().to_string());

    let config = read_config();
    let (publisher, subscriber) = start_event_bus();

    let map = match config.reactor_map_source() {
        Some(map) => map,
        None => {
            warn!("No reactor map configured. No reactions can fire");
            ReactorMapSource::Inline(Vec::new())
        }
    };

    let sources = ReactionSources::new(
        Arc::new(LocalFileCache::new(config.reaction_root())),
        Arc::new(JinjaYamlRenderer),
    );

    let client_factory = Arc::new(BusClientFactory::new(publisher.clone()));

    let options = ReactorOptions {
        map,
        worker_threads: config
            .worker_threads()
            .expect("Invalid worker_threads setting"),
        worker_hwm: config.worker_hwm().expect("Invalid worker_hwm setting"),
        client_refresh_interval: config
            .client_refresh_interval()
            .expect("Invalid client_refresh_interval setting"),
    };

    let _reactor = start_reactor(options, subscriber, sources, client_factory);

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install ctrl+c signal handler");
}

fn read_config() -> ReactordConfig {
    let contents =
        std::fs::read_to_string("reactord.config").expect("Failed to read 'reactord.config'");

    parse_config_file(contents.as_str()).expect("Failed to parse config file")
}

fn get_log_directory() -> String {
    let log_dir = "logs";
    let mut log_path = PathBuf::from(log_dir);
    if log_path.is_relative() {
        log_path = std::env::current_dir().expect("Failed to get current directory");
        log_path.push(log_dir);
    }

    log_path
        .to_str()
        .expect("Log directory is not valid UTF-8")
        .to_string()
}
