use crate::beacon_client::BeaconNodeHttpClient;
use crate::config::Config;
use crate::database::Database;
use crate::indexer::Indexer;
use crate::logger;
use crate::validator_names::ValidatorNames;
use clap::{Arg, ArgAction, Command};
use slog::info;
use std::sync::Arc;

pub const CONFIG: &str = "config";

pub fn app() -> Command {
    Command::new("beacon_watch")
        .about("Beacon chain indexer for a read-only explorer")
        .arg(
            Arg::new(CONFIG)
                .long(CONFIG)
                .value_name("PATH_TO_CONFIG")
                .help("Path to configuration file")
                .action(ArgAction::Set),
        )
}

pub async fn run() -> Result<(), String> {
    let matches = app().get_matches();

    let config = match matches.get_one::<String>(CONFIG) {
        Some(path) => Config::load_from_file(path.to_string())?,
        None => Config::default(),
    };

    if config.beacon_api.endpoints.is_empty() {
        return Err("No beacon API endpoints configured. See --help".to_string());
    }

    let log = logger::build_logger(config.logging.level);
    info!(log, "Starting beacon indexer"; "endpoints" => config.beacon_api.endpoints.len());

    let database =
        Database::open(&config.database.file).map_err(|e| format!("Database failure: {:?}", e))?;

    let validator_names = Arc::new(ValidatorNames::new(log.clone()));
    if let Some(path) = config.validator_names.yaml.clone() {
        validator_names.load_from_yaml(&path)?;
        if !config.indexer.disable_index_writer {
            validator_names
                .update_db(&database)
                .map_err(|e| format!("Database failure: {:?}", e))?;
        }
    }

    let indexer = Indexer::new(&config, database, log.clone());

    for endpoint in &config.beacon_api.endpoints {
        let client = BeaconNodeHttpClient::from_endpoint(endpoint, &config.beacon_api)
            .map_err(|e| format!("Invalid endpoint {}: {:?}", endpoint.url, e))?;
        indexer.add_client(endpoint, Arc::new(client));
    }

    indexer.start_services();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for shutdown signal: {:?}", e))?;
    info!(log, "Shutting down");

    indexer.shutdown().await;

    Ok(())
}
