use std::process;

#[tokio::main]
async fn main() {
    match beacon_watch::cli::run().await {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("Command failed with: {}", e);
            drop(e);
            process::exit(1)
        }
    }
}
