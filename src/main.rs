use clap::Parser;

use flapi::cmd::{run_server, Cli};
use flapi::log::init_tracing;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref(), cli.log_json);

    if let Err(e) = run_server(&cli).await {
        tracing::error!("{e}");
        // Non-zero exit on startup/config failure before the server binds.
        std::process::exit(1);
    }
}
