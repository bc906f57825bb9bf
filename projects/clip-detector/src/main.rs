mod cli;
mod pipeline;
mod video;
mod web;

use anyhow::Result;
use cli::{Args, Command};
use video::processor::run_offline;
use web::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    match args.command {
        Command::Serve(serve) => run_server(serve).await?,
        Command::Process(process) => {
            tokio::task::spawn_blocking(move || run_offline(process)).await??
        }
    }

    Ok(())
}
