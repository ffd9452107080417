//! Long-lived game-timer synchronization server

use clap::Parser;
use server::network::Server;

#[derive(Parser)]
#[command(name = "timer-sync-server")]
#[command(about = "WebSocket synchronization server for shared game timers")]
struct Args {
    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let server = Server::bind(&format!("{}:{}", args.host, args.port)).await?;
    server.run().await
}
