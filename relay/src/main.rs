use clap::Parser;
use log::info;
use relay::Relay;
use shared::DEFAULT_RELAY_PORT;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(default_value_t = DEFAULT_RELAY_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let addr = format!("0.0.0.0:{}", args.port);

    info!("Starting relay on {}", addr);
    let relay = Relay::bind(&addr).await?;
    relay.run().await?;
    Ok(())
}
