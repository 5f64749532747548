use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use lottery_server::{
    cli::{Cli, Command},
    client,
    server::{Server, ServerConfig},
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let config = ServerConfig::from(args);
            let server = Server::bind(&config).await?;
            let addr = server.local_addr()?;
            info!(
                expected_agencies = config.expected_agencies,
                store = %config.store_path.display(),
                "server ready"
            );
            println!("lottery server listening on {addr}");
            if let Err(err) = server.run_until_signal().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
            info!("server stopped");
        }
        Command::Submit(args) => client::run(args).await?,
    }

    Ok(())
}
