use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use tcp_relay::{
    cli::{Cli, Command},
    client,
    config::RelayConfig,
    server::RelayServer,
    transfer::{self, FileReceiver},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let config = RelayConfig::from(&args);
            let server = RelayServer::bind(&config).await?;
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
        Command::SendFile(args) => {
            transfer::send_file(args.server, &args.path).await?;
        }
        Command::ReceiveFiles(args) => {
            let receiver = FileReceiver::bind(args.listen, args.dir).await?;
            info!("file receiver listening on {}", receiver.local_addr()?);
            receiver.run_until_ctrl_c().await?;
        }
    }

    Ok(())
}
