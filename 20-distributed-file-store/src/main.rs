use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use distributed_file_store::{
    FileServer, ServerState,
    cli::{Cli, Command},
    crypto::EncryptionKey,
    shell,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

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
        Command::Node(args) => {
            let server = Arc::new(FileServer::new(args.into_config()));

            let runner = Arc::clone(&server);
            let server_task = tokio::spawn(async move { runner.start().await });

            if server.wait_for_state(ServerState::Running).await == ServerState::Running {
                if let Some(addr) = server.local_addr() {
                    info!("node listening on {}", addr);
                }
                shell::run(Arc::clone(&server)).await?;
            }

            server.stop();
            match server_task.await? {
                Ok(()) => {}
                Err(err) => {
                    warn!("node exited with error: {err}");
                    return Err(err.into());
                }
            }
        }
        Command::Keygen => println!("{}", EncryptionKey::generate().to_hex()),
    }

    Ok(())
}
