use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    fs::File,
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
};
use tracing::warn;

use crate::console::{ConsoleCommand, HELP};
use crate::server::FileServer;

/// Reads commands from stdin and runs them against `server` until EXIT,
/// end of input or ctrl-c.
pub async fn run(server: Arc<FileServer>) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                if !handle_line(&server, &input).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    Ok(())
}

async fn handle_line(server: &FileServer, line: &str) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(true);
    }

    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(true);
        }
    };

    let keep_going = command != ConsoleCommand::Exit;
    if let Err(err) = execute(server, command).await {
        write_stderr(&format!("!!! {err:#}")).await?;
    }

    Ok(keep_going)
}

async fn execute(server: &FileServer, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Put { key, path } => {
            let mut file = File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            let written = server.store_file(&key, &mut file).await?;
            write_stdout(&format!("*** stored {key} ({written} bytes)")).await
        }
        ConsoleCommand::Get { key, output } => {
            let (size, mut file) = server.get(&key).await?;
            match output {
                Some(path) => {
                    let mut out = File::create(&path)
                        .await
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    io::copy(&mut file, &mut out).await?;
                    out.flush().await?;
                    write_stdout(&format!("*** wrote {key} ({size} bytes) to {}", path.display()))
                        .await
                }
                None => {
                    let mut stdout = io::stdout();
                    io::copy(&mut file, &mut stdout).await?;
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await?;
                    Ok(())
                }
            }
        }
        ConsoleCommand::Delete { key } => {
            server.delete_local(&key).await?;
            write_stdout(&format!("*** deleted {key} from this node")).await
        }
        ConsoleCommand::Peers => {
            let peers = server.peers();
            if peers.is_empty() {
                return write_stdout("*** no connected peers").await;
            }
            for peer in peers {
                write_stdout(&format!("  {peer}")).await?;
            }
            Ok(())
        }
        ConsoleCommand::Help => {
            for line in HELP {
                write_stdout(line).await?;
            }
            Ok(())
        }
        ConsoleCommand::Exit => write_stdout("*** shutting down").await,
    }
}

async fn write_stdout(line: &str) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

async fn write_stderr(line: &str) -> Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await?;
    Ok(())
}
