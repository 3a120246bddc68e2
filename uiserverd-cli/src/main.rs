use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use uiserverd_core::engine::{NullCertificateResolver, NullEngine};
use uiserverd_core::{UiServer, UiServerConfig};

#[derive(Parser)]
#[command(author, version, about = "GnuPG-style UI server daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Serve {
        /// Data directory (default: $UISERVERD_DATA_DIR or ~/.uiserverd)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Listen on this socket instead of <data-dir>/S.uiserver
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Show configuration and whether a server is listening
    Status {
        /// Data directory (default: $UISERVERD_DATA_DIR or ~/.uiserverd)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Socket to probe instead of <data-dir>/S.uiserver
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Print the effective configuration as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send raw protocol lines to a running server
    Call {
        /// Data directory (default: $UISERVERD_DATA_DIR or ~/.uiserverd)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Socket to connect to instead of <data-dir>/S.uiserver
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Protocol lines, sent in order
        #[arg(required = true)]
        lines: Vec<String>,
    },
}

/// Get the uiserverd data directory
fn uiserverd_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    if let Ok(dir) = std::env::var("UISERVERD_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
    Ok(home.join(".uiserverd"))
}

fn load_config(data_dir: Option<PathBuf>, socket: Option<PathBuf>) -> Result<UiServerConfig> {
    let dir = uiserverd_dir(data_dir)?;
    let mut config = UiServerConfig::load_or_default(&dir)?;
    if socket.is_some() {
        config.socket_path = socket;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { data_dir, socket } => {
            cmd_serve(data_dir, socket).await?;
        }
        Commands::Status {
            data_dir,
            socket,
            json,
        } => {
            cmd_status(data_dir, socket, json).await?;
        }
        Commands::Call {
            data_dir,
            socket,
            lines,
        } => {
            cmd_call(data_dir, socket, lines).await?;
        }
    }

    Ok(())
}

// =============================================================================
// Serve Command Implementation
// =============================================================================

async fn cmd_serve(data_dir: Option<PathBuf>, socket: Option<PathBuf>) -> Result<()> {
    let config = Arc::new(load_config(data_dir, socket)?);
    let server = UiServer::bind(
        Arc::clone(&config),
        Arc::new(NullEngine),
        Arc::new(NullCertificateResolver),
    )
    .await?;
    println!("uiserverd listening on {}", server.socket_path().display());

    let shutdown = server.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.signal();
        }
    });

    server.run().await
}

// =============================================================================
// Status Command Implementation
// =============================================================================

async fn cmd_status(data_dir: Option<PathBuf>, socket: Option<PathBuf>, json: bool) -> Result<()> {
    let config = load_config(data_dir, socket)?;
    let socket_path = config.socket_path();

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("=== uiserverd Status ===");
    println!();
    println!("Data directory: {}", config.data_dir.display());
    println!("Socket: {}", socket_path.display());
    println!(
        "Smartcard watcher: {}",
        if config.watcher.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("Checksum definition: {}", config.checksums.default_definition);
    println!("Session GC interval: {}s", config.sessions.gc_interval_secs);
    println!();

    match UnixStream::connect(&socket_path).await {
        Ok(stream) => {
            let mut reader = BufReader::new(stream);
            let mut greeting = String::new();
            reader.read_line(&mut greeting).await?;
            println!("Server: running ({})", greeting.trim_end());
        }
        Err(err) => {
            println!("Server: not running ({err})");
        }
    }

    Ok(())
}

// =============================================================================
// Call Command Implementation
// =============================================================================

async fn cmd_call(
    data_dir: Option<PathBuf>,
    socket: Option<PathBuf>,
    lines: Vec<String>,
) -> Result<()> {
    let config = load_config(data_dir, socket)?;
    let socket_path = config.socket_path();

    let stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("cannot reach uiserverd at {}", socket_path.display()))?;
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let mut greeting = String::new();
    reader.read_line(&mut greeting).await?;
    print!("{greeting}");

    let mut failed = false;
    let mut said_bye = false;
    for line in &lines {
        write.write_all(line.as_bytes()).await?;
        write.write_all(b"\n").await?;
        said_bye = line.trim().eq_ignore_ascii_case("BYE");
        loop {
            let mut reply = String::new();
            if reader.read_line(&mut reply).await? == 0 {
                bail!("server closed the connection");
            }
            print!("{reply}");
            if reply.starts_with("OK") {
                break;
            }
            if reply.starts_with("ERR") {
                failed = true;
                break;
            }
            // A raw client has no way to answer inquiries.
            if reply.starts_with("INQUIRE") {
                write.write_all(b"CAN\n").await?;
            }
        }
    }

    if !said_bye {
        write.write_all(b"BYE\n").await?;
        let mut reply = String::new();
        reader.read_line(&mut reply).await?;
    }

    if failed {
        bail!("one or more commands failed");
    }
    Ok(())
}
