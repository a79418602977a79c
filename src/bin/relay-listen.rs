//! Reference CLI: constructs a switch over a set of TCP master connections
//! and pipes frames to/from standard in/out.
//!
//! ```bash
//! relay-listen listen --master 127.0.0.1:9001 --master 127.0.0.1:9002
//! ```
//!
//! Each `--master` address is dialed in order; the peer at that address
//! must speak RELAY_NOTIFY first, exactly as [`relay_switch::RelayMaster`]
//! requires. Frames read from stdin are routed via `sendToMaster`; frames
//! read from any master are written to stdout as they arrive.

use clap::{Parser, Subcommand};
use relay_switch::framing::{FrameReader, FrameWriter};
use relay_switch::{Frame, ProtocolError, RelaySwitch};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-listen")]
#[command(about = "Capability-routed relay switch, driven over stdin/stdout")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a set of masters and pipe frames to/from stdin/stdout.
    Listen {
        /// Address of a master to connect to. May be repeated; each
        /// connection is attempted in the order given.
        #[arg(long = "master", required = true)]
        masters: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let args = Args::parse();

    match args.command {
        Command::Listen { masters } => {
            if let Err(e) = listen(masters).await {
                tracing::error!(error = %e, "relay-listen failed");
                std::process::exit(1);
            }
        }
    }
}

/// A frame read from stdin, or the terminal conditions of that read loop.
enum StdinEvent {
    Frame(Frame),
    Closed,
    Error(ProtocolError),
}

async fn listen(master_addrs: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut sockets = Vec::with_capacity(master_addrs.len());
    for addr in &master_addrs {
        tracing::info!(addr, "dialing master");
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        sockets.push((read, write));
    }

    let mut switch = RelaySwitch::new(sockets).await?;
    tracing::info!(
        masters = master_addrs.len(),
        caps = String::from_utf8_lossy(&switch.capabilities()).into_owned(),
        "switch ready"
    );

    let mut stdout_writer = FrameWriter::new(tokio::io::stdout());

    // Stdin is read by a single dedicated task and funneled through a
    // channel, for the same reason masters are: `FrameReader::read_frame`
    // consumes the stream across several await points and is not
    // cancellation-safe, so it must never be the losing arm of a `select!`.
    // The negotiated limits can change on a RELAY_NOTIFY, so they're kept
    // in sync with the task via a `watch` channel rather than captured once.
    let (limits_tx, mut limits_rx) = watch::channel(switch.limits());
    let (stdin_tx, mut stdin_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut stdin_reader = FrameReader::new(tokio::io::stdin());
        loop {
            let limits = *limits_rx.borrow_and_update();
            let event = match stdin_reader.read_frame(&limits).await {
                Ok(Some(frame)) => StdinEvent::Frame(frame),
                Ok(None) => StdinEvent::Closed,
                Err(e) => StdinEvent::Error(e),
            };
            let stop = !matches!(event, StdinEvent::Frame(_));
            if stdin_tx.send(event).await.is_err() || stop {
                return;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = switch.read_from_masters() => {
                match incoming? {
                    Some(frame) => {
                        let _ = limits_tx.send(switch.limits());
                        stdout_writer.write_frame(&frame).await?;
                    }
                    None => {
                        tracing::info!("all masters closed, exiting");
                        return Ok(());
                    }
                }
            }
            outgoing = stdin_rx.recv() => {
                match outgoing {
                    Some(StdinEvent::Frame(frame)) => {
                        if let Err(e) = switch.send_to_master(frame).await {
                            tracing::warn!(error = %e, "failed to route frame from stdin");
                        }
                    }
                    Some(StdinEvent::Closed) | None => {
                        tracing::info!("stdin closed, exiting");
                        return Ok(());
                    }
                    Some(StdinEvent::Error(e)) => return Err(e.into()),
                }
            }
        }
    }
}
