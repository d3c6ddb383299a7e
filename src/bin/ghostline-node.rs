//! CLI front end for a single Ghostline Signal device process: brings up
//! identity, keys, storage, transport and the connection broker (spec §0
//! crate shape; no GUI shell — that remains an external collaborator).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ghostline_core::config::Config;
use ghostline_core::identity;
use ghostline_core::session::InboundOutcome;
use ghostline_core::transport::TransportEvent;
use ghostline_core::Node;

#[derive(Parser)]
#[command(name = "ghostline-node", version, about = "Ghostline Signal device node")]
struct Args {
    /// Data directory override (defaults to GHOSTLINE_DATA_DIR or the OS data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Listener bind host
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listener bind port (0 = OS-assigned)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Rendezvous server base URL
    #[arg(long)]
    rendezvous: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print this device's identity and fingerprint, then exit.
    Whoami,
    /// Start the node: bind the transport, run the broker, print events.
    Run,
    /// Connect to a peer by device ID and send one message, then exit.
    Send {
        target_device_id: String,
        message: String,
    },
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::default();
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    config.listen_host = args.host;
    config.listen_port = args.port;
    config.rendezvous_url = args.rendezvous;

    let node = match Node::load(config) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("failed to load node state: {e}");
            std::process::exit(1);
        }
    };

    match args.command {
        Command::Whoami => print_whoami(&node),
        Command::Run => run_node(node),
        Command::Send {
            target_device_id,
            message,
        } => send_one_message(node, &target_device_id, &message),
    }
}

fn print_whoami(node: &Node) {
    println!("device_id:   {}", node.identity.device_id);
    println!("device_name: {}", node.identity.device_name);
    println!(
        "fingerprint: {}",
        identity::format_fingerprint(&node.identity.fingerprint)
    );
}

fn run_node(node: Node) {
    let port = match node.start() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to start transport: {e}");
            std::process::exit(1);
        }
    };
    log::info!("listening on {}:{port}", node.config.listen_host);

    let events = node.transport.events();
    let store = node.store.clone();
    let sessions = node.sessions.clone();

    ctrlc_shutdown(&node);

    for event in events.iter() {
        match event {
            TransportEvent::Connected { peer_id } => {
                let _ = store.add_peer(&peer_id, None);
                println!("connected: {peer_id}");
            }
            TransportEvent::Disconnected { peer_id } => {
                println!("disconnected: {peer_id}");
            }
            TransportEvent::Message { peer_id, data } => {
                match sessions.decode_inbound(&peer_id, &data, &store) {
                    Ok(InboundOutcome::Message { plaintext }) => {
                        println!(
                            "{peer_id}: {}",
                            String::from_utf8_lossy(&plaintext)
                        );
                    }
                    Ok(InboundOutcome::Undecryptable) => {
                        println!("{peer_id}: <undecryptable message>");
                    }
                    Err(e) => log::warn!("failed to decode message from {peer_id}: {e}"),
                }
            }
        }
    }
}

fn send_one_message(node: Node, target_device_id: &str, message: &str) {
    if let Err(e) = node.start() {
        eprintln!("failed to start transport: {e}");
        std::process::exit(1);
    }

    let peer_id = match node.broker.connect(target_device_id) {
        Some(p) => p,
        None => {
            eprintln!("could not establish a connection to {target_device_id}");
            std::process::exit(1);
        }
    };

    let envelope = match node
        .sessions
        .encode_outbound(&peer_id, message.as_bytes(), &node.keys, &node.store)
    {
        Ok(e) => e,
        Err(e) => {
            eprintln!("failed to encode outbound message: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = node.transport.send(&peer_id, &envelope) {
        eprintln!("failed to send message: {e}");
        std::process::exit(1);
    }

    println!("sent to {peer_id}");
    node.shutdown();
}

/// Best-effort graceful shutdown: a dedicated thread blocks on stdin EOF
/// (Ctrl-D or a closed pipe) and tears down the broker and transport when it
/// returns. No signal-handling crate is in the dependency set.
fn ctrlc_shutdown(node: &Node) {
    let transport = node.transport.clone();
    let broker = node.broker.clone();
    let device_id = node.identity.device_id.clone();

    std::thread::spawn(move || {
        use std::io::Read;
        let mut buf = [0u8; 1];
        while std::io::stdin().read(&mut buf).unwrap_or(0) > 0 {}

        log::info!("shutting down device {device_id}");
        broker.shutdown();
        transport.stop();
        std::process::exit(0);
    });
}
