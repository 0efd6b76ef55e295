//! riptide command-line client
//!
//! Normal mode listens on the given port, reads .torrent paths from
//! stdin, and downloads each via the tracker. Peer mode (`--peer`)
//! skips the tracker and downloads from one known peer.

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};

use riptide::{Client, Config, TorrentMeta};

#[derive(Parser)]
#[command(name = "riptide", version, about = "A single-file BitTorrent v1 client")]
struct Cli {
    /// Local port to listen on for peer connections
    port: u16,

    /// Skip the tracker and download from one known peer
    #[arg(long, num_args = 2, value_names = ["IP", "PORT"])]
    peer: Option<Vec<String>>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "riptide=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let peer = match cli.peer.as_deref() {
        Some([ip, port]) => {
            let ip: IpAddr = match ip.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    eprintln!("invalid peer address: {}", ip);
                    return ExitCode::FAILURE;
                }
            };
            let port: u16 = match port.parse() {
                Ok(port) => port,
                Err(_) => {
                    eprintln!("invalid peer port: {}", port);
                    return ExitCode::FAILURE;
                }
            };
            Some(SocketAddr::new(ip, port))
        }
        Some(_) => {
            eprintln!("--peer takes an IP and a port");
            return ExitCode::FAILURE;
        }
        None => None,
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    match peer {
        Some(addr) => run_peer_mode(cli.port, addr, &mut stdin).await,
        None => run_normal_mode(cli.port, &mut stdin).await,
    }
}

/// One-shot download from a single manual peer, no tracker
async fn run_peer_mode(port: u16, peer: SocketAddr, stdin: &mut Lines<BufReader<Stdin>>) -> ExitCode {
    let Some(path) = prompt(stdin, "Enter .torrent file to download from peer:").await else {
        return ExitCode::FAILURE;
    };

    let meta = match load_metainfo(&path) {
        Some(meta) => meta,
        None => return ExitCode::FAILURE,
    };

    let mut client = match Client::new(meta, Config::with_port(port)).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };
    client.set_skip_tracker(true);
    client.add_peer(peer);

    match client.run().await {
        Ok(()) => {
            println!("Download complete: {}", client.output_path().display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("download failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Interactive loop: download each named torrent, then offer to seed
async fn run_normal_mode(port: u16, stdin: &mut Lines<BufReader<Stdin>>) -> ExitCode {
    loop {
        let Some(path) = prompt(stdin, "Enter .torrent file to download (or 'quit'):").await
        else {
            return ExitCode::SUCCESS;
        };
        if path == "quit" {
            return ExitCode::SUCCESS;
        }
        if path.is_empty() {
            continue;
        }

        let meta = match load_metainfo(&path) {
            Some(meta) => meta,
            None => return ExitCode::FAILURE,
        };

        let mut client = match Client::new(meta, Config::with_port(port)).await {
            Ok(client) => client,
            Err(e) => {
                eprintln!("failed to initialize: {}", e);
                return ExitCode::FAILURE;
            }
        };

        if let Err(e) = client.run().await {
            eprintln!("download failed: {}", e);
            return ExitCode::FAILURE;
        }
        println!("Download complete: {}", client.output_path().display());

        let answer = prompt(stdin, "Seed this file? [y/N]").await.unwrap_or_default();
        if answer.eq_ignore_ascii_case("y") {
            println!("Seeding; press Ctrl-C to stop.");
            let mut interrupted = false;
            tokio::select! {
                result = client.seed() => {
                    if let Err(e) = result {
                        eprintln!("seeding failed: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    interrupted = true;
                }
            }
            if interrupted {
                println!("Stopping seed.");
                client.announce_stopped().await;
            }
        }
    }
}

fn load_metainfo(path: &str) -> Option<TorrentMeta> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("failed to read {}: {}", path, e);
            return None;
        }
    };
    match TorrentMeta::parse(&data) {
        Ok(meta) => {
            println!(
                "{}: {} bytes, {} pieces of {} bytes, info hash {}",
                meta.name,
                meta.length,
                meta.num_pieces(),
                meta.piece_length,
                meta.info_hash_hex()
            );
            Some(meta)
        }
        Err(e) => {
            eprintln!("failed to parse {}: {}", path, e);
            None
        }
    }
}

async fn prompt(stdin: &mut Lines<BufReader<Stdin>>, text: &str) -> Option<String> {
    println!("{}", text);
    print_flush("> ").await;
    match stdin.next_line().await {
        Ok(Some(line)) => Some(line.trim().to_string()),
        _ => None,
    }
}

async fn print_flush(text: &str) {
    let mut stdout = tokio::io::stdout();
    let _ = stdout.write_all(text.as_bytes()).await;
    let _ = stdout.flush().await;
}
