use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use futures::StreamExt;

use nasasniff::config::Port;
use nasasniff::format::{coloured, format_packet};
use nasasniff::protocol::codec::RxEvent;
use nasasniff::protocol::message::hex_string;
use nasasniff::protocol::packet::Packet;

/// Dump decoded NASA bus traffic to the terminal.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the port to connect to
    ///
    /// either serial:///device/path or tcp+raw://host:port URLs supported
    port: url::Url,

    /// Also print frames that fail to decode
    #[arg(long)]
    show_corrupt: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut framed = Port::open(&args.port).await?.framed();

    while let Some(event) = framed.next().await {
        match event? {
            RxEvent::Frame(frame) => match Packet::decode(&frame) {
                Ok(packet) => {
                    let line = format_packet(&packet);
                    println!("{}", coloured(&packet, line));
                }
                Err(error) => {
                    if args.show_corrupt {
                        let line = format!("corrupt frame ({error}): {}", hex_string(&frame));
                        println!("{}", line.on_red().bright_white());
                    }
                }
            },
            RxEvent::Resync(resync) => {
                if args.show_corrupt {
                    let line = format!("resync: skipped {} bytes", resync.skipped);
                    println!("{}", line.on_yellow());
                }
            }
        }
    }

    Ok(())
}
