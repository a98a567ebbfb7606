use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

use cluster_node::channel::codec::{read_frame, write_frame};
use cluster_node::channel::{ChannelMessage, Frame, Reliability};
use cluster_node::membership::{Member, MemberId};

#[derive(Parser)]
#[command(name = "cluster-cli")]
#[command(about = "Send test messages to a cluster node", long_about = None)]
struct Cli {
    /// Seconds to wait for an acknowledgment
    #[arg(short, long, default_value_t = 3)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message to a node's message endpoint
    Send {
        /// Node message endpoint, e.g. 127.0.0.1:4000
        #[arg(long)]
        to: SocketAddr,

        /// UTF-8 payload
        #[arg(short, long)]
        message: String,

        /// none | ack | ack-after-processing
        #[arg(short, long, default_value = "ack")]
        reliability: Reliability,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            to,
            message,
            reliability,
        } => {
            let mut stream = TcpStream::connect(to).await?;
            let local = stream.local_addr()?;
            let source = Member::new(MemberId::new(), local.ip(), local.port());
            let msg = ChannelMessage::new(source, message.into_bytes(), reliability, 0);
            let id = msg.id();

            write_frame(&mut stream, &Frame::Message(msg)).await?;
            println!("Sent message {id} to {to}");

            if !reliability.wants_ack() {
                return Ok(());
            }
            let reply = tokio::time::timeout(
                Duration::from_secs(cli.timeout),
                read_frame(&mut stream, 1024 * 1024),
            )
            .await;
            match reply {
                Ok(Ok(Some(Frame::Ack { from, .. }))) => println!("ACK from member {from}"),
                Ok(Ok(Some(Frame::Nack { from, reason, .. }))) => {
                    eprintln!("NACK from member {from}: {reason}");
                    std::process::exit(2);
                }
                Ok(Ok(Some(other))) => eprintln!("Unexpected {} frame", other.kind()),
                Ok(Ok(None)) => eprintln!("Connection closed before acknowledgment"),
                Ok(Err(e)) => eprintln!("Error: {e}"),
                Err(_) => {
                    eprintln!("No acknowledgment within {}s", cli.timeout);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
