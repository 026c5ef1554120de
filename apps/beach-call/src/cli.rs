use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::config::ServerArgs;
use crate::signaling::{CallDecision, ClientMessage, ServerMessage, Verdict};

#[derive(Parser, Debug)]
#[command(name = "beach-call")]
#[command(about = "One-to-one call signaling server and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register with a running server and print the signaling it sends
    Probe {
        /// Signaling endpoint
        #[arg(short, long, default_value = "ws://localhost:8443/one2one")]
        url: String,

        /// User name to register as
        #[arg(short, long)]
        name: String,

        /// Decline incoming calls instead of only printing them
        #[arg(long)]
        decline: bool,

        /// How long to listen after registering
        #[arg(long, default_value_t = 30)]
        listen_secs: u64,
    },
}

pub async fn run_probe(url: String, name: String, decline: bool, listen_secs: u64) -> Result<()> {
    debug!(url = %url, name = %name, "connecting probe");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(result) => result.with_context(|| format!("failed to connect to {url}"))?,
        Err(_) => bail!("connection timeout - is the signaling server running at {url}?"),
    };
    let (mut write, mut read) = ws_stream.split();

    let register = serde_json::to_string(&ClientMessage::Register { name: name.clone() })?;
    write.send(Message::Text(register.into())).await?;

    let deadline = Instant::now() + Duration::from_secs(listen_secs);
    loop {
        let frame = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => bail!("server closed the connection"),
            Err(_) => break,
        };
        let Message::Text(text) = frame else {
            continue;
        };
        let message: ServerMessage = serde_json::from_str(text.as_str())
            .map_err(|err| anyhow!("unexpected server frame {}: {err}", text.as_str()))?;
        println!("<- {}", text.as_str());

        match message {
            ServerMessage::RegisterResponse {
                response: Verdict::Rejected,
                message,
            } => bail!(
                "registration rejected: {}",
                message.unwrap_or_else(|| "no reason given".into())
            ),
            ServerMessage::IncomingCall { from } if decline => {
                let reply = serde_json::to_string(&ClientMessage::IncomingCallResponse {
                    from: Some(from),
                    call_response: CallDecision::Reject,
                    sdp_offer: None,
                })?;
                println!("-> {reply}");
                write.send(Message::Text(reply.into())).await?;
            }
            _ => {}
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}
