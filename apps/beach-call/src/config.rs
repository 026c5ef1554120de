use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Args;

/// Server flags, each with an environment fallback.
#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address the HTTP and signaling listener binds to.
    #[arg(long, env = "BEACH_CALL_LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    pub listen_addr: String,

    /// Media server address. `ws://`/`wss://` reach Kurento, `memory://`
    /// runs the in-process engine.
    #[arg(
        long,
        env = "BEACH_CALL_MEDIA_SERVER_URI",
        default_value = "ws://localhost:8888/kurento"
    )]
    pub media_server_uri: String,

    /// Directory uri recordings are written under, one file per participant.
    #[arg(long, env = "BEACH_CALL_RECORDINGS_URI", default_value = "file:///tmp")]
    pub recordings_uri: String,

    /// Upper bound on building and negotiating one call's media graph.
    #[arg(long, env = "BEACH_CALL_PROVISION_TIMEOUT_SECS", default_value_t = 30)]
    pub provision_timeout_secs: u64,

    /// Timeout for a single request to the media server.
    #[arg(long, env = "BEACH_CALL_MEDIA_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub media_request_timeout_secs: u64,

    /// Time given to in-flight calls to release their pipelines on shutdown.
    #[arg(long, env = "BEACH_CALL_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub media_server_uri: String,
    pub recordings_uri: String,
    pub provision_timeout: Duration,
    pub media_request_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;

        let scheme_ok = ["ws://", "wss://", "memory://"]
            .iter()
            .any(|scheme| args.media_server_uri.starts_with(scheme));
        if !scheme_ok {
            bail!(
                "unsupported media server uri {} (expected ws://, wss:// or memory://)",
                args.media_server_uri
            );
        }
        if args.provision_timeout_secs == 0 {
            bail!("provision timeout must be at least one second");
        }

        Ok(ServerConfig {
            listen_addr,
            media_server_uri: args.media_server_uri,
            recordings_uri: args.recordings_uri,
            provision_timeout: Duration::from_secs(args.provision_timeout_secs),
            media_request_timeout: Duration::from_secs(args.media_request_timeout_secs.max(1)),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
