#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};

use nullssh::{AllowNone, Ed25519HostKey, HostKey, SessionRequest, Transport};
use nullssh_demo::{null_config, setup_log, DEMO_PORT};

const TIMEOUT: Duration = Duration::from_secs(30);
const GREETING: &[u8] = b"Hello World from nullssh server!\n";

#[derive(argh::FromArgs)]
/** nullssh demo server. Accepts "none" auth for any user.
 */
struct Args {
    #[argh(switch, short = 'v')]
    /// verbose debug logging
    debug: bool,

    #[argh(switch)]
    /// more verbose
    trace: bool,

    #[argh(option, short = 'p', default = "DEMO_PORT")]
    /// port
    port: u16,

    #[argh(option, default = "String::from(\"127.0.0.1\")")]
    /// listen address
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();
    setup_log(args.debug, args.trace)?;

    run(&args).await.inspect_err(|e| error!("Exit with error: {e:?}"))
}

async fn run(args: &Args) -> Result<()> {
    // A fresh key each run, clients will see a new host key
    let hostkey: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate()?);

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("Listening on {}:{}", args.host, args.port))?;
    info!("Listening on {}:{}", args.host, args.port);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Connection from {addr}");
        let hostkey = hostkey.clone();
        tokio::spawn(async move {
            if let Err(e) = session(stream, hostkey).await {
                warn!("Session from {addr} ended: {e:#}");
            }
        });
    }
}

async fn session(stream: TcpStream, hostkey: Arc<dyn HostKey>) -> Result<()> {
    let t = Transport::start_as_server(stream, null_config(), hostkey, AllowNone, TIMEOUT)
        .await?;
    if let Some(n) = t.negotiated() {
        info!("Negotiated cipher {} mac {}", n.cipher_c2s, n.mac_c2s);
    }

    loop {
        let mut ch = match t.accept_channel(Duration::from_secs(3600)).await {
            Ok(ch) => ch,
            Err(nullssh::Error::TransportClosed) => break,
            Err(e) => return Err(e.into()),
        };

        match ch.session_request(TIMEOUT).await? {
            SessionRequest::Shell => info!("Shell requested"),
            SessionRequest::Exec(cmd) => info!("Exec requested: {}", cmd.escape_default()),
        }
        ch.send(GREETING, TIMEOUT).await?;
        ch.send_exit_status(0, TIMEOUT).await?;
        ch.send_eof(TIMEOUT).await?;
        ch.close(TIMEOUT).await?;
    }
    Ok(())
}
