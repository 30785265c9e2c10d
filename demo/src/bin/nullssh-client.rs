#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;

use nullssh::{NoHostCheck, Transport};
use nullssh_demo::{null_config, setup_log, DEMO_PORT};

const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(argh::FromArgs)]
/** nullssh demo client. Authenticates with "none" and runs a shell.
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
    /// server address
    host: String,

    #[argh(option, short = 'l', default = "String::from(\"testuser\")")]
    /// username
    user: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();
    setup_log(args.debug, args.trace)?;

    run(&args).await.inspect_err(|e| error!("Exit with error: {e:?}"))
}

async fn run(args: &Args) -> Result<()> {
    let stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("Connecting to {}:{}", args.host, args.port))?;

    let t = Transport::start_as_client(stream, null_config(), NoHostCheck, TIMEOUT).await?;
    let n = t.negotiated().context("No negotiated algorithms")?;
    info!("Negotiated cipher {}/{} mac {}/{}", n.cipher_c2s, n.cipher_s2c, n.mac_c2s, n.mac_s2c);
    if n.is_null() {
        warn!("Connection is not encrypted or authenticated");
    }

    t.authenticate_none(&args.user, TIMEOUT).await?;
    let mut ch = t.open_channel(TIMEOUT).await?;
    ch.shell(TIMEOUT).await?;

    let mut out = std::io::stdout();
    while let Some(d) = ch.recv(TIMEOUT).await? {
        out.write_all(&d)?;
    }
    out.flush()?;

    match ch.exit_status(TIMEOUT).await? {
        Some(s) => info!("Exit status {s}"),
        None => info!("No exit status"),
    }
    t.close(TIMEOUT).await?;
    Ok(())
}
