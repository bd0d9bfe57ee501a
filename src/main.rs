use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use relay_manager::config::Settings;
use relay_manager::proxy::singbox::DEFAULT_BINARY;
use relay_manager::tls::signing::DEFAULT_SIGNING_ENDPOINT;

/// Management server for a sing-box VPN relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding server.json, the proxy document and the TLS identity
    #[arg(long, env = "DATA_DIR", default_value = "./data", global = true)]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write server.json and a basic proxy document
    Init(InitArgs),
    /// Start the proxy and serve the management API
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Address clients use to reach this server
    #[arg(long, env = "PUBLIC_IP")]
    public_ip: Option<String>,

    /// API port (random non-privileged port if omitted)
    #[arg(long)]
    api_port: Option<u16>,

    /// Proxy inbound port (random non-privileged port if omitted)
    #[arg(long)]
    vpn_port: Option<u16>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    init: InitArgs,

    /// PEM certificate chain to serve instead of the generated identity
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key matching --tls-cert
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Extra CA bundle trusted by the reachability check
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Have a fresh certificate signed by the remote signing service
    #[arg(long)]
    sign_cert: bool,

    #[arg(long, default_value = DEFAULT_SIGNING_ENDPOINT)]
    signing_endpoint: String,

    /// sing-box binary used to check and run the proxy
    #[arg(long, env = "SING_BOX_BINARY", default_value = DEFAULT_BINARY)]
    sing_box: PathBuf,
}

impl InitArgs {
    fn apply(self, mut settings: Settings) -> Settings {
        settings.public_ip = self.public_ip;
        settings.api_port = self.api_port;
        settings.vpn_port = self.vpn_port;
        settings
    }
}

impl ServeArgs {
    fn apply(self, settings: Settings) -> Settings {
        let mut settings = self.init.apply(settings);
        settings.tls_cert = self.tls_cert;
        settings.tls_key = self.tls_key;
        settings.ca_cert = self.ca_cert;
        settings.sign_cert = self.sign_cert;
        settings.signing_endpoint = self.signing_endpoint;
        settings.sing_box_binary = self.sing_box;
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let settings = Settings::new(&cli.data_dir);
    match cli.command {
        Command::Init(args) => {
            let server = relay_manager::init(&args.apply(settings))
                .context("failed to initialize server")?;
            println!("{}", server.new_server_url());
        }
        Command::Serve(args) => {
            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    relay_manager::shutdown_signal().await;
                    shutdown.cancel();
                }
            });

            relay_manager::serve(args.apply(settings), shutdown)
                .await
                .context("server failed")?;
        }
    }

    Ok(())
}
