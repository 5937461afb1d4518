use clap::{ArgGroup, Parser};
use speedtest::config::FileConfig;
use speedtest::{logging, Client, Protocol, Server};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "speedtest")]
#[command(about = "Measure peak TCP/UDP throughput between two hosts", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("mode").required(true).args(["server", "client"])))]
struct Cli {
    /// Run in server mode
    #[arg(short, long)]
    server: bool,

    /// Run in client mode
    #[arg(short, long)]
    client: bool,

    /// JSON configuration file; a missing default file means built-in defaults
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Use UDP instead of the configured transport
    #[arg(short, long)]
    udp: bool,

    /// Server host to connect to (client mode)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on or connect to
    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds spent on each of download and upload (client mode)
    #[arg(short = 't', long)]
    period: Option<f64>,

    /// Seconds to wait on any single network operation before giving up
    #[arg(long)]
    timeout: Option<f64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn load_file_config(cli: &Cli) -> anyhow::Result<FileConfig> {
    if cli.config.exists() {
        Ok(FileConfig::load(&cli.config)?)
    } else if cli.config == PathBuf::from("config.json") {
        Ok(FileConfig::default())
    } else {
        anyhow::bail!("configuration file {} not found", cli.config.display())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut file = load_file_config(&cli)?;

    if let Some(level) = &cli.log_level {
        file.log.level = level.clone();
    }
    if cli.udp {
        file.server.model = Protocol::Udp;
        file.client.model = Protocol::Udp;
    }
    if let Some(port) = cli.port {
        file.server.port = port;
        file.client.port = port;
    }
    if let Some(host) = &cli.host {
        file.client.host = host.clone();
    }
    if let Some(period) = cli.period {
        file.client.period = period;
    }
    if cli.timeout.is_some() {
        file.client.io_timeout = cli.timeout;
    }

    logging::init(&file.log)?;

    if cli.server {
        let server = Server::new(file.server_config());
        server.run().await?;
    } else {
        let client = Client::new(file.client_config()?)?;
        if let Err(e) = client.run().await {
            log::error!("Speed test failed: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
