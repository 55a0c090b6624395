use std::sync::Arc;
use std::time::Duration;

use mokki_ble_controller::BleLink;
use mokki_provision::{CREDENTIALS_FILE, CredentialStore, HubConfig};

#[derive(clap::Parser)]
#[command(name = "mokki-hub")]
#[command(about = "Mokki Hub: provisions sensors over Bluetooth LE")]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Create the hub decryption key
    CreateKey,
    /// Issue identifiers for new device labels
    Issue {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// List Bluetooth devices nearby
    Scan {
        /// Seconds to listen for advertisements
        #[arg(long, default_value_t = 5)]
        duration: u64,
    },
    /// Provision one device and record it in a room
    Provision {
        /// Advertised name of the device
        #[arg(long)]
        name: String,
        #[arg(long)]
        room: u64,
    },
    /// Run the server
    Run,
}

#[tokio::main]
async fn main() {
    let cli: Cli = clap::Parser::parse();
    mokki_hub::init_logger(cli.verbose, cli.json);

    if let Err(e) = run(cli.command).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let home = mokki_provision::mokki_home()?;
    std::fs::create_dir_all(&home)?;
    let config = HubConfig::load(&home)?;

    match command {
        Commands::CreateKey => {
            let handle = config.provision.key_handle;
            let public = mokki_hub::create_key(&home, handle)?;
            println!("Created key {handle} in {}", home.display());
            println!("Public key: {public}");
        }
        Commands::Issue { count } => {
            let credentials = CredentialStore::open(home.join(CREDENTIALS_FILE)).await?;
            for identifier in credentials.issue(count).await? {
                println!("{identifier}");
            }
        }
        Commands::Scan { duration } => {
            let link = BleLink::first_adapter().await?;
            for device in link.scan(Duration::from_secs(duration)).await? {
                let marker = if device.is_mokki { "*" } else { " " };
                let rssi = device.rssi.map(|r| r.to_string()).unwrap_or_default();
                println!("{marker} {} {:>4} {}", device.address, rssi, device.name);
            }
        }
        Commands::Provision { name, room } => {
            let link = BleLink::first_adapter().await?;
            let hub = mokki_hub::Hub::open(&home, config, link).await?;
            let record = hub.create_device(&name, room).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Run => {
            let link = BleLink::first_adapter().await?;
            let hub = mokki_hub::Hub::open(&home, config, link).await?;
            mokki_hub::http::run_server(Arc::new(hub)).await?;
        }
    }
    Ok(())
}
