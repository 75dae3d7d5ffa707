mod adopt;
mod camera;
mod digest_auth;
mod discovery;
mod driver;
mod font5x7;
mod models;
mod settings;
mod tls;
mod upload;
mod uptime;
mod util;
mod wss;

use anyhow::{Context, Result};
use clap::Parser;
use settings::SettingsStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use util::TokenEvent;

#[derive(Parser, Debug)]
#[command(
    name = "virtual-protect-cam",
    version,
    about = "Virtual UniFi Protect camera: discovery, adoption, snapshots and stats over WSS"
)]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    once: bool,
    #[arg(long)]
    discover_onvif: bool,
    #[arg(long, default_value = "eth0")]
    iface: String,
    #[arg(long)]
    camera_model: Option<String>,
    #[arg(long, default_value = "cert.pem")]
    cert: PathBuf,
    #[arg(long, default_value = "key.pem")]
    key: PathBuf,
    #[arg(long)]
    save_snapshots: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    if args.discover_onvif {
        let discovered = camera::discover_onvif(3).await?;
        println!("{}", serde_json::to_string_pretty(&discovered)?);
        return Ok(());
    }

    let settings_path = args
        .config
        .unwrap_or_else(|| PathBuf::from("settings.json"));
    let settings = Arc::new(
        SettingsStore::open(settings_path).context("failed opening settings store")?,
    );
    settings
        .ensure_identity(args.camera_model, &args.iface)
        .await
        .context("failed resolving camera identity")?;

    let mac = settings.get("mac", serde_json::json!(""));
    let model = settings.get("marketName", serde_json::json!(""));
    let platform = settings.get("platform", serde_json::json!(""));
    let sysid = settings.get("sysid", serde_json::json!(""));
    let firmware = settings.get("firmwareVersion", serde_json::json!(""));

    if args.once {
        println!("mac: {mac}");
        println!("host: {}", settings.get("host", serde_json::json!("")));
        println!("platform: {platform}");
        println!("sysid: {sysid}");
        println!("model: {model}");
        println!("firmwareVersion: {firmware}");
        println!(
            "eol: {}",
            models::is_eol(model.as_str().unwrap_or(""))
        );
        return Ok(());
    }

    info!(%mac, %model, %sysid, %firmware, "virtual-protect-cam starting");

    let camera_name = model.as_str().unwrap_or("camera").to_string();
    let driver: Arc<dyn driver::CameraDriver> =
        Arc::from(driver::build(&settings.snapshot(), camera_name)?);

    let token_event = TokenEvent::new();

    tokio::spawn(uptime::run(settings.clone()));

    if settings.get("canAdopt", serde_json::json!(true)).as_bool().unwrap_or(true) {
        let settings_disco = settings.clone();
        tokio::spawn(async move {
            if let Err(err) = discovery::run(settings_disco).await {
                warn!(error = %err, "discovery responder exited");
            }
        });
    }

    {
        let settings_adopt = settings.clone();
        let token_event_adopt = token_event.clone();
        let cert = args.cert.clone();
        let key = args.key.clone();
        tokio::spawn(async move {
            if let Err(err) = adopt::run(settings_adopt, token_event_adopt, &cert, &key).await {
                warn!(error = %err, "adoption server exited");
            }
        });
    }

    {
        let cert = args.cert.clone();
        let key = args.key.clone();
        let save_dir = args.save_snapshots.clone();
        tokio::spawn(async move {
            if let Err(err) = upload::run(&cert, &key, save_dir).await {
                warn!(error = %err, "snapshot upload server exited");
            }
        });
    }

    let wss_handle = tokio::spawn(wss::run(settings.clone(), token_event.clone(), driver.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        res = wss_handle => {
            if let Err(err) = res {
                warn!(error = %err, "wss task panicked");
            }
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    let env = tracing_subscriber::EnvFilter::try_new(level)
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .compact()
        .init();
}
