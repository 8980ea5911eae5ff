use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use vmedia::api::{self, AppState};
use vmedia::app::VirtualMedia;
use vmedia::config::{Config, DEFAULT_CONFIG_PATH};
use vmedia::core::model::{DownloadRequest, JobState};
use vmedia::logging;
use vmedia::plugins::registry::PluginRegistry;

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .help("Path to the TOML configuration file")
        .default_value(DEFAULT_CONFIG_PATH)
        .num_args(1)
}

fn build_cli(registry: &PluginRegistry) -> Command {
    let serve = Command::new("serve")
        .about("Serve the virtual media API")
        .arg(config_arg())
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("Address to listen on (overrides server.listen)")
                .num_args(1),
        );

    let fetch = Command::new("fetch")
        .about("Download one image into the catalog and exit")
        .arg(
            Arg::new("source")
                .help("Image URL (http, https or file)")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("checksum")
                .long("checksum")
                .help("Expected SHA-256 of the image, hex")
                .num_args(1),
        )
        .arg(
            Arg::new("filename")
                .long("filename")
                .help("Catalog file name (default: last URL segment)")
                .num_args(1),
        )
        .arg(config_arg());

    Command::new("vmedia")
        .about("Virtual media manager: image downloads, catalog and USB mounting")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(registry.augment_command(serve))
        .subcommand(registry.augment_command(fetch))
}

fn load_config(registry: &PluginRegistry, m: &ArgMatches) -> anyhow::Result<Config> {
    let path: PathBuf = m
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = Config::load(&path)?;

    let mut ctx = config.download.driver_context();
    registry.apply_matches(m, &mut ctx)?;
    config.download.apply_driver_context(&ctx);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let registry = PluginRegistry::with_defaults();
    let matches = build_cli(&registry).get_matches();

    match matches.subcommand() {
        Some(("serve", m)) => {
            let mut config = load_config(&registry, m)?;
            if let Some(listen) = m.get_one::<String>("listen") {
                config.server.listen = listen.clone();
            }
            serve(config, registry).await
        }
        Some(("fetch", m)) => {
            let config = load_config(&registry, m)?;
            let mut req = DownloadRequest::new(m.get_one::<String>("source").cloned().unwrap_or_default());
            req.checksum = m.get_one::<String>("checksum").cloned();
            req.filename = m.get_one::<String>("filename").cloned();
            fetch(config, registry, req).await
        }
        _ => Ok(()),
    }
}

async fn serve(config: Config, registry: PluginRegistry) -> anyhow::Result<()> {
    let media = VirtualMedia::open_with_gadget(&config, registry).await?;
    let app = api::router(AppState::new(media, config.server.api_token.clone()));

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("bind {}", config.server.listen))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn fetch(config: Config, registry: PluginRegistry, req: DownloadRequest) -> anyhow::Result<()> {
    let media = VirtualMedia::open_with_gadget(&config, registry).await?;
    let job_id = media.downloads.start(req).await?;
    println!("Download started: {}", job_id);

    let sty_spinner = ProgressStyle::with_template("{spinner:.green} {wide_msg}")?.tick_chars("|/-\\ ");
    let sty_bar = ProgressStyle::with_template(
        "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta}) {wide_msg}",
    )?;
    let pb = ProgressBar::new_spinner();
    pb.set_style(sty_spinner);
    pb.enable_steady_tick(Duration::from_millis(120));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                let _ = media.downloads.cancel().await;
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        let job = media.downloads.status().await;
        match job.bytes_total {
            Some(total) if pb.length() != Some(total) => {
                pb.set_style(sty_bar.clone());
                pb.set_length(total);
            }
            _ => {}
        }
        pb.set_position(job.bytes_transferred);
        pb.set_message(fmt_bytes(job.bytes_transferred));
        if job.state.is_terminal() {
            break;
        }
    }

    let job = media.downloads.wait().await;
    match job.state {
        JobState::Succeeded => {
            pb.finish_with_message("done");
            println!(
                "Image {} ready ({})",
                job.image_id.unwrap_or_default(),
                fmt_bytes(job.bytes_transferred)
            );
            Ok(())
        }
        JobState::Canceled => {
            pb.abandon_with_message("canceled");
            anyhow::bail!("download canceled")
        }
        _ => {
            pb.abandon_with_message("failed");
            anyhow::bail!("download failed: {}", job.error.unwrap_or_default())
        }
    }
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
