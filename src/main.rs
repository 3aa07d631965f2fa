//! chromad - Razer Chroma peripheral daemon and control CLI

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chroma_driver::traits::{TraitValue, TraitValues};
use chroma_driver::{ChromaDevice, DeviceManager};

mod cli;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let manager = DeviceManager::new().map_err(|e| anyhow!(e))?;
    manager.discover().await;

    match cli.command {
        None | Some(Commands::List) => {
            list_devices(&manager).await;
        }

        Some(Commands::Info { key }) => {
            for device in selected(&manager, key.as_deref()).await? {
                print_info(&device).await;
            }
        }

        Some(Commands::Daemon) => {
            run_daemon(&manager).await?;
        }

        Some(Commands::SetFx {
            name,
            color,
            device,
        }) => {
            let target = one_device(&manager, device.as_deref()).await?;

            let mut args = TraitValues::new();
            if let Some(color) = color {
                args.insert("color".into(), TraitValue::Str(color));
            }

            if target.fx_manager().activate(&name, args).await {
                println!("{}: {name} active", target.key());
            } else {
                return Err(anyhow!("effect {name} could not be applied"));
            }
        }

        Some(Commands::Brightness { level, device }) => {
            let target = one_device(&manager, device.as_deref()).await?;
            match level {
                Some(level) => {
                    target.set_brightness(level).await;
                    // leave time for the ramp to finish before exiting
                    tokio::time::sleep(Duration::from_millis(600)).await;
                    println!("{}: brightness {level:.0}", target.key());
                }
                None => {
                    println!("{:.0}", target.get_brightness().await);
                }
            }
        }
    }

    manager.close_devices().await;
    Ok(())
}

async fn list_devices(manager: &Arc<DeviceManager>) {
    let devices = manager.devices().await;
    if devices.is_empty() {
        println!("No supported devices found");
        return;
    }

    for device in devices {
        println!(
            "{}  {}  [{}]",
            device.key(),
            device.name(),
            device.device_type().name()
        );
    }
}

async fn selected(
    manager: &Arc<DeviceManager>,
    key: Option<&str>,
) -> Result<Vec<Arc<ChromaDevice>>> {
    match key {
        Some(key) => {
            let device = manager
                .get(key)
                .await
                .with_context(|| format!("no device with key {key}"))?;
            Ok(vec![device])
        }
        None => Ok(manager.devices().await),
    }
}

async fn one_device(
    manager: &Arc<DeviceManager>,
    key: Option<&str>,
) -> Result<Arc<ChromaDevice>> {
    match key {
        Some(key) => manager
            .get(key)
            .await
            .with_context(|| format!("no device with key {key}")),
        None => manager
            .devices()
            .await
            .into_iter()
            .next()
            .context("no supported devices found"),
    }
}

async fn print_info(device: &Arc<ChromaDevice>) {
    println!("{} ({})", device.name(), device.key());
    println!("  type:      {}", device.device_type().name());
    println!("  serial:    {}", device.serial_number().await);
    println!("  firmware:  {}", device.firmware_version().await);
    if device.has_matrix() {
        println!("  matrix:    {}x{}", device.height(), device.width());
    }
    if device.is_wireless() {
        let level = device.battery_level().await;
        if level >= 0.0 {
            println!("  battery:   {level:.0}%");
        }
    }
    let fx: Vec<&str> = device
        .fx_manager()
        .available_fx()
        .iter()
        .filter(|def| !def.hidden)
        .map(|def| def.name)
        .collect();
    if !fx.is_empty() {
        println!("  effects:   {}", fx.join(", "));
    }
}

async fn run_daemon(manager: &Arc<DeviceManager>) -> Result<()> {
    manager
        .monitor_start()
        .await
        .map_err(|e| anyhow!(e))?;

    let count = manager.devices().await.len();
    info!("chromad running with {count} device(s); ctrl-c to exit");

    tokio::signal::ctrl_c()
        .await
        .context("could not install signal handler")?;
    info!("Shutting down");

    manager.close_devices().await;
    Ok(())
}
