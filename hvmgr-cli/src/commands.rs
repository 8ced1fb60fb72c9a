//! Subcommand execution.

use std::sync::Arc;

use anyhow::{Context, Result};

use hvmgr_hypervisor::{
    Confirmation, DisplayId, DomainRecord, HypervisorError, Inventory, LifecycleController,
    RestartOutcome, StartOutcome, StopOutcome,
};

use crate::cli::Command;
use crate::config::Config;

pub async fn run(command: Command, controller: &Arc<LifecycleController>, config: &Config) -> Result<()> {
    match command {
        Command::List { json } => {
            let handle = controller.connections().acquire().await?;
            let records = Inventory::list_all(&handle).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_table(&records);
            }
        }

        Command::Create(args) => {
            let input = config.resource_input(&args);
            let report = controller.spawn_create(input).wait().await.map_err(explain)?;
            println!(
                "Defined {} with disk {} ({} GiB, {})",
                report.descriptor.name(),
                report.disk.path.display(),
                report.disk.size_gib,
                report.disk.format
            );
            match report.start_error {
                None => println!("{} is running", report.descriptor.name()),
                Some(e) => println!("{} is defined but did not start: {}", report.descriptor.name(), e),
            }
        }

        Command::Start { name } => match controller.spawn_start(name.clone()).wait().await? {
            StartOutcome::AlreadyRunning => println!("{} is already running", name),
            StartOutcome::Started => println!("{} started", name),
        },

        Command::Restart { name } => match controller.spawn_restart(name.clone()).wait().await? {
            RestartOutcome::Started => println!("{} was stopped and has been started", name),
            RestartOutcome::Rebooting => println!("{} is rebooting", name),
        },

        Command::Stop { name, force } => {
            let task = if force {
                controller.spawn_force_stop(name.clone())
            } else {
                controller.spawn_stop(name.clone())
            };
            match task.wait().await? {
                StopOutcome::AlreadyStopped => println!("{} is already stopped", name),
                StopOutcome::ShutdownRequested => println!("Shutdown requested for {}", name),
                StopOutcome::Stopped => println!("{} powered off", name),
            }
        }

        Command::Delete { name, yes } => {
            let report = controller
                .spawn_delete(name, Confirmation::from_flag(yes))
                .wait()
                .await
                .map_err(explain)?;
            println!("{} deleted", report.name);
            for path in &report.disk_paths {
                println!("  disk kept: {} (remove with `hvmgr remove-disk {} --yes`)", path.display(), path.display());
            }
        }

        Command::RemoveDisk { path, yes } => {
            controller
                .remove_disk(&path, Confirmation::from_flag(yes))
                .await
                .map_err(explain)?;
            println!("Removed {}", path.display());
        }

        Command::Info { name } => {
            let summary = controller.describe(&name).await?;
            println!("Name:      {}", summary.name);
            println!("State:     {}", summary.state);
            println!("UUID:      {}", summary.uuid.as_deref().unwrap_or("-"));
            println!("Arch:      {}", summary.arch.as_deref().unwrap_or("-"));
            println!("Memory:    {} MiB", summary.memory_mib);
            println!("vCPUs:     {}", summary.vcpus);
            println!("Autostart: {}", if summary.autostart { "yes" } else { "no" });
            match summary.vnc_port {
                Some(port) => println!("VNC port:  {}", port),
                None => println!("VNC port:  -"),
            }
            for path in &summary.disk_paths {
                println!("Disk:      {}", path.display());
            }
        }

        Command::State { name } => {
            println!("{}", controller.state(&name).await?);
        }

        Command::Console { name } => {
            let endpoint = controller
                .console_endpoint(&name)
                .await
                .with_context(|| format!("No console available for {}", name))?;
            println!("{}", endpoint);
        }

        Command::Networks => {
            let handle = controller.connections().acquire().await?;
            for name in controller.networks().available_networks(&handle).await? {
                println!("{}", name);
            }
        }
    }

    Ok(())
}

/// Add remediation hints to errors an operator can act on.
fn explain(e: HypervisorError) -> anyhow::Error {
    let hint = match &e {
        HypervisorError::Network { available, .. } if !available.is_empty() => {
            let names: Vec<&str> = available.iter().map(String::as_str).collect();
            Some(format!("available networks: {}", names.join(", ")))
        }
        HypervisorError::Unconfirmed(_) => Some("pass --yes to confirm".to_string()),
        _ => None,
    };

    match hint {
        Some(hint) => anyhow::anyhow!("{} ({})", e, hint),
        None => e.into(),
    }
}

fn print_table(records: &[DomainRecord]) {
    println!("{:<6} {:<24} {:<8} {:>8} {:>6} {:>9}", "ID", "NAME", "STATE", "MEM MiB", "vCPUs", "AUTOSTART");
    for r in records {
        let id = match r.id {
            DisplayId::Active(id) => id.to_string(),
            DisplayId::Synthetic(id) => format!("({})", id),
        };
        println!(
            "{:<6} {:<24} {:<8} {:>8} {:>6} {:>9}",
            id,
            r.name,
            if r.running { "running" } else { "stopped" },
            r.memory_mib,
            r.vcpus,
            if r.autostart { "yes" } else { "no" }
        );
    }
}
