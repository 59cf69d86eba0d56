//! Launcher that reads fleet.yaml and spawns one `battery_agent` process per unit.
//! Saves exporting UNIT_ID / LISTEN_ADDR / COORDINATOR_ADDR by hand for each unit.

use anyhow::{Context, Result};
use bess_core::{FleetFile, UnitSettings};
use std::{collections::HashMap, path::Path, process::Stdio};
use tokio::{process::Command, task::JoinHandle};

/// First port handed to units without an explicit `listen_addr`.
const BASE_PORT: u32 = 5700;

#[tokio::main]
async fn main() -> Result<()> {
    // Where to find fleet.yaml; default to workspace root.
    let fleet_path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| "fleet.yaml".to_string());
    let fleet = FleetFile::load(Path::new(&fleet_path)).with_context(|| format!("reading {fleet_path}"))?;
    let coordinator_addr = std::env::var("COORDINATOR_ADDR").unwrap_or_else(|_| fleet.coordinator_addr.clone());
    if fleet.units.is_empty() {
        anyhow::bail!("{fleet_path} lists no units");
    }

    let mut handles: Vec<JoinHandle<Result<()>>> = Vec::new();
    for unit in &fleet.units {
        let envs = build_envs(unit, &fleet_path, &coordinator_addr);
        let id = unit.id;

        // Spawn `cargo run -p battery_agent` with the envs; RUST_LOG and
        // SOH_MODEL_PATH are inherited from this process.
        let handle = tokio::spawn(async move {
            let mut cmd = Command::new("cargo");
            cmd.arg("run")
                .arg("-p")
                .arg("battery_agent")
                .envs(envs)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            println!("Launching battery agent for unit {id}");
            let status = cmd.status().await.context("launching agent")?;
            if !status.success() {
                anyhow::bail!("agent for unit {id} exited with {status:?}");
            }
            Ok(())
        });
        handles.push(handle);
    }

    // Wait for all agents (they run until killed).
    for h in handles {
        if let Err(err) = h.await? {
            eprintln!("{err:#}");
        }
    }
    Ok(())
}

fn listen_addr(unit: &UnitSettings) -> String {
    unit.listen_addr
        .clone()
        .unwrap_or_else(|| format!("127.0.0.1:{}", BASE_PORT + unit.id))
}

fn build_envs(unit: &UnitSettings, fleet_path: &str, coordinator_addr: &str) -> HashMap<String, String> {
    let mut envs = HashMap::new();
    envs.insert("UNIT_ID".into(), unit.id.to_string());
    envs.insert("LISTEN_ADDR".into(), listen_addr(unit));
    envs.insert("COORDINATOR_ADDR".into(), coordinator_addr.to_string());
    envs.insert("FLEET_CONFIG".into(), fleet_path.to_string());
    envs
}
