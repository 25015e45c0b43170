//! Read-only inspection and database setup (`testforge status|healing|logs|init-db|scenarios`).

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use testforge::config::Config;
use testforge::pipeline::db::RunDb;
use testforge::pipeline::models::{RunId, RunRecord};
use testforge::pipeline::scenarios;

fn parse_id(raw: &str) -> Result<RunId> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("Invalid run id '{}'", raw))
}

fn open_existing(config: &Config) -> Result<RunDb> {
    let path = &config.server.db_path;
    if !path.exists() {
        bail!(
            "No run database at {} (run `testforge init-db` or `testforge serve` first)",
            path.display()
        );
    }
    RunDb::new(path)
}

fn load_run(config: &Config, raw_id: &str) -> Result<RunRecord> {
    let id = parse_id(raw_id)?;
    let db = open_existing(config)?;
    db.get_run(id)?
        .with_context(|| format!("Run {} not found", id))
}

pub fn cmd_status(config: &Config, run_id: &str) -> Result<()> {
    let run = load_run(config, run_id)?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

pub fn cmd_healing(config: &Config, run_id: &str) -> Result<()> {
    let run = load_run(config, run_id)?;
    println!("{}", serde_json::to_string_pretty(&run.healing_report())?);
    Ok(())
}

pub fn cmd_logs(config: &Config, run_id: &str) -> Result<()> {
    let id = parse_id(run_id)?;
    let db = open_existing(config)?;
    if db.get_run(id)?.is_none() {
        bail!("Run {} not found", id);
    }
    for line in db.get_logs(id)? {
        println!(
            "{}  {}",
            line.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            line.message
        );
    }
    Ok(())
}

pub fn cmd_init_db(config: &Config) -> Result<()> {
    let path = &config.server.db_path;
    RunDb::new(path)
        .with_context(|| format!("Failed to initialize run database at {}", path.display()))?;
    println!("Run database initialized at {}", path.display());
    Ok(())
}

pub fn cmd_scenarios() -> Result<()> {
    for template in scenarios::SCENARIO_TEMPLATES {
        println!("{:<22} {} ({} steps)", template.id, template.name, template.steps.len());
    }
    println!("{:<22} Pick a template from the discovered pages", scenarios::AUTO_SCENARIO);
    Ok(())
}
