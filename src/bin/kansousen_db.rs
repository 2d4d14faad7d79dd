//! kansousen-db: kifu table maintenance CLI
//!
//! Runs single store operations against the configured backend and prints
//! results as JSON on stdout. Logs go to stderr.
//!
//! ## Usage
//! ```text
//! kansousen-db put [expected_version]            < {"kifu": {...}, "steps": [...]}
//! kansousen-db get <kifu_id>
//! kansousen-db steps <kifu_id>
//! kansousen-db list <owner_id>
//! kansousen-db recent <owner_id> [limit]
//! kansousen-db samepos <owner_id,...> <position> [num_step] [exclude_id,...]
//! kansousen-db dup <final_position>
//! kansousen-db delete <kifu_id> <version>
//! ```
//!
//! ## Configuration
//! - KANSOUSEN_CONFIG: YAML config file (default `kansousen.yaml`)
//! - KANSOUSEN__STORAGE__TYPE: `dynamo` or `memory`
//! - KANSOUSEN__STORAGE__DYNAMO__TABLE_NAME / ENDPOINT_URL / REGION
//! - KANSOUSEN__STORE__PARALLELISM: fan-out width (default 2)

use std::io::Read;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kansousen::config::Config;
use kansousen::kifu::{Kifu, Step, Version};
use kansousen::storage::{init_storage, KifuStore};
use kansousen::utils::bootstrap::init_tracing;

const DEFAULT_RECENT_LIMIT: usize = 10;

#[derive(Deserialize)]
struct PutInput {
    kifu: Kifu,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Serialize)]
struct KifuWithSteps {
    kifu: Kifu,
    steps: Vec<Step>,
    version: Version,
}

#[derive(Serialize)]
struct KifuWithVersion {
    kifu: Kifu,
    version: Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        return Err(usage());
    };

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let backend = init_storage(&config.storage).await?;
    let store = KifuStore::new(backend, &config.store)?;
    info!(parallelism = store.parallelism(), "Store ready");

    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let arg = |i: usize| args.get(i).map(String::as_str);

    match (command.as_str(), arg(1)) {
        ("put", expected) => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw)?;
            let input: PutInput = serde_json::from_str(&raw)?;
            let expected = expected.map(Version::from);

            let version = store
                .put_kifu(&ctx, &input.kifu, &input.steps, expected.as_ref())
                .await?;
            print_json(&serde_json::json!({
                "kifu_id": input.kifu.kifu_id,
                "version": version,
            }))?;
        }
        ("get", Some(kifu_id)) => {
            let (kifu, version) = store.get_kifu(&ctx, kifu_id).await?;
            print_json(&KifuWithVersion { kifu, version })?;
        }
        ("steps", Some(kifu_id)) => {
            let (kifu, steps, version) = store.get_kifu_and_steps(&ctx, kifu_id).await?;
            print_json(&KifuWithSteps {
                kifu,
                steps,
                version,
            })?;
        }
        ("list", Some(owner_id)) => {
            let mut printed = Ok(());
            store
                .list_kifu(&ctx, owner_id, |kifu, version| {
                    if printed.is_ok() {
                        printed = serde_json::to_string(&KifuWithVersion { kifu, version })
                            .map(|line| println!("{line}"));
                    }
                })
                .await?;
            printed?;
        }
        ("recent", Some(owner_id)) => {
            let limit = match arg(2) {
                Some(raw) => raw.parse()?,
                None => DEFAULT_RECENT_LIMIT,
            };
            let kifus = store.get_recent_kifu(&ctx, owner_id, limit).await?;
            print_json(&kifus)?;
        }
        ("samepos", Some(owners)) => {
            let position = arg(2).ok_or_else(usage)?;
            let num_step = arg(3).map(str::parse::<u32>).transpose()?;
            let exclude = arg(4).map(split_list).unwrap_or_default();

            let found = store
                .get_same_positions(&ctx, &split_list(owners), position, num_step, &exclude)
                .await?;
            print_json(&found)?;
        }
        ("dup", Some(position)) => {
            let found = store.duplicate_kifu(&ctx, position).await?;
            print_json(&found)?;
        }
        ("delete", Some(kifu_id)) => {
            let version = arg(2).map(Version::from).ok_or_else(usage)?;
            store.delete_kifu(&ctx, kifu_id, &version).await?;
            info!(kifu_id = %kifu_id, "Deleted");
        }
        _ => return Err(usage()),
    }

    Ok(())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn usage() -> Box<dyn std::error::Error> {
    "usage: kansousen-db <put|get|steps|list|recent|samepos|dup|delete> [args...]".into()
}
