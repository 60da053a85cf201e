use std::collections::VecDeque;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use veranode_prover::auth::ApiKeyValidator;
use veranode_prover::crypto::{self, ProofStep, Side, DEFAULT_CHUNK_SIZE};
use veranode_prover::infra::{ArtifactCache, RetentionConfig, RetentionSweeper, SqliteStore};
use veranode_prover::metrics::MetricsRegistry;

fn print_help() {
    eprintln!(
        "\
veranode-admin

USAGE:
  veranode-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  fingerprint                     Print the SHA-256 fingerprint of a model file
  merkle-root                     Print the weight Merkle root of a model file
  merkle-proof                    Print an inclusion proof for one weight chunk
  verify-merkle-proof             Verify a weight chunk inclusion proof
  cache-status                    List setup artifact cache entries
  cache-evict                     Remove one setup artifact cache entry
  sweep                           Remove files of expired completed jobs
  gen-api-key                     Generate an API key for a user

COMMON OPTIONS:
  --database-url <sqlite_url>     (defaults to env DATABASE_URL)
  --cache-dir <path>              (defaults to env CACHE_DIR, then <PROOFS_DIR>/_cache)

fingerprint OPTIONS:
  --path <file>                   (required)

merkle-root OPTIONS:
  --path <file>                   (required)
  --chunk-size <bytes>            (default: 1048576)

merkle-proof OPTIONS:
  --path <file>                   (required)
  --index <n>                     (required) Chunk index
  --chunk-size <bytes>            (default: 1048576)

verify-merkle-proof OPTIONS:
  --leaf <hex>                    (required) Hashed leaf digest
  --root <hex>                    (required) Expected Merkle root
  --proof <side:hex,...>          (required) Steps as left:<hex> or right:<hex>

cache-evict OPTIONS:
  --fingerprint <hex>             (required)

sweep OPTIONS:
  --retention-days <n>            (defaults to env RETENTION_DAYS, then 7)

gen-api-key OPTIONS:
  --user-id <uuid>                (optional) Defaults to a new random user
"
    );
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

fn resolve_cache_dir(cache_dir: Option<PathBuf>) -> PathBuf {
    cache_dir
        .or_else(|| std::env::var("CACHE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| {
            std::env::var("PROOFS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/proofs"))
                .join("_cache")
        })
}

fn next_value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

fn parse_chunk_size(raw: &str) -> anyhow::Result<usize> {
    let size: usize = raw.parse()?;
    if size == 0 {
        anyhow::bail!("--chunk-size must be positive");
    }
    Ok(size)
}

fn parse_proof_steps(raw: &str) -> anyhow::Result<Vec<ProofStep>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|step| {
            let (side, sibling) = step
                .trim()
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("proof step must be side:hex, got {step}"))?;
            let side = match side {
                "left" | "l" => Side::Left,
                "right" | "r" => Side::Right,
                other => anyhow::bail!("unknown proof side: {other}"),
            };
            if !crypto::is_hex_digest(sibling) {
                anyhow::bail!("proof sibling must be a 64 character hex digest: {sibling}");
            }
            Ok(ProofStep {
                sibling: sibling.to_string(),
                side,
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    match command.as_str() {
        "migrate" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(next_value(&mut args, "--database-url")?);
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let database_url = require_database_url(database_url)?;
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect(&database_url)
                .await?;
            veranode_prover::migrations::run_sqlite(&pool).await?;
            pool.close().await;
            println!("ok: migrations applied");
            Ok(())
        }
        "fingerprint" => {
            let mut path: Option<PathBuf> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--path" => path = Some(next_value(&mut args, "--path")?.into()),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let path = path.ok_or_else(|| anyhow::anyhow!("--path is required"))?;
            let fingerprint = crypto::fingerprint(&path)?;
            println!("{fingerprint}");
            Ok(())
        }
        "merkle-root" => {
            let mut path: Option<PathBuf> = None;
            let mut chunk_size = DEFAULT_CHUNK_SIZE;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--path" => path = Some(next_value(&mut args, "--path")?.into()),
                    "--chunk-size" => {
                        chunk_size = parse_chunk_size(&next_value(&mut args, "--chunk-size")?)?;
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let path = path.ok_or_else(|| anyhow::anyhow!("--path is required"))?;
            let tree = crypto::weight_tree(File::open(&path)?, chunk_size)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "path": path.display().to_string(),
                    "chunk_size": chunk_size,
                    "leaf_count": tree.leaf_count(),
                    "merkle_root": tree.root(),
                }))?
            );
            Ok(())
        }
        "merkle-proof" => {
            let mut path: Option<PathBuf> = None;
            let mut index: Option<usize> = None;
            let mut chunk_size = DEFAULT_CHUNK_SIZE;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--path" => path = Some(next_value(&mut args, "--path")?.into()),
                    "--index" => index = Some(next_value(&mut args, "--index")?.parse()?),
                    "--chunk-size" => {
                        chunk_size = parse_chunk_size(&next_value(&mut args, "--chunk-size")?)?;
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let path = path.ok_or_else(|| anyhow::anyhow!("--path is required"))?;
            let index = index.ok_or_else(|| anyhow::anyhow!("--index is required"))?;

            let tree = crypto::weight_tree(File::open(&path)?, chunk_size)?;
            let steps = tree.proof(index)?;
            let leaf = tree
                .leaf_digest(index)
                .ok_or_else(|| anyhow::anyhow!("leaf {index} missing from tree"))?;

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "leaf_index": index,
                    "leaf": leaf,
                    "merkle_root": tree.root(),
                    "proof": steps,
                }))?
            );
            Ok(())
        }
        "verify-merkle-proof" => {
            let mut leaf: Option<String> = None;
            let mut root: Option<String> = None;
            let mut proof: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--leaf" => leaf = Some(next_value(&mut args, "--leaf")?),
                    "--root" => root = Some(next_value(&mut args, "--root")?),
                    "--proof" => proof = Some(next_value(&mut args, "--proof")?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let leaf = leaf.ok_or_else(|| anyhow::anyhow!("--leaf is required"))?;
            let root = root.ok_or_else(|| anyhow::anyhow!("--root is required"))?;
            let proof = proof.ok_or_else(|| anyhow::anyhow!("--proof is required"))?;

            if !crypto::is_hex_digest(&leaf) {
                anyhow::bail!("--leaf must be a 64 character hex digest");
            }
            if !crypto::is_hex_digest(&root) {
                anyhow::bail!("--root must be a 64 character hex digest");
            }
            let steps = parse_proof_steps(&proof)?;

            if crypto::verify_proof(&leaf, &steps, &root) {
                println!("ok: proof valid");
                Ok(())
            } else {
                anyhow::bail!("proof invalid: computed root does not match --root");
            }
        }
        "cache-status" => {
            let mut cache_dir: Option<PathBuf> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--cache-dir" => cache_dir = Some(next_value(&mut args, "--cache-dir")?.into()),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let cache = ArtifactCache::new(resolve_cache_dir(cache_dir));
            let entries = cache.entries()?;
            let total_bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();

            for entry in &entries {
                println!(
                    "{} complete={} size_bytes={}",
                    entry.fingerprint, entry.complete, entry.size_bytes
                );
            }
            println!(
                "ok: {} entries, {} bytes under {}",
                entries.len(),
                total_bytes,
                cache.root().display()
            );
            Ok(())
        }
        "cache-evict" => {
            let mut cache_dir: Option<PathBuf> = None;
            let mut fingerprint: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--cache-dir" => cache_dir = Some(next_value(&mut args, "--cache-dir")?.into()),
                    "--fingerprint" => fingerprint = Some(next_value(&mut args, "--fingerprint")?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let fingerprint =
                fingerprint.ok_or_else(|| anyhow::anyhow!("--fingerprint is required"))?;
            let cache = ArtifactCache::new(resolve_cache_dir(cache_dir));

            if cache.evict(&fingerprint)? {
                println!("ok: evicted {fingerprint}");
            } else {
                println!("ok: no cache entry for {fingerprint}");
            }
            Ok(())
        }
        "sweep" => {
            let mut database_url: Option<String> = None;
            let mut retention_days: Option<u64> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(next_value(&mut args, "--database-url")?);
                    }
                    "--retention-days" => {
                        retention_days = Some(next_value(&mut args, "--retention-days")?.parse()?);
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let database_url = require_database_url(database_url)?;
            let mut config = RetentionConfig::from_env();
            if let Some(days) = retention_days {
                config.retention = Duration::from_secs(days * 24 * 3600);
            }

            let store = SqliteStore::from_url(&database_url).await?;
            let pool = store.pool().clone();
            let sweeper =
                RetentionSweeper::new(config, Arc::new(store), Arc::new(MetricsRegistry::new()));
            let report = sweeper.sweep_once().await?;
            pool.close().await;

            println!(
                "ok: cleaned {} jobs, freed {} bytes",
                report.cleaned, report.freed_bytes
            );
            Ok(())
        }
        "gen-api-key" => {
            let mut user_id: Option<Uuid> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--user-id" => {
                        let raw = next_value(&mut args, "--user-id")?;
                        user_id = Some(
                            Uuid::parse_str(&raw)
                                .map_err(|e| anyhow::anyhow!("invalid --user-id: {e}"))?,
                        );
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let user_id = user_id.unwrap_or_else(Uuid::new_v4);
            let (key, key_hash) = ApiKeyValidator::generate_key();
            println!("api_key={key}");
            println!("key_hash={key_hash}");
            println!("API_KEYS entry: {key}:{user_id}");
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}\n");
            print_help();
            anyhow::bail!("unknown command: {other}");
        }
    }
}
