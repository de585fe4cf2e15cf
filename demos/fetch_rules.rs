//! Fetch business rules over mutual TLS
//!
//! Usage: `cargo run --example fetch_rules -- <settings.toml> <https-url>`
//!
//! Passwords can come from the environment instead of the file, e.g.
//! `RULES_CLIENT__SSL__KEY_STORE_PASSWORD`.

use anyhow::Context;
use rules_mtls_client::{bootstrap, Settings};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let settings_path = args.next().map(PathBuf::from);
    let url = args
        .next()
        .unwrap_or_else(|| "https://localhost:8443/rules".to_string());

    println!("Rules mTLS client\n");

    let settings = Settings::load(settings_path.as_deref()).context("loading settings")?;
    println!("Key store:   {}", settings.ssl.key_store.display());
    println!("Trust store: {}", settings.ssl.trust_store.display());

    let client = bootstrap(&settings).context("building the mTLS client")?;
    let policy = client.pool_policy();
    println!(
        "✓ Client ready ({} per route, {} total)",
        policy.max_per_route, policy.max_total
    );

    match client.get(&url).await {
        Ok(response) => {
            println!("✓ {} {}", response.status(), url);
            println!("{}", response.text());
        }
        Err(e) if e.is_transient() => {
            println!("✗ Temporary failure, retry later: {}", e);
        }
        Err(e) => return Err(e).context(format!("fetching {}", url)),
    }

    let state = client.pool_state();
    println!("\nPool: {} idle, {} leased", state.idle, state.leased);

    Ok(())
}
