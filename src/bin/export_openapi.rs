//! Write the billing payments OpenAPI document
//!
//! Usage:
//!   export_openapi                      # stdout
//!   export_openapi --output api.json    # file

use anyhow::Context;
use billing_payments::gateway::openapi::ApiDoc;
use utoipa::OpenApi;

fn main() -> anyhow::Result<()> {
    let json = ApiDoc::openapi()
        .to_pretty_json()
        .context("failed to serialize OpenAPI document")?;

    let args: Vec<String> = std::env::args().collect();
    match args.iter().position(|a| a == "--output").and_then(|i| args.get(i + 1)) {
        Some(path) => {
            std::fs::write(path, &json).with_context(|| format!("failed to write {}", path))?;
            eprintln!("OpenAPI document written to {}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}
