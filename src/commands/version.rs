use anyhow::Result;
use serde_json::json;

pub fn run() -> Result<i32> {
    super::print_json(&json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))?;
    Ok(0)
}
