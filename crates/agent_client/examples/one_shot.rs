//! Minimal one-shot prompt: `cargo run --example one_shot -- "your prompt"`.

use agent_client::{execute, AgentOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let prompt = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "What is 2+2?".to_string());

    let outcome = execute(prompt, AgentOptions::builder().build()).await?;

    println!("status: {:?}", outcome.status);
    println!("{}", outcome.text);
    if let Some(cost) = outcome.metadata.total_cost_usd {
        eprintln!("cost: ${cost:.4}");
    }
    Ok(())
}
