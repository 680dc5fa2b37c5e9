//! Two turns on one session; the process keeps the conversation context.

use agent_client::{AgentMessage, AgentOptions, AgentSession};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let session = AgentSession::new(AgentOptions::builder().build());
    session.connect().await?;

    for prompt in [
        "My favorite color is blue. Say OK.",
        "What is my favorite color?",
    ] {
        session.query(prompt).await?;
        let mut turn = session.receive_response();
        while let Some(item) = turn.next().await {
            match item? {
                AgentMessage::Assistant(assistant) => print!("{}", assistant.text()),
                AgentMessage::Result(result) => {
                    println!("\n-- turn {} done --", result.num_turns.unwrap_or_default());
                }
                _ => {}
            }
        }
    }

    session.close().await?;
    Ok(())
}
