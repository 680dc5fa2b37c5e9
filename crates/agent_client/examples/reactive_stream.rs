//! Reactive facade: lazy per-turn producers and a cross-turn result handler.

use agent_client::{AgentOptions, ReactiveSession};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let session = ReactiveSession::new(
        AgentOptions::builder()
            .include_partial_messages(true)
            .build(),
    );
    session.on_result(|result| {
        eprintln!(
            "turn finished: subtype={} cost={:?}",
            result.subtype, result.total_cost_usd
        );
    });
    session.connect().await?;

    // Nothing is sent until the stream is polled.
    let turn = session.query("Write a haiku about rivers.");
    let mut fragments = turn.text_stream();
    while let Some(fragment) = fragments.next().await {
        print!("{}", fragment?);
    }
    println!();

    session.close().await?;
    Ok(())
}
