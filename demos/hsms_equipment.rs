//! Passive HSMS equipment answering S1F1 (Are You There) and S1F13
//! (Establish Communications).
//!
//! ```text
//! RUST_LOG=debug cargo run --example hsms_equipment -- demos/equipment.toml
//! ```

use std::path::PathBuf;

use bytes::Bytes;
use secs_transport::{ProtocolEvent, Result, SessionBuilder, Settings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load(&PathBuf::from(path))?,
        None => Settings::from_toml_str(include_str!("equipment.toml"))?,
    };

    let session = SessionBuilder::new("equipment", settings)
        .handle(1, 1, |_msg, ctx| async move {
            // <L[2] <A "DEMO"> <A "1.0">>
            ctx.reply(Bytes::from_static(b"\x01\x02\x41\x04DEMO\x41\x031.0"))
                .await
        })?
        .handle(1, 13, |_msg, ctx| async move {
            // <L[2] <B 0x00> <L[0]>>
            ctx.reply(Bytes::from_static(b"\x01\x02\x21\x01\x00\x01\x00"))
                .await
        })?
        .build()?;

    let mut events = session.subscribe();
    session.enable();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ProtocolEvent::StateChanged { current, .. }) => tracing::info!("State: {}", current),
                Ok(ProtocolEvent::MessageReceived(message)) => tracing::info!("Unhandled {}", message),
                Ok(_) => {}
                Err(e) => tracing::warn!("Event stream: {}", e),
            },
        }
    }

    session.disable().await;
    Ok(())
}
