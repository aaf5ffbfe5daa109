//! Active HSMS host: selects, establishes communication and asks the
//! equipment whether it is there.
//!
//! ```text
//! cargo run --example hsms_equipment &
//! cargo run --example hsms_host -- 127.0.0.1 5000
//! ```

use bytes::Bytes;
use secs_transport::{
    ConnectMode, ConnectionState, DeviceRole, ProtocolEvent, Result, SecsError, SessionBuilder,
    Settings, TransportSettings,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match args.next() {
        Some(port) => port
            .parse()
            .map_err(|_| SecsError::Config(format!("invalid port {:?}", port)))?,
        None => 5000,
    };

    let settings = Settings {
        role: DeviceRole::Host,
        session_id: 1,
        transport: TransportSettings::Hsms {
            address,
            port,
            mode: ConnectMode::Active,
            close_listener_after_accept: false,
        },
        ..Settings::default()
    };
    let session = SessionBuilder::new("host", settings).build()?;
    let mut events = session.subscribe();
    session.enable();

    loop {
        match events.recv().await {
            Ok(ProtocolEvent::StateChanged {
                current: ConnectionState::Selected,
                ..
            }) => break,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Err(SecsError::ConnectionClosed),
        }
    }

    // S1F13 <L[0]>
    match session.send_and_wait(1, 13, Bytes::from_static(b"\x01\x00")).await? {
        Some(reply) => tracing::info!("Communication established: {}", reply),
        None => tracing::warn!("No S1F14"),
    }

    match session.send_and_wait(1, 1, Bytes::new()).await? {
        Some(reply) => tracing::info!("Equipment answered {} ({} bytes)", reply, reply.data.len()),
        None => tracing::warn!("No S1F2"),
    }

    session.disable().await;
    Ok(())
}
