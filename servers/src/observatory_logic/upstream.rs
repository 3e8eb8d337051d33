use lib_observatory::ingestors::GerritSshTransport;
use lib_observatory::{Dispatcher, EventStream, Registry};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::config::Settings;

/// Streams Gerrit events into the registry until shutdown or a fatal
/// ingestion error. Registered agents keep their inboxes either way.
pub async fn run(settings: Settings, registry: Arc<Registry>, mut shutdown: broadcast::Receiver<()>) {
    let transport = match GerritSshTransport::new(settings.gerrit()) {
        Ok(transport) => transport,
        Err(e) => {
            error!("Ingestion disabled: {}", e);
            return;
        }
    };

    let (events_tx, events_rx) = EventStream::<GerritSshTransport>::channel(settings.queue_capacity);
    let dispatcher = tokio::spawn(Dispatcher::new(registry, events_rx).run());
    let stream = EventStream::new(transport, events_tx, settings.event_stream());

    tokio::select! {
        result = stream.run() => {
            if let Err(e) = result {
                error!("Ingestion stopped: {}", e);
            }
        }
        _ = shutdown.recv() => {
            info!("Upstream shutting down...");
        }
    }

    let stats = stream.stats();
    info!(
        "Ingested {} events over {} connections and {} sessions ({} decode failures)",
        stats.documents(),
        stats.connections(),
        stats.sessions(),
        stats.decode_failures()
    );

    // Dropping the stream closes the event queue; the dispatcher drains what is left.
    drop(stream);
    if let Err(e) = dispatcher.await {
        error!("Dispatcher task failed: {}", e);
    }
}
