//! Two clients typing concurrently into one document, in-process.
//!
//! Run with `RUST_LOG=debug cargo run --features demo --bin quire-demo` to see the server log.

use std::error::Error;

use log::info;
use quire_collab::{ServerConfig, Subscription, SyncClient, SyncMessage, SyncServer};
use quire_core::Operation;
use uuid::Uuid;

/// Send a client's outbound operation over the wire and feed the reply back.
async fn submit(
    server: &SyncServer,
    client: &mut SyncClient,
    op: Operation,
) -> Result<(), Box<dyn Error>> {
    let effects = client.on_local_edit(op)?;
    let Some(outbound) = effects.send else {
        return Ok(());
    };
    let bytes = client.message(&outbound).encode()?;
    info!("Client {} sent {} bytes", client.client_id(), bytes.len());

    match server.handle(SyncMessage::decode(&bytes)?).await {
        Some(SyncMessage::Ack(ack)) => {
            // Held until earlier remote revisions arrive
            client.on_server_ack(ack.revision)?;
        }
        Some(SyncMessage::Reject(reject)) => {
            return Err(format!("operation rejected: {:?}", reject.reason).into());
        }
        other => return Err(format!("unexpected reply: {other:?}").into()),
    }
    Ok(())
}

/// Apply every remote operation waiting on the subscription.
fn drain(client: &mut SyncClient, subscription: &mut Subscription) -> Result<(), Box<dyn Error>> {
    while let Some(remote) = subscription.try_recv()? {
        let effects = client.on_remote_operation(remote.revision, remote.operation.clone())?;
        for op in &effects.apply {
            info!("Client {} applied {:?}", client.client_id(), op);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    info!("Starting quire demo...");

    let server = SyncServer::in_memory(ServerConfig::default());
    let document_id = Uuid::new_v4();

    let mut alice = SyncClient::new(document_id, Uuid::new_v4());
    let mut bob = SyncClient::new(document_id, Uuid::new_v4());
    let mut alice_feed = server.subscribe(document_id, alice.client_id()).await?;
    let mut bob_feed = server.subscribe(document_id, bob.client_id()).await?;

    // Both type into the empty document before seeing each other
    submit(&server, &mut alice, Operation::new().insert("Hello")).await?;
    submit(&server, &mut bob, Operation::new().insert("World")).await?;

    drain(&mut alice, &mut alice_feed)?;
    drain(&mut bob, &mut bob_feed)?;

    let (revision, content) = server.document(document_id).await?;
    info!("Server at revision {revision}: {content}");
    info!("Alice sees: {}", alice.document());
    info!("Bob sees:   {}", bob.document());

    if alice.document() != &content || bob.document() != &content {
        return Err("replicas diverged".into());
    }
    println!("{content}");

    server.unsubscribe(document_id, alice.client_id()).await;
    server.unsubscribe(document_id, bob.client_id()).await;
    let stats = server.stats().await;
    info!(
        "Committed {} operations across {} documents",
        stats.operations_committed, stats.loaded_documents
    );
    Ok(())
}
