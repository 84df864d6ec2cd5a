use criterion::{criterion_group, criterion_main, Criterion};
use quire_collab::broadcast::BroadcastGroup;
use quire_collab::protocol::{RemoteOperationMessage, SyncMessage};
use quire_collab::storage::{EntryMetadata, MemoryStore, OperationLog};
use quire_collab::{DocumentProcessor, ProcessorConfig, ServerConfig, SyncClient, SyncServer};
use quire_core::Operation;
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn bench_message_roundtrip(c: &mut Criterion) {
    let msg = SyncMessage::operation(
        Uuid::new_v4(),
        Uuid::new_v4(),
        42,
        Operation::new().retain(120).insert("hello").delete(3),
    );

    c.bench_function("operation_message_roundtrip", |b| {
        b.iter(|| {
            let encoded = black_box(&msg).encode().unwrap();
            black_box(SyncMessage::decode(&encoded).unwrap());
        })
    });
}

fn bench_process_operation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = SyncServer::in_memory(ServerConfig::default());
    let doc = Uuid::new_v4();
    let client = Uuid::new_v4();
    let mut revision = 0;

    c.bench_function("process_operation_warm", |b| {
        b.iter(|| {
            let (committed, _) = rt
                .block_on(server.process_operation(
                    doc,
                    client,
                    revision,
                    Operation::new().insert("x"),
                ))
                .unwrap();
            revision = committed;
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let doc = Uuid::new_v4();
    let origin = Uuid::new_v4();
    let mut subscribers: Vec<_> = (0..100)
        .map(|_| group.subscribe(doc, Uuid::new_v4()))
        .collect();

    c.bench_function("broadcast_1k_to_100", |b| {
        b.iter(|| {
            for revision in 0..1_000 {
                group.broadcast(RemoteOperationMessage {
                    document_id: doc,
                    revision,
                    operation: Operation::new().insert("x"),
                    origin_client_id: origin,
                });
            }
            for sub in subscribers.iter_mut() {
                while let Ok(Some(msg)) = sub.try_recv() {
                    black_box(msg);
                }
            }
        })
    });
}

fn bench_reload(c: &mut Criterion) {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    for revision in 1..=100 {
        store
            .append(doc, revision, &Operation::new().insert("line\n"), EntryMetadata::new(Uuid::nil()))
            .unwrap();
    }

    c.bench_function("reload_100_entry_tail", |b| {
        b.iter(|| {
            black_box(
                DocumentProcessor::load(doc, store.clone(), store.clone(), ProcessorConfig::default())
                    .unwrap(),
            );
        })
    });
}

fn bench_client_remote_against_buffer(c: &mut Criterion) {
    c.bench_function("client_remote_with_pending_and_buffer", |b| {
        b.iter(|| {
            let mut client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4());
            client.on_local_edit(Operation::new().insert("pending")).unwrap();
            client.on_local_edit(Operation::new().retain(7).insert(" buffer")).unwrap();
            for revision in 1..=50 {
                client
                    .on_remote_operation(revision, Operation::new().insert("r"))
                    .unwrap();
            }
            black_box(client.document().len());
        })
    });
}

criterion_group!(
    benches,
    bench_message_roundtrip,
    bench_process_operation,
    bench_broadcast_fan_out,
    bench_reload,
    bench_client_remote_against_buffer,
);
criterion_main!(benches);
