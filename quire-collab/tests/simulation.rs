//! Randomized editing sessions: several clients typing at once while the
//! network delays and reorders acks and remote operations.

use proptest::prelude::*;
use quire_collab::{
    ClientSyncState, OutboundOperation, Revision, ServerConfig, Subscription, SyncClient,
    SyncServer,
};
use quire_core::{AttributeValue, Attributes, Operation};
use uuid::Uuid;

const PEERS: usize = 3;

/// Something the server sent that has not reached the client yet.
enum Delivery {
    Ack(Revision),
    Remote(Revision, Operation),
}

struct Peer {
    client: SyncClient,
    feed: Subscription,
    outbox: Option<OutboundOperation>,
    inbox: Vec<Delivery>,
}

/// One scheduling decision: (action, peer, a, b, text).
type Step = (u8, usize, usize, usize, String);

fn schedule_strategy() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        (
            0u8..4,
            0..PEERS,
            any::<usize>(),
            any::<usize>(),
            prop::string::string_regex("[a-z]{1,3}").expect("Invalid regex"),
        ),
        0..60,
    )
}

/// A local edit that fits a document of `len`.
fn local_edit(len: usize, a: usize, b: usize, text: &str) -> Operation {
    let pos = a % (len + 1);
    let room = len - pos;
    match b % 3 {
        1 if room > 0 => Operation::new().retain(pos).delete(1 + b / 3 % room),
        2 if room > 0 => {
            let bold = if b / 3 % 2 == 0 {
                AttributeValue::Bool(true)
            } else {
                AttributeValue::Null
            };
            Operation::new()
                .retain(pos)
                .retain_with(1 + b / 6 % room, Attributes::new().with("bold", bold))
        }
        _ => Operation::new().retain(pos).insert(text),
    }
}

async fn submit(server: &SyncServer, peers: &mut [Peer], index: usize) {
    let Some(outbound) = peers[index].outbox.take() else {
        return;
    };
    let peer = &peers[index];
    let (revision, _) = server
        .process_operation(
            peer.client.document_id(),
            peer.client.client_id(),
            outbound.base_revision,
            outbound.operation,
        )
        .await
        .unwrap();
    peers[index].inbox.push(Delivery::Ack(revision));

    for peer in peers.iter_mut() {
        while let Some(remote) = peer.feed.try_recv().unwrap() {
            peer.inbox
                .push(Delivery::Remote(remote.revision, remote.operation.clone()));
        }
    }
}

fn deliver(peer: &mut Peer, index: usize) {
    let effects = match peer.inbox.remove(index) {
        Delivery::Ack(revision) => peer.client.on_server_ack(revision).unwrap(),
        Delivery::Remote(revision, op) => peer.client.on_remote_operation(revision, op).unwrap(),
    };
    if let Some(send) = effects.send {
        assert!(peer.outbox.is_none());
        peer.outbox = Some(send);
    }
}

async fn run_session(schedule: Vec<Step>) {
    let server = SyncServer::in_memory(ServerConfig::default());
    let doc = Uuid::new_v4();
    let mut peers = Vec::new();
    for _ in 0..PEERS {
        let client = SyncClient::new(doc, Uuid::new_v4());
        let feed = server.subscribe(doc, client.client_id()).await.unwrap();
        peers.push(Peer {
            client,
            feed,
            outbox: None,
            inbox: Vec::new(),
        });
    }

    for (action, index, a, b, text) in schedule {
        match action {
            0 | 1 => {
                let peer = &mut peers[index];
                let op = local_edit(peer.client.document().len(), a, b, &text);
                if op.is_noop() {
                    continue;
                }
                if let Some(send) = peer.client.on_local_edit(op).unwrap().send {
                    assert!(peer.outbox.is_none());
                    peer.outbox = Some(send);
                }
            }
            2 => submit(&server, &mut peers, index).await,
            _ => {
                let peer = &mut peers[index];
                if !peer.inbox.is_empty() {
                    let at = a % peer.inbox.len();
                    deliver(peer, at);
                }
            }
        }
    }

    // Let the network settle.
    loop {
        let mut idle = true;
        for index in 0..PEERS {
            if peers[index].outbox.is_some() {
                idle = false;
                submit(&server, &mut peers, index).await;
            }
        }
        for peer in peers.iter_mut() {
            while !peer.inbox.is_empty() {
                idle = false;
                deliver(peer, 0);
            }
        }
        if idle {
            break;
        }
    }

    let (revision, content) = server.document(doc).await.unwrap();
    for peer in &peers {
        assert_eq!(peer.client.document(), &content);
        assert_eq!(
            peer.client.state(),
            &ClientSyncState::Synchronized {
                server_revision: revision
            }
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_clients_converge_with_server(schedule in schedule_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(run_session(schedule));
    }
}

#[tokio::test]
async fn test_interleaved_session_converges() {
    let schedule = vec![
        (0, 0, 0, 0, "abc".to_string()),
        (0, 1, 0, 0, "xyz".to_string()),
        (0, 2, 0, 0, "q".to_string()),
        (2, 1, 0, 0, String::new()),
        (0, 1, 1, 1, String::new()),
        (2, 0, 0, 0, String::new()),
        (3, 2, 1, 0, String::new()),
        (0, 0, 1, 2, String::new()),
        (2, 2, 0, 0, String::new()),
        (3, 0, 0, 0, String::new()),
        (2, 0, 0, 0, String::new()),
        (3, 1, 2, 0, String::new()),
    ];
    run_session(schedule).await;
}
