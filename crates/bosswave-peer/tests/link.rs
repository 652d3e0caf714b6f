//! Peer link behavior over the in-memory transport: handshake proof,
//! point requests, streaming subscriptions and reconnect replay.

use std::sync::Arc;
use std::time::Duration;

use bosswave_core::Message;
use bosswave_core::MessageType;
use bosswave_crypto::Keypair;
use bosswave_crypto::Vk;
use bosswave_peer::Frame;
use bosswave_peer::MemoryTransport;
use bosswave_peer::PeerError;
use bosswave_peer::PeerEvent;
use bosswave_peer::PeerLink;
use bosswave_peer::transport::MemoryServerEnd;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const CMD_MESSAGE: u8 = 0x01;
const CMD_RESPONSE: u8 = 0x02;
const CMD_RESULT: u8 = 0x03;
const CMD_END: u8 = 0x04;

const CERT_SIG: &[u8] = b"certificate signature bytes";

fn remote() -> Keypair {
    Keypair::generate(&mut StdRng::seed_from_u64(1))
}

fn proof(kp: &Keypair) -> Vec<u8> {
    let mut p = Vec::with_capacity(96);
    p.extend_from_slice(kp.vk().as_bytes());
    p.extend_from_slice(&kp.sign(CERT_SIG));
    p
}

async fn accept(accepts: &mut mpsc::UnboundedReceiver<MemoryServerEnd>, kp: &Keypair) -> MemoryServerEnd {
    let mut end = accepts.recv().await.expect("transport connect");
    end.writer.write_all(&proof(kp)).await.unwrap();
    end.writer.flush().await.unwrap();
    end
}

fn test_message(suffix: &str) -> Message {
    let signer = Keypair::generate(&mut StdRng::seed_from_u64(9));
    let mut m = Message::new(MessageType::Publish, 5, Vk([3u8; 32]), suffix);
    m.encode(&signer);
    m
}

fn ok_status_body() -> Vec<u8> {
    Frame::status_body(0, "")
}

fn sub_status_body(mid: u64, sig: u64) -> Vec<u8> {
    let mut body = Frame::status_body(0, "");
    body.extend_from_slice(&mid.to_le_bytes());
    body.extend_from_slice(&sig.to_le_bytes());
    body
}

#[tokio::test]
async fn test_handshake_rejects_wrong_vk() {
    let kp = remote();
    let other = Keypair::generate(&mut StdRng::seed_from_u64(2));
    let (transport, mut accepts) = MemoryTransport::new(CERT_SIG.to_vec());
    let server = tokio::spawn(async move {
        let _end = accept(&mut accepts, &kp).await;
    });
    // We expect a different VK than the one proven.
    let err = PeerLink::connect(Arc::new(transport), other.vk()).await.unwrap_err();
    assert!(matches!(err, PeerError::WrongPeer));
    server.await.unwrap();
}

#[tokio::test]
async fn test_handshake_rejects_bad_signature() {
    let kp = remote();
    let (transport, mut accepts) = MemoryTransport::new(CERT_SIG.to_vec());
    let vk = kp.vk();
    let server = tokio::spawn(async move {
        let mut end = accepts.recv().await.unwrap();
        // Proof signed over the wrong bytes.
        let mut p = Vec::new();
        p.extend_from_slice(kp.vk().as_bytes());
        p.extend_from_slice(&kp.sign(b"not the certificate"));
        end.writer.write_all(&p).await.unwrap();
        end.writer.flush().await.unwrap();
        end
    });
    let err = PeerLink::connect(Arc::new(transport), vk).await.unwrap_err();
    assert!(matches!(err, PeerError::BadProof { .. }));
    drop(server);
}

#[tokio::test]
async fn test_publish_roundtrip_status() {
    let kp = remote();
    let vk = kp.vk();
    let (transport, mut accepts) = MemoryTransport::new(CERT_SIG.to_vec());
    let msg = test_message("a/b");
    let encoded = msg.encoded.clone();

    let server = tokio::spawn(async move {
        let mut end = accept(&mut accepts, &kp).await;
        let f = Frame::read_from(&mut end.reader).await.unwrap();
        assert_eq!(f.cmd, CMD_MESSAGE);
        assert_eq!(f.body, encoded);
        Frame::new(f.seqno, CMD_RESPONSE, ok_status_body()).write_to(&mut end.writer).await.unwrap();

        // Second request gets an error status.
        let f = Frame::read_from(&mut end.reader).await.unwrap();
        Frame::new(f.seqno, CMD_RESPONSE, Frame::status_body(42, "denied")).write_to(&mut end.writer).await.unwrap();
        end
    });

    let link = PeerLink::connect(Arc::new(transport), vk).await.unwrap();
    link.publish(&msg).await.unwrap();
    let err = link.publish(&msg).await.unwrap_err();
    assert!(matches!(err, PeerError::Status { code: 42, .. }));
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_stream_and_reconnect_replay() {
    let kp = remote();
    let vk = kp.vk();
    let (transport, mut accepts) = MemoryTransport::new(CERT_SIG.to_vec());
    let sub_msg = test_message("a/+");
    let result_msg = test_message("a/b");
    let result_bytes = result_msg.encoded.clone();

    let server = tokio::spawn(async move {
        // First connection: status + one result, then drop the link.
        let mut end = accept(&mut accepts, &kp).await;
        let f = Frame::read_from(&mut end.reader).await.unwrap();
        assert_eq!(f.cmd, CMD_MESSAGE);
        let seqno = f.seqno;
        Frame::new(seqno, CMD_RESPONSE, sub_status_body(77, 88)).write_to(&mut end.writer).await.unwrap();
        Frame::new(seqno, CMD_RESULT, result_bytes.clone()).write_to(&mut end.writer).await.unwrap();
        drop(end);

        // Reconnect: the subscription is replayed under the same seqno.
        let mut end = accept(&mut accepts, &kp).await;
        let f = Frame::read_from(&mut end.reader).await.unwrap();
        assert_eq!(f.cmd, CMD_MESSAGE);
        assert_eq!(f.seqno, seqno, "replay must reuse the original seqno");
        Frame::new(seqno, CMD_RESPONSE, sub_status_body(77, 88)).write_to(&mut end.writer).await.unwrap();
        Frame::new(seqno, CMD_RESULT, result_bytes.clone()).write_to(&mut end.writer).await.unwrap();
        // Finally end the subscription.
        Frame::new(seqno, CMD_END, Vec::new()).write_to(&mut end.writer).await.unwrap();
        end
    });

    let link = PeerLink::connect(Arc::new(transport), vk).await.unwrap();
    let (umid, mut events) = link.subscribe(&sub_msg).await.unwrap();
    assert_eq!(umid.mid, 77);
    assert_eq!(umid.sig, 88);

    // Result before the drop.
    match events.recv().await.unwrap() {
        PeerEvent::Message(m) => assert_eq!(m.encoded, result_msg.encoded),
        other => panic!("unexpected event {other:?}"),
    }
    // Result after the reconnect; no duplicate end event in between.
    match events.recv().await.unwrap() {
        PeerEvent::Message(m) => assert_eq!(m.encoded, result_msg.encoded),
        other => panic!("unexpected event {other:?}"),
    }
    // The remote end fires the end event exactly once.
    assert!(matches!(events.recv().await.unwrap(), PeerEvent::End));
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_point_request_fails_on_disconnect() {
    let kp = remote();
    let vk = kp.vk();
    let (transport, mut accepts) = MemoryTransport::new(CERT_SIG.to_vec());
    let msg = test_message("a/b");

    let server = tokio::spawn(async move {
        let mut end = accept(&mut accepts, &kp).await;
        // Read the request, then drop without answering.
        let _ = Frame::read_from(&mut end.reader).await.unwrap();
        drop(end);
        // Serve the reconnect so the client loop settles.
        let _end = accept(&mut accepts, &kp).await;
        std::future::pending::<()>().await;
    });

    let link = PeerLink::connect(Arc::new(transport), vk).await.unwrap();
    let err = link.publish(&msg).await.unwrap_err();
    assert!(matches!(err, PeerError::Disconnected));
    server.abort();
}

#[tokio::test]
async fn test_dropped_link_stops_reconnecting() {
    let kp = remote();
    let vk = kp.vk();
    let (transport, mut accepts) = MemoryTransport::new(CERT_SIG.to_vec());

    let (link, end) = tokio::join!(PeerLink::connect(Arc::new(transport), vk), accept(&mut accepts, &kp));
    let link = link.unwrap();

    // Drop every strong handle, then sever the connection: the receive
    // loop must exit rather than dial again.
    drop(link);
    drop(end);
    match tokio::time::timeout(Duration::from_millis(200), accepts.recv()).await {
        Ok(Some(_)) => panic!("an unreferenced link must not reconnect"),
        // Either the accept channel closed (the transport died with the
        // link) or nothing dialed in: both mean the loop is gone.
        Ok(None) | Err(_) => {}
    }
}

#[tokio::test]
async fn test_query_stream_ends() {
    let kp = remote();
    let vk = kp.vk();
    let (transport, mut accepts) = MemoryTransport::new(CERT_SIG.to_vec());
    let msg = test_message("a/b");
    let result = test_message("a/b");
    let result_bytes = result.encoded.clone();

    let server = tokio::spawn(async move {
        let mut end = accept(&mut accepts, &kp).await;
        let f = Frame::read_from(&mut end.reader).await.unwrap();
        Frame::new(f.seqno, CMD_RESPONSE, ok_status_body()).write_to(&mut end.writer).await.unwrap();
        Frame::new(f.seqno, CMD_RESULT, result_bytes).write_to(&mut end.writer).await.unwrap();
        // A malformed result is dropped, not fatal.
        Frame::new(f.seqno, CMD_RESULT, b"garbage".to_vec()).write_to(&mut end.writer).await.unwrap();
        Frame::new(f.seqno, CMD_END, Vec::new()).write_to(&mut end.writer).await.unwrap();
        end
    });

    let link = PeerLink::connect(Arc::new(transport), vk).await.unwrap();
    let mut events = link.query(&msg).await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), PeerEvent::Message(_)));
    assert!(matches!(events.recv().await.unwrap(), PeerEvent::End));
    server.await.unwrap();
}
