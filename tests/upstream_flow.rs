//! End-to-end flow-control tests over a loopback collector.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use av_uplink::events::EventBus;
use av_uplink::pipeline::{
    EncoderPipeline, EncoderPipelineConfig, MediaBuffer, MediaPipeline, PipelineFault,
};
use av_uplink::upstream::{UpstreamController, UpstreamState, TOKEN_LEN};

struct Rig {
    pipeline: Arc<dyn MediaPipeline>,
    upstream: Arc<UpstreamController>,
    events: Arc<EventBus>,
    fault_rx: mpsc::UnboundedReceiver<PipelineFault>,
    listener: TcpListener,
    port: u16,
}

async fn rig() -> Rig {
    let events = Arc::new(EventBus::new());
    let (fault_tx, fault_rx) = mpsc::unbounded_channel();
    let pipeline: Arc<dyn MediaPipeline> = Arc::new(EncoderPipeline::new(
        EncoderPipelineConfig {
            // Small bound so a single pushed buffer can overrun the queue
            queue_max: Duration::from_millis(200),
            ..Default::default()
        },
        events.clone(),
        fault_tx.clone(),
    ));
    let upstream = UpstreamController::new(pipeline.clone(), events.clone(), fault_tx, true);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    Rig {
        pipeline,
        upstream,
        events,
        fault_rx,
        listener,
        port,
    }
}

fn media(len: usize, millis: u64) -> MediaBuffer {
    MediaBuffer::new(Bytes::from(vec![0u8; len]), Duration::from_millis(millis))
}

/// Push an oversized buffer to force the backlog, then keep trickling
/// small buffers until the drain brings the engine to transmitting.
async fn drive_to_transmitting(rig: &Rig) {
    rig.pipeline.queue().push(media(4096, 300)).await;

    for _ in 0..200 {
        if rig.upstream.state() == UpstreamState::Transmitting {
            return;
        }
        rig.pipeline.queue().push(media(512, 10)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("engine never reached transmitting");
}

#[tokio::test]
async fn backlog_then_drain_reaches_transmitting() {
    let rig = rig().await;
    rig.upstream
        .enable("127.0.0.1", rig.port, None)
        .await
        .unwrap();
    assert_eq!(rig.upstream.state(), UpstreamState::Connecting);

    let (mut peer, _) = rig.listener.accept().await.unwrap();
    let drain = tokio::spawn(async move {
        let mut sink = Vec::new();
        let _ = peer.read_to_end(&mut sink).await;
        sink
    });

    // One buffer larger than the queue bound: overruns, the engine holds
    // capture, the writer drains it, the underrun resumes transmission
    drive_to_transmitting(&rig).await;

    rig.upstream.disable().await.unwrap();
    assert_eq!(rig.upstream.state(), UpstreamState::Disabled);

    let sunk = drain.await.unwrap();
    assert!(sunk.len() >= 4096);
}

#[tokio::test]
async fn state_changes_appear_on_the_event_bus() {
    let rig = rig().await;
    let mut rx = rig.events.subscribe();

    rig.upstream
        .enable("127.0.0.1", rig.port, None)
        .await
        .unwrap();
    let (mut peer, _) = rig.listener.accept().await.unwrap();
    tokio::spawn(async move {
        let mut sink = Vec::new();
        let _ = peer.read_to_end(&mut sink).await;
    });

    drive_to_transmitting(&rig).await;
    rig.upstream.disable().await.unwrap();

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let av_uplink::events::SystemEvent::UpstreamStateChanged { state } = event {
            states.push(state);
        }
    }
    // connecting, waiting, transmitting, disabled
    assert_eq!(states, vec![1, 2, 3, 0]);
}

#[tokio::test]
async fn token_precedes_all_media() {
    let rig = rig().await;
    rig.upstream
        .enable("127.0.0.1", rig.port, Some("0123456789abcdef0123456789abcdef0123"))
        .await
        .unwrap();
    let (mut peer, _) = rig.listener.accept().await.unwrap();

    rig.pipeline.queue().push(media(64, 10)).await;

    let mut head = vec![0u8; TOKEN_LEN + 64];
    peer.read_exact(&mut head).await.unwrap();
    assert_eq!(&head[..TOKEN_LEN], b"0123456789abcdef0123456789abcdef0123");

    rig.upstream.disable().await.unwrap();
}

#[tokio::test]
async fn peer_disconnect_surfaces_transport_fault() {
    let mut rig = rig().await;
    rig.upstream
        .enable("127.0.0.1", rig.port, None)
        .await
        .unwrap();
    let (peer, _) = rig.listener.accept().await.unwrap();
    drop(peer);

    // Keep feeding until the broken pipe is observed
    let fault = loop {
        rig.pipeline.queue().push(media(16 * 1024, 1)).await;
        match rig.fault_rx.try_recv() {
            Ok(fault) => break fault,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };
    assert!(matches!(fault, PipelineFault::TransportWrite { .. }));
}

#[tokio::test]
async fn enable_rejects_unreachable_collector() {
    let rig = rig().await;
    let closed_port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };
    assert!(rig
        .upstream
        .enable("127.0.0.1", closed_port, None)
        .await
        .is_err());
    assert_eq!(rig.upstream.state(), UpstreamState::Disabled);
}

#[tokio::test]
async fn disable_is_idempotent_only_while_enabled() {
    let rig = rig().await;
    assert!(rig.upstream.disable().await.is_err());

    rig.upstream
        .enable("127.0.0.1", rig.port, None)
        .await
        .unwrap();
    let _ = TcpStream::connect(("127.0.0.1", rig.port)).await;

    rig.upstream.disable().await.unwrap();
    assert!(rig.upstream.disable().await.is_err());
}
