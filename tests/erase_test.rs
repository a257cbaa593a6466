//! Full-chip erase integration tests.

mod common;

use flashflux::config::LoaderConfig;
use flashflux::connection::ConnectionState;
use flashflux::error::{ErrorKind, FlashError};
use flashflux::loader::BinarySegmentLoader;
use flashflux::sink::Severity;
use std::sync::Arc;
use tokio::sync::Notify;

use common::{init_tracing, orchestrator, Call, MockTransport, RecordingSink};

fn local_loader() -> BinarySegmentLoader {
    BinarySegmentLoader::new(&LoaderConfig::local(".").expect("loader config"))
}

#[tokio::test]
async fn test_unconfirmed_erase_is_cancelled_without_io() {
    init_tracing();

    let transport = MockTransport::healthy();
    let sink = Arc::new(RecordingSink::default());
    let flasher = orchestrator(&transport, local_loader(), &sink);

    flasher.connect(115_200).await.expect("connect");
    transport.clear_calls();

    let err = flasher.erase(false).await.expect_err("not confirmed");

    assert!(matches!(err, FlashError::Cancelled));
    assert_eq!(err.kind(), ErrorKind::UserCancelled);
    assert!(transport.calls().is_empty());
    assert_eq!(flasher.state(), ConnectionState::Connected);
    assert!(!sink.has_log(Severity::Error, ""), "a cancellation is not an error");
}

#[tokio::test]
async fn test_confirmed_erase_wipes_flash_and_keeps_session() {
    init_tracing();

    let transport = MockTransport::healthy();
    let sink = Arc::new(RecordingSink::default());
    let flasher = orchestrator(&transport, local_loader(), &sink);

    flasher.connect(115_200).await.expect("connect");
    transport.clear_calls();

    flasher.erase(true).await.expect("erase");

    assert_eq!(transport.calls(), vec![Call::EraseAll]);
    assert_eq!(flasher.state(), ConnectionState::Connected);
    assert!(sink.has_log(Severity::Warning, "Do NOT unplug"));
    assert!(sink.has_log(Severity::Success, "Flash erased successfully"));
}

#[tokio::test]
async fn test_erase_timeout_is_protocol_write_failure() {
    init_tracing();

    let transport = MockTransport::healthy();
    let sink = Arc::new(RecordingSink::default());
    let flasher = orchestrator(&transport, local_loader(), &sink);

    flasher.connect(115_200).await.expect("connect");
    transport.script(|script| script.erase_timeout = true);

    let err = flasher.erase(true).await.expect_err("erase times out");

    assert!(matches!(err, FlashError::Erase(_)));
    assert_eq!(err.kind(), ErrorKind::ProtocolWriteFailed);
    assert_eq!(flasher.state(), ConnectionState::Connected);
    assert_eq!(transport.count(&Call::Reset), 0);
    assert!(sink.has_log(Severity::Error, "Erase failed"));
}

#[tokio::test]
async fn test_erase_requires_connection() {
    init_tracing();

    let transport = MockTransport::healthy();
    let sink = Arc::new(RecordingSink::default());
    let flasher = orchestrator(&transport, local_loader(), &sink);

    let err = flasher.erase(true).await.expect_err("not connected");

    assert!(matches!(err, FlashError::NotConnected));
    assert!(transport.calls().is_empty());
    assert_eq!(flasher.state(), ConnectionState::Disconnected);
    assert!(sink.has_log(Severity::Warning, "Connect to the device first"));
}

/// Disconnecting mid-erase waits for the erase, then tears the link down.
#[tokio::test]
async fn test_disconnect_while_erasing_ends_disconnected() {
    init_tracing();

    let gate = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    let transport = MockTransport::healthy();
    transport.script(|script| {
        script.erase_gate = Some(Arc::clone(&gate));
        script.erase_started = Arc::clone(&started);
    });
    let sink = Arc::new(RecordingSink::default());
    let flasher = orchestrator(&transport, local_loader(), &sink);

    flasher.connect(115_200).await.expect("connect");
    transport.clear_calls();

    let erasing = tokio::spawn({
        let flasher = Arc::clone(&flasher);
        async move { flasher.erase(true).await }
    });
    started.notified().await;
    assert_eq!(flasher.state(), ConnectionState::Erasing);

    let disconnecting = tokio::spawn({
        let flasher = Arc::clone(&flasher);
        async move { flasher.disconnect().await }
    });
    while flasher.state() != ConnectionState::Disconnecting {
        tokio::task::yield_now().await;
    }

    gate.notify_one();
    erasing
        .await
        .expect("task should not panic")
        .expect("erase was not interrupted");
    disconnecting.await.expect("task should not panic");

    assert_eq!(flasher.state(), ConnectionState::Disconnected);
    assert_eq!(
        transport.calls(),
        vec![Call::EraseAll, Call::Reset, Call::Close]
    );
}
