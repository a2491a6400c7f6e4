//! End-to-end call scenarios across endpoints, routing and media

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;

use tandem_call_core::{
    Call, CallEndReason, CallObserver, Connection, LocalEndpoint, Manager, ManagerConfig,
    MixerEndpoint, NetworkEndpoint, NetworkEndpointConfig, Phase, StringOptions, UserInputMode,
    RFC2833_PAYLOAD_TYPE,
};
use tandem_media_core::dtmf::Rfc2833Event;
use tandem_media_core::format::names;
use tandem_rtp_core::packet::{RtpHeader, RtpPacket};

#[derive(Default)]
struct RecordingObserver {
    cleared: Mutex<Vec<(String, Option<CallEndReason>)>>,
    established: Mutex<Vec<String>>,
}

impl CallObserver for RecordingObserver {
    fn on_established_call(&self, call: &Arc<Call>) {
        self.established.lock().push(call.token().to_string());
    }

    fn on_cleared_call(&self, call: &Arc<Call>) {
        self.cleared
            .lock()
            .push((call.token().to_string(), call.end_reason()));
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn network_connection(call: &Arc<Call>) -> Arc<Connection> {
    call.connections()
        .into_iter()
        .find(|c| c.is_network_connection())
        .expect("call has a network connection")
}

fn local_connection(call: &Arc<Call>) -> Arc<Connection> {
    call.connections()
        .into_iter()
        .find(|c| !c.is_network_connection())
        .expect("call has a local connection")
}

#[tokio::test]
async fn inbound_network_call_routes_to_local_endpoint() {
    let manager = Manager::new(ManagerConfig::default());
    let observer = Arc::new(RecordingObserver::default());
    manager.add_call_observer(observer.clone());

    let h323 = NetworkEndpoint::new(&manager, "h323");
    let _pc = LocalEndpoint::new(&manager);
    manager.add_route("h323:.*\t.* = pc:<da>").unwrap();

    let call = h323
        .new_incoming_call("h323:alice@1.2.3.4", "bob", &StringOptions::new())
        .await
        .unwrap();

    // Fully synchronous set-up: both legs are established on return
    assert!(call.is_established());
    assert_eq!(call.connections().len(), 2);
    for connection in call.connections() {
        assert_eq!(connection.phase(), Phase::Established);
    }

    // Audio negotiated to G.711 uLaw, the most preferred common format
    let streams = network_connection(&call).media_streams().await;
    assert!(!streams.is_empty());
    assert!(streams.iter().all(|s| s.format().name() == names::PCMU));

    // Remote clears; both connections must come down and the garbage
    // collector reclaims the call with the remote-user reason
    let token = network_connection(&call).token().to_string();
    assert!(h323.inject_release(&token, None).await);

    wait_until(|| manager.active_call_count() == 0, "call reclaimed").await;
    let cleared = observer.cleared.lock();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].1, Some(CallEndReason::RemoteUser));
}

#[tokio::test]
async fn rtp_media_reaches_local_speaker() {
    let manager = Manager::new(ManagerConfig::default());
    let h323 = NetworkEndpoint::new(&manager, "h323");
    let pc = LocalEndpoint::new(&manager);
    manager.add_route("h323:.*\t.* = pc:<da>").unwrap();

    let call = h323
        .new_incoming_call("h323:alice@1.2.3.4", "bob", &StringOptions::new())
        .await
        .unwrap();
    assert!(call.is_established());

    let net = network_connection(&call);
    let session = net.rtp_session(1).await.expect("audio RTP session");
    let mut speaker = pc
        .take_speaker(local_connection(&call).token(), 1)
        .expect("speaker channel");

    // Push RTP into the session's socket like a remote would
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = session.local_data_address();
    for i in 0..5u16 {
        let mut header = RtpHeader::new(0, 1000 + i, i as u32 * 160, 0x4242);
        header.marker = i == 0;
        let packet = RtpPacket::new(header, bytes::Bytes::from(vec![0x55u8; 160]));
        sender.send_to(&packet.serialize().unwrap(), target).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Frames traverse session -> jitter buffer -> patch -> speaker sink
    let frame = tokio::time::timeout(Duration::from_secs(3), speaker.recv())
        .await
        .expect("speaker frame within deadline")
        .expect("speaker channel open");
    assert_eq!(frame.payload.len(), 160);
    assert_eq!(frame.header.ssrc, 0x4242);

    manager.clear_call(call.token(), CallEndReason::LocalUser).await;
}

#[tokio::test]
async fn codec_mask_removes_offered_format() {
    let mut config = ManagerConfig::default();
    config.media_format_order = vec![names::G722.to_string(), names::PCMU.to_string()];
    config.media_format_mask = vec![names::ILBC.to_string()];
    let manager = Manager::new(config);

    // The A party family only offers iLBC and G.711 uLaw
    let h323 = NetworkEndpoint::with_config(
        &manager,
        "h323",
        NetworkEndpointConfig {
            format_names: Some(vec![names::ILBC.to_string(), names::PCMU.to_string()]),
            ..Default::default()
        },
    );
    let _pc = LocalEndpoint::new(&manager);
    manager.add_route("h323:.*\t.* = pc:<da>").unwrap();

    let call = h323
        .new_incoming_call("h323:gw@10.0.0.1", "100", &StringOptions::new())
        .await
        .unwrap();
    assert!(call.is_established());

    // Mask removed iLBC; G.722 is preferred but not offered, so both legs
    // negotiated G.711 uLaw
    for connection in call.connections() {
        for stream in connection.media_streams().await {
            assert_eq!(stream.format().name(), names::PCMU);
        }
    }

    manager.clear_call(call.token(), CallEndReason::LocalUser).await;
}

#[tokio::test]
async fn rfc2833_tone_goes_out_of_band() {
    let manager = Manager::new(ManagerConfig::default());
    let _pc = LocalEndpoint::new(&manager);
    let _sip = NetworkEndpoint::new(&manager, "sip");
    manager.add_route("pc:.*\t.* = sip:<da>").unwrap();

    let mut options = StringOptions::new();
    options.set("User-Input-Mode", "RFC2833");

    let call = manager
        .set_up_call("pc:caller", "sip:gw@127.0.0.1", &options, true)
        .await
        .unwrap();
    assert!(call.is_established());

    let net = network_connection(&call);
    assert_eq!(net.user_input_mode(), UserInputMode::Tone);

    // Observe the RTP the network leg emits
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = net.rtp_session(1).await.unwrap();
    session.set_remote(remote.local_addr().unwrap(), None);

    net.send_user_input_tone('5', 180).await.unwrap();

    let mut buf = [0u8; 256];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
        .await
        .expect("tone packet deadline")
        .unwrap();
    let packet = RtpPacket::parse(&buf[..len]).unwrap();
    assert_eq!(packet.header.payload_type, RFC2833_PAYLOAD_TYPE);
    assert!(packet.header.marker);

    let event = Rfc2833Event::decode(&packet.payload).unwrap();
    assert_eq!(event.event, 5);
    // 180 ms at the 8 kHz session clock
    assert_eq!(event.duration, 1440);

    // The end packet follows
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
        .await
        .expect("end packet deadline")
        .unwrap();
    let packet = RtpPacket::parse(&buf[..len]).unwrap();
    let event = Rfc2833Event::decode(&packet.payload).unwrap();
    assert!(event.end);

    // Sending a tone changes no connection state
    assert_eq!(net.phase(), Phase::Established);

    manager.clear_call(call.token(), CallEndReason::LocalUser).await;
}

#[tokio::test]
async fn synchronous_clear_all_calls_drains_everything() {
    let manager = Manager::new(ManagerConfig::default());
    let _pc = LocalEndpoint::new(&manager);
    let _sip = NetworkEndpoint::new(&manager, "sip");
    manager.add_route("pc:.*\t.* = sip:<da>").unwrap();

    let call1 = manager
        .set_up_call("pc:one", "sip:a@host", &StringOptions::new(), true)
        .await
        .unwrap();
    let call2 = manager
        .set_up_call("pc:two", "sip:b@host", &StringOptions::new(), true)
        .await
        .unwrap();
    assert!(call1.is_established());
    assert!(call2.is_established());
    assert_eq!(manager.active_call_count(), 2);

    manager.clear_all_calls(CallEndReason::LocalUser, true).await;

    assert_eq!(manager.active_call_count(), 0);
    assert!(call1.is_cleared());
    assert!(call2.is_cleared());
}

#[tokio::test]
async fn clearing_all_refuses_new_calls() {
    let manager = Manager::new(ManagerConfig::default());
    let _pc = LocalEndpoint::new(&manager);
    let _sip = NetworkEndpoint::new(&manager, "sip");
    manager.add_route("pc:.*\t.* = sip:<da>").unwrap();

    let call = manager
        .set_up_call("pc:one", "sip:a@host", &StringOptions::new(), true)
        .await
        .unwrap();
    assert!(call.is_established());

    // Hold the clearing flag open on a parallel task while we try to
    // create another call
    let blocker = manager.clone();
    let clearing = tokio::spawn(async move {
        blocker.clear_all_calls(CallEndReason::LocalUser, true).await;
    });

    // The clearing flag may need an instant to be visible
    tokio::time::sleep(Duration::from_millis(10)).await;
    let result = manager
        .set_up_call("pc:late", "sip:b@host", &StringOptions::new(), true)
        .await;

    clearing.await.unwrap();

    // Either the attempt was refused mid-clear, or clearing had already
    // finished and the late call went through; never both half-done
    match result {
        Err(_) => assert_eq!(manager.active_call_count(), 0),
        Ok(late) => {
            assert_eq!(manager.active_call_count(), 1);
            manager.clear_call_sync(late.token(), CallEndReason::LocalUser).await;
        }
    }
}

#[tokio::test]
async fn routing_failure_clears_with_no_user() {
    let manager = Manager::new(ManagerConfig::default());
    let observer = Arc::new(RecordingObserver::default());
    manager.add_call_observer(observer.clone());

    let h323 = NetworkEndpoint::new(&manager, "h323");
    // No route matches and the destination scheme has no endpoint: the
    // lookup must fail cleanly
    manager.add_route("sip:.*\t.* = pc:<da>").unwrap();

    let result = h323
        .new_incoming_call("h323:alice@1.2.3.4", "xmpp:nowhere", &StringOptions::new())
        .await;
    assert!(result.is_err());

    wait_until(|| manager.active_call_count() == 0, "failed call reclaimed").await;
    let cleared = observer.cleared.lock();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].1, Some(CallEndReason::NoUser));
}

#[tokio::test]
async fn empty_route_table_without_scheme_fails_cleanly() {
    let manager = Manager::new(ManagerConfig::default());
    let observer = Arc::new(RecordingObserver::default());
    manager.add_call_observer(observer.clone());

    // Only a local endpoint: the no-scheme fallback finds no network
    // endpoint to complete the call
    let _pc = LocalEndpoint::new(&manager);

    let result = manager
        .set_up_call("pc:alice", "nowhere", &StringOptions::new(), true)
        .await;
    assert!(result.is_err());

    wait_until(|| manager.active_call_count() == 0, "failed call reclaimed").await;
    assert_eq!(observer.cleared.lock()[0].1, Some(CallEndReason::NoUser));
}

#[tokio::test]
async fn bandwidth_budget_blocks_media() {
    let mut config = ManagerConfig::default();
    // Less than one G.711 channel
    config.default_bandwidth = 1_000;
    let manager = Manager::new(config);

    let h323 = NetworkEndpoint::new(&manager, "h323");
    let _pc = LocalEndpoint::new(&manager);
    manager.add_route("h323:.*\t.* = pc:<da>").unwrap();

    let call = h323
        .new_incoming_call("h323:alice@1.2.3.4", "bob", &StringOptions::new())
        .await
        .unwrap();

    // Signalling connected, but no stream could reserve bandwidth so the
    // call never establishes
    assert!(!call.is_established());
    for connection in call.connections() {
        assert!(connection.media_streams().await.is_empty());
        assert!(connection.phase() >= Phase::Connected);
    }

    manager.clear_call(call.token(), CallEndReason::LocalUser).await;
}

#[tokio::test]
async fn conference_pull_creates_node_on_demand() {
    let manager = Manager::new(ManagerConfig::default());
    let _pc = LocalEndpoint::new(&manager);
    let _sip = NetworkEndpoint::new(&manager, "sip");
    let mcu = MixerEndpoint::new(&manager);
    manager.add_route("pc:.*\tsip:.* = sip:<da>").unwrap();

    let call = manager
        .set_up_call("pc:alice", "sip:bob@host", &StringOptions::new(), true)
        .await
        .unwrap();
    assert!(call.is_established());
    assert!(mcu.find_node("conf42").is_none());

    manager.set_up_conference(call.token(), "mcu:conf42").await.unwrap();

    // Node created on demand and the call now points at the conference
    assert!(mcu.find_node("conf42").is_some());
    assert_eq!(call.party_b(), "mcu:conf42");
    assert_eq!(mcu.node_count(), 1);

    // A later member joins the same node rather than creating another
    let second = manager
        .set_up_call("pc:carol", "mcu:conf42", &StringOptions::new(), true)
        .await
        .unwrap();
    assert!(second.is_established());
    assert_eq!(mcu.node_count(), 1);
    let node = mcu.find_node("conf42").unwrap();
    assert!(node.member_count().await >= 1);

    manager.clear_all_calls(CallEndReason::LocalUser, true).await;
}

#[tokio::test]
async fn string_options_apply_idempotently() {
    let manager = Manager::new(ManagerConfig::default());
    let _pc = LocalEndpoint::new(&manager);
    let _sip = NetworkEndpoint::new(&manager, "sip");
    manager.add_route("pc:.*\t.* = sip:<da>").unwrap();

    let mut options = StringOptions::new();
    options.set("User-Input-Mode", "inband");
    options.set("Min-Jitter", "80");
    options.set("Max-Jitter", "400");

    let call = manager
        .set_up_call("pc:alice", "sip:bob@host", &options, true)
        .await
        .unwrap();
    let connection = network_connection(&call);

    let mode1 = connection.user_input_mode();
    let jitter1 = connection.jitter_settings();

    // Applying the same option map again changes nothing observable
    connection.apply_string_options();
    assert_eq!(connection.user_input_mode(), mode1);
    let jitter2 = connection.jitter_settings();
    assert_eq!(jitter1.min_ms, jitter2.min_ms);
    assert_eq!(jitter1.max_ms, jitter2.max_ms);
    assert_eq!(mode1, UserInputMode::InBand);
    assert_eq!(jitter1.min_ms, 80);
    assert_eq!(jitter1.max_ms, 400);

    manager.clear_call(call.token(), CallEndReason::LocalUser).await;
}

#[tokio::test]
async fn release_is_idempotent_on_end_reason() {
    let manager = Manager::new(ManagerConfig::default());
    let _pc = LocalEndpoint::new(&manager);
    let _sip = NetworkEndpoint::new(&manager, "sip");
    manager.add_route("pc:.*\t.* = sip:<da>").unwrap();

    let call = manager
        .set_up_call("pc:alice", "sip:bob@host", &StringOptions::new(), true)
        .await
        .unwrap();
    let connection = network_connection(&call);

    connection.release(CallEndReason::NoAnswer, true).await;
    assert_eq!(connection.end_reason(), Some(CallEndReason::NoAnswer));

    // Later releases must not change the recorded reason
    connection.release(CallEndReason::LocalUser, true).await;
    assert_eq!(connection.end_reason(), Some(CallEndReason::NoAnswer));
    assert_eq!(connection.phase(), Phase::Released);
}

#[tokio::test]
async fn hold_pauses_media_streams() {
    let manager = Manager::new(ManagerConfig::default());
    let _pc = LocalEndpoint::new(&manager);
    let _sip = NetworkEndpoint::new(&manager, "sip");
    manager.add_route("pc:.*\t.* = sip:<da>").unwrap();

    let call = manager
        .set_up_call("pc:alice", "sip:bob@host", &StringOptions::new(), true)
        .await
        .unwrap();
    assert!(call.is_established());

    let connection = network_connection(&call);
    connection.set_hold(false, true).await;
    assert!(connection.is_on_hold());
    for stream in connection.media_streams().await {
        assert!(stream.is_paused());
    }

    connection.set_hold(false, false).await;
    assert!(!connection.is_on_hold());
    for stream in connection.media_streams().await {
        assert!(!stream.is_paused());
    }

    manager.clear_call(call.token(), CallEndReason::LocalUser).await;
}

#[tokio::test]
async fn q931_cause_carries_through() {
    let manager = Manager::new(ManagerConfig::default());
    let observer = Arc::new(RecordingObserver::default());
    manager.add_call_observer(observer.clone());

    let h323 = NetworkEndpoint::new(&manager, "h323");
    let _pc = LocalEndpoint::new(&manager);
    manager.add_route("h323:.*\t.* = pc:<da>").unwrap();

    let call = h323
        .new_incoming_call("h323:alice@1.2.3.4", "bob", &StringOptions::new())
        .await
        .unwrap();
    let token = network_connection(&call).token().to_string();

    h323.inject_release(&token, Some(88)).await;
    wait_until(|| manager.active_call_count() == 0, "call reclaimed").await;

    let cleared = observer.cleared.lock();
    assert_eq!(cleared[0].1, Some(CallEndReason::Q931Cause(88)));
}
