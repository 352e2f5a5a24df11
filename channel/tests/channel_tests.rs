use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use warden_channel::{
    Channel, ChannelConfig, ChannelError, ChannelPhase, Delivery, DeliveryError, EventLoop,
    Outbound,
};
use warden_container::{Connectivity, Container, ContainerState, MemoryContainer};
use warden_core::{
    FRAME_HEADER_LEN, FrameDecoder, GuestCode, GuestMessage, HostCode, HostMessage, encode_frame,
};

const WAIT: Duration = Duration::from_secs(2);

// Field order is drop order: the channel goes before its container.
struct Harness {
    channel: Channel,
    container: Rc<MemoryContainer>,
    event_loop: EventLoop,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let event_loop = EventLoop::new();
        let container = Rc::new(MemoryContainer::new("vm-7"));
        container.set_dns_server("10.0.2.3");
        container.set_state(ContainerState::Booting);
        let config = ChannelConfig::for_container(dir.path(), &container.uuid());
        let channel = Channel::new(&container, config, event_loop.clone());
        Self {
            channel,
            container,
            event_loop,
            _dir: dir,
        }
    }

    fn listening() -> Self {
        let harness = Self::new();
        harness.channel.create_endpoint().unwrap();
        harness.channel.bind_in_namespace().unwrap();
        harness.channel.begin_listening().unwrap();
        harness
    }

    fn connected() -> (Self, UnixStream) {
        let harness = Self::listening();
        let guest = harness.connect();
        (harness, guest)
    }

    fn connect(&self) -> UnixStream {
        let guest = UnixStream::connect(&self.channel.config().socket_path).unwrap();
        assert!(self.pump_until(|| self.channel.is_connected()));
        guest
    }

    fn pump_until(&self, done: impl FnMut() -> bool) -> bool {
        self.event_loop.run_until(WAIT, done).unwrap()
    }

    /// Let the event loop dispatch whatever the guest has already written.
    fn pump(&self) {
        self.event_loop.run_once(Some(Duration::from_millis(500))).unwrap();
    }
}

fn send(guest: &mut UnixStream, message: &GuestMessage) {
    guest.write_all(&encode_frame(message).unwrap()).unwrap();
}

fn read_host(guest: &mut UnixStream) -> HostMessage {
    guest.set_read_timeout(Some(WAIT)).unwrap();
    let mut header = [0u8; FRAME_HEADER_LEN];
    guest.read_exact(&mut header).unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
    guest.read_exact(&mut body).unwrap();

    let mut decoder = FrameDecoder::default();
    decoder.extend(&header);
    decoder.extend(&body);
    decoder.decode_next().unwrap().unwrap()
}

fn assert_silent(guest: &mut UnixStream) {
    guest.set_nonblocking(true).unwrap();
    let mut byte = [0u8; 1];
    match guest.read(&mut byte) {
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        other => panic!("expected no pending host message, got {:?}", other),
    }
    guest.set_nonblocking(false).unwrap();
}

#[test]
fn test_lifecycle_phases() {
    let harness = Harness::new();
    let channel = &harness.channel;
    assert_eq!(channel.phase(), ChannelPhase::Uncreated);

    assert!(matches!(
        channel.bind_in_namespace(),
        Err(ChannelError::InvalidPhase { .. })
    ));

    channel.create_endpoint().unwrap();
    assert_eq!(channel.phase(), ChannelPhase::EndpointCreated);
    assert!(matches!(
        channel.create_endpoint(),
        Err(ChannelError::InvalidPhase { .. })
    ));

    channel.bind_in_namespace().unwrap();
    assert_eq!(channel.phase(), ChannelPhase::Bound);
    assert!(channel.config().socket_path.exists());

    channel.begin_listening().unwrap();
    assert_eq!(channel.phase(), ChannelPhase::Listening);
    assert!(channel.is_listening());
    assert_eq!(harness.container.observer_count(), 1);

    let guest = harness.connect();
    assert_eq!(channel.phase(), ChannelPhase::Connected);

    drop(guest);
    assert!(harness.pump_until(|| !channel.is_connected()));
    assert_eq!(channel.phase(), ChannelPhase::Listening);

    let _guest = harness.connect();
    assert_eq!(channel.connections_accepted(), 2);

    channel.teardown();
    assert_eq!(channel.phase(), ChannelPhase::Closed);
    assert!(!channel.is_connected());
    assert!(!channel.is_listening());
    assert!(harness.event_loop.is_empty());
    assert_eq!(harness.container.observer_count(), 0);

    channel.teardown();
    assert_eq!(channel.phase(), ChannelPhase::Closed);
    assert!(matches!(
        channel.create_endpoint(),
        Err(ChannelError::InvalidPhase { .. })
    ));
    assert!(UnixStream::connect(&channel.config().socket_path).is_err());
}

#[test]
fn test_teardown_before_any_socket() {
    let harness = Harness::new();
    harness.channel.teardown();
    harness.channel.teardown();
    assert_eq!(harness.channel.phase(), ChannelPhase::Closed);
}

#[test]
fn test_bind_replaces_stale_socket() {
    let first = Harness::listening();
    let path = first.channel.config().socket_path.clone();
    first.channel.teardown();
    assert!(path.exists());

    let container = Rc::new(MemoryContainer::new("vm-8"));
    let channel = Channel::new(&container, ChannelConfig::new(&path), EventLoop::new());
    channel.create_endpoint().unwrap();
    channel.bind_in_namespace().unwrap();
    channel.begin_listening().unwrap();
    assert!(channel.is_listening());
}

#[test]
fn test_boot_completed_sets_running() {
    let (harness, mut guest) = Harness::connected();
    send(&mut guest, &GuestMessage::new(GuestCode::BootCompleted));

    assert!(harness.pump_until(|| harness.container.state() == ContainerState::Running));
}

#[test]
fn test_name_request_gets_one_reply() {
    let (harness, mut guest) = Harness::connected();
    send(&mut guest, &GuestMessage::new(GuestCode::ContainerCfgNameReq));
    harness.pump();

    let reply = read_host(&mut guest);
    assert_eq!(reply.kind(), Ok(HostCode::ContainerCfgName));
    assert_eq!(reply.container_name.as_deref(), Some("vm-7"));
    assert_silent(&mut guest);
}

#[test]
fn test_dns_request_gets_reply() {
    let (harness, mut guest) = Harness::connected();
    send(&mut guest, &GuestMessage::new(GuestCode::ContainerCfgDnsReq));
    harness.pump();

    let reply = read_host(&mut guest);
    assert_eq!(reply.kind(), Ok(HostCode::ContainerCfgDns));
    assert_eq!(reply.container_dns.as_deref(), Some("10.0.2.3"));
}

#[test]
fn test_shutdown_without_guest_fails() {
    let harness = Harness::listening();
    assert!(matches!(
        harness.channel.request_stop(),
        Err(DeliveryError::NotConnected)
    ));
    assert_eq!(harness.channel.suspend().unwrap(), Delivery::Skipped);
}

#[test]
fn test_shutdown_with_guest_is_sent() {
    let (harness, mut guest) = Harness::connected();
    assert_eq!(harness.channel.request_stop().unwrap(), Delivery::Sent);
    assert_eq!(read_host(&mut guest).kind(), Ok(HostCode::Shutdown));
}

#[test]
fn test_host_commands_reach_guest() {
    let (harness, mut guest) = Harness::connected();
    assert_eq!(harness.channel.suspend().unwrap(), Delivery::Sent);
    assert_eq!(harness.channel.resume().unwrap(), Delivery::Sent);
    assert_eq!(harness.channel.audio_suspend().unwrap(), Delivery::Sent);
    assert_eq!(harness.channel.audio_resume().unwrap(), Delivery::Skipped);

    assert_eq!(read_host(&mut guest).kind(), Ok(HostCode::Suspend));
    assert_eq!(read_host(&mut guest).kind(), Ok(HostCode::Resume));
    assert_eq!(read_host(&mut guest).kind(), Ok(HostCode::AudioSuspend));
    assert_silent(&mut guest);
}

#[test]
fn test_connectivity_pushed_once_per_change() {
    let (harness, mut guest) = Harness::connected();
    assert_eq!(harness.container.connectivity(), Connectivity::Offline);

    harness.container.set_connectivity(Connectivity::Connected);
    let pushed = read_host(&mut guest);
    assert_eq!(pushed.kind(), Ok(HostCode::ConnectivityChange));
    assert_eq!(pushed.connectivity_value(), Some(Connectivity::Connected));
    assert_eq!(harness.channel.last_connectivity(), Connectivity::Connected);

    harness.container.set_connectivity(Connectivity::Connected);
    assert_silent(&mut guest);
}

#[test]
fn test_guest_connectivity_is_not_echoed() {
    let (harness, mut guest) = Harness::connected();
    send(
        &mut guest,
        &GuestMessage {
            connectivity: Some(Connectivity::Limited as i32),
            ..GuestMessage::new(GuestCode::ConnectivityChange)
        },
    );

    assert!(harness.pump_until(|| harness.container.connectivity() == Connectivity::Limited));
    assert_eq!(harness.channel.last_connectivity(), Connectivity::Limited);
    assert_silent(&mut guest);
}

#[test]
fn test_connectivity_change_while_disconnected_is_retried() {
    let harness = Harness::listening();
    harness.container.set_connectivity(Connectivity::Connected);
    assert_eq!(harness.channel.last_connectivity(), Connectivity::Offline);

    let mut guest = harness.connect();
    harness.container.set_connectivity(Connectivity::Connected);
    let pushed = read_host(&mut guest);
    assert_eq!(pushed.connectivity_value(), Some(Connectivity::Connected));
}

#[test]
fn test_oversized_frame_drops_connection_only() {
    let (harness, mut guest) = Harness::connected();
    guest.write_all(&u32::MAX.to_be_bytes()).unwrap();

    assert!(harness.pump_until(|| !harness.channel.is_connected()));
    assert!(harness.channel.is_listening());

    let mut guest = harness.connect();
    send(&mut guest, &GuestMessage::new(GuestCode::BootCompleted));
    assert!(harness.pump_until(|| harness.container.state() == ContainerState::Running));
}

#[test]
fn test_truncated_frame_drops_connection() {
    let (harness, mut guest) = Harness::connected();
    let frame = encode_frame(&GuestMessage::new(GuestCode::ContainerCfgNameReq)).unwrap();
    guest.write_all(&frame[..frame.len() - 1]).unwrap();
    guest.shutdown(Shutdown::Write).unwrap();

    assert!(harness.pump_until(|| !harness.channel.is_connected()));
    assert!(harness.channel.is_listening());
    assert_eq!(harness.channel.phase(), ChannelPhase::Listening);
}

#[test]
fn test_invalid_payload_drops_connection() {
    let (harness, mut guest) = Harness::connected();
    send(&mut guest, &GuestMessage::new(GuestCode::ConnectivityChange));

    assert!(harness.pump_until(|| !harness.channel.is_connected()));
    assert_eq!(harness.container.connectivity(), Connectivity::Offline);
}

#[test]
fn test_oversized_exec_request_drops_connection() {
    let (harness, mut guest) = Harness::connected();
    send(
        &mut guest,
        &GuestMessage {
            exec_path: Some("/bin/date".to_string()),
            exec_args: vec!["x".to_string(); 1000],
            ..GuestMessage::new(GuestCode::ExecCapSystimePriv)
        },
    );

    assert!(harness.pump_until(|| !harness.channel.is_connected()));
    assert!(harness.container.exec_invocations().is_empty());
}

#[test]
fn test_frames_in_one_write_are_all_dispatched() {
    let (harness, mut guest) = Harness::connected();
    let mut bytes = encode_frame(&GuestMessage::new(GuestCode::BootCompleted)).unwrap();
    bytes.extend(
        encode_frame(&GuestMessage {
            mac: Some("02:00:00:00:00:01".to_string()),
            ..GuestMessage::new(GuestCode::ImeiMacPhoneno)
        })
        .unwrap(),
    );
    guest.write_all(&bytes).unwrap();

    assert!(harness.pump_until(|| harness.container.mac_address().is_some()));
    assert_eq!(harness.container.state(), ContainerState::Running);
    assert_eq!(harness.container.imei(), None);
}

#[test]
fn test_message_before_eof_is_dispatched() {
    let (harness, mut guest) = Harness::connected();
    send(&mut guest, &GuestMessage::new(GuestCode::MasterClear));
    drop(guest);

    assert!(harness.pump_until(|| !harness.channel.is_connected()));
    assert_eq!(harness.container.snapshot().wipe_calls, 1);
}

#[test]
fn test_exec_request_end_to_end() {
    let (harness, mut guest) = Harness::connected();
    send(
        &mut guest,
        &GuestMessage {
            exec_path: Some("/bin/date".to_string()),
            exec_args: vec!["-s".to_string(), "now".to_string()],
            ..GuestMessage::new(GuestCode::ExecCapSystimePriv)
        },
    );

    assert!(harness.pump_until(|| !harness.container.exec_invocations().is_empty()));
    let argv = &harness.container.exec_invocations()[0];
    assert_eq!(argv.len(), 4);
    assert_eq!(argv[0].as_deref(), Some("/bin/date"));
    assert_eq!(argv[1].as_deref(), Some("-s"));
    assert_eq!(argv[2].as_deref(), Some("now"));
    assert_eq!(argv[3], None);
    assert!(harness.channel.is_connected());
}

#[test]
fn test_guest_shutdown_stops_container() {
    let (harness, mut guest) = Harness::connected();
    harness.container.set_state(ContainerState::Running);
    send(&mut guest, &GuestMessage::new(GuestCode::Shutdown));

    assert!(harness.pump_until(|| harness.container.state() == ContainerState::Stopped));
    assert_eq!(harness.container.snapshot().stop_calls, 1);
}

#[test]
fn test_audit_round_trip() {
    let (harness, mut guest) = Harness::connected();
    let record = encode_frame(&HostMessage::command(HostCode::AuditComplete)).unwrap();

    harness.channel.audit().send_record(&record).unwrap();
    assert_eq!(
        harness.channel.audit().notify_remaining_storage(512).unwrap(),
        Delivery::Sent
    );
    assert_eq!(harness.channel.audit().notify_complete().unwrap(), Delivery::Sent);

    assert_eq!(read_host(&mut guest).kind(), Ok(HostCode::AuditComplete));
    let notify = read_host(&mut guest);
    assert_eq!(notify.kind(), Ok(HostCode::AuditNotify));
    assert_eq!(notify.audit_remaining_storage, Some(512));
    assert_eq!(read_host(&mut guest).kind(), Ok(HostCode::AuditComplete));

    send(
        &mut guest,
        &GuestMessage {
            audit_ack: Some(b"record-1".to_vec()),
            ..GuestMessage::new(GuestCode::AuditAck)
        },
    );
    assert!(harness.pump_until(|| !harness.container.audit_acks().is_empty()));
    assert_eq!(harness.container.audit_acks(), vec![b"record-1".to_vec()]);
}

#[test]
fn test_write_failure_keeps_connection() {
    let (harness, guest) = Harness::connected();
    drop(guest);

    assert!(matches!(
        harness.channel.suspend(),
        Err(DeliveryError::Io(_))
    ));
    assert!(harness.channel.is_connected());

    assert!(harness.pump_until(|| !harness.channel.is_connected()));
    assert_eq!(harness.channel.suspend().unwrap(), Delivery::Skipped);
}

#[test]
fn test_full_guest_buffer_keeps_frames_intact() {
    let (harness, mut guest) = Harness::connected();
    let name = "n".repeat(60_000);

    let mut sent = 0;
    let refused = loop {
        match harness.channel.send(Outbound::ContainerName(name.clone())) {
            Ok(Delivery::Sent) => sent += 1,
            Ok(Delivery::Skipped) => panic!("guest is connected"),
            Err(e) => break e,
        }
        assert!(sent < 1000, "socket buffer never filled");
    };
    assert!(matches!(
        refused,
        DeliveryError::Io(ref e) if e.kind() == ErrorKind::WouldBlock
    ));
    assert!(harness.channel.is_connected());

    guest.set_nonblocking(true).unwrap();
    let mut decoder = FrameDecoder::default();
    let mut received = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    let deadline = Instant::now() + WAIT;
    while received.len() < sent && Instant::now() < deadline {
        harness.event_loop.run_once(Some(Duration::from_millis(10))).unwrap();
        match guest.read(&mut buf) {
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => panic!("guest read failed: {}", e),
        }
        while let Some(message) = decoder.decode_next::<HostMessage>().unwrap() {
            received.push(message);
        }
    }

    assert_eq!(received.len(), sent);
    assert!(
        received
            .iter()
            .all(|m| m.container_name.as_deref() == Some(name.as_str()))
    );
    assert_eq!(decoder.buffered(), 0);

    guest.set_nonblocking(false).unwrap();
    assert_eq!(harness.channel.request_stop().unwrap(), Delivery::Sent);
    assert_eq!(read_host(&mut guest).kind(), Ok(HostCode::Shutdown));
}

#[test]
fn test_second_guest_waits_for_first() {
    let (harness, first) = Harness::connected();
    let mut second = UnixStream::connect(&harness.channel.config().socket_path).unwrap();
    harness.pump();
    assert_eq!(harness.channel.connections_accepted(), 1);

    drop(first);
    assert!(harness.pump_until(|| harness.channel.connections_accepted() == 2));

    send(&mut second, &GuestMessage::new(GuestCode::BootCompleted));
    assert!(harness.pump_until(|| harness.container.state() == ContainerState::Running));
}

#[test]
fn test_observer_failure_keeps_listening() {
    let harness = Harness::new();
    harness.container.fail_observer_registration(true);
    harness.channel.create_endpoint().unwrap();
    harness.channel.bind_in_namespace().unwrap();

    assert!(matches!(
        harness.channel.begin_listening(),
        Err(ChannelError::Observer(_))
    ));
    assert!(harness.channel.is_listening());

    let _guest = harness.connect();
    assert_eq!(harness.channel.phase(), ChannelPhase::Connected);
}

#[test]
fn test_dropping_channel_deregisters_everything() {
    let (harness, _guest) = Harness::connected();
    let Harness {
        _dir,
        event_loop,
        container,
        channel,
    } = harness;

    assert_eq!(event_loop.len(), 2);
    drop(channel);
    assert!(event_loop.is_empty());
    assert_eq!(container.observer_count(), 0);
}
