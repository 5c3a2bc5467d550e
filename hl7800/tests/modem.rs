mod common;

use core::net::SocketAddr;
use std::{cell::Cell, rc::Rc};

use common::*;
use embassy_futures::join::join;
use embassy_time::{with_timeout, Duration, Instant, Timer};
use hl7800::{
    ControlLine, Event, Modem, ModemConfig, ModemError, NetworkState, PinSnapshot, SessionId,
    SleepState, SocketKind, SocketState, StartupState,
};

fn remote() -> SocketAddr {
    "192.0.2.10:7".parse().unwrap()
}

/// Answers everything needed to connect a stream socket as session 1, and to close it.
fn stream_session(message: &HostMessage) -> Vec<Response> {
    match message.command() {
        Some("AT+KTCPCFG=1,0,\"192.0.2.10\",7,,,,0,,0") => vec![now("+KTCPCFG: 1\r\nOK\r\n")],
        Some("AT+KTCPCNX=1") => vec![now("OK\r\n"), after(10, "+KTCP_IND: 1,1\r\n")],
        Some("AT+KTCPCLOSE=1") | Some("AT+KTCPDEL=1") => vec![now("OK\r\n")],
        _ => vec![],
    }
}

#[test]
fn commands_never_overlap() {
    let sim = Sim::new(|message| match message.command() {
        Some("AT+SLOW") => vec![after(500, "OK\r\n")],
        Some(_) => vec![now("OK\r\n")],
        None => vec![],
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), ModemConfig::default());
    let mut runner = modem.runner(SimReader(&sim));
    let (slow, fast) = drive(&mut runner, &sim, async {
        join(modem.send_at_command("AT+SLOW"), async {
            Timer::after_millis(50).await;
            modem.send_at_command("AT+FAST").await
        })
        .await
    });
    assert_eq!(slow, Ok(()));
    assert_eq!(fast, Ok(()));
    let slow_at = sim.sent_at("AT+SLOW")[0];
    let fast_at = sim.sent_at("AT+FAST")[0];
    assert!(fast_at - slow_at >= Duration::from_millis(500));
}

#[test]
fn timeout_is_retried() {
    let attempts = Rc::new(Cell::new(0));
    let counter = attempts.clone();
    let sim = Sim::new(move |message| match message.command() {
        Some("AT+RETRY") => {
            counter.set(counter.get() + 1);
            if counter.get() == 1 {
                vec![]
            } else {
                vec![now("OK\r\n")]
            }
        }
        _ => vec![],
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    let (retried, exhausted) = drive(&mut runner, &sim, async {
        let retried = modem
            .issue("AT+RETRY", Duration::from_millis(100), 2)
            .await;
        let exhausted = modem
            .issue("AT+SILENT", Duration::from_millis(100), 2)
            .await;
        (retried, exhausted)
    });
    assert_eq!(retried, Ok(()));
    assert_eq!(attempts.get(), 2);
    assert_eq!(exhausted, Err(ModemError::Timeout));
    assert_eq!(sim.sent_at("AT+SILENT").len(), 2);
}

#[test]
fn protocol_errors_are_not_retried() {
    let sim = Sim::new(|message| match message.command() {
        Some("AT+BAD") => vec![now("+CME ERROR: 3\r\n")],
        _ => vec![now("ERROR\r\n")],
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    let res = drive(&mut runner, &sim, async {
        (
            modem.issue("AT+BAD", Duration::from_millis(100), 3).await,
            modem.send_at_command("AT+OTHER").await,
        )
    });
    assert_eq!(res, (Err(ModemError::CmeError(3)), Err(ModemError::Io)));
    assert_eq!(sim.sent_at("AT+BAD").len(), 1);
}

#[test]
fn late_reply_is_not_attributed_to_the_next_command() {
    let sim = Sim::new(|message| match message.command() {
        Some("AT+LATE") => vec![after(200, "OK\r\n")],
        Some("AT+NEXT") => vec![now("ERROR\r\n")],
        _ => vec![],
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    let (late, next) = drive(&mut runner, &sim, async {
        let late = modem.issue("AT+LATE", Duration::from_millis(100), 1).await;
        Timer::after_millis(300).await;
        (late, modem.send_at_command("AT+NEXT").await)
    });
    assert_eq!(late, Err(ModemError::Timeout));
    assert_eq!(next, Err(ModemError::Io));
}

#[test]
fn stream_socket_round_trip() {
    let sim = Sim::new(|message| match message {
        HostMessage::Command(command) if command == "AT+KTCPSND=1,5" => {
            vec![now("CONNECT\r\n")]
        }
        HostMessage::Data(data) if data == b"hello" => {
            vec![now("OK\r\n"), after(10, "+KTCP_DATA: 1,5\r\n")]
        }
        HostMessage::Command(command) if command == "AT+KTCPRCV=1,5" => {
            vec![now("CONNECT\r\nworld--EOF--Pattern--\r\nOK\r\n")]
        }
        other => stream_session(other),
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        let socket = modem.open(SocketKind::Stream).await.unwrap();
        modem.connect(socket, remote()).await.unwrap();
        let info = modem.socket_info(socket).unwrap();
        assert_eq!(info.state, SocketState::Connected);
        assert_eq!(info.session, SessionId::Assigned(1));

        assert_eq!(modem.send(socket, b"hello").await, Ok(5));
        let payload = modem.receive(socket).await.unwrap().unwrap();
        assert_eq!(payload.as_slice(), b"world");

        modem.close(socket).await.unwrap();
        assert_eq!(modem.socket_info(socket), Err(ModemError::NotFound));

        // The slot comes back without any trace of the previous session.
        let reused = modem.open(SocketKind::Stream).await.unwrap();
        assert_eq!(reused, socket);
        let info = modem.socket_info(reused).unwrap();
        assert_eq!(info.state, SocketState::Idle);
        assert_eq!(info.session, SessionId::Pending);
        assert_eq!(info.rx_available, 0);
        assert_eq!(info.error, None);
    });
    assert_eq!(
        sim.commands(),
        [
            "AT+KTCPCFG=1,0,\"192.0.2.10\",7,,,,0,,0",
            "AT+KTCPCNX=1",
            "AT+KTCPSND=1,5",
            "AT+KTCPRCV=1,5",
            "AT+KTCPCLOSE=1",
            "AT+KTCPDEL=1",
        ]
    );
}

#[test]
fn peer_close_ends_the_stream_once() {
    let sim = Sim::new(stream_session);
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        let socket = modem.open(SocketKind::Stream).await.unwrap();
        modem.connect(socket, remote()).await.unwrap();

        sim.inject("+KTCP_NOTIF: 1,4\r\n");
        assert_eq!(modem.receive(socket).await, Ok(None));
        assert_eq!(
            modem.receive(socket).await,
            Err(ModemError::NotConnected)
        );
        assert_eq!(
            modem.socket_info(socket).unwrap().state,
            SocketState::ClosedByPeer
        );
        assert_eq!(
            modem.send(socket, b"hello").await,
            Err(ModemError::NotConnected)
        );
        modem.close(socket).await.unwrap();
    });
    let commands = sim.commands();
    assert!(!commands.iter().any(|command| command.starts_with("AT+KTCPSND")));
    // The peer already closed the session, so it's only deleted.
    assert!(!commands.iter().any(|command| command == "AT+KTCPCLOSE=1"));
    assert_eq!(commands.last().map(String::as_str), Some("AT+KTCPDEL=1"));
}

#[test]
fn close_during_receive_is_delivered_after_the_data() {
    let sim = Sim::new(|message| match message.command() {
        Some("AT+KTCPRCV=1,3") => vec![now(
            "CONNECT\r\nabc--EOF--Pattern--\r\n+KTCP_NOTIF: 1,4\r\nOK\r\n",
        )],
        _ => stream_session(message),
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        let socket = modem.open(SocketKind::Stream).await.unwrap();
        modem.connect(socket, remote()).await.unwrap();

        sim.inject("+KTCP_DATA: 1,3\r\n");
        let payload = modem.receive(socket).await.unwrap().unwrap();
        assert_eq!(payload.as_slice(), b"abc");
        assert_eq!(modem.receive(socket).await, Ok(None));
        assert_eq!(
            modem.receive(socket).await,
            Err(ModemError::NotConnected)
        );
    });
}

#[test]
fn datagram_socket_sends_to_destination() {
    let sim = Sim::new(|message| match message {
        HostMessage::Command(command) if command == "AT+KUDPCFG=1,0,,,,,0,0" => {
            vec![now("+KUDPCFG: 2\r\nOK\r\n"), after(10, "+KUDP_IND: 2,1\r\n")]
        }
        HostMessage::Command(command) if command.starts_with("AT+KUDPSND=2,") => {
            vec![now("CONNECT\r\n")]
        }
        HostMessage::Data(_) => vec![now("OK\r\n")],
        HostMessage::Command(command) if command == "AT+KUDPCLOSE=2" => vec![now("OK\r\n")],
        _ => vec![],
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        let socket = modem.open(SocketKind::Datagram).await.unwrap();
        assert_eq!(
            modem.socket_info(socket).unwrap().session,
            SessionId::Assigned(2)
        );
        assert_eq!(
            modem.send(socket, b"ping").await,
            Err(ModemError::InvalidArgument)
        );
        assert_eq!(
            modem
                .send_to(socket, "198.51.100.1:53".parse().unwrap(), b"q")
                .await,
            Ok(1)
        );
        modem.connect(socket, remote()).await.unwrap();
        assert_eq!(
            modem.send_vectored(socket, &[b"pi", b"ng"]).await,
            Ok(4)
        );
        assert_eq!(
            modem.send(socket, &[0; 1501]).await,
            Err(ModemError::InvalidArgument)
        );
        modem.close(socket).await.unwrap();
    });
    assert!(sim
        .received()
        .iter()
        .any(|(_, message)| *message == HostMessage::Data(b"ping".to_vec())));
    assert_eq!(
        sim.commands(),
        [
            "AT+KUDPCFG=1,0,,,,,0,0",
            "AT+KUDPSND=2,\"198.51.100.1\",53,1",
            "AT+KUDPSND=2,\"192.0.2.10\",7,4",
            "AT+KUDPCLOSE=2",
        ]
    );
}

#[test]
fn reboot_detaches_sessions_and_reconfigures() {
    let sim = Sim::new(|message| match message.command() {
        Some("AT+KCNXCFG=1,\"GPRS\",\"\",,,\"IPV4V6\"")
        | Some("AT+KTCPCFG?")
        | Some("AT+KUDPCFG?") => vec![now("OK\r\n")],
        _ => stream_session(message),
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        let first = modem.open(SocketKind::Stream).await.unwrap();
        modem.connect(first, remote()).await.unwrap();

        sim.inject("+KSUP: 0\r\n");
        assert_eq!(modem.receive(first).await, Ok(None));

        // The rebooted modem hands out session 1 again.
        let second = modem.open(SocketKind::Stream).await.unwrap();
        modem.connect(second, remote()).await.unwrap();
        let info = modem.socket_info(second).unwrap();
        assert_eq!(info.session, SessionId::Assigned(1));
        assert_eq!(info.state, SocketState::Connected);

        let info = modem.socket_info(first).unwrap();
        assert_eq!(info.session, SessionId::Pending);
        assert_eq!(info.state, SocketState::Error);
        assert_eq!(modem.take_error(first), Ok(Some(ModemError::NotConnected)));
        assert_eq!(
            modem.send(first, b"hello").await,
            Err(ModemError::NotConnected)
        );
        // Only the live session is closed.
        modem.close(first).await.unwrap();
        modem.close(second).await.unwrap();
    });
    let commands = sim.commands();
    let reconfig = commands
        .iter()
        .position(|command| command.starts_with("AT+KCNXCFG"))
        .unwrap();
    assert_eq!(
        &commands[reconfig..reconfig + 4],
        [
            "AT+KCNXCFG=1,\"GPRS\",\"\",,,\"IPV4V6\"",
            "AT+KTCPCFG?",
            "AT+KUDPCFG?",
            "AT+KTCPCFG=1,0,\"192.0.2.10\",7,,,,0,,0",
        ]
    );
    assert_eq!(sim.sent_at("AT+KCNXCFG=1,\"GPRS\",\"\",,,\"IPV4V6\"").len(), 1);
    assert_eq!(sim.sent_at("AT+KTCPDEL=1").len(), 1);
}

#[test]
fn cancelled_send_leaves_the_socket_usable() {
    let sends = Rc::new(Cell::new(0));
    let counter = sends.clone();
    let sim = Sim::new(move |message| match message {
        HostMessage::Command(command) if command == "AT+KTCPSND=1,5" => {
            counter.set(counter.get() + 1);
            if counter.get() == 1 {
                vec![after(200, "CONNECT\r\n")]
            } else {
                vec![now("CONNECT\r\n")]
            }
        }
        HostMessage::Data(_) => vec![now("OK\r\n")],
        other => stream_session(other),
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        let socket = modem.open(SocketKind::Stream).await.unwrap();
        modem.connect(socket, remote()).await.unwrap();

        assert!(
            with_timeout(Duration::from_millis(50), modem.send(socket, b"hello"))
                .await
                .is_err()
        );
        assert_eq!(
            modem.socket_info(socket).unwrap().state,
            SocketState::Connected
        );
        // The late CONNECT belongs to nobody.
        Timer::after_millis(400).await;
        assert_eq!(modem.send(socket, b"hello").await, Ok(5));
        assert_eq!(
            modem.socket_info(socket).unwrap().state,
            SocketState::Connected
        );
    });
    assert_eq!(sends.get(), 2);
    let blocks: Vec<_> = sim
        .received()
        .into_iter()
        .filter_map(|(_, message)| match message {
            HostMessage::Data(data) => Some(data),
            HostMessage::Command(_) => None,
        })
        .collect();
    // The abandoned block is terminated before the next command.
    assert_eq!(blocks, [Vec::new(), b"hello".to_vec()]);
}

#[test]
fn cancelled_connect_fails_the_socket() {
    let sim = Sim::new(|message| match message.command() {
        // The connection never comes up.
        Some("AT+KTCPCNX=1") => vec![now("OK\r\n")],
        _ => stream_session(message),
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        let socket = modem.open(SocketKind::Stream).await.unwrap();
        assert!(
            with_timeout(Duration::from_millis(100), modem.connect(socket, remote()))
                .await
                .is_err()
        );
        let info = modem.socket_info(socket).unwrap();
        assert_eq!(info.state, SocketState::Error);
        assert_eq!(info.error, Some(ModemError::Timeout));
        assert_eq!(
            modem.send(socket, b"hello").await,
            Err(ModemError::Timeout)
        );
        modem.close(socket).await.unwrap();
    });
    // The session was created, so it's deleted on close.
    assert_eq!(sim.sent_at("AT+KTCPCLOSE=1").len(), 1);
    assert_eq!(sim.sent_at("AT+KTCPDEL=1").len(), 1);
}

#[test]
fn cancelled_datagram_open_frees_the_slot() {
    let sim = Sim::new(|message| match message.command() {
        // The session is created, but never reported up.
        Some("AT+KUDPCFG=1,0,,,,,0,0") => vec![now("+KUDPCFG: 2\r\nOK\r\n")],
        Some("AT+KUDPCLOSE=2") => vec![now("OK\r\n")],
        _ => vec![],
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        assert!(
            with_timeout(Duration::from_millis(100), modem.open(SocketKind::Datagram))
                .await
                .is_err()
        );
        Timer::after_millis(200).await;
        let socket = modem.open(SocketKind::Stream).await.unwrap();
        assert_eq!(socket.index(), 0);
    });
    assert_eq!(sim.sent_at("AT+KUDPCLOSE=2").len(), 1);
}

#[test]
fn full_receive_queue_reports_no_buffers() {
    let sim = Sim::new(|message| match message.command() {
        Some("AT+KTCPRCV=1,3") => vec![now("CONNECT\r\nabc--EOF--Pattern--\r\nOK\r\n")],
        Some("AT") => vec![now("OK\r\n")],
        _ => stream_session(message),
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        let socket = modem.open(SocketKind::Stream).await.unwrap();
        modem.connect(socket, remote()).await.unwrap();

        // Nobody receives, so the third payload doesn't fit.
        for _ in 0..3 {
            sim.inject("+KTCP_DATA: 1,3\r\n");
            Timer::after_millis(50).await;
        }
        assert_eq!(modem.send_at_command("AT").await, Ok(()));
        assert_eq!(modem.take_error(socket), Ok(Some(ModemError::NoBuffers)));
        assert_eq!(
            modem.socket_info(socket).unwrap().state,
            SocketState::Connected
        );
        for _ in 0..2 {
            let payload = modem.receive(socket).await.unwrap().unwrap();
            assert_eq!(payload.as_slice(), b"abc");
        }
        assert!(
            with_timeout(Duration::from_millis(20), modem.receive(socket))
                .await
                .is_err()
        );
    });
    assert_eq!(sim.sent_at("AT+KTCPRCV=1,3").len(), 3);
}

#[test]
fn stalled_raw_data_returns_to_line_mode() {
    let sim = Sim::new(|message| match message.command() {
        // Two of five bytes, then nothing.
        Some("AT+KTCPRCV=1,5") => vec![now("CONNECT\r\nab")],
        Some("AT") => vec![now("OK\r\n")],
        _ => stream_session(message),
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        let socket = modem.open(SocketKind::Stream).await.unwrap();
        modem.connect(socket, remote()).await.unwrap();

        sim.inject("+KTCP_DATA: 1,5\r\n");
        // Raw data times out, then the receive command does.
        Timer::after_millis(800).await;
        assert_eq!(modem.send_at_command("AT").await, Ok(()));
        assert_eq!(
            modem.socket_info(socket).unwrap().state,
            SocketState::Connected
        );
        assert!(
            with_timeout(Duration::from_millis(20), modem.receive(socket))
                .await
                .is_err()
        );
    });
}

#[test]
fn unowned_sessions_are_deleted() {
    let sim = Sim::new(|message| match message.command() {
        Some("AT+KTCPDEL=3") => vec![now("OK\r\n")],
        _ => vec![],
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    drive(&mut runner, &sim, async {
        sim.inject("+KTCPCFG: 3\r\n");
        Timer::after_millis(300).await;
    });
    assert_eq!(sim.commands(), ["AT+KTCPDEL=3"]);
}

#[test]
fn registration_report_triggers_status_refresh() {
    let sim = Sim::new(|message| match message.command() {
        Some("AT+COPS?") => vec![now("+COPS: 0,0,\"Operator\",7\r\nOK\r\n")],
        Some("AT+KCELLMEAS=0") => vec![now("+KCELLMEAS: -97,95,23,24,12\r\nOK\r\n")],
        _ => vec![],
    });
    let lines = LineLog::default();
    let config = ModemConfig {
        signal_quality_period: Duration::from_secs(30),
        ..test_config()
    };
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), config);
    let mut runner = modem.runner(SimReader(&sim));
    let mut listener = modem.subscribe().unwrap();
    let events = drive(&mut runner, &sim, async {
        let reported = Instant::now();
        sim.inject("+CEREG: 1,\"ABCD\",\"0123ABCD\",7\r\n");
        let mut events = Vec::new();
        while events.len() < 2 {
            let event = with_timeout(Duration::from_secs(2), listener.next_message_pure())
                .await
                .expect("event expected");
            events.push(event);
        }
        assert!(sim.sent_at("AT+COPS?")[0] - reported >= Duration::from_millis(500));
        events
    });
    assert_eq!(
        events,
        [
            Event::NetworkState(NetworkState::HomeNetwork),
            Event::SignalQuality {
                rsrp: -97,
                sinr: 12
            }
        ]
    );
    assert_eq!(modem.network_state(), NetworkState::HomeNetwork);
    assert_eq!(modem.info().operator_mode, Some(0));
}

#[test]
fn commands_wait_for_the_modem_to_leave_hibernate() {
    let sim = Sim::new(|message| match message.command() {
        Some(_) => vec![now("OK\r\n")],
        None => vec![],
    });
    let lines = LineLog::default();
    let config = ModemConfig {
        low_power: true,
        sleep_level: SleepState::Hibernate,
        allow_sleep_delay: Duration::from_millis(20),
        ..test_config()
    };
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), config);
    let mut runner = modem.runner(SimReader(&sim));
    let woke = drive(&mut runner, &sim, async {
        modem.pin_changed(ready_pins());
        Timer::after_millis(10).await;
        assert_eq!(modem.sleep_state(), SleepState::Awake);

        // Nothing to do, so the modem goes to sleep and powers down.
        Timer::after_millis(50).await;
        assert_eq!(modem.sleep_state(), SleepState::Hibernate);
        modem.pin_changed(PinSnapshot::new().with_cts(true));
        Timer::after_millis(10).await;
        let asleep = Instant::now();

        let (res, woke) = join(modem.send_at_command("AT+CSQ"), async {
            // Wait for the wake line, then let the modem take its time to boot.
            while !lines
                .borrow()
                .iter()
                .any(|(at, line, asserted)| *at >= asleep && *line == ControlLine::Wake && *asserted)
            {
                Timer::after_millis(1).await;
            }
            Timer::after_millis(30).await;
            let woke = Instant::now();
            modem.pin_changed(ready_pins());
            Timer::after_millis(5).await;
            assert!(sim.sent_at("AT+CSQ").is_empty());
            sim.inject("+KSUP: 0\r\n");
            woke
        })
        .await;
        assert_eq!(res, Ok(()));
        woke
    });
    assert!(sim.sent_at("AT+CSQ")[0] >= woke);
    assert_eq!(modem.startup_state(), StartupState::Ready);
    assert!(lines
        .borrow()
        .iter()
        .any(|(_, line, asserted)| *line == ControlLine::Wake && !*asserted));
}

#[test]
fn reset_configures_the_modem() {
    let sim = Sim::new(|message| {
        let Some(command) = message.command() else {
            return vec![];
        };
        let reply = match command {
            "AT+CGMR" => "HL7800.4.6.9.4\r\nOK\r\n",
            "AT+KSRAT?" => "+KSRAT: 0\r\nOK\r\n",
            "AT+CGMI" => "Sierra Wireless\r\nOK\r\n",
            "AT+CGMM" => "HL7800\r\nOK\r\n",
            "AT+CGSN" => "354658090012345\r\nOK\r\n",
            "AT+KGSN=3" => "+KGSN: T5640400011101\r\nOK\r\n",
            "AT+CCID?" => "+CCID: 89014103211118510720\r\nOK\r\n",
            "AT+CIMI" => "310410123456789\r\nOK\r\n",
            "AT+CGDCONT?" => "+CGDCONT: 1,\"IPV4V6\",\"iot.example\",,0,0\r\nOK\r\n",
            "AT+CEREG?" => "+CEREG: 5,2\r\nOK\r\n",
            _ => "OK\r\n",
        };
        vec![now(reply)]
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    let res = drive(&mut runner, &sim, async {
        let (res, _) = join(modem.reset(), async {
            Timer::after_millis(100).await;
            sim.inject("+KSUP: 0\r\n");
        })
        .await;
        res
    });
    assert_eq!(res, Ok(()));
    assert!(modem.is_configured());
    let info = modem.info();
    assert_eq!(info.manufacturer.as_str(), "Sierra Wireless");
    assert_eq!(info.model.as_str(), "HL7800");
    assert_eq!(info.revision.as_str(), "HL7800.4.6.9.4");
    assert!(info.new_rat_syntax);
    assert_eq!(info.imei.as_str(), "354658090012345");
    assert_eq!(info.serial_number.as_str(), "T5640400011101");
    assert_eq!(info.imsi.as_str(), "310410123456789");
    assert_eq!(info.iccid.as_str(), "89014103211118510720");
    assert_eq!(info.apn.as_str(), "iot.example");
    assert_eq!(modem.network_state(), NetworkState::Searching);
    assert_eq!(modem.startup_state(), StartupState::Ready);

    let commands = sim.commands();
    assert_eq!(commands.first().map(String::as_str), Some("ATE0"));
    assert!(commands
        .iter()
        .any(|command| command == "AT+KCNXCFG=1,\"GPRS\",\"iot.example\",,,\"IPV4V6\""));
    assert_eq!(commands.last().map(String::as_str), Some("AT+CFUN=1,0"));
    // Reset is pulsed before anything is sent.
    let lines = lines.borrow();
    let pulse: Vec<_> = lines
        .iter()
        .filter(|(_, line, _)| *line == ControlLine::Reset)
        .map(|(_, _, asserted)| *asserted)
        .collect();
    assert_eq!(pulse, [true, false]);
}

#[test]
fn failed_configuration_is_reported() {
    let sim = Sim::new(|message| match message.command() {
        Some("AT+CMEE=1") => vec![now("ERROR\r\n")],
        Some(_) => vec![now("OK\r\n")],
        None => vec![],
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));
    let mut listener = modem.subscribe().unwrap();
    let res = drive(&mut runner, &sim, async {
        sim.inject("+KSUP: 0\r\n");
        modem.reset().await
    });
    assert_eq!(res, Err(ModemError::Io));
    assert!(!modem.is_configured());
    assert_eq!(modem.network_state(), NetworkState::UnableToConfigure);
    let mut last_network = None;
    while let Some(event) = listener.try_next_message_pure() {
        if let Event::NetworkState(state) = event {
            last_network = Some(state);
        }
    }
    assert_eq!(last_network, Some(NetworkState::UnableToConfigure));
}

#[test]
fn queries_update_cached_state() {
    let sim = Sim::new(|message| match message.command() {
        Some("AT+KCELLMEAS=0") => vec![now("+KCELLMEAS: -101,95,23,24,-3\r\nOK\r\n")],
        Some("AT+CFUN?") => vec![now("+CFUN: 1\r\nOK\r\n")],
        Some(_) => vec![now("OK\r\n")],
        None => vec![],
    });
    let lines = LineLog::default();
    let modem = Modem::new(SimWriter(&sim), RecordingLines(&lines), test_config());
    let mut runner = modem.runner(SimReader(&sim));

    let mut listener = modem.subscribe().unwrap();
    modem.generate_status_events();
    assert_eq!(
        listener.try_next_message_pure(),
        Some(Event::NetworkState(NetworkState::NotRegistered))
    );
    assert_eq!(
        listener.try_next_message_pure(),
        Some(Event::StartupState(StartupState::Undetermined))
    );
    assert_eq!(
        listener.try_next_message_pure(),
        Some(Event::SleepState(SleepState::Uninitialized))
    );
    drop(listener);

    drive(&mut runner, &sim, async {
        assert_eq!(modem.signal_quality().await, Ok(Some((-101, -3))));
        assert_eq!(modem.functionality().await, Ok(1));
        assert_eq!(modem.set_functionality(4).await, Ok(()));
        // Sleep levels only apply in low power mode.
        assert_eq!(
            modem.set_desired_sleep_level(SleepState::Sleep).await,
            Err(ModemError::InvalidArgument)
        );
        assert_eq!(
            modem.update_apn("bad\"apn").await,
            Err(ModemError::InvalidArgument)
        );
        assert_eq!(modem.power_off().await, Ok(()));
    });
    assert_eq!(modem.network_state(), NetworkState::NotRegistered);
    assert_eq!(
        sim.commands(),
        ["AT+KCELLMEAS=0", "AT+CFUN?", "AT+CFUN=4,0", "AT+CPOF"]
    );
}
