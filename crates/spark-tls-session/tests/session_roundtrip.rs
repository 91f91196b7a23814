//! 端到端会话测试：真实 `rustls` 后端 + Unix 套接字对。
//!
//! 覆盖信任拒绝与放行、客户端偏好的 ALPN、非阻塞读、精确读、单向/双向关闭、已知证书与拥塞写，
//! 以及对端未发送 `close_notify` 就断开时的截断处理。

#![cfg(unix)]

mod support;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use spark_tls_session::{
    AcceptAll, ErrorKind, HandshakeState, PeerTrust, ReadMode, RejectUnknown, SessionSettings,
    TlsError, TrustDecision, TrustQuery,
};

use support::*;

#[test]
fn rejected_certificate_fails_both_sides() -> anyhow::Result<()> {
    let material = material()?;
    let server = server_credentials(&material)?;
    let trust = tempfile::tempdir()?;
    let client = client_credentials(trust.path())?;

    let (server_end, client_end) = socket_pair()?;
    let echo = spawn_echo_server(server, server_end, &["bar"]);

    let mut session = client.session(
        client_end,
        SERVER_NAME,
        None,
        &["foo", "bar"],
        Arc::new(RejectUnknown),
    )?;
    let err = session.complete_handshake().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UntrustedPeer, "{err}");
    assert_eq!(session.state(), HandshakeState::Failed);
    assert_eq!(session.peer_trust(), Some(PeerTrust::Rejected));
    session.close();

    assert!(echo.join().expect("server thread").is_err());
    assert!(client.known_peers().is_empty());
    Ok(())
}

#[test]
fn accepted_certificate_round_trips_and_negotiates_client_preference() -> anyhow::Result<()> {
    let material = material()?;
    let server = server_credentials(&material)?;
    let trust = tempfile::tempdir()?;
    let client = client_credentials(trust.path())?;

    let queries = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&queries);
    let policy = move |query: &TrustQuery| {
        seen.fetch_add(1, Ordering::SeqCst);
        assert_eq!(query.server_name, SERVER_NAME);
        assert_eq!(query.service.as_deref(), Some("spark-test"));
        assert_eq!(query.suggested, TrustDecision::Reject);
        assert_eq!(query.fingerprint.len(), 64);
        TrustDecision::AcceptPermanently
    };

    let (server_end, client_end) = socket_pair()?;
    let echo = spawn_echo_server(server, server_end, &["foo", "bar"]);
    let mut session = connect(&client, client_end, &["bar", "foo"], Arc::new(policy))?;

    assert_eq!(queries.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), HandshakeState::Established);
    assert_eq!(
        session.peer_trust(),
        Some(PeerTrust::AcceptedByPolicy { permanent: true })
    );
    assert_eq!(session.alpn_protocol(), Some("bar"));
    assert!(session.peer_certificates().is_some_and(|chain| !chain.is_empty()));

    let mut buf = [0u8; 12];
    let err = session.read(&mut buf, ReadMode::Available).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);

    assert_eq!(session.write(b"Hello ")?, 6);
    assert_eq!(session.write(b"world!")?, 6);
    assert_eq!(session.read(&mut buf, ReadMode::Exact)?, 12);
    assert_eq!(&buf, b"Hello world!");

    session.shutdown(false)?;
    assert_eq!(drain_until_closed(&mut session)?, 0);
    assert_eq!(session.read(&mut buf, ReadMode::Available)?, 0);
    assert_eq!(session.take_alpn_protocol().as_deref(), Some("bar"));
    session.close();

    assert_eq!(echo.join().expect("server thread")?.as_deref(), Some("bar"));

    let store = client.known_peers();
    assert_eq!(store.len(), 1);
    let stored = std::fs::read_to_string(store.path().expect("file-backed store"))?;
    assert!(stored.starts_with("localhost spark-test "));
    Ok(())
}

#[test]
fn remembered_certificate_skips_the_policy() -> anyhow::Result<()> {
    let material = material()?;
    let trust = tempfile::tempdir()?;

    {
        let client = client_credentials(trust.path())?;
        let (server_end, client_end) = socket_pair()?;
        let echo = spawn_echo_server(server_credentials(&material)?, server_end, &[]);
        let policy = |_: &TrustQuery| TrustDecision::AcceptPermanently;
        let mut session = connect(&client, client_end, &[], Arc::new(policy))?;
        session.shutdown(true)?;
        session.close();
        echo.join().expect("server thread")?;
    }

    // 新凭据从信任目录重新加载例外记录。
    let client = client_credentials(trust.path())?;
    assert_eq!(client.known_peers().len(), 1);
    let (server_end, client_end) = socket_pair()?;
    let echo = spawn_echo_server(server_credentials(&material)?, server_end, &[]);
    let mut session = connect(&client, client_end, &[], Arc::new(RejectUnknown))?;
    assert_eq!(session.peer_trust(), Some(PeerTrust::KnownException));
    session.shutdown(true)?;
    session.close();
    echo.join().expect("server thread")?;
    Ok(())
}

#[test]
fn bidirectional_shutdown_waits_for_the_peer() -> anyhow::Result<()> {
    let material = material()?;
    let trust = tempfile::tempdir()?;
    let client = client_credentials(trust.path())?;
    let (server_end, client_end) = socket_pair()?;
    let echo = spawn_echo_server(server_credentials(&material)?, server_end, &[]);

    let mut session = connect(&client, client_end, &[], Arc::new(AcceptAll))?;
    assert_eq!(
        session.peer_trust(),
        Some(PeerTrust::AcceptedByPolicy { permanent: false })
    );
    session.write_all(b"ping")?;
    session.shutdown(true)?;
    assert!(session.is_read_closed());
    assert_eq!(
        session.write(b"late").unwrap_err().kind(),
        ErrorKind::ConnectionClosed
    );
    session.close();

    echo.join().expect("server thread")?;
    assert!(client.known_peers().is_empty());
    Ok(())
}

#[test]
fn one_sided_alpn_offer_negotiates_nothing() -> anyhow::Result<()> {
    let material = material()?;
    let trust = tempfile::tempdir()?;
    let client = client_credentials(trust.path())?;

    let cases: [(&'static [&'static str], &[&str]); 3] =
        [(&[], &["foo"]), (&["foo"], &[]), (&["h2"], &["http/1.1"])];
    for (server_offer, client_offer) in cases {
        let (server_end, client_end) = socket_pair()?;
        let echo = spawn_echo_server(server_credentials(&material)?, server_end, server_offer);
        let mut session = connect(&client, client_end, client_offer, Arc::new(AcceptAll))?;
        assert_eq!(session.alpn_protocol(), None, "{server_offer:?} / {client_offer:?}");
        session.shutdown(true)?;
        session.close();
        assert_eq!(echo.join().expect("server thread")?, None);
    }
    Ok(())
}

#[test]
fn congested_writes_are_echoed_byte_for_byte() -> anyhow::Result<()> {
    const CHUNK: usize = 16_184;

    let material = material()?;
    let trust = tempfile::tempdir()?;
    let settings = SessionSettings {
        send_buffer_limit: 16 * 1024,
        io_timeout_ms: Some(10_000),
        ..SessionSettings::default()
    };
    let client = client_credentials_with(trust.path(), settings)?;
    let (server_end, client_end) = socket_pair()?;
    let echo = spawn_echo_server(server_credentials(&material)?, server_end, &[]);
    let mut session = connect(&client, client_end, &[], Arc::new(AcceptAll))?;

    let mut sent = Vec::new();
    let mut seed = 0x5eed_u32;
    loop {
        let chunk = payload(CHUNK, seed);
        seed = seed.wrapping_add(1);
        match session.write(&chunk) {
            Ok(written) => {
                sent.extend_from_slice(&chunk[..written]);
                if written < CHUNK {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) => return Err(err.into()),
        }
    }
    assert!(sent.len() >= CHUNK, "at least one full chunk fits before congestion");

    let mut received = vec![0u8; sent.len()];
    assert_eq!(session.read(&mut received, ReadMode::Exact)?, sent.len());
    assert!(received == sent, "echoed bytes differ from sent bytes");

    session.shutdown(true)?;
    session.close();
    echo.join().expect("server thread")?;
    Ok(())
}

#[test]
fn every_session_on_shared_credentials_consults_trust() -> anyhow::Result<()> {
    let material = material()?;
    let trust = tempfile::tempdir()?;
    let client = client_credentials(trust.path())?;

    {
        let (server_end, client_end) = socket_pair()?;
        let echo = spawn_echo_server(server_credentials(&material)?, server_end, &[]);
        let mut session = connect(&client, client_end, &[], Arc::new(AcceptAll))?;
        session.write_all(b"ping")?;
        let mut buf = [0u8; 4];
        assert_eq!(session.read(&mut buf, ReadMode::Exact)?, 4);
        session.shutdown(true)?;
        session.close();
        echo.join().expect("server thread")?;
    }

    let queries = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&queries);
    let policy = move |_: &TrustQuery| {
        seen.fetch_add(1, Ordering::SeqCst);
        TrustDecision::AcceptOnce
    };
    let (server_end, client_end) = socket_pair()?;
    let echo = spawn_echo_server(server_credentials(&material)?, server_end, &[]);
    let mut session = connect(&client, client_end, &[], Arc::new(policy))?;
    assert_eq!(queries.load(Ordering::SeqCst), 1);
    assert_eq!(
        session.peer_trust(),
        Some(PeerTrust::AcceptedByPolicy { permanent: false })
    );
    session.shutdown(true)?;
    session.close();
    echo.join().expect("server thread")?;
    assert!(client.known_peers().is_empty());
    Ok(())
}

fn read_until_fault(
    session: &mut spark_tls_session::Session<std::os::unix::net::UnixStream>,
    mode: ReadMode,
) -> anyhow::Result<TlsError> {
    let mut buf = [0u8; 64];
    loop {
        match session.read(&mut buf, mode) {
            Ok(0) => anyhow::bail!("truncated stream reported as a clean close ({mode:?})"),
            Ok(_) => {}
            Err(err) if err.is_would_block() => {
                session.wait(session.read_interest(), None)?;
            }
            Err(err) => return Ok(err),
        }
    }
}

#[test]
fn truncation_without_close_notify_fails_reads() -> anyhow::Result<()> {
    let material = material()?;
    let trust = tempfile::tempdir()?;
    let client = client_credentials(trust.path())?;

    for mode in [ReadMode::Available, ReadMode::Exact] {
        let (server_end, client_end) = socket_pair()?;
        let server = spawn_vanishing_server(server_credentials(&material)?, server_end);
        let mut session = connect(&client, client_end, &[], Arc::new(AcceptAll))?;
        server.join().expect("server thread")?;

        let err = read_until_fault(&mut session, mode)?;
        assert!(
            matches!(err.kind(), ErrorKind::ProtocolFailure | ErrorKind::IoFault),
            "{mode:?}: {err}"
        );
        assert!(!session.is_read_closed());
        assert_eq!(session.state(), HandshakeState::Failed);
        assert_eq!(session.write(b"late").unwrap_err().kind(), ErrorKind::Misuse);
        assert!(session.shutdown(true).is_err());
        session.close();
    }
    Ok(())
}

#[test]
fn bidirectional_shutdown_fails_when_the_peer_vanishes() -> anyhow::Result<()> {
    let material = material()?;
    let trust = tempfile::tempdir()?;
    let client = client_credentials(trust.path())?;
    let (server_end, client_end) = socket_pair()?;
    let server = spawn_vanishing_server(server_credentials(&material)?, server_end);
    let mut session = connect(&client, client_end, &[], Arc::new(AcceptAll))?;
    server.join().expect("server thread")?;

    let err = session.shutdown(true).unwrap_err();
    assert!(
        matches!(err.kind(), ErrorKind::IoFault | ErrorKind::ProtocolFailure),
        "{err}"
    );
    assert_eq!(session.state(), HandshakeState::Failed);
    session.close();
    Ok(())
}
