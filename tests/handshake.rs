//! Registration: PASS, CAP, SASL PLAIN and nickname fallback.

mod common;

use common::{capture, FakeServer};
use crabirc::config::SaslConfig;
use crabirc::error::Stage;
use crabirc::{Client, Command, ConnectError, Status};

#[tokio::test]
async fn sasl_plain_success() {
    let server = FakeServer::bind().await.unwrap();
    let mut cfg = server.config();
    cfg.sasl = Some(SaslConfig {
        user: "user1".into(),
        pass: "securepass1".into(),
    });
    let client = Client::new(cfg).unwrap();

    let (result, _peer) = tokio::join!(client.connect(), async {
        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.expect("CAP").await.unwrap(), "CAP REQ :sasl");
        peer.expect("USER").await.unwrap();
        peer.send(":irc.test CAP * ACK :sasl").await.unwrap();
        peer.expect("AUTHENTICATE PLAIN").await.unwrap();
        peer.send("AUTHENTICATE +").await.unwrap();
        // base64("user1\0user1\0securepass1")
        assert_eq!(
            peer.expect("AUTHENTICATE").await.unwrap(),
            "AUTHENTICATE dXNlcjEAdXNlcjEAc2VjdXJlcGFzczE="
        );
        peer.send(":irc.test 903 test :SASL authentication successful")
            .await
            .unwrap();
        peer.expect("CAP END").await.unwrap();
        peer.send(":irc.test 001 test :Welcome").await.unwrap();
        peer
    });
    result.unwrap();
    assert!(client.has_capability("sasl"));
    assert_eq!(client.status(), Status::Connected);
    client.close_and_wait().await;
}

#[tokio::test]
async fn sasl_failure_is_auth_rejected() {
    let server = FakeServer::bind().await.unwrap();
    let mut cfg = server.config();
    cfg.sasl = Some(SaslConfig {
        user: "user1".into(),
        pass: "wrong".into(),
    });
    let client = Client::new(cfg).unwrap();

    let (result, _peer) = tokio::join!(client.connect(), async {
        let mut peer = server.accept().await.unwrap();
        peer.expect("USER").await.unwrap();
        peer.send(":irc.test CAP * ACK :sasl").await.unwrap();
        peer.expect("AUTHENTICATE PLAIN").await.unwrap();
        peer.send("AUTHENTICATE +").await.unwrap();
        peer.expect("AUTHENTICATE").await.unwrap();
        peer.send(":irc.test 904 test :SASL authentication failed")
            .await
            .unwrap();
        peer
    });
    match result {
        Err(ConnectError::AuthRejected(msg)) => assert!(msg.contains("failed")),
        other => panic!("expected AuthRejected, got {other:?}"),
    }
    assert_eq!(client.status(), Status::Disconnected);
}

#[tokio::test]
async fn extra_capabilities_end_negotiation() {
    let server = FakeServer::bind().await.unwrap();
    let mut cfg = server.config();
    cfg.capabilities = vec!["multi-prefix".into(), "away-notify".into()];
    let client = Client::new(cfg).unwrap();

    let (result, _peer) = tokio::join!(client.connect(), async {
        let mut peer = server.accept().await.unwrap();
        assert_eq!(
            peer.expect("CAP").await.unwrap(),
            "CAP REQ :multi-prefix away-notify"
        );
        peer.expect("USER").await.unwrap();
        peer.send(":irc.test CAP * ACK :multi-prefix away-notify")
            .await
            .unwrap();
        peer.expect("CAP END").await.unwrap();
        peer.send(":irc.test 001 test :Welcome").await.unwrap();
        peer
    });
    result.unwrap();
    assert!(client.has_capability("multi-prefix"));
    assert!(client.has_capability("away-notify"));
    client.close_and_wait().await;
}

#[tokio::test]
async fn password_is_sent_first() {
    let server = FakeServer::bind().await.unwrap();
    let mut cfg = server.config();
    cfg.password = Some("hunter2".into());
    let client = Client::new(cfg).unwrap();

    let (result, _peer) = tokio::join!(client.connect(), async {
        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.recv().await.unwrap().unwrap(), "PASS hunter2");
        assert_eq!(peer.recv().await.unwrap().unwrap(), "NICK test");
        assert_eq!(peer.recv().await.unwrap().unwrap(), "USER test 0 * :test");
        peer.send(":irc.test 001 test :Welcome").await.unwrap();
        peer
    });
    result.unwrap();
    client.close_and_wait().await;
}

#[tokio::test]
async fn nick_in_use_falls_back() {
    let server = FakeServer::bind().await.unwrap();
    let mut cfg = server.config();
    cfg.alt_nicks = vec!["test2".into()];
    let client = Client::new(cfg).unwrap();
    let mut numerics = capture(&client, Command::Numeric(433));

    let (result, _peer) = tokio::join!(client.connect(), async {
        let mut peer = server.accept().await.unwrap();
        peer.expect("USER").await.unwrap();
        peer.send(":irc.test 433 * test :Nickname is already in use")
            .await
            .unwrap();
        assert_eq!(peer.expect("NICK").await.unwrap(), "NICK test2");
        peer.send(":irc.test 433 * test2 :Nickname is already in use")
            .await
            .unwrap();
        assert_eq!(peer.expect("NICK").await.unwrap(), "NICK test_");
        peer.send(":irc.test 001 test_ :Welcome").await.unwrap();
        peer
    });
    result.unwrap();
    assert_eq!(client.nick(), "test_");
    assert!(numerics.try_recv().is_ok());
    client.close_and_wait().await;
}

#[tokio::test]
async fn silent_server_times_out_registration() {
    let server = FakeServer::bind().await.unwrap();
    let mut cfg = server.config();
    cfg.timeouts.handshake_ms = 200;
    let client = Client::new(cfg).unwrap();

    let (result, _peer) = tokio::join!(client.connect(), server.accept());
    match result {
        Err(ConnectError::Timeout { stage, .. }) => assert_eq!(stage, Stage::Handshake),
        other => panic!("expected a handshake timeout, got {other:?}"),
    }
    assert_eq!(client.status(), Status::Disconnected);
}

#[tokio::test]
async fn error_during_registration_fails_connect() {
    let server = FakeServer::bind().await.unwrap();
    let client = Client::new(server.config()).unwrap();

    let (result, _peer) = tokio::join!(client.connect(), async {
        let mut peer = server.accept().await.unwrap();
        peer.expect("USER").await.unwrap();
        peer.send("ERROR :Closing link: banned").await.unwrap();
        peer
    });
    match result {
        Err(ConnectError::Handshake(msg)) => assert!(msg.contains("banned")),
        other => panic!("expected a handshake error, got {other:?}"),
    }
}
