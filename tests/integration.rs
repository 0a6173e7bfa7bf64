// Session-level scenarios exercised end to end over an in-memory duplex pipe,
// standing in for the property checks a real socket pair would need a live
// network to drive.

use std::time::Duration;

use yamux_rs::{Config, Error, GoAwayCode, Session};

#[tokio::test]
async fn echoes_a_message_and_observes_half_close() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let client = Session::client(client_io, Config::new());
    let server = Session::server(server_io, Config::new());

    let client_stream = client.open_stream().await.unwrap();
    client_stream.write(b"ABC").await.unwrap();
    client_stream.close().await.unwrap();

    let server_stream = server.accept_stream().await.unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 16];
    loop {
        let n = server_stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, b"ABC");

    server_stream.close().await.unwrap();
    let n = client_stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn write_blocks_on_a_tiny_window_and_unblocks_as_peer_reads() {
    let (client_io, server_io) = tokio::io::duplex(65536);
    let config = Config::new().with_max_stream_window_size(16);
    let client = Session::client(client_io, config.clone());
    let server = Session::server(server_io, config);

    let client_stream = client.open_stream().await.unwrap();
    let payload = vec![7u8; 64];
    let payload_clone = payload.clone();
    let writer = tokio::spawn(async move {
        client_stream.write(&payload_clone).await.unwrap();
        client_stream
    });

    // Give the writer a chance to exhaust the initial 16-byte window and
    // start waiting; it must not have finished yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    let server_stream = server.accept_stream().await.unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 16];
    while received.len() < payload.len() {
        let n = server_stream.read(&mut buf).await.unwrap();
        assert!(n > 0);
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, payload);

    let client_stream = writer.await.unwrap();
    client_stream.close().await.unwrap();
}

#[tokio::test]
async fn reset_unblocks_peer_read_and_future_writes_fail() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let client = Session::client(client_io, Config::new());
    let server = Session::server(server_io, Config::new());

    let client_stream = client.open_stream().await.unwrap();
    client_stream.write(&[0u8; 10]).await.unwrap();

    let server_stream = server.accept_stream().await.unwrap();
    let mut buf = [0u8; 32];
    let n = server_stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 10);

    let server_stream_clone = server_stream.clone();
    let pending_read = tokio::spawn(async move {
        let mut buf = [0u8; 32];
        server_stream_clone.read(&mut buf).await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    client_stream.reset().await.unwrap();

    let result = tokio::time::timeout(Duration::from_millis(500), pending_read)
        .await
        .expect("pending read did not resolve after reset")
        .unwrap();
    assert!(matches!(result, Err(Error::ConnectionReset)));

    let write_err = server_stream.write(b"x").await.unwrap_err();
    assert!(matches!(write_err, Error::ConnectionReset));
}

#[tokio::test]
async fn keep_alive_does_not_tear_down_a_healthy_session() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let config = Config::new().with_keep_alive_interval(Duration::from_millis(100));
    let client = Session::client(client_io, config.clone());
    let _server = Session::server(server_io, config);

    tokio::time::sleep(Duration::from_millis(350)).await;

    // The session must still be usable: several keep-alive round trips have
    // happened silently in the background and none of them killed it.
    let stream = client.open_stream().await.unwrap();
    stream.write(b"still alive").await.unwrap();
    stream.close().await.unwrap();
}

#[tokio::test]
async fn accept_backlog_rejects_streams_beyond_the_limit() {
    let (client_io, server_io) = tokio::io::duplex(16384);
    let client = Session::client(client_io, Config::new());
    let server_config = Config::new().with_accept_backlog(2);
    let server = Session::server(server_io, server_config);

    let s1 = client.open_stream().await.unwrap();
    let s2 = client.open_stream().await.unwrap();
    let s3 = client.open_stream().await.unwrap();
    s1.write(b"a").await.unwrap();
    s2.write(b"b").await.unwrap();
    s3.write(b"c").await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(server.open_stream_count(), 2);

    let accepted_a = server.accept_stream().await.unwrap();
    let accepted_b = server.accept_stream().await.unwrap();
    let mut ids = vec![accepted_a.id(), accepted_b.id()];
    ids.sort();
    assert_eq!(ids, vec![1, 3]);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let err = s3.write(b"more").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionReset));
}

#[tokio::test]
async fn go_away_stops_new_streams_but_not_existing_ones() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let client = Session::client(client_io, Config::new());
    let server = Session::server(server_io, Config::new());

    let client_stream = client.open_stream().await.unwrap();
    client_stream.write(b"hi").await.unwrap();
    let server_stream = server.accept_stream().await.unwrap();
    let mut buf = [0u8; 8];
    let n = server_stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hi");

    server.go_away(GoAwayCode::Normal).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let err = client.open_stream().await.unwrap_err();
    assert!(matches!(err, Error::RemoteGoAway));

    // The stream opened before the GoAway keeps working.
    client_stream.write(b" there").await.unwrap();
    let n = server_stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b" there");

    client_stream.close().await.unwrap();
    server_stream.close().await.unwrap();
}

#[tokio::test]
async fn ordered_delivery_holds_across_many_frames() {
    let (client_io, server_io) = tokio::io::duplex(65536);
    let config = Config::new().with_max_stream_window_size(64);
    let client = Session::client(client_io, config.clone());
    let server = Session::server(server_io, config);

    let client_stream = client.open_stream().await.unwrap();
    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
    let payload_clone = payload.clone();
    let writer = tokio::spawn(async move {
        client_stream.write(&payload_clone).await.unwrap();
        client_stream.close().await.unwrap();
    });

    let server_stream = server.accept_stream().await.unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 37]; // deliberately not a multiple of the frame size
    loop {
        let n = server_stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    writer.await.unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn ping_resolves_with_a_nonnegative_round_trip_time() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let client = Session::client(client_io, Config::new());
    let _server = Session::server(server_io, Config::new());

    let rtt = client.ping().await.unwrap();
    assert!(rtt < Duration::from_secs(1));
}
