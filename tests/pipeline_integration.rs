//! Full pipeline over real sockets: a client writes plaintext metrics
//! into the relay's TCP listener and a downstream server receives the
//! routed, rewritten result.

use std::io::Write;
use std::time::Duration;

use graphite_relay::relay::{Relay, RelayOptions};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_ingress_to_tcp_egress() {
    // downstream graphite stand-in on an ephemeral port
    let downstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let downstream_port = downstream.local_addr().unwrap().port();

    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(
        config,
        "cluster store forward 127.0.0.1:{downstream_port};\n\
         rewrite ^prod\\.([^.]+)\\.(.*)$ into apps.\\1.\\2;\n\
         match ^apps\\. send to store stop;\n\
         match * send to blackhole stop;\n"
    )
    .unwrap();
    config.flush().unwrap();

    let opts = RelayOptions {
        config_path: config.path().to_path_buf(),
        listen_port: 19216,
        ..RelayOptions::default()
    };
    let relay = Relay::start(opts).await.unwrap();

    // a plaintext client; sloppy formatting on purpose
    let mut client = tokio::net::TcpStream::connect("127.0.0.1:19216")
        .await
        .unwrap();
    tokio::io::AsyncWriteExt::write_all(
        &mut client,
        b"prod.web.cpu 0.5 100\nprod..db..mem 7 101\nignored.host 1 102\n",
    )
    .await
    .unwrap();
    tokio::io::AsyncWriteExt::flush(&mut client).await.unwrap();

    let (mut sock, _) = timeout(Duration::from_secs(10), downstream.accept())
        .await
        .expect("relay never connected downstream")
        .unwrap();

    let expected = b"apps.web.cpu 0.5 100\napps.db.mem 7 101\n";
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while buf.len() < expected.len() {
        let n = timeout(Duration::from_secs(10), sock.read(&mut chunk))
            .await
            .expect("timed out waiting for downstream bytes")
            .unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected)
    );

    // the ignored line was blackholed, not delivered
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while relay.stats().blackholes() < 1 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.stats().metrics(), 3);
    assert_eq!(relay.stats().blackholes(), 1);

    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_ingress_is_accepted() {
    let downstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let downstream_port = downstream.local_addr().unwrap().port();

    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(
        config,
        "cluster store forward 127.0.0.1:{downstream_port};\nmatch * send to store stop;\n"
    )
    .unwrap();
    config.flush().unwrap();

    let opts = RelayOptions {
        config_path: config.path().to_path_buf(),
        listen_port: 19217,
        ..RelayOptions::default()
    };
    let relay = Relay::start(opts).await.unwrap();

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"udp.metric 1 100\n", "127.0.0.1:19217")
        .await
        .unwrap();

    let (mut sock, _) = timeout(Duration::from_secs(10), downstream.accept())
        .await
        .expect("relay never connected downstream")
        .unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(10), sock.read(&mut buf))
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"udp.metric 1 100\n");

    relay.shutdown().await;
}
