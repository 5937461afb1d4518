use speedtest::client::SpeedTestSession;
use speedtest::estimator::Estimator;
use speedtest::tcp::TcpClient;
use speedtest::{Client, Config, Protocol, Server};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

async fn spawn_server(config: Config) -> SocketAddr {
    let config = config.with_bind_addr("127.0.0.1".parse().unwrap());
    let bound = Server::new(config).bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(bound.serve());
    addr
}

async fn read_reply(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line.trim().to_string()
}

#[tokio::test]
async fn test_tcp_download_reports_peak() {
    let addr = spawn_server(Config::server(0)).await;
    let config = Config::client("127.0.0.1".to_string(), addr.port());
    let mut client = TcpClient::connect(&addr.to_string(), &config).await.unwrap();

    assert_eq!(client.say_hello().await.unwrap(), "OK");

    let estimator = Estimator::new(4096, config.max_block_size);
    let run = timeout(
        Duration::from_secs(30),
        client.download(&estimator, Duration::from_millis(500)),
    )
    .await
    .expect("download did not finish")
    .unwrap();

    assert!(!run.iterations.is_empty());
    assert!(run.iterations.len() < 64);
    assert!(run.peak_bytes_per_second > 0.0);
    assert!(run.elapsed >= Duration::from_millis(500));
    assert_eq!(run.iterations[0].block_size, 4096);

    assert_eq!(client.say_bye().await.unwrap(), "Good bye.");
}

#[tokio::test]
async fn test_tcp_client_full_run() {
    let addr = spawn_server(Config::server(0)).await;
    let config = Config::client("127.0.0.1".to_string(), addr.port())
        .with_period(Duration::from_millis(200))
        .with_io_timeout(Duration::from_secs(10));

    let client = Client::new(config).unwrap();
    client.run().await.unwrap();

    let measurements = client.get_measurements();
    assert_eq!(measurements.runs.len(), 2);
    assert!(measurements.peak_download().unwrap() > 0.0);
    assert!(measurements.peak_upload().unwrap() > 0.0);
}

#[tokio::test]
async fn test_udp_client_full_run() {
    let addr = spawn_server(
        Config::server(0)
            .with_protocol(Protocol::Udp)
            .with_server_block_size(1024),
    )
    .await;
    let config = Config::client("127.0.0.1".to_string(), addr.port())
        .with_protocol(Protocol::Udp)
        .with_block_size(1024)
        .with_max_block_size(16 * 1024)
        .with_period(Duration::from_millis(50))
        .with_io_timeout(Duration::from_secs(5));

    let client = Client::new(config).unwrap();
    client.run().await.unwrap();

    let measurements = client.get_measurements();
    assert_eq!(measurements.runs.len(), 2);
    for run in &measurements.runs {
        assert!(run.iterations.iter().all(|i| i.block_size <= 16 * 1024));
        assert!(run.peak_bytes_per_second > 0.0);
    }
}

#[tokio::test]
async fn test_tcp_send_yields_exact_byte_count() {
    let addr = spawn_server(Config::server(0)).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut reader = BufReader::new(stream);

    // Larger than the server payload so the block wraps around it.
    let count = 200_000usize;
    reader
        .get_mut()
        .write_all(format!("Send {}\r\n", count).as_bytes())
        .await
        .unwrap();
    let mut data = vec![0u8; count];
    reader.read_exact(&mut data).await.unwrap();
    assert!(data.iter().all(|b| b.is_ascii_graphic()));

    // Anything beyond `count` would show up in front of the reply.
    reader.get_mut().write_all(b"Bye\r\n").await.unwrap();
    assert_eq!(read_reply(&mut reader).await, "Good bye.");
}

#[tokio::test]
async fn test_tcp_recv_with_small_writes() {
    let addr = spawn_server(Config::server(0)).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut reader = BufReader::new(stream);

    reader.get_mut().write_all(b"Recv 5000\r\n").await.unwrap();
    assert_eq!(read_reply(&mut reader).await, "OK");

    let data = vec![b'q'; 5000];
    for chunk in data.chunks(13) {
        reader.get_mut().write_all(chunk).await.unwrap();
    }
    assert_eq!(read_reply(&mut reader).await, "OK");

    reader.get_mut().write_all(b"SpeedTest V1\r\n").await.unwrap();
    assert_eq!(read_reply(&mut reader).await, "OK");
}

#[tokio::test]
async fn test_tcp_handshake_twice() {
    let addr = spawn_server(Config::server(0)).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut reader = BufReader::new(stream);

    for _ in 0..2 {
        reader.get_mut().write_all(b"SpeedTest V1\r\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await, "OK");
    }
}

#[tokio::test]
async fn test_tcp_unsupported_version_closes_connection() {
    let addr = spawn_server(Config::server(0)).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut reader = BufReader::new(stream);

    reader.get_mut().write_all(b"SpeedTest V2\r\n").await.unwrap();
    assert_eq!(read_reply(&mut reader).await, "Unsupported protocol version.");

    // The server has hung up: the next command gets no answer.
    let _ = reader.get_mut().write_all(b"SpeedTest V1\r\n").await;
    let mut rest = Vec::new();
    let outcome = timeout(Duration::from_secs(5), reader.read_to_end(&mut rest))
        .await
        .expect("connection left open");
    assert!(outcome.is_err() || rest.is_empty());
}

#[tokio::test]
async fn test_tcp_bye_after_transfers() {
    let addr = spawn_server(Config::server(0)).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut reader = BufReader::new(stream);

    reader.get_mut().write_all(b"Send 100\r\n").await.unwrap();
    let mut data = [0u8; 100];
    reader.read_exact(&mut data).await.unwrap();

    reader.get_mut().write_all(b"Recv 10\r\n").await.unwrap();
    assert_eq!(read_reply(&mut reader).await, "OK");
    reader.get_mut().write_all(&[b'x'; 10]).await.unwrap();
    assert_eq!(read_reply(&mut reader).await, "OK");

    reader.get_mut().write_all(b"bye\r\n").await.unwrap();
    assert_eq!(read_reply(&mut reader).await, "Good bye.");
}

#[tokio::test]
async fn test_tcp_concurrent_clients() {
    let addr = spawn_server(Config::server(0)).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(tokio::spawn(async move {
            let config = Config::client("127.0.0.1".to_string(), addr.port());
            let mut client = TcpClient::connect(&addr.to_string(), &config).await.unwrap();
            assert_eq!(client.say_hello().await.unwrap(), "OK");
            client.recv_test_block(100_000).await.unwrap();
            client.send_test_block(100_000).await.unwrap();
            client.say_bye().await.unwrap()
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), "Good bye.");
    }
}

#[tokio::test]
async fn test_udp_counting_ack() {
    let addr = spawn_server(Config::server(0).with_protocol(Protocol::Udp)).await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(addr).await.unwrap();
    let mut buf = vec![0u8; 65536];

    socket.send(b"Recv 3000").await.unwrap();
    let n = timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"OK");

    for _ in 0..3 {
        socket.send(&[b'd'; 1000]).await.unwrap();
    }
    let n = timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"OK");

    // Exactly one acknowledgement for the whole block.
    assert!(timeout(Duration::from_millis(200), socket.recv(&mut buf))
        .await
        .is_err());
}

#[tokio::test]
async fn test_udp_send_delivers_count() {
    let addr = spawn_server(
        Config::server(0)
            .with_protocol(Protocol::Udp)
            .with_server_block_size(2048),
    )
    .await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(addr).await.unwrap();
    let mut buf = vec![0u8; 65536];

    socket.send(b"SEND 5000").await.unwrap();
    let mut total = 0;
    while total < 5000 {
        total += timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(total, 5000);
}
