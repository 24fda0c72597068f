//! 数据报往返：监听循环按来源地址分发，直接与管道两种写模式下每次发送都是一个完整数据报。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use conduit_codec_frames::TerminatorFilter;
use conduit_core::{CloseReason, ConnectionOptions, PipeConnection, WriteMode};
use conduit_transport_udp::{DatagramFeeder, ENABLE_SENDING_PIPE, UdpConnection, UdpTransport};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// 最小的宿主监听循环：新来源建立连接，每个连接回显 `ack:<line>`，前缀与行体分两段发送。
async fn serve(
    socket: Arc<UdpSocket>,
    options: ConnectionOptions,
    connections: mpsc::UnboundedSender<UdpConnection>,
) -> Result<()> {
    let mut routes: HashMap<std::net::SocketAddr, DatagramFeeder> = HashMap::new();
    let mut buf = vec![0_u8; 2048];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let datagram = Bytes::copy_from_slice(&buf[..len]);
        if let Some(feeder) = routes.get(&peer)
            && feeder.push(datagram.clone()).is_ok()
        {
            continue;
        }
        let (transport, feeder) = UdpTransport::new(Arc::clone(&socket), peer)?;
        let connection = PipeConnection::new(transport, options.clone());
        let mut lines = connection.run(TerminatorFilter::newline()).await?;
        feeder.push(datagram)?;
        routes.insert(peer, feeder);
        let _ = connections.send(connection.clone());
        tokio::spawn(async move {
            while let Some(Ok(line)) = lines.read().await {
                let reply = [Bytes::from_static(b"ack:"), line];
                if connection.send_all(reply).await.is_err() {
                    break;
                }
            }
        });
    }
}

async fn exchange(options: ConnectionOptions, expected_mode: WriteMode) -> Result<()> {
    let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let server_addr = server.local_addr()?;
    let (connections_tx, mut connections) = mpsc::unbounded_channel();
    let listener = tokio::spawn(serve(Arc::clone(&server), options, connections_tx));

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client.connect(server_addr).await?;
    let mut buf = [0_u8; 256];
    for request in ["first", "second", "third"] {
        client.send(format!("{request}\n").as_bytes()).await?;
        let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
            .await
            .context("等待回包超时")??;
        let expected = format!("ack:{request}");
        ensure!(&buf[..len] == expected.as_bytes(), "两段必须合并为一个数据报");
    }

    // 一个数据报携带两行：直接模式下各自成包，管道模式下可能被同一次 `drain` 合并。
    client.send(b"a\nb\n").await?;
    let mut replies = Vec::new();
    let mut datagrams = 0;
    while replies.len() < b"ack:aack:b".len() {
        let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf)).await??;
        replies.extend_from_slice(&buf[..len]);
        datagrams += 1;
    }
    ensure!(replies == b"ack:aack:b", "回包顺序不符: {replies:?}");
    if expected_mode == WriteMode::Direct {
        ensure!(datagrams == 2, "直接模式下每次发送是一个数据报");
    }

    let connection = connections.recv().await.context("应建立一条连接")?;
    ensure!(connection.write_mode() == expected_mode);
    ensure!(connection.remote_endpoint().and_then(|endpoint| endpoint.socket_addr())
        == Some(client.local_addr()?));
    connection.close(CloseReason::ServerShutdown).await?;
    ensure!(connection.closed().await == CloseReason::ServerShutdown);
    listener.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_mode_round_trip() -> Result<()> {
    exchange(ConnectionOptions::default(), WriteMode::Direct).await
}

#[tokio::test(flavor = "multi_thread")]
async fn piped_mode_round_trip() -> Result<()> {
    let options = ConnectionOptions::builder()
        .value(ENABLE_SENDING_PIPE, "true")
        .build()?;
    exchange(options, WriteMode::Piped).await
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_feeder_closes_as_remote() -> Result<()> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let peer = socket.local_addr()?;
    let (transport, mut feeder) = UdpTransport::new(socket, peer)?;
    let connection = PipeConnection::new(transport, ConnectionOptions::default());
    let mut lines = connection.run(TerminatorFilter::newline()).await?;

    feeder.push(&b"only\nhalf"[..])?;
    let line = tokio::time::timeout(Duration::from_secs(5), lines.read())
        .await?
        .context("应收到一行")??;
    ensure!(line == "only");
    feeder.complete();
    ensure!(lines.read().await.is_none(), "未完成的行应被丢弃");
    ensure!(connection.closed().await == CloseReason::RemoteClosing);
    Ok(())
}
