//! 参考过滤器接入引擎：长度前缀帧逐字节到达仍能完整解析，超限声明在包体到达前即关闭连接。

use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use bytes::{Bytes, BytesMut};
use conduit_codec_frames::{
    FixedHeaderFilter, LengthField, LengthPrefixEncoder, LineEncoder, TerminatorFilter,
};
use conduit_core::{
    CloseReason, ConnectionError, ConnectionOptions, FilterError, PackageEncoder, PackageStream,
    PipeConnection, VirtualTransport,
};

async fn next<P>(packages: &mut PackageStream<P>) -> Result<P> {
    tokio::time::timeout(Duration::from_secs(5), packages.read())
        .await
        .context("等待包超时")?
        .ok_or_else(|| anyhow!("包序列提前结束"))?
        .context("包序列报告错误")
}

#[tokio::test(flavor = "multi_thread")]
async fn length_prefixed_requests_are_answered_with_lines() -> Result<()> {
    let (transport, mut peer) = VirtualTransport::pair();
    let connection = PipeConnection::new(transport, ConnectionOptions::default());
    let mut packages = connection
        .run(FixedHeaderFilter::new(LengthField::U16))
        .await
        .context("启动连接失败")?;

    let encoder = LengthPrefixEncoder::new(LengthField::U16);
    let mut wire = BytesMut::new();
    for body in ["ping", "", "a longer request body"] {
        encoder.encode(&mut wire, body).context("编码请求失败")?;
    }
    for byte in wire.iter().copied() {
        peer.write(vec![byte])?;
    }

    let lines = LineEncoder::crlf();
    for expected in ["ping", "", "a longer request body"] {
        let frame = next(&mut packages).await?;
        ensure!(frame.body() == Bytes::from(expected), "包体不符: {frame:?}");
        connection
            .send_package(&lines, &frame.body()[..])
            .await
            .context("回写失败")?;
    }

    let echoed = peer.recv_exact(b"ping\r\n\r\na longer request body\r\n".len()).await;
    ensure!(&echoed[..] == b"ping\r\n\r\na longer request body\r\n");
    connection.close(CloseReason::LocalClosing).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_declaration_closes_with_protocol_error() -> Result<()> {
    let (transport, peer) = VirtualTransport::pair();
    let options = ConnectionOptions::builder().max_package_length(32).build()?;
    let connection = PipeConnection::new(transport, options);
    let mut packages = connection.run(FixedHeaderFilter::new(LengthField::U32)).await?;

    // 只发送头部：声明 4096 字节，包体一个字节都没有到达。
    peer.write(&b"\x00\x00\x10\x00"[..])?;
    let fault = tokio::time::timeout(Duration::from_secs(5), packages.read())
        .await?
        .context("应收到错误项")?;
    ensure!(matches!(
        fault,
        Err(ConnectionError::Filter(FilterError::DeclaredLengthTooLarge {
            declared: 4100,
            limit: 32
        }))
    ));
    ensure!(connection.closed().await == CloseReason::ProtocolError);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn overlong_lines_trip_the_engine_guard() -> Result<()> {
    let (transport, peer) = VirtualTransport::pair();
    let options = ConnectionOptions::builder().max_package_length(16).build()?;
    let connection = PipeConnection::new(transport, options);
    let mut packages = connection.run(TerminatorFilter::crlf()).await?;

    peer.write("short\r\n")?;
    ensure!(&next(&mut packages).await?[..] == b"short");
    peer.write("this line never ends and keeps growing")?;
    let fault = tokio::time::timeout(Duration::from_secs(5), packages.read())
        .await?
        .context("应收到错误项")?;
    ensure!(matches!(fault, Err(ConnectionError::PackageTooLarge { limit: 16, .. })));
    ensure!(connection.closed().await == CloseReason::ProtocolError);
    Ok(())
}
