//! 故障日志：协议违规与关闭失败以 `warn` 记录并携带稳定错误码，对端正常关闭保持静默。

mod support;

use std::time::Duration;

use anyhow::{Context, Result, ensure};
use conduit_core::{CloseReason, ConnectionOptions, PipeConnection, VirtualTransport, WriteMode};
use tracing_test::traced_test;

use support::{
    CrlfLines, DrainScript, Rejecting, ScriptedOutput, ScriptedTransport, drain_stream,
};

#[tokio::test]
#[traced_test]
async fn protocol_violation_is_logged_with_its_code() -> Result<()> {
    let (transport, peer) = VirtualTransport::pair();
    let connection = PipeConnection::new(transport, ConnectionOptions::default());
    let mut packages = connection.run(Rejecting).await?;

    peer.write("?")?;
    let (_, fault) = tokio::time::timeout(Duration::from_secs(5), drain_stream(&mut packages))
        .await
        .context("等待故障超时")??;
    ensure!(fault.is_some(), "协议违规必须作为错误项交付");
    ensure!(connection.closed().await == CloseReason::ProtocolError);

    ensure!(logs_contain("connection fault"));
    ensure!(logs_contain("conduit.protocol.filter_failed"));
    ensure!(logs_contain("stage=\"parse\""));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn remote_close_is_not_a_fault() -> Result<()> {
    let (transport, mut peer) = VirtualTransport::pair();
    let connection = PipeConnection::new(transport, ConnectionOptions::default());
    let mut packages = connection.run(CrlfLines).await?;

    peer.write("bye\r\n")?;
    peer.complete();
    let (lines, fault) = drain_stream(&mut packages).await?;
    ensure!(lines == ["bye"] && fault.is_none());
    ensure!(connection.closed().await == CloseReason::RemoteClosing);

    ensure!(logs_contain("connection closed"));
    ensure!(!logs_contain("connection fault"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn failed_transport_shutdown_is_logged_with_its_code() -> Result<()> {
    let mut output = ScriptedOutput::new(DrainScript::Stall, WriteMode::Direct);
    output.close_error = Some(std::io::ErrorKind::PermissionDenied);
    let closes = std::sync::Arc::clone(&output.closes);
    let connection = PipeConnection::new(ScriptedTransport { output }, ConnectionOptions::default());
    let _packages = connection.run(CrlfLines).await?;

    connection.close(CloseReason::LocalClosing).await?;
    ensure!(closes.load(std::sync::atomic::Ordering::SeqCst) == 1);
    ensure!(connection.closed().await == CloseReason::LocalClosing, "关闭失败不改变关闭原因");
    ensure!(logs_contain("transport shutdown failed"));
    ensure!(logs_contain("conduit.transport.shutdown_failed"));
    Ok(())
}
