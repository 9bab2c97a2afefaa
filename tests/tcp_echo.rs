//! TCP round-trip and capacity behavior through the straps.

use std::sync::Arc;
use std::time::Duration;

use flywire::{
    ChannelConfig, ChannelHandle, ClientConf, ReadPoolConf, Runtime, ServerConf, Strap,
    TcpClientStrap, TcpServerStrap,
};
use tokio::sync::mpsc;

fn test_runtime() -> Arc<Runtime> {
    Runtime::new(ReadPoolConf::default(), ChannelConfig::default()).expect("valid defaults")
}

fn echo_handle() -> ChannelHandle {
    ChannelHandle::new(|channel, packet| async move { channel.write(&packet).await })
}

fn capture_handle(tx: mpsc::Sender<Vec<u8>>) -> ChannelHandle {
    ChannelHandle::new(move |_, packet| {
        let tx = tx.clone();
        async move {
            if let Some(data) = packet.data() {
                let _ = tx.send(data.to_vec()).await;
            }
            Ok(())
        }
    })
}

#[tokio::test]
async fn tcp_echo_round_trip() -> anyhow::Result<()> {
    let runtime = test_runtime();
    let server = TcpServerStrap::with_runtime(
        ServerConf::new("127.0.0.1:0"),
        echo_handle(),
        Arc::clone(&runtime),
    )?;
    server.start().await?;
    let addr = server.local_addr().expect("bound address");

    let (tx, mut rx) = mpsc::channel(4);
    let client = TcpClientStrap::with_runtime(
        ClientConf::new(addr.to_string()),
        capture_handle(tx),
        runtime,
    )?;
    client.start().await?;

    let channel = client.channel().await.expect("client channel");
    let mut packet = channel.new_packet();
    packet.set_data(&b"hello"[..])?;
    channel.write(&packet).await?;

    let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .expect("echo payload");
    assert_eq!(echoed, b"hello");

    client.stop().await;
    server.stop().await;

    // Stop is complete: no channels left behind, states terminal.
    assert_eq!(server.channel_count().await, 0);
    assert!(server.is_closed());
    assert!(client.is_closed());
    assert!(channel.is_closed());
    Ok(())
}

#[tokio::test]
async fn tcp_server_enforces_max_channels() -> anyhow::Result<()> {
    let runtime = test_runtime();
    let conf = ServerConf::new("127.0.0.1:0").with_max_channels(1);
    let server = TcpServerStrap::with_runtime(conf, echo_handle(), Arc::clone(&runtime))?;
    server.start().await?;
    let addr = server.local_addr().expect("bound address");

    let (tx, _rx) = mpsc::channel(4);
    let first = TcpClientStrap::with_runtime(
        ClientConf::new(addr.to_string()),
        capture_handle(tx.clone()),
        Arc::clone(&runtime),
    )?;
    first.start().await?;

    // Wait for the first channel to land in the map.
    for _ in 0..100 {
        if server.channel_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.channel_count().await, 1);

    // The next connection is accepted at the TCP level and then
    // rejected: it never becomes a channel.
    let second = TcpClientStrap::with_runtime(
        ClientConf::new(addr.to_string()),
        capture_handle(tx),
        runtime,
    )?;
    second.start().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.channel_count().await, 1);

    second.stop().await;
    first.stop().await;
    server.stop().await;
    assert_eq!(server.channel_count().await, 0);
    Ok(())
}
