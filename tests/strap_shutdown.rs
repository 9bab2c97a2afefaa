//! Orderly strap shutdown with many live channels.

use std::sync::Arc;
use std::time::Duration;

use flywire::{
    ChannelConfig, ChannelHandle, ClientConf, ReadPoolConf, Runtime, ServerConf, Strap,
    TcpClientStrap, TcpServerStrap,
};
use tokio::sync::mpsc;

const CLIENTS: usize = 20;

#[tokio::test]
async fn stopping_the_strap_closes_every_channel() -> anyhow::Result<()> {
    let runtime = Runtime::new(ReadPoolConf::default(), ChannelConfig::default())?;
    let echo = ChannelHandle::new(|channel, packet| async move { channel.write(&packet).await });
    let server = TcpServerStrap::with_runtime(
        ServerConf::new("127.0.0.1:0").with_max_channels(CLIENTS),
        echo,
        Arc::clone(&runtime),
    )?;
    server.start().await?;
    let addr = server.local_addr().expect("bound address");

    let mut clients = Vec::with_capacity(CLIENTS);
    let (tx, mut rx) = mpsc::channel(CLIENTS * 2);
    for _ in 0..CLIENTS {
        let tx = tx.clone();
        let handle = ChannelHandle::new(move |_, packet| {
            let tx = tx.clone();
            async move {
                if let Some(data) = packet.data() {
                    let _ = tx.send(data.to_vec()).await;
                }
                Ok(())
            }
        });
        let client = TcpClientStrap::with_runtime(
            ClientConf::new(addr.to_string()),
            handle,
            Arc::clone(&runtime),
        )?;
        client.start().await?;
        clients.push(client);
    }

    // Every client echoes once so all channels are demonstrably live.
    for client in &clients {
        let channel = client.channel().await.expect("client channel");
        let mut packet = channel.new_packet();
        packet.set_data(&b"ping"[..])?;
        channel.write(&packet).await?;
    }
    for _ in 0..CLIENTS {
        let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await?
            .expect("echo payload");
        assert_eq!(echoed, b"ping");
    }
    assert_eq!(server.channel_count().await, CLIENTS);

    server.stop().await;
    assert_eq!(server.channel_count().await, 0);
    assert!(server.is_closed());

    // The server closed every connection; each client observes the
    // close and winds down on its own within a bounded time.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    for client in &clients {
        loop {
            let channel = client.channel().await.expect("client channel");
            if channel.is_closed() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "client channel did not close after server stop"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    for client in &clients {
        client.stop().await;
    }
    Ok(())
}
