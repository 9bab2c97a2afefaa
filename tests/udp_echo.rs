//! UDP echo through the per-peer demultiplexing server strap.

use std::sync::Arc;
use std::time::Duration;

use flywire::{
    ChannelConfig, ChannelHandle, ClientConf, ReadPoolConf, Runtime, ServerConf, Strap,
    UdpClientStrap, UdpServerStrap,
};
use tokio::sync::mpsc;

#[tokio::test]
async fn udp_echo_creates_a_peer_channel() -> anyhow::Result<()> {
    let runtime = Runtime::new(ReadPoolConf::default(), ChannelConfig::default())?;
    let echo = ChannelHandle::new(|channel, packet| async move { channel.write(&packet).await });
    let server =
        UdpServerStrap::with_runtime(ServerConf::new("127.0.0.1:0"), echo, Arc::clone(&runtime))?;
    server.start().await?;
    let addr = server.local_addr().expect("bound address");

    let (tx, mut rx) = mpsc::channel(4);
    let handle = ChannelHandle::new(move |_, packet| {
        let tx = tx.clone();
        async move {
            if let Some(data) = packet.data() {
                let _ = tx.send(data.to_vec()).await;
            }
            Ok(())
        }
    });
    let client = UdpClientStrap::with_runtime(ClientConf::new(addr.to_string()), handle, runtime)?;
    client.start().await?;

    let channel = client.channel().await.expect("client channel");
    let mut packet = channel.new_packet();
    packet.set_data(&b"udp-ping"[..])?;
    channel.write(&packet).await?;

    let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .expect("echo payload");
    assert_eq!(echoed, b"udp-ping");

    // The datagram source was demultiplexed into one peer channel.
    assert_eq!(server.channel_count().await, 1);
    let peer = &server.channels().await[0];
    assert_eq!(
        peer.remote_addr().map(|addr| addr.port()),
        channel.local_addr().map(|addr| addr.port()),
    );

    client.stop().await;
    server.stop().await;
    assert_eq!(server.channel_count().await, 0);
    Ok(())
}
