//! HTTP/WebSocket strap: upgrade routing, echo, capacity rejection,
//! and plain HTTP routes on the same listener.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flywire::{
    http_handler, ChannelConfig, ChannelHandle, ClientConf, HttpWsServerStrap, ReadPoolConf,
    Runtime, ServerConf, Strap, WsClientStrap,
};
use http_body_util::Full;
use hyper::{Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

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

async fn wait_for_count(server: &HttpWsServerStrap, expected: usize) {
    for _ in 0..200 {
        if server.channel_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel count never reached {expected}");
}

#[tokio::test]
async fn ws_echo_and_capacity_rejection() -> anyhow::Result<()> {
    let runtime = Runtime::new(ReadPoolConf::default(), ChannelConfig::default())?;
    let server = HttpWsServerStrap::with_runtime(
        ServerConf::new("127.0.0.1:0").with_max_channels(2),
        Arc::clone(&runtime),
    )?;
    server.add_ws_route("/echo", echo_handle());
    server.start().await?;
    let addr = server.local_addr().expect("bound address");

    let (tx, mut rx) = mpsc::channel(8);
    let conf = |_: usize| ClientConf::new(addr.to_string()).with_path("/echo");

    let first = WsClientStrap::with_runtime(conf(1), capture_handle(tx.clone()), Arc::clone(&runtime))?;
    first.start().await?;
    let second =
        WsClientStrap::with_runtime(conf(2), capture_handle(tx.clone()), Arc::clone(&runtime))?;
    second.start().await?;
    wait_for_count(&server, 2).await;

    // Round trip through the first upgrade.
    let channel = first.channel().await.expect("client channel");
    let mut packet = channel.new_packet();
    packet.set_data(&b"hello-ws"[..])?;
    channel.write(&packet).await?;
    let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .expect("echo payload");
    assert_eq!(echoed, b"hello-ws");

    // The third upgrade is refused with a server error and never
    // becomes a channel.
    let third = WsClientStrap::with_runtime(conf(3), capture_handle(tx), runtime)?;
    assert!(third.start().await.is_err());
    assert_eq!(server.channel_count().await, 2);

    first.stop().await;
    second.stop().await;
    server.stop().await;
    assert_eq!(server.channel_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn plain_http_routes_share_the_listener() -> anyhow::Result<()> {
    let runtime = Runtime::new(ReadPoolConf::default(), ChannelConfig::default())?;
    let server = HttpWsServerStrap::with_runtime(ServerConf::new("127.0.0.1:0"), runtime)?;
    server.add_ws_route("/echo", echo_handle());
    server.add_http_route(
        "/health",
        http_handler(|_req| async {
            Response::new(Full::new(Bytes::from_static(b"healthy")))
        }),
    );
    server.start().await?;
    let addr = server.local_addr().expect("bound address");

    let request = |path: &str| {
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
    };

    // Registered plain route.
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request("/health").as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("200 OK"), "got: {response}");
    assert!(response.contains("healthy"));

    // WS route hit without an upgrade.
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request("/echo").as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let response = String::from_utf8_lossy(&response);
    assert!(
        response.contains(StatusCode::BAD_REQUEST.as_str()),
        "got: {response}"
    );

    // Unknown path.
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request("/missing").as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("404"), "got: {response}");

    server.stop().await;
    Ok(())
}
