//! End-to-end reverse listener over real QUIC.
//!
//! The proxy asks the agent for a listener, an external client connects
//! to it, the accepted socket is claimed with a sock-attach session, and
//! bytes relay through to a local target on the proxy side. The agent
//! half is the real dispatcher, not a scripted fake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use pivot_agent::handler::{handle_session, AgentContext};
use pivot_core::transport::{client_endpoint, server_endpoint, TlsIdentity};
use pivot_proxy::forward::{close_remote_listener, run_remote_forward, RemoteForward};

#[tokio::test]
async fn reverse_listener_relays_external_connections() {
    let identity = TlsIdentity::self_signed().unwrap();
    let server = server_endpoint("127.0.0.1:0".parse().unwrap(), identity).unwrap();
    let server_addr = server.local_addr().unwrap();

    // Agent side: dial in, then serve every session with the dispatcher.
    let agent = tokio::spawn(async move {
        let endpoint = client_endpoint(true).unwrap();
        let connection = endpoint
            .connect(server_addr, "pivot-proxy")
            .unwrap()
            .await
            .unwrap();

        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let ctx = Arc::new(AgentContext::new(shutdown_tx));
        while let Ok((send, recv)) = connection.accept_bi().await {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                let _ = handle_session(recv, send, ctx).await;
            });
        }
    });

    let connection = server.accept().await.unwrap().await.unwrap();

    // The operator-side sink each accepted connection is spliced into.
    let sink = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sink_addr = sink.local_addr().unwrap();
    let sink_task = tokio::spawn(async move {
        let (mut sock, _) = sink.accept().await.unwrap();
        let mut buf = [0u8; 5];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        sock.write_all(b"world").await.unwrap();
    });

    // A free port for the agent-side listener; the response envelope does
    // not echo the bound address, so the test must pick one it knows.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent_bind = probe.local_addr().unwrap();
    drop(probe);

    let forward = RemoteForward {
        bind: agent_bind.to_string(),
        target: sink_addr.to_string(),
    };
    let forward_task = tokio::spawn(run_remote_forward(connection.clone(), forward));

    // External client: retry until the remote listener is up.
    let mut client = connect_with_retry(agent_bind).await;

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    sink_task.await.unwrap();
    drop(client);

    // Tear the listener down: first one in this agent process, id 0. The
    // bind stream then ends with its final error frame and the forward
    // task returns cleanly.
    close_remote_listener(&connection, 0).await.unwrap();
    forward_task.await.unwrap().unwrap();

    // A second close must report the id as unknown.
    assert!(close_remote_listener(&connection, 0).await.is_err());

    connection.close(0u32.into(), b"done");
    agent.abort();
}

async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("remote listener never came up on {addr}");
}
