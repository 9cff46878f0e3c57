//! Loopback integration: envelopes over real QUIC sessions.
//!
//! The proxy role opens sessions toward the accepting agent role, the
//! agent answers one request per session, exactly as the dispatcher does.

use pivot_core::protocol::{
    read_envelope, write_envelope, Envelope, HostPingRequest, HostPingResponse,
};
use pivot_core::transport::{client_endpoint, server_endpoint, TlsIdentity};

#[tokio::test]
async fn one_request_one_response_per_session() {
    let identity = TlsIdentity::self_signed().unwrap();
    let server = server_endpoint("127.0.0.1:0".parse().unwrap(), identity).unwrap();
    let server_addr = server.local_addr().unwrap();

    // Agent role: dial, then answer ping requests on accepted sessions.
    let agent = tokio::spawn(async move {
        let endpoint = client_endpoint(true).unwrap();
        let connection = endpoint
            .connect(server_addr, "pivot-proxy")
            .unwrap()
            .await
            .unwrap();

        while let Ok((mut send, mut recv)) = connection.accept_bi().await {
            let envelope = read_envelope(&mut recv).await.unwrap();
            match envelope {
                Envelope::HostPingRequest(req) => {
                    let alive = req.address == "10.0.0.5";
                    write_envelope(
                        &mut send,
                        &Envelope::HostPingResponse(HostPingResponse { alive }),
                    )
                    .await
                    .unwrap();
                }
                other => panic!("unexpected envelope {other:?}"),
            }
        }
    });

    // Proxy role: accept the agent, run two independent sessions.
    let connection = server.accept().await.unwrap().await.unwrap();

    for (address, expected) in [("10.0.0.5", true), ("10.0.0.9", false)] {
        let (mut send, mut recv) = connection.open_bi().await.unwrap();
        write_envelope(
            &mut send,
            &Envelope::HostPingRequest(HostPingRequest {
                address: address.into(),
            }),
        )
        .await
        .unwrap();

        match read_envelope(&mut recv).await.unwrap() {
            Envelope::HostPingResponse(resp) => assert_eq!(resp.alive, expected),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    connection.close(0u32.into(), b"done");
    agent.abort();
}
