//! Public HTTP traffic relayed through tunnels

use std::time::Duration;

use hyper::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use burrow_e2e::{ControlClient, MockHttpService, TestClient, TestServer, TestServerConfig};

/// Initialize tracing and crypto provider for tests
fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("burrow_server=debug,burrow=debug,burrow_e2e=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_request_relayed_through_hand_driven_client() {
    init_test();

    let server = TestServer::start().await;
    let mut control = ControlClient::authenticated(&server, Some("abc123"))
        .await
        .expect("Failed to authenticate");
    assert_eq!(control.endpoint_id(), "abc123");

    // 1. Public caller
    let http_client = server.http_client();
    let url = server.public_url("/test-path");
    let host = server.host_for("abc123");
    let caller = tokio::spawn(async move {
        http_client
            .get(url)
            .header("Host", host)
            .send()
            .await
            .expect("HTTP request failed")
    });

    // 2. The broker announces the request, we open its tunnel stream
    let request_id = control
        .expect_new_request()
        .await
        .expect("No new-request received");
    let tunnel = control
        .open_tunnel(&request_id)
        .await
        .expect("Tunnel stream rejected");

    // 3. Serve the request on the tunnel stream
    let service = MockHttpService::detached();
    service.set_response_body("Hello through tunnel!");
    let serving = service.clone();
    tokio::spawn(async move { serving.serve(tunnel).await });

    let resp = caller.await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "Hello through tunnel!");

    let request = service.last_request().expect("request not recorded");
    assert_eq!(request.method, "GET");
    assert_eq!(request.uri, "/test-path");
    assert!(request
        .headers
        .iter()
        .any(|(name, value)| name == "host" && value == "abc123.e.localhost"));
}

#[tokio::test]
async fn test_bytes_relayed_unmodified() {
    init_test();

    let server = TestServer::start().await;
    let mut control = ControlClient::authenticated(&server, Some("raw"))
        .await
        .unwrap();

    let body: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let mut request = format!(
        "POST /upload?x=1 HTTP/1.1\r\nHost: RAW.e.localhost\r\nX-Odd:  spaced \r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);

    let mut public = TcpStream::connect(server.public_addr).await.unwrap();
    public.write_all(&request).await.unwrap();

    let request_id = control.expect_new_request().await.unwrap();
    let mut tunnel = control.open_tunnel(&request_id).await.unwrap();

    // The head and the body arrive exactly as the caller wrote them
    let mut received = vec![0u8; request.len()];
    tunnel.read_exact(&mut received).await.unwrap();
    assert_eq!(received, request);

    // Whatever the client writes back reaches the caller untouched
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\n\x00\xffz";
    tunnel.write_all(response).await.unwrap();
    tunnel.shutdown().await.unwrap();

    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), public.read_to_end(&mut out))
        .await
        .expect("Timed out reading the relayed response")
        .unwrap();
    assert_eq!(out, response);
}

#[tokio::test]
async fn test_ping_pong_on_control_channel() {
    init_test();

    let server = TestServer::start().await;
    let mut control = ControlClient::authenticated(&server, None).await.unwrap();
    assert!(!control.endpoint_id().is_empty());

    control.send(burrow_protocol::ClientCommand::Ping).await.unwrap();
    let msg = control.recv().await.unwrap();
    assert!(
        matches!(
            msg,
            Some(burrow_protocol::ServerMessage::Command(
                burrow_protocol::ServerCommand::Pong
            ))
        ),
        "Expected pong, got {:?}",
        msg
    );
}

#[tokio::test]
async fn test_client_forwards_get_to_local_service() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_body(b"Hello from local service!".to_vec());

    let client = TestClient::connect(&server, &mock.addr_string(), None)
        .await
        .expect("Failed to connect client");
    let endpoint_id = client.endpoint_id().to_string();
    tracing::info!("Tunnel established for endpoint: {}", endpoint_id);

    let resp = server
        .http_client()
        .get(server.public_url("/test-path"))
        .header("Host", server.host_for(&endpoint_id))
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "Hello from local service!");

    let requests = mock.get_requests();
    assert_eq!(requests.len(), 1, "Expected 1 request, got {}", requests.len());
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].uri, "/test-path");
}

#[tokio::test]
async fn test_every_public_listener_reaches_the_tunnel() {
    init_test();

    let server = TestServer::start_with(TestServerConfig {
        public_listeners: 2,
        ..TestServerConfig::default()
    })
    .await;
    assert_eq!(server.public_addrs.len(), 2);
    assert_ne!(server.public_addrs[0], server.public_addrs[1]);

    let mock = MockHttpService::start().await;
    mock.set_response_body("same service");

    let client = TestClient::connect(&server, &mock.addr_string(), Some("twoports"))
        .await
        .expect("Failed to connect client");

    for (i, addr) in server.public_addrs.iter().enumerate() {
        let resp = server
            .http_client()
            .get(format!("http://{}/via/{}", addr, i))
            .header("Host", server.host_for(client.endpoint_id()))
            .send()
            .await
            .expect("HTTP request failed");
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "same service");
    }

    let uris: Vec<_> = mock.get_requests().into_iter().map(|r| r.uri).collect();
    assert_eq!(uris, vec!["/via/0", "/via/1"]);
}

#[tokio::test]
async fn test_client_forwards_post_with_body() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_status(StatusCode::CREATED);
    mock.set_response_body(b"{\"id\": 123}".to_vec());
    mock.add_response_header("content-type", "application/json");

    let client = TestClient::connect(&server, &mock.addr_string(), Some("poster"))
        .await
        .unwrap();
    assert_eq!(client.endpoint_id(), "poster");

    let request_body = r#"{"name": "test", "value": 42}"#;
    let resp = server
        .http_client()
        .post(server.public_url("/api/users"))
        .header("Host", server.host_for("poster"))
        .header("Content-Type", "application/json")
        .body(request_body)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 201);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(resp.text().await.unwrap(), "{\"id\": 123}");

    let request = mock.last_request().unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.uri, "/api/users");
    assert_eq!(request.body, request_body.as_bytes());
}

#[tokio::test]
async fn test_client_handles_sequential_and_concurrent_requests() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    let client = TestClient::connect(&server, &mock.addr_string(), Some("busy"))
        .await
        .unwrap();
    let host = server.host_for(client.endpoint_id());

    // Reused connection
    let http_client = server.http_client();
    for i in 0..3 {
        let resp = http_client
            .get(server.public_url(&format!("/seq/{}", i)))
            .header("Host", &host)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    // Fresh connections in parallel
    let mut handles = Vec::new();
    for i in 0..5 {
        let url = server.public_url(&format!("/par/{}", i));
        let host = host.clone();
        handles.push(tokio::spawn(async move {
            reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap()
                .get(url)
                .header("Host", host)
                .send()
                .await
                .unwrap()
                .status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 200);
    }

    let mut uris: Vec<String> = mock.get_requests().into_iter().map(|r| r.uri).collect();
    uris.sort();
    assert_eq!(
        uris,
        vec!["/par/0", "/par/1", "/par/2", "/par/3", "/par/4", "/seq/0", "/seq/1", "/seq/2"]
    );
}

#[tokio::test]
async fn test_unreachable_local_service_gives_bad_gateway() {
    init_test();

    let server = TestServer::start().await;
    // Nothing listens on the discard port
    let client = TestClient::connect(&server, "127.0.0.1:9", Some("nolocal"))
        .await
        .unwrap();

    let resp = server
        .http_client()
        .get(server.public_url("/"))
        .header("Host", server.host_for(client.endpoint_id()))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn test_client_shutdown_releases_endpoint() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    let mut client = TestClient::connect(&server, &mock.addr_string(), Some("leaving"))
        .await
        .unwrap();
    server.wait_for_endpoint("leaving", true).await;

    client.shutdown().await.expect("Client did not end cleanly");
    server.wait_for_endpoint("leaving", false).await;

    let resp = server
        .http_client()
        .get(server.public_url("/"))
        .header("Host", server.host_for("leaving"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // The endpoint can be claimed again
    let again = TestClient::connect(&server, &mock.addr_string(), Some("leaving"))
        .await
        .expect("Endpoint should be free again");
    assert_eq!(again.endpoint_id(), "leaving");
}
