//! Method routing and out-of-dialog requests

mod common;

use common::*;
use std::net::SocketAddr;
use voxsip::infrastructure::protocols::sip::message::HeaderAccess;

fn request(method: &str, peer: SocketAddr, server: SocketAddr, call_id: &str) -> String {
    RawRequest {
        method,
        uri: format!("sip:bot@{}", server),
        via: peer,
        branch: branch(),
        from: "<sip:carol@127.0.0.1>;tag=carol1".to_string(),
        to: "<sip:bot@127.0.0.1>".to_string(),
        call_id,
        cseq: 1,
        body: None,
    }
    .render()
}

#[tokio::test]
async fn test_out_of_dialog_methods() {
    let server = start_server(32400).await;
    let addr = server.local_addr();
    let peer = Peer::bind().await;

    let cases = [
        ("OPTIONS", 200),
        ("REGISTER", 200),
        ("MESSAGE", 200),
        ("REFER", 603),
        ("SUBSCRIBE", 489),
        ("BYE", 481),
        ("CANCEL", 481),
    ];
    for (i, (method, code)) in cases.iter().enumerate() {
        let call_id = format!("methods-{}", i);
        peer.send(addr, &request(method, peer.addr, addr, &call_id)).await;
        let (_, response) = peer.expect_response(*code).await;
        assert_eq!(response.call_id().as_deref(), Some(call_id.as_str()), "{}", method);
    }
    assert_eq!(server.session_count().await, 0);
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_method_gets_allow_list() {
    let server = start_server(32500).await;
    let addr = server.local_addr();
    let peer = Peer::bind().await;

    peer.send(addr, &request("PUBLISH", peer.addr, addr, "publish-1")).await;
    let (_, response) = peer.expect_response(405).await;
    let allow = response.header("allow").expect("405 lists allowed methods");
    assert!(allow.contains("INVITE"));
    assert!(allow.contains("BYE"));
    assert!(!allow.contains("PUBLISH"));
    server.stop().await;
}

#[tokio::test]
async fn test_retransmitted_request_answered_once() {
    let server = start_server(32600).await;
    let addr = server.local_addr();
    let peer = Peer::bind().await;

    let options = request("OPTIONS", peer.addr, addr, "retransmit-1");
    peer.send(addr, &options).await;
    peer.expect_response(200).await;

    // same branch again: the cached response comes back, no new handling
    peer.send(addr, &options).await;
    let (_, again) = peer.expect_response(200).await;
    assert_eq!(again.call_id().as_deref(), Some("retransmit-1"));
    server.stop().await;
}

#[tokio::test]
async fn test_garbage_datagrams_do_not_stop_intake() {
    let server = start_server(32800).await;
    let addr = server.local_addr();
    let peer = Peer::bind().await;

    let garbage: [&[u8]; 4] = [b"\xff", b"\xc3\x28 sip:x SIP/2.0\r\n\r\n", b"INVITE", b"SIP/2.0 200"];
    for garbage in garbage {
        peer.socket.send_to(garbage, addr).await.unwrap();
    }
    peer.send(addr, &request("OPTIONS", peer.addr, addr, "after-garbage")).await;
    let (_, response) = peer.expect_response(200).await;
    assert_eq!(response.call_id().as_deref(), Some("after-garbage"));
    server.stop().await;
}

#[tokio::test]
async fn test_invite_with_invalid_sdp_bytes_is_answered() {
    let server = start_server(32900).await;
    let addr = server.local_addr();
    let peer = Peer::bind().await;

    let mut invite = RawRequest {
        method: "INVITE",
        uri: format!("sip:bot@{}", addr),
        via: peer.addr,
        branch: branch(),
        from: "<sip:carol@127.0.0.1>;tag=carol1".to_string(),
        to: "<sip:bot@127.0.0.1>".to_string(),
        call_id: "bad-sdp-1",
        cseq: 1,
        body: Some("v=0\r\nX=x\r\nc=IN IP4 127.0.0.1\r\nm=audio 40000 RTP/AVP 8\r\n".to_string()),
    }
    .render()
    .into_bytes();
    // corrupt the first byte of the "X=x" line
    let at = invite.windows(3).position(|w| w == b"X=x").unwrap();
    invite[at] = 0xff;
    peer.socket.send_to(&invite, addr).await.unwrap();

    let (_, ok) = peer.expect_response(200).await;
    let answer = String::from_utf8_lossy(ok.body()).into_owned();
    assert!(answer.contains(" RTP/AVP 8\r\n"), "{}", answer);
    server.stop().await;
}
