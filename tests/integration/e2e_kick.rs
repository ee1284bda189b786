//! API kick semantics across front-ends: effective on reply, exactly-once,
//! not-found afterwards.

use lg_test_utils::{RtmpTestPublisher, TestServer, test_conf_yaml, wait_until};
use std::time::Duration;

const BASE: u16 = 21400;

#[tokio::test]
async fn rtmp_kick_removes_conn_then_returns_not_found() {
    let server = TestServer::start(&test_conf_yaml(BASE, "  all_others:\n")).await;
    let rtmp_addr = format!("127.0.0.1:{}", BASE + 2);
    let api_base = format!("http://127.0.0.1:{}/v3", BASE);
    let client = reqwest::Client::new();

    let mut publisher = RtmpTestPublisher::publish(&rtmp_addr, "live", "cam")
        .await
        .unwrap();

    let body: serde_json::Value = client
        .get(format!("{api_base}/rtmpconns/list"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["itemCount"], 1);
    assert_eq!(body["items"][0]["state"], "publish");
    assert_eq!(body["items"][0]["path"], "live/cam");
    let id = body["items"][0]["id"].as_str().unwrap().to_owned();

    // kick succeeds exactly once
    let res = client
        .post(format!("{api_base}/rtmpconns/kick/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    // effective by the time the reply returned
    let res = client
        .get(format!("{api_base}/rtmpconns/get/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
    let res = client
        .post(format!("{api_base}/rtmpconns/kick/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    // the socket teardown completes asynchronously
    assert!(publisher.is_closed().await);

    // the path loses its source
    wait_until("path to become not ready", Duration::from_secs(2), async || {
        let Ok(res) = client
            .get(format!("{api_base}/paths/get/live/cam"))
            .send()
            .await
        else {
            return false;
        };
        match res.status().as_u16() {
            404 => true, // dynamic path already destroyed
            200 => res
                .json::<serde_json::Value>()
                .await
                .is_ok_and(|b| b["ready"] == false),
            _ => false,
        }
    })
    .await;

    server.stop().await;
}

#[tokio::test]
async fn webrtc_whip_session_appears_and_kicks() {
    let server = TestServer::start(&test_conf_yaml(BASE + 50, "  all_others:\n")).await;
    let whip_base = format!("http://127.0.0.1:{}", BASE + 54);
    let api_base = format!("http://127.0.0.1:{}/v3", BASE + 50);
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{whip_base}/cam/whip"))
        .header("content-type", "application/sdp")
        .body("v=0\r\n")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);
    assert!(res.headers().contains_key("location"));
    let answer = res.text().await.unwrap();
    assert!(answer.contains("a=candidate"));

    let body: serde_json::Value = client
        .get(format!("{api_base}/webrtcsessions/list"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["itemCount"], 1);
    assert_eq!(body["items"][0]["state"], "publish");
    let id = body["items"][0]["id"].as_str().unwrap().to_owned();

    let res = client
        .post(format!("{api_base}/webrtcsessions/kick/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let res = client
        .get(format!("{api_base}/webrtcsessions/get/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    // a WHEP request against an unpublished path is refused
    let res = client
        .post(format!("{whip_base}/ghost/whep"))
        .body("v=0\r\n")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn unknown_registry_and_disabled_server_return_not_found() {
    // RTSP disabled: its registries must answer 404, the others still work
    let yaml = test_conf_yaml(BASE + 70, "  all_others:\n").replace("rtsp: true", "rtsp: false");
    let server = TestServer::start(&yaml).await;
    let api_base = format!("http://127.0.0.1:{}/v3", BASE + 70);
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{api_base}/rtspconns/list"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    let res = client
        .get(format!("{api_base}/rtmpconns/list"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let res = client
        .get(format!("{api_base}/nosuchthing/list"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    server.stop().await;
}
