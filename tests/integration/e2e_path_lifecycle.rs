//! End-to-end path lifecycle: admission misses, publish/read over RTSP and
//! SRT, HLS remux, API visibility, and teardown propagation.

use lg_media::Description;
use lg_test_utils::{RtspTestClient, SrtTestClient, TestServer, test_conf_yaml, wait_until};
use std::time::Duration;

const BASE: u16 = 21100;

fn addr(offset: u16) -> String {
    format!("127.0.0.1:{}", BASE + offset)
}

fn api(pathname: &str) -> String {
    format!("http://{}/v3/{pathname}", addr(0))
}

#[tokio::test]
async fn setup_miss_returns_not_found_and_no_path_is_left_behind() {
    let server = TestServer::start(&test_conf_yaml(BASE, "  all_others:\n")).await;

    let mut client = RtspTestClient::connect(&addr(1)).await.unwrap();
    let uri = format!("{}/trackID=0", client.uri("mypath"));
    let res = client.request("SETUP", &uri, &[], &[]).await.unwrap();
    assert_eq!(res.status, 404);

    // the dynamically-created path must be gone
    tokio::time::sleep(Duration::from_millis(100)).await;
    let body: serde_json::Value = reqwest::get(api("paths/list"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["itemCount"], 0);
    assert_eq!(body["items"], serde_json::json!([]));

    server.stop().await;
}

#[tokio::test]
async fn publish_read_flow_with_api_visibility() {
    let server = TestServer::start(&test_conf_yaml(BASE + 10, "  all_others:\n")).await;
    let rtsp = format!("127.0.0.1:{}", BASE + 11);
    let api_base = format!("http://127.0.0.1:{}/v3", BASE + 10);

    let mut publisher = RtspTestClient::connect(&rtsp).await.unwrap();
    let desc = Description::video_and_audio();
    let res = publisher.publish("live/cam", &desc).await.unwrap();
    assert_eq!(res.status, 200);

    let mut reader = RtspTestClient::connect(&rtsp).await.unwrap();
    let res = reader.play("live/cam").await.unwrap();
    assert_eq!(res.status, 200);

    publisher.send_frame(0, b"frame-0").await.unwrap();
    publisher.send_frame(1, b"frame-1").await.unwrap();
    let (track, payload) = reader.recv_frame().await.unwrap();
    assert_eq!(track, 0);
    assert_eq!(&payload[..], b"frame-0");
    let (track, payload) = reader.recv_frame().await.unwrap();
    assert_eq!(track, 1);
    assert_eq!(&payload[..], b"frame-1");

    // API sees a ready path with one publisher and one reader
    let client = reqwest::Client::new();
    wait_until("path to report one reader", Duration::from_secs(2), async || {
        let Ok(res) = client
            .get(format!("{api_base}/paths/get/live/cam"))
            .send()
            .await
        else {
            return false;
        };
        let Ok(body) = res.json::<serde_json::Value>().await else {
            return false;
        };
        body["ready"] == true
            && body["confName"] == "all_others"
            && body["readers"].as_array().is_some_and(|r| r.len() == 1)
            && body["source"]["type"] == "rtspSession"
    })
    .await;

    // conn and session registries are populated and sorted
    let conns: serde_json::Value = client
        .get(format!("{api_base}/rtspconns/list"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(conns["itemCount"], 2);
    let sessions: serde_json::Value = client
        .get(format!("{api_base}/rtspsessions/list"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions["itemCount"], 2);
    let states: Vec<&str> = sessions["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["state"].as_str().unwrap())
        .collect();
    assert!(states.contains(&"publish"));
    assert!(states.contains(&"read"));

    // publisher teardown evicts the reader
    publisher.teardown("live/cam").await.unwrap();
    let evicted = tokio::time::timeout(Duration::from_secs(2), reader.recv_frame()).await;
    assert!(
        matches!(evicted, Ok(Err(_))),
        "reader connection must be closed when the publisher leaves"
    );

    server.stop().await;
}

#[tokio::test]
async fn srt_publish_rtsp_read_and_hls_remux() {
    let server = TestServer::start(&test_conf_yaml(BASE + 20, "  all_others:\n")).await;
    let srt_addr = format!("127.0.0.1:{}", BASE + 23);
    let rtsp_addr = format!("127.0.0.1:{}", BASE + 21);
    let hls_base = format!("http://127.0.0.1:{}", BASE + 25);
    let api_base = format!("http://127.0.0.1:{}/v3", BASE + 20);

    let srt = SrtTestClient::connect(&srt_addr, "#!::r=feed,m=publish")
        .await
        .unwrap();

    let mut reader = RtspTestClient::connect(&rtsp_addr).await.unwrap();
    let res = reader.play("feed").await.unwrap();
    assert_eq!(res.status, 200);

    srt.send_media(0, b"srt-payload").await.unwrap();
    let (track, payload) = reader.recv_frame().await.unwrap();
    assert_eq!(track, 0);
    assert_eq!(&payload[..], b"srt-payload");

    let client = reqwest::Client::new();
    let conns: serde_json::Value = client
        .get(format!("{api_base}/srtconns/list"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(conns["itemCount"], 1);
    assert_eq!(conns["items"][0]["state"], "publish");

    // HLS: the first playlist request creates a muxer reading the path
    let res = client
        .get(format!("{hls_base}/feed/index.m3u8"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    // keep feeding so a segment rotates in
    for i in 0..30u8 {
        srt.send_media(0, &[i; 64]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    wait_until("playlist to carry a segment", Duration::from_secs(5), async || {
        let Ok(res) = client.get(format!("{hls_base}/feed/index.m3u8")).send().await else {
            return false;
        };
        res.text().await.is_ok_and(|t| t.contains(".ts"))
    })
    .await;

    let muxers: serde_json::Value = client
        .get(format!("{api_base}/hlsmuxers/list"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(muxers["itemCount"], 1);
    assert_eq!(muxers["items"][0]["path"], "feed");

    server.stop().await;
}
