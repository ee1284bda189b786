//! Hot configuration swap through the API: an exact path configuration
//! added over a catch-all rebinds the live path without dropping its
//! stream; deleting it reverts; re-applying identical config recreates
//! nothing.

use lg_test_utils::{RtmpTestPublisher, TestServer, test_conf_yaml, wait_until};
use std::time::Duration;

const BASE: u16 = 21300;

#[tokio::test]
async fn config_swap_rebinds_conf_name_without_dropping_the_stream() {
    let server = TestServer::start(&test_conf_yaml(BASE, "  all:\n    record: false\n")).await;
    let rtmp_addr = format!("127.0.0.1:{}", BASE + 2);
    let api_base = format!("http://127.0.0.1:{}/v3", BASE);
    let client = reqwest::Client::new();

    let mut publisher = RtmpTestPublisher::publish(&rtmp_addr, "undefined_stream", "")
        .await
        .unwrap();
    publisher.send_media(0, b"payload").await.unwrap();

    let body: serde_json::Value = client
        .get(format!("{api_base}/paths/get/undefined_stream"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["confName"], "all");
    assert_eq!(body["ready"], true);

    // add an exact configuration: the path must rebind, stream intact
    let res = client
        .post(format!("{api_base}/config/paths/add/undefined_stream"))
        .json(&serde_json::json!({"record": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    wait_until("path to rebind to the exact conf", Duration::from_secs(2), async || {
        let Ok(res) = client
            .get(format!("{api_base}/paths/get/undefined_stream"))
            .send()
            .await
        else {
            return false;
        };
        let Ok(body) = res.json::<serde_json::Value>().await else {
            return false;
        };
        body["confName"] == "undefined_stream" && body["ready"] == true
    })
    .await;

    // the publisher connection survived the swap
    publisher.send_media(0, b"still-alive").await.unwrap();

    // deleting the exact configuration reverts to the catch-all
    let res = client
        .delete(format!("{api_base}/config/paths/delete/undefined_stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    wait_until("path to revert to the catch-all", Duration::from_secs(2), async || {
        let Ok(res) = client
            .get(format!("{api_base}/paths/get/undefined_stream"))
            .send()
            .await
        else {
            return false;
        };
        let Ok(body) = res.json::<serde_json::Value>().await else {
            return false;
        };
        body["confName"] == "all" && body["ready"] == true
    })
    .await;
    publisher.send_media(0, b"still-here").await.unwrap();

    server.stop().await;
}

#[tokio::test]
async fn reapplying_identical_config_recreates_nothing() {
    let server = TestServer::start(&test_conf_yaml(BASE + 50, "  all_others:\n")).await;
    let rtmp_addr = format!("127.0.0.1:{}", BASE + 52);
    let api_base = format!("http://127.0.0.1:{}/v3", BASE + 50);
    let client = reqwest::Client::new();

    let mut publisher = RtmpTestPublisher::publish(&rtmp_addr, "live", "cam")
        .await
        .unwrap();

    let conn_id = {
        let body: serde_json::Value = client
            .get(format!("{api_base}/rtmpconns/list"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["items"][0]["id"].as_str().unwrap().to_owned()
    };

    // a no-op global patch: every close flag must stay false
    let res = client
        .patch(format!("{api_base}/config/global/patch"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // same connection id: the RTMP server was not recreated
    let body: serde_json::Value = client
        .get(format!("{api_base}/rtmpconns/get/{conn_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["id"].as_str().unwrap(), conn_id);
    publisher.send_media(0, b"uninterrupted").await.unwrap();

    // a validation failure leaves everything untouched and returns 400
    let res = client
        .patch(format!("{api_base}/config/global/patch"))
        .json(&serde_json::json!({"writeQueueSize": 1000}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("power of two"));

    server.stop().await;
}
