//! On-demand source lifecycle: lazy start on first reader, readiness wait,
//! start-timeout rejection, and inactivity-driven shutdown.

use lg_media::Description;
use lg_test_utils::{RtspTestClient, TestServer, test_conf_yaml, wait_until};
use std::time::Duration;

const BASE: u16 = 21200;

#[tokio::test]
async fn static_source_starts_on_demand_and_stops_after_last_reader() {
    let paths = format!(
        "  src:
  '~^(on)demand$':
    source: rtsp://127.0.0.1:{rtsp}/src
    sourceOnDemand: true
    sourceOnDemandStartTimeout: 5s
    sourceOnDemandCloseAfter: 1s
",
        rtsp = BASE + 1
    );
    let server = TestServer::start(&test_conf_yaml(BASE, &paths)).await;
    let rtsp_addr = format!("127.0.0.1:{}", BASE + 1);
    let api_base = format!("http://127.0.0.1:{}/v3", BASE);

    // feed the upstream path continuously
    let mut publisher = RtspTestClient::connect(&rtsp_addr).await.unwrap();
    let res = publisher
        .publish("src", &Description::single_video())
        .await
        .unwrap();
    assert_eq!(res.status, 200);
    let feed = tokio::spawn(async move {
        loop {
            if publisher.send_frame(0, b"tick").await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
    });

    // the on-demand path is idle until a reader shows up
    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .get(format!("{api_base}/paths/get/src"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["readers"].as_array().unwrap().is_empty());

    // DESCRIBE blocks until the pull source is ready, then succeeds
    let mut reader = RtspTestClient::connect(&rtsp_addr).await.unwrap();
    let res = reader.play("ondemand").await.unwrap();
    assert_eq!(res.status, 200);
    let (_, payload) = reader.recv_frame().await.unwrap();
    assert_eq!(&payload[..], b"tick");

    // the upstream path now has the pull source attached as a reader
    wait_until("pull source to attach upstream", Duration::from_secs(2), async || {
        let Ok(res) = client.get(format!("{api_base}/paths/get/src")).send().await else {
            return false;
        };
        let Ok(body) = res.json::<serde_json::Value>().await else {
            return false;
        };
        !body["readers"].as_array().unwrap().is_empty()
    })
    .await;

    // reader leaves; after sourceOnDemandCloseAfter the pull source detaches
    reader.teardown("ondemand").await.unwrap();
    drop(reader);
    wait_until(
        "pull source to detach after inactivity",
        Duration::from_secs(5),
        async || {
            let Ok(res) = client.get(format!("{api_base}/paths/get/src")).send().await else {
                return false;
            };
            let Ok(body) = res.json::<serde_json::Value>().await else {
                return false;
            };
            body["readers"].as_array().unwrap().is_empty()
        },
    )
    .await;

    feed.abort();
    server.stop().await;
}

#[tokio::test]
async fn on_demand_start_timeout_rejects_the_reader() {
    let paths = "  never:
    runOnDemand: sleep 60
    sourceOnDemandStartTimeout: 300ms
";
    let server = TestServer::start(&test_conf_yaml(BASE + 50, paths)).await;
    let rtsp_addr = format!("127.0.0.1:{}", BASE + 51);

    let mut reader = RtspTestClient::connect(&rtsp_addr).await.unwrap();
    let started = std::time::Instant::now();
    let uri = reader.uri("never");
    let res = reader.request("DESCRIBE", &uri, &[], &[]).await.unwrap();
    assert_eq!(res.status, 404, "timed-out on-demand start must reject");
    assert!(started.elapsed() >= Duration::from_millis(300));

    server.stop().await;
}
