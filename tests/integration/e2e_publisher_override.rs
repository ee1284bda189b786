//! Publisher override policy: a second publisher preempts the first by
//! default, and is rejected when `disablePublisherOverride` is set.

use lg_media::Description;
use lg_test_utils::{RtspTestClient, TestServer, test_conf_yaml};
use std::time::Duration;

const BASE: u16 = 21500;

#[tokio::test]
async fn second_publisher_preempts_the_first_by_default() {
    let server = TestServer::start(&test_conf_yaml(BASE, "  all_others:\n")).await;
    let rtsp_addr = format!("127.0.0.1:{}", BASE + 1);
    let desc = Description::single_video();

    let mut first = RtspTestClient::connect(&rtsp_addr).await.unwrap();
    assert_eq!(first.publish("cam", &desc).await.unwrap().status, 200);

    let mut second = RtspTestClient::connect(&rtsp_addr).await.unwrap();
    assert_eq!(second.publish("cam", &desc).await.unwrap().status, 200);

    // the first publisher's connection is closed by the preemption
    let gone = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if first.send_frame(0, b"x").await.is_err() {
                return;
            }
            let uri = first.uri("cam");
            if first.request("GET_PARAMETER", &uri, &[], &[]).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "first publisher must observe the preemption");

    // the second publisher feeds readers
    let mut reader = RtspTestClient::connect(&rtsp_addr).await.unwrap();
    assert_eq!(reader.play("cam").await.unwrap().status, 200);
    second.send_frame(0, b"from-second").await.unwrap();
    let (_, payload) = reader.recv_frame().await.unwrap();
    assert_eq!(&payload[..], b"from-second");

    server.stop().await;
}

#[tokio::test]
async fn second_publisher_is_rejected_when_override_disabled() {
    let server = TestServer::start(&test_conf_yaml(
        BASE + 50,
        "  all_others:\n    disablePublisherOverride: true\n",
    ))
    .await;
    let rtsp_addr = format!("127.0.0.1:{}", BASE + 51);
    let desc = Description::single_video();

    let mut first = RtspTestClient::connect(&rtsp_addr).await.unwrap();
    assert_eq!(first.publish("cam", &desc).await.unwrap().status, 200);

    let mut second = RtspTestClient::connect(&rtsp_addr).await.unwrap();
    let res = second.publish("cam", &desc).await.unwrap();
    assert_eq!(res.status, 403, "second publisher must be rejected");

    // the first publisher is untouched
    let mut reader = RtspTestClient::connect(&rtsp_addr).await.unwrap();
    assert_eq!(reader.play("cam").await.unwrap().status, 200);
    first.send_frame(0, b"still-first").await.unwrap();
    let (_, payload) = reader.recv_frame().await.unwrap();
    assert_eq!(&payload[..], b"still-first");

    server.stop().await;
}
