//! SDK broker over a loopback TCP connection.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use hr_bridge::broker::SdkBias;
use hr_bridge::config::SdkConfig;
use hr_bridge::prelude::*;
use hr_bridge::protocol::{decode_message, encode_message, HrMessage, SdkMessage};
use hr_bridge::source::SdkBridgeSource;

fn source() -> SdkBridgeSource {
    let config = BridgeConfig {
        source: "sdk".into(),
        sdk: SdkConfig {
            bind: "127.0.0.1:0".into(),
            plugin_dir: None,
        },
        ..BridgeConfig::default()
    };
    SdkBridgeSource::new(config.descriptor().unwrap(), SdkBias::default()).unwrap()
}

async fn listening(source: &SdkBridgeSource) -> std::net::SocketAddr {
    for _ in 0..100 {
        if let Some(addr) = source.broker().local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("broker never started listening");
}

fn hr(name: &str, bpm: u32, active: bool) -> String {
    encode_message(&SdkMessage::Hr(HrMessage {
        sdk_name: name.into(),
        bpm,
        is_open: true,
        is_active: active,
    }))
    .unwrap()
}

#[tokio::test]
async fn remote_reporter_drives_the_source() {
    let mut source = source();
    source.start().await.unwrap();
    let addr = listening(&source).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(hr("Band", 88, true).as_bytes()).await.unwrap();

    let mut bpm = source.heart_rate();
    tokio::time::timeout(Duration::from_secs(5), bpm.wait_for(|s| s.bpm == 88))
        .await
        .unwrap()
        .unwrap();
    assert!(*source.connected().borrow());

    write
        .write_all(encode_message(&SdkMessage::GetHrData).unwrap().as_bytes())
        .await
        .unwrap();
    // Keep-alives may arrive first.
    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let line = lines.next_line().await.unwrap().unwrap();
            match decode_message(&line).unwrap() {
                SdkMessage::Update => continue,
                other => break other,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        reply,
        SdkMessage::Hr(HrMessage {
            sdk_name: "Band".into(),
            bpm: 88,
            is_open: true,
            is_active: true,
        })
    );

    source.stop().await;
    assert_eq!(source.heart_rate().borrow().bpm, 0);
    assert!(source.broker().local_addr().is_none());
}

#[tokio::test]
async fn destroying_a_remote_reporter_closes_its_socket() {
    let mut source = source();
    source.start().await.unwrap();
    let addr = listening(&source).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(hr("Band", 64, true).as_bytes()).await.unwrap();

    let mut bpm = source.heart_rate();
    tokio::time::timeout(Duration::from_secs(5), bpm.wait_for(|s| s.bpm == 64))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(source.broker().destroy("Band"), 1);
    assert!(source.broker().reports().is_empty());

    // Anything still queued is a keep-alive; then the broker hangs up.
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(line) = lines.next_line().await.unwrap() {
            assert_eq!(decode_message(&line).unwrap(), SdkMessage::Update);
        }
    })
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), bpm.wait_for(|s| s.bpm == 0))
        .await
        .unwrap()
        .unwrap();
    source.stop().await;
}

#[tokio::test]
async fn bias_selects_among_active_reporters() {
    let bias = SdkBias::default();
    let config = BridgeConfig {
        source: "sdk".into(),
        sdk: SdkConfig {
            bind: "127.0.0.1:0".into(),
            plugin_dir: None,
        },
        ..BridgeConfig::default()
    };
    let mut source = SdkBridgeSource::new(config.descriptor().unwrap(), bias.clone()).unwrap();
    source.start().await.unwrap();
    let addr = listening(&source).await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(hr("Watch", 70, true).as_bytes()).await.unwrap();
    let mut bpm = source.heart_rate();
    tokio::time::timeout(Duration::from_secs(5), bpm.wait_for(|s| s.bpm == 70))
        .await
        .unwrap()
        .unwrap();

    let mut second = TcpStream::connect(addr).await.unwrap();
    second.write_all(hr("Strap", 95, true).as_bytes()).await.unwrap();
    bias.set(Some("Strap".into()));
    tokio::time::timeout(Duration::from_secs(5), bpm.wait_for(|s| s.bpm == 95))
        .await
        .unwrap()
        .unwrap();

    // Dropping the biased reporter falls back to the other one.
    drop(second);
    tokio::time::timeout(Duration::from_secs(5), bpm.wait_for(|s| s.bpm == 70))
        .await
        .unwrap()
        .unwrap();

    source.stop().await;
}
