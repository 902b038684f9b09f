use beacon_link::{PartitionId, SessionState};
use beacon_sim::{FileFlash, FlashLayout, SimConfig, SimError, Simulator};
use rmpv::Value;

fn config() -> SimConfig {
    SimConfig {
        flash: FlashLayout { partitions: 2, partition_capacity: 64 * 1024 },
        ..SimConfig::default()
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|index| (index * 7 % 251) as u8).collect()
}

#[tokio::test(flavor = "current_thread")]
async fn image_is_committed_and_survives_restart() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config();
    let flash = FileFlash::open(dir.path(), &config.flash).expect("open flash");
    let sim = Simulator::start(config.clone(), flash);
    let companion = sim.companion();

    let passkey = companion.connect_and_pair().await.expect("pair");
    assert!((100_000..=999_999).contains(&passkey));

    let firmware = image(10_000);
    let report = companion.flash_image(&firmware, 1024).await.expect("flash");
    assert_eq!(report.partition, "ota_1");
    assert_eq!(report.bytes, 10_000);
    assert_eq!(report.chunks, 10);
    assert_eq!(sim.channel().session_state(), SessionState::Idle);

    drop(companion);
    let delivered = sim.shutdown().await.expect("shutdown");
    assert!(delivered > 20);

    let mut reopened = FileFlash::open(dir.path(), &config.flash).expect("reopen");
    let status = reopened.status();
    assert_eq!(status.boot, "ota_1");
    assert_eq!(status.running, "ota_0");
    assert!(status.partitions[1].validated);
    assert_eq!(status.partitions[1].image_bytes, Some(10_000));
    assert_eq!(reopened.read_image(PartitionId(1)).expect("image"), firmware);

    reopened.reboot().expect("reboot");
    assert_eq!(reopened.running_partition(), PartitionId(1));
}

#[tokio::test(flavor = "current_thread")]
async fn oversized_chunk_request_is_clamped() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config();
    let flash = FileFlash::open(dir.path(), &config.flash).expect("open flash");
    let sim = Simulator::start(config, flash);
    let companion = sim.companion();
    companion.connect_and_pair().await.expect("pair");

    let report = companion.flash_image(&image(8000), 8000).await.expect("flash");
    assert_eq!(report.chunks, 3);
    drop(companion);
    sim.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "current_thread")]
async fn disconnect_mid_update_discards_staging_image() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config();
    let flash = FileFlash::open(dir.path(), &config.flash).expect("open flash");
    let sim = Simulator::start(config.clone(), flash);
    let companion = sim.companion();
    companion.connect_and_pair().await.expect("pair");

    companion
        .call("ota_begin", vec![("size", Value::from(4096u64))])
        .await
        .expect("begin");
    assert!(dir.path().join("ota_1.bin.part").exists());

    companion.disconnect(0x08).await.expect("disconnect");
    // Any later exchange is ordered after the disconnect.
    companion.connect_and_pair().await.expect("re-pair");
    let reply = companion.exchange("ota_end", Vec::new()).await.expect("end");
    assert_eq!(reply.error_message(), Some("OTA not active"));

    let status = sim.with_storage(|flash| flash.status()).expect("status");
    assert!(!dir.path().join("ota_1.bin.part").exists());
    assert!(!status.partitions[1].validated);
    assert_eq!(status.boot, "ota_0");

    drop(companion);
    sim.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "current_thread")]
async fn device_errors_surface_as_remote_failures() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config();
    let flash = FileFlash::open(dir.path(), &config.flash).expect("open flash");
    let sim = Simulator::start(config, flash);
    let companion = sim.companion();
    companion.connect_and_pair().await.expect("pair");

    let err = companion
        .call("ota_begin", vec![("size", Value::from(1_000_000u64))])
        .await
        .expect_err("too big for slot");
    match err {
        SimError::Remote { function, message, code } => {
            assert_eq!(function, "ota_begin");
            assert_eq!(message, "begin failed");
            assert_eq!(code, Some(i64::from(beacon_link::storage::codes::INVALID_SIZE)));
        }
        other => panic!("unexpected error: {other}"),
    }

    companion
        .call("ota_begin", vec![("size", Value::from(4u64))])
        .await
        .expect("begin");
    let reply = companion
        .exchange(
            "ota_chunk",
            vec![("chunk", Value::from("AQIDBA==")), ("checksum", Value::from(11u64))],
        )
        .await
        .expect("chunk");
    assert_eq!(reply.error_message(), Some("CRC mismatch"));

    drop(companion);
    sim.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "current_thread")]
async fn unpaired_companion_is_refused() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config();
    let flash = FileFlash::open(dir.path(), &config.flash).expect("open flash");
    let sim = Simulator::start(config, flash);
    let companion = sim.companion();

    let err = companion.call("get_settings", Vec::new()).await.expect_err("no link");
    assert!(matches!(err, SimError::Remote { ref message, .. } if message == "unauthenticated"));

    drop(companion);
    sim.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "current_thread")]
async fn screen_shows_boot_frame() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config();
    let flash = FileFlash::open(dir.path(), &config.flash).expect("open flash");
    let sim = Simulator::start(config, flash);
    let companion = sim.companion();
    companion.connect_and_pair().await.expect("pair");

    let lines = companion.screen().await.expect("screen");
    assert_eq!(lines.len(), beacon_sim::DISPLAY_HEIGHT);
    assert_eq!(lines[0], "#".repeat(beacon_sim::DISPLAY_WIDTH));
    assert!(lines[10].starts_with('#') && lines[10].ends_with('#'));
    assert_eq!(lines[10].matches('#').count(), 2);

    drop(companion);
    sim.shutdown().await.expect("shutdown");
}
