//! End-to-end transfers against the loopback service layer.

use fpga_svc::{
    Command, EngineConfig, FpgaManager, ImageFlags, LoopbackBehavior, LoopbackService, Phase,
    SvcError, TransferState,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const KIB: usize = 1024;

fn attach_with(
    behavior: LoopbackBehavior,
    config: EngineConfig,
) -> anyhow::Result<FpgaManager<LoopbackService>> {
    let svc = Arc::new(LoopbackService::new(behavior)?);
    Ok(FpgaManager::attach(svc, config)?)
}

fn small_config() -> EngineConfig {
    EngineConfig {
        num_buffers: 4,
        buffer_size: 4 * KIB,
        request_timeout_ms: 1000,
        buffer_timeout_ms: 1000,
        device_mapping: false,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

#[test]
fn test_reference_pool_three_buffer_image() -> anyhow::Result<()> {
    // Four 512KB buffers, image of 512 + 512 + 476 KB
    let mut mgr = attach_with(LoopbackBehavior::default(), EngineConfig::default())?;
    let image = pattern(1500 * KIB);

    mgr.begin(image.len(), ImageFlags::empty())?;
    assert_eq!(mgr.write(&image)?, image.len());
    let stats = mgr.finish()?;

    assert_eq!(
        mgr.channel().submit_lengths(),
        vec![512 * KIB, 512 * KIB, 476 * KIB]
    );
    assert_eq!(stats.submits, 3);
    assert_eq!(stats.bytes_sent, image.len() as u64);
    assert_eq!(mgr.free_buffers(), 4);
    assert_eq!(&mgr.channel().image()[..], &image[..]);
    Ok(())
}

#[test]
fn test_exact_multiple_submits_k_buffers_then_drains() -> anyhow::Result<()> {
    let mut mgr = attach_with(
        LoopbackBehavior {
            auto_complete: false,
            ..Default::default()
        },
        small_config(),
    )?;
    let k = 3;
    let image = pattern(k * 4 * KIB);

    mgr.begin(image.len(), ImageFlags::empty())?;
    mgr.write(&image)?;

    let commands = mgr.channel().commands();
    let submits: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Command::DataSubmit { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(submits.len(), k);
    assert_eq!(mgr.channel().submit_lengths(), vec![4 * KIB; k]);

    // Claims only once every byte is submitted
    let last_submit = submits[k - 1];
    assert!(commands[..last_submit]
        .iter()
        .all(|c| !matches!(c, Command::DataClaim)));
    assert_eq!(mgr.free_buffers(), 4);

    mgr.finish()?;
    Ok(())
}

#[test]
fn test_short_image_is_not_padded() -> anyhow::Result<()> {
    let mut mgr = attach_with(LoopbackBehavior::default(), small_config())?;
    let image = pattern(1234);

    mgr.load(&image, ImageFlags::empty())?;
    assert_eq!(mgr.channel().submit_lengths(), vec![1234]);
    assert_eq!(mgr.channel().image().len(), 1234);
    Ok(())
}

#[test]
fn test_multiple_writes_concatenate() -> anyhow::Result<()> {
    let mut mgr = attach_with(LoopbackBehavior::default(), small_config())?;
    let image = pattern(30 * KIB + 5);

    mgr.begin(image.len(), ImageFlags::empty())?;
    for chunk in image.chunks(7 * KIB) {
        assert_eq!(mgr.write(chunk)?, chunk.len());
    }
    let stats = mgr.finish()?;

    assert_eq!(stats.bytes_sent, image.len() as u64);
    assert_eq!(&mgr.channel().image()[..], &image[..]);
    Ok(())
}

#[test]
fn test_claim_returns_several_buffers_per_notification() -> anyhow::Result<()> {
    let mut mgr = attach_with(
        LoopbackBehavior {
            auto_complete: false,
            ..Default::default()
        },
        small_config(),
    )?;

    mgr.begin(0, ImageFlags::empty())?;
    mgr.write(&pattern(16 * KIB))?;
    let stats = mgr.finish()?;

    assert_eq!(stats.submits, 4);
    assert!(stats.claims >= 1);
    assert_eq!(mgr.free_buffers(), 4);
    Ok(())
}

#[test]
fn test_slow_peer() -> anyhow::Result<()> {
    let mut mgr = attach_with(
        LoopbackBehavior {
            latency_ms: 2,
            busy_polls: 3,
            ..Default::default()
        },
        small_config(),
    )?;

    let image = pattern(40 * KIB);
    let stats = mgr.load(&image, ImageFlags::PARTIAL_RECONFIG)?;
    assert_eq!(stats.status_polls, 4);
    assert_eq!(&mgr.channel().image()[..], &image[..]);
    Ok(())
}

#[test]
fn test_finalize_deadline_is_shared_across_polls() -> anyhow::Result<()> {
    let config = EngineConfig {
        request_timeout_ms: 300,
        ..small_config()
    };
    let mut mgr = attach_with(
        LoopbackBehavior {
            never_complete: true,
            latency_ms: 5,
            ..Default::default()
        },
        config,
    )?;

    mgr.begin(0, ImageFlags::empty())?;
    mgr.write(&pattern(KIB))?;

    let start = Instant::now();
    let err = mgr.finish().unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(
        err,
        SvcError::Timeout {
            phase: Phase::Finalize
        }
    ));
    assert!(mgr.channel().count("RECONFIG_STATUS") > 1);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(
        elapsed < Duration::from_millis(300 + 200),
        "finalize overran its deadline: {:?}",
        elapsed
    );
    assert_eq!(mgr.state(), TransferState::Failed);
    Ok(())
}

#[test]
fn test_finalize_peer_error() -> anyhow::Result<()> {
    let mut mgr = attach_with(
        LoopbackBehavior {
            fail_reconfig: true,
            ..Default::default()
        },
        small_config(),
    )?;

    let err = mgr.load(&pattern(KIB), ImageFlags::empty()).unwrap_err();
    assert!(matches!(
        err,
        SvcError::TransferError {
            phase: Phase::Finalize
        }
    ));
    Ok(())
}

#[test]
fn test_authenticated_load() -> anyhow::Result<()> {
    let mut mgr = attach_with(LoopbackBehavior::default(), small_config())?;
    mgr.load(&pattern(KIB), ImageFlags::BITSTREAM_AUTHENTICATE)?;

    let reconfig = mgr
        .channel()
        .commands()
        .into_iter()
        .find_map(|c| match c {
            Command::Reconfig { flags } => Some(flags),
            _ => None,
        });
    assert_eq!(reconfig, Some(fpga_svc::svc::ReconfigFlags::AUTHENTICATE));
    Ok(())
}

#[test]
fn test_authenticate_without_support_issues_no_command() -> anyhow::Result<()> {
    let mut mgr = attach_with(
        LoopbackBehavior {
            firmware_version: None,
            ..Default::default()
        },
        small_config(),
    )?;
    let sent_before = mgr.channel().commands();

    let err = mgr
        .begin(0, ImageFlags::BITSTREAM_AUTHENTICATE)
        .unwrap_err();
    assert!(matches!(err, SvcError::UnsupportedOperation(_)));
    assert_eq!(mgr.channel().commands(), sent_before);
    Ok(())
}

#[test]
fn test_restart_after_failure() -> anyhow::Result<()> {
    let mut mgr = attach_with(
        LoopbackBehavior {
            error_on_submit: Some(1),
            ..Default::default()
        },
        small_config(),
    )?;

    mgr.begin(0, ImageFlags::empty())?;
    assert!(mgr.write(&pattern(8 * KIB)).is_err());
    assert_eq!(mgr.state(), TransferState::Failed);
    assert!(mgr.finish().is_err());

    // A failed transfer leaves the manager ready for a new begin
    mgr.begin(0, ImageFlags::empty())?;
    assert_eq!(mgr.state(), TransferState::Streaming);
    assert_eq!(mgr.free_buffers(), 4);
    Ok(())
}

#[test]
fn test_detach_releases_all_buffers() -> anyhow::Result<()> {
    let mut mgr = attach_with(LoopbackBehavior::default(), small_config())?;
    mgr.load(&pattern(10 * KIB), ImageFlags::empty())?;

    let svc = Arc::clone(mgr.channel());
    assert_eq!(svc.live_allocations(), 4);
    assert!(mgr.detach());
    assert_eq!(svc.live_allocations(), 0);
    Ok(())
}

#[test]
fn test_done_called_after_each_request_phase() -> anyhow::Result<()> {
    let mut mgr = attach_with(LoopbackBehavior::default(), small_config())?;
    mgr.load(&pattern(KIB), ImageFlags::empty())?;

    // probe, initiate, finalize
    assert_eq!(mgr.channel().done_calls(), 3);
    Ok(())
}
