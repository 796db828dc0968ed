use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::format::{AudioFormat, NegotiatedFormat, OutputFormat};
use crate::frame::{BufferId, FrameFlags, PayloadView};
use crate::pipeline::{OutputEvent, OutputFrame, PipelineFacade};
use crate::surface::Transform;
use crate::testing::{RecordingSurface, ScriptedFactory, ScriptedShared, SurfaceEvent};
use crate::worker::WorkerState;

fn test_config() -> PipelineConfig {
    PipelineConfig {
        frame_display_interval_ms: 4,
        max_in_flight: 10,
        ..Default::default()
    }
}

fn facade(
    config: PipelineConfig,
    zero_copy: bool,
) -> (PipelineFacade, Arc<ScriptedShared>, Arc<ScriptedFactory>) {
    let engine = ScriptedShared::new(zero_copy);
    let factory = ScriptedFactory::new(engine.clone());
    (PipelineFacade::new(config, factory.clone()), engine, factory)
}

fn unit(ts: i64) -> Vec<u8> {
    vec![0xAB, ts as u8]
}

/// Next event that is not `WouldBlock`.
fn next_event(facade: &PipelineFacade) -> OutputEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match facade.take_ready(Duration::from_millis(20)) {
            Ok(OutputEvent::WouldBlock) => {
                assert!(Instant::now() < deadline, "no output event");
            }
            Ok(event) => return event,
            Err(err) => panic!("take_ready failed: {}", err),
        }
    }
}

fn next_frame(facade: &PipelineFacade) -> OutputFrame {
    match next_event(facade) {
        OutputEvent::Frame(frame) => frame,
        other => panic!("expected frame, got {:?}", other),
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ---------------------------------------------------------------------------
// Configure / open
// ---------------------------------------------------------------------------

#[test]
fn test_open_requires_configure() {
    let (facade, _, _) = facade(test_config(), false);
    assert!(matches!(facade.open("video/avc"), Err(PipelineError::NotConfigured)));
    assert!(matches!(
        facade.feed(&unit(0), 0, FrameFlags::NONE),
        Err(PipelineError::NotConfigured)
    ));
}

#[test]
fn test_invalid_dimensions() {
    let (facade, _, _) = facade(test_config(), false);
    assert!(matches!(
        facade.configure(None, 0, 480, None),
        Err(PipelineError::InvalidDimensions { .. })
    ));

    facade.configure(None, 0, 0, None).unwrap();
    assert!(matches!(
        facade.open("video/avc"),
        Err(PipelineError::InvalidDimensions { .. })
    ));
}

#[test]
fn test_open_failure_starts_no_worker() {
    let engine = ScriptedShared::new(false);
    let factory = ScriptedFactory::failing(engine);
    let facade = PipelineFacade::new(test_config(), factory.clone());
    facade.configure(None, 640, 480, None).unwrap();

    let err = facade.open("video/avc").unwrap_err();
    assert!(matches!(err, PipelineError::Open { .. }));
    assert_eq!(facade.worker_state(), WorkerState::Idle);
    assert_eq!(facade.take_ready(Duration::from_millis(10)).unwrap(), OutputEvent::WouldBlock);
    assert_eq!(factory.requests().len(), 1);
}

#[test]
fn test_unknown_media_type_fails_open() {
    let (facade, _, factory) = facade(test_config(), false);
    facade.configure(None, 640, 480, None).unwrap();
    assert!(matches!(facade.open("text/plain"), Err(PipelineError::Open { .. })));
    assert!(factory.requests().is_empty());
}

#[test]
fn test_second_open_is_rejected() -> anyhow::Result<()> {
    let (facade, engine, factory) = facade(test_config(), false);
    facade.configure(None, 640, 480, None)?;
    facade.open("video/avc")?;

    assert!(matches!(facade.open("video/avc"), Err(PipelineError::AlreadyOpen)));
    assert_eq!(factory.requests().len(), 1);

    facade.teardown();
    assert_eq!(engine.shutdowns.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_second_open_rejected_while_open_is_delayed() -> anyhow::Result<()> {
    let (facade, _, factory) = facade(test_config(), false);
    facade.configure(None, 0, 0, None)?;
    facade.open("audio/mp4a-latm")?;

    assert!(matches!(facade.open("audio/mp4a-latm"), Err(PipelineError::AlreadyOpen)));
    assert!(factory.requests().is_empty());
    Ok(())
}

#[test]
fn test_zero_capacities_are_clamped() -> anyhow::Result<()> {
    let config = PipelineConfig {
        output_capacity: 0,
        max_in_flight: 0,
        ..test_config()
    };
    let (facade, _, _) = facade(config, false);
    assert_eq!(facade.output_capacity(), 1);

    facade.configure(None, 640, 480, None)?;
    facade.open("video/avc")?;
    facade.feed(&unit(0), 0, FrameFlags::NONE)?;
    assert_eq!(next_event(&facade), OutputEvent::FormatChanged);
    let frame = next_frame(&facade);
    assert_eq!(frame.timestamp, 0);
    assert!(facade.release(frame.index, -1));
    Ok(())
}

#[test]
fn test_output_would_block_before_open() {
    let (facade, _, _) = facade(test_config(), false);
    facade.configure(None, 640, 480, None).unwrap();
    let start = Instant::now();
    assert_eq!(facade.take_ready(Duration::from_secs(1)).unwrap(), OutputEvent::WouldBlock);
    assert!(start.elapsed() < Duration::from_millis(500));
}

// ---------------------------------------------------------------------------
// Data flow
// ---------------------------------------------------------------------------

#[test]
fn test_initial_format_then_frames_then_end() -> anyhow::Result<()> {
    let (facade, _, factory) = facade(test_config(), false);
    facade.configure(None, 640, 480, Some(&[1, 2, 3]))?;
    facade.open("video/avc")?;

    let request = &factory.requests()[0];
    assert_eq!(request.mime, "video/avc");
    assert_eq!((request.width, request.height), (640, 480));
    assert_eq!(request.codec_config.as_deref(), Some(&[1u8, 2, 3][..]));
    assert!(!request.surface_attached);

    assert!(facade.feed(&unit(0), 0, FrameFlags::SYNC_POINT)?);
    assert!(facade.feed(&unit(1), 40, FrameFlags::NONE)?);
    facade.flush()?;

    assert_eq!(next_event(&facade), OutputEvent::FormatChanged);
    let first = next_frame(&facade);
    assert_eq!(first.timestamp, 0);
    assert_eq!(first.payload, PayloadView::Bytes(unit(0).into()));
    assert!(first.flags.contains(FrameFlags::SYNC_POINT));
    assert!(facade.release(first.index, -1));

    let second = next_frame(&facade);
    assert_eq!(second.timestamp, 40);
    assert!(facade.release(second.index, -1));
    assert_eq!(next_event(&facade), OutputEvent::EndOfStream);

    let Some(OutputFormat::Video(format)) = facade.current_format() else {
        panic!("expected video format");
    };
    assert_eq!((format.width(), format.height()), (640, 480));
    assert_eq!(facade.component_name(), "scripted.video");
    assert_eq!(facade.output_capacity(), 10);
    Ok(())
}

#[test]
fn test_take_ready_without_deadline() -> anyhow::Result<()> {
    let (facade, _, _) = facade(test_config(), false);
    facade.configure(None, 640, 480, None)?;
    facade.open("video/avc")?;
    facade.feed(&unit(7), 7, FrameFlags::NONE)?;

    assert_eq!(facade.take_ready(Duration::MAX)?, OutputEvent::FormatChanged);
    let OutputEvent::Frame(frame) = facade.take_ready(Duration::MAX)? else {
        panic!("expected frame");
    };
    assert_eq!(frame.timestamp, 7);
    assert!(facade.release(frame.index, -1));
    Ok(())
}

#[test]
fn test_release_of_unheld_index_is_ignored() -> anyhow::Result<()> {
    let (facade, _, _) = facade(test_config(), false);
    facade.configure(None, 640, 480, None)?;
    facade.open("video/avc")?;
    facade.feed(&unit(0), 0, FrameFlags::NONE)?;

    assert_eq!(next_event(&facade), OutputEvent::FormatChanged);
    let frame = next_frame(&facade);
    assert!(facade.release(frame.index, -1));
    assert!(!facade.release(frame.index, -1));
    assert!(!facade.release(99, -1));
    Ok(())
}

#[test]
fn test_delayed_audio_open_waits_for_codec_config() -> anyhow::Result<()> {
    let (facade, engine, factory) = facade(test_config(), false);
    engine.set_format(NegotiatedFormat::Audio {
        sample_rate: Some(44100),
        channel_count: Some(2),
        component: Some("scripted.audio".to_string()),
    });
    facade.configure(None, 0, 0, None)?;
    facade.open("audio/mp4a-latm")?;
    assert!(factory.requests().is_empty());
    assert_eq!(facade.take_ready(Duration::from_millis(10))?, OutputEvent::WouldBlock);

    // buffered until the engine exists
    assert!(facade.feed(&unit(0), 0, FrameFlags::NONE)?);
    assert!(facade.feed(&[0x12, 0x10], 0, FrameFlags::CODEC_CONFIG)?);

    let requests = factory.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].codec_config.as_deref(), Some(&[0x12u8, 0x10][..]));

    assert_eq!(next_event(&facade), OutputEvent::FormatChanged);
    assert_eq!(
        facade.current_format(),
        Some(OutputFormat::Audio(AudioFormat {
            sample_rate: 44100,
            channel_count: 2
        }))
    );
    assert_eq!(next_frame(&facade).timestamp, 0);
    assert_eq!(engine.submitted(), vec![0]);
    Ok(())
}

#[test]
fn test_early_buffer_limit_before_worker() -> anyhow::Result<()> {
    let config = PipelineConfig {
        early_buffer_limit: 4,
        ..test_config()
    };
    let (facade, _, _) = facade(config, false);
    facade.configure(None, 0, 0, None)?;
    facade.open("audio/mp4a-latm")?;

    for ts in 0..4 {
        assert!(facade.feed(&unit(ts), ts, FrameFlags::NONE)?);
    }
    assert!(!facade.can_accept_more());
    assert!(!facade.feed(&unit(4), 4, FrameFlags::NONE)?);
    Ok(())
}

#[test]
fn test_full_input_reports_pressure() -> anyhow::Result<()> {
    let (facade, engine, _) = facade(test_config(), true);
    facade.configure(None, 640, 480, None)?;
    facade.open("video/avc")?;

    // the worker blocks publishing the first zero-copy frame until it is held
    let mut rejected = None;
    for ts in 0..10 {
        if !facade.feed(&unit(ts), ts, FrameFlags::NONE)? {
            rejected = Some(ts);
            break;
        }
    }
    assert!(rejected.is_some());
    assert!(!facade.can_accept_more());

    assert_eq!(next_event(&facade), OutputEvent::FormatChanged);
    let first = next_frame(&facade);
    assert_eq!(first.payload, PayloadView::Buffer(BufferId(0)));
    assert!(facade.release(first.index, -1));

    wait_until("input space", || facade.can_accept_more());
    let ts = rejected.unwrap_or_default();
    assert!(facade.feed(&unit(ts), ts, FrameFlags::NONE)?);
    assert!(engine.owner.released().contains(&BufferId(0)));
    Ok(())
}

// ---------------------------------------------------------------------------
// Flush / teardown
// ---------------------------------------------------------------------------

#[test]
fn test_flush_rearms_worker_on_next_feed() -> anyhow::Result<()> {
    let (facade, engine, _) = facade(test_config(), false);
    facade.configure(None, 640, 480, None)?;
    facade.open("video/avc")?;
    facade.feed(&unit(0), 0, FrameFlags::NONE)?;
    facade.flush()?;

    assert_eq!(next_event(&facade), OutputEvent::FormatChanged);
    let frame = next_frame(&facade);
    facade.release(frame.index, -1);
    assert_eq!(next_event(&facade), OutputEvent::EndOfStream);
    wait_until("worker stop", || facade.worker_state() == WorkerState::Stopped);

    assert!(facade.feed(&unit(1), 40, FrameFlags::NONE)?);
    assert_eq!(facade.worker_state(), WorkerState::Running);
    assert_eq!(engine.flushes.load(Ordering::SeqCst), 1);
    assert_eq!(next_frame(&facade).timestamp, 40);
    assert_eq!(engine.submitted(), vec![0, 40]);
    Ok(())
}

#[test]
fn test_teardown_is_idempotent() -> anyhow::Result<()> {
    let (surface, events) = RecordingSurface::new();
    let (facade, engine, _) = facade(test_config(), false);
    facade.configure(Some(Box::new(surface)), 640, 480, None)?;
    facade.open("video/avc")?;
    facade.feed(&unit(0), 0, FrameFlags::NONE)?;

    facade.teardown();
    facade.teardown();

    assert_eq!(engine.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(facade.worker_state(), WorkerState::Stopped);
    assert!(matches!(facade.feed(&unit(1), 1, FrameFlags::NONE), Err(PipelineError::TornDown)));
    assert!(matches!(facade.take_ready(Duration::from_millis(1)), Err(PipelineError::TornDown)));
    assert!(matches!(facade.flush(), Err(PipelineError::TornDown)));
    assert!(facade.current_format().is_none());

    drop(facade);
    assert_eq!(events.snapshot().last(), Some(&SurfaceEvent::Disconnect));
    Ok(())
}

#[test]
fn test_fatal_submit_error_reaches_producer() -> anyhow::Result<()> {
    let config = PipelineConfig {
        max_submit_failures: 1,
        ..test_config()
    };
    let (facade, engine, _) = facade(config, false);
    engine.fail_submit.store(true, Ordering::SeqCst);
    facade.configure(None, 640, 480, None)?;
    facade.open("video/avc")?;

    assert!(facade.feed(&unit(0), 0, FrameFlags::NONE)?);
    wait_until("worker stop", || facade.worker_state() == WorkerState::Stopped);
    assert!(matches!(facade.feed(&unit(1), 1, FrameFlags::NONE), Err(PipelineError::Engine(_))));
    assert!(!facade.can_accept_more());
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

#[test]
fn test_software_frames_are_drawn_on_release() -> anyhow::Result<()> {
    let (surface, events) = RecordingSurface::new();
    let (facade, _, factory) = facade(test_config(), false);
    facade.configure(Some(Box::new(surface)), 640, 480, None)?;
    facade.open("video/avc")?;
    assert!(factory.requests()[0].surface_attached);

    facade.feed(&unit(7), 7_000, FrameFlags::NONE)?;
    assert_eq!(next_event(&facade), OutputEvent::FormatChanged);
    let frame = next_frame(&facade);
    assert!(facade.release(frame.index, 7_000));

    assert_eq!(
        events.snapshot(),
        vec![
            SurfaceEvent::Connect,
            SurfaceEvent::Geometry(640, 480, Transform::Identity),
            SurfaceEvent::Drawn(unit(7), 7_000),
        ]
    );
    Ok(())
}

#[test]
fn test_zero_copy_frames_are_presented_and_returned() -> anyhow::Result<()> {
    let (surface, events) = RecordingSurface::new();
    let (facade, engine, _) = facade(test_config(), true);
    facade.configure(Some(Box::new(surface)), 640, 480, None)?;
    facade.open("video/avc")?;

    facade.feed(&unit(1), 1_000, FrameFlags::NONE)?;
    assert_eq!(next_event(&facade), OutputEvent::FormatChanged);
    let frame = next_frame(&facade);
    assert!(facade.release(frame.index, 1_000));

    assert_eq!(
        events.snapshot(),
        vec![SurfaceEvent::Connect, SurfaceEvent::Buffer(BufferId(0), 1_000)]
    );
    assert_eq!(engine.owner.released(), vec![BufferId(0)]);

    let surface = facade.take_surface();
    assert!(surface.is_some());
    assert_eq!(events.snapshot().last(), Some(&SurfaceEvent::Disconnect));
    Ok(())
}
