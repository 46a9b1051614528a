//! End-to-end tests of the acquisition pipeline.
//!
//! A `VirtualSensor` produces encrypted frames into a `MockTransport`; the
//! full pipeline pairs, unlocks, reassembles, decrypts, calibrates and
//! commits them. No hardware is involved.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use cgm_core::{
    Action, AppState, CoreEvent, EventReceiver, MemoryPersistence, MockTransport, Pipeline,
    VirtualSensor,
};
use cgm_types::{ConnectionState, SensorState};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_state(pipeline: &Pipeline, predicate: impl FnMut(&AppState) -> bool) -> Arc<AppState> {
    timeout(WAIT, pipeline.store().wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("store stopped")
}

async fn next_event(
    events: &mut EventReceiver,
    mut predicate: impl FnMut(&CoreEvent) -> bool,
) -> CoreEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn drain_events(events: &mut EventReceiver) -> Vec<CoreEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn push_frame(transport: &MockTransport, sensor: &VirtualSensor, age: u32) {
    for chunk in sensor.chunks(age).unwrap() {
        assert!(transport.push_chunk(chunk));
    }
}

struct Harness {
    transport: Arc<MockTransport>,
    pipeline: Pipeline,
    events: EventReceiver,
}

async fn paired(sensor: &VirtualSensor) -> Harness {
    let transport = Arc::new(MockTransport::with_default_name());
    sensor.install(&transport).await;
    let pipeline = Pipeline::builder(transport.clone()).start().await.unwrap();
    let events = pipeline.subscribe();
    pipeline.pair().unwrap();
    wait_state(&pipeline, |s| s.connection_state == ConnectionState::Connected).await;
    Harness {
        transport,
        pipeline,
        events,
    }
}

#[tokio::test]
async fn test_pair_connect_and_stream() {
    let sensor = VirtualSensor::new(11).with_age(1440);
    let mut h = paired(&sensor).await;

    let state = h.pipeline.state();
    let paired = state.sensor.as_ref().unwrap();
    assert_eq!(&paired.uuid, sensor.uid());
    assert_eq!(paired.state, SensorState::Ready);
    // pairing used 1, the streaming session 2
    assert_eq!(h.transport.unlock_counters(), vec![1, 2]);
    assert_eq!(state.unlock_count, 2);

    push_frame(&h.transport, &sensor, 1441);
    let state = wait_state(&h.pipeline, |s| !s.glucose_values.is_empty()).await;

    assert!(
        state
            .glucose_values
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp)
    );
    let latest = state.latest_sensor_glucose().unwrap();
    let expected = sensor.glucose_at(1441).round() as i32;
    assert!((latest.glucose_value.unwrap() - expected).abs() <= 1);
    assert_eq!(state.sensor.as_ref().unwrap().age, 1441);

    let event = next_event(&mut h.events, |e| matches!(e, CoreEvent::GlucoseAdded { .. })).await;
    let CoreEvent::GlucoseAdded { values } = event else {
        unreachable!()
    };
    assert_eq!(values.len(), state.glucose_values.len());
}

#[tokio::test]
async fn test_overlapping_frames_add_only_new_minutes() {
    let sensor = VirtualSensor::new(12).with_age(1440);
    let h = paired(&sensor).await;

    push_frame(&h.transport, &sensor, 1441);
    let first = wait_state(&h.pipeline, |s| !s.glucose_values.is_empty())
        .await
        .glucose_values
        .len();

    push_frame(&h.transport, &sensor, 1442);
    let state = wait_state(&h.pipeline, |s| s.glucose_values.len() > first).await;
    assert_eq!(state.glucose_values.len(), first + 1);
    let latest = state.glucose_values.last().unwrap();
    assert!(latest.minute_change.is_some());
}

#[tokio::test]
async fn test_decrypt_error_keeps_session() {
    let sensor = VirtualSensor::new(13).with_age(1440);
    let mut h = paired(&sensor).await;
    drain_events(&mut h.events);

    let mut corrupted = sensor.frame(1441).unwrap();
    corrupted[7] ^= 0x5A;
    assert!(h.transport.push_chunk(Bytes::from(corrupted)));
    push_frame(&h.transport, &sensor, 1442);

    let state = wait_state(&h.pipeline, |s| !s.glucose_values.is_empty()).await;
    assert_eq!(state.connection_state, ConnectionState::Connected);
    assert!(state.connection_error.as_deref().unwrap().contains("Decrypt"));
    assert!(!state.connection_error_is_critical);
    assert_eq!(state.sensor.as_ref().unwrap().age, 1442);

    let events = drain_events(&mut h.events);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, CoreEvent::ConnectionStateChanged { .. }))
    );
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::ConnectionError {
            is_critical: false,
            ..
        }
    )));
}

#[tokio::test]
async fn test_expiry_emits_age_change_only() {
    let sensor = VirtualSensor::new(14).with_age(20879);
    let mut h = paired(&sensor).await;
    let lifetime = h.pipeline.state().sensor.as_ref().unwrap().lifetime;
    assert_eq!(lifetime, 20880);
    drain_events(&mut h.events);

    push_frame(&h.transport, &sensor, lifetime);
    let state = wait_state(&h.pipeline, |s| {
        s.sensor.as_ref().is_some_and(|s| s.state == SensorState::Expired)
    })
    .await;
    assert!(state.glucose_values.is_empty());

    // a marker action proves the frame was fully processed
    h.pipeline
        .dispatch(Action::MissedReading {
            at: time::OffsetDateTime::now_utc(),
        })
        .unwrap();
    next_event(&mut h.events, |e| matches!(e, CoreEvent::MissedReading { .. })).await;

    let events = drain_events(&mut h.events);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, CoreEvent::GlucoseAdded { .. }))
    );
}

#[tokio::test]
async fn test_stale_session_output_dropped_after_disconnect() {
    let sensor = VirtualSensor::new(15).with_age(1440);
    let h = paired(&sensor).await;
    let session = h.pipeline.state().session;

    h.pipeline.disconnect().unwrap();
    let state = wait_state(&h.pipeline, |s| s.session > session).await;
    assert_eq!(state.connection_state, ConnectionState::Disconnected);

    let frame = cgm_core::TelemetryDecoder::default()
        .decode(
            sensor.uid(),
            &sensor.frame(1441).unwrap(),
            time::OffsetDateTime::now_utc(),
        )
        .unwrap();
    h.pipeline
        .dispatch(Action::AddSensorReadings(frame.readings()).in_session(session))
        .unwrap();
    h.pipeline
        .dispatch(Action::connection_state(ConnectionState::Connected).in_session(session))
        .unwrap();
    h.pipeline
        .dispatch(Action::MissedReading {
            at: time::OffsetDateTime::now_utc(),
        })
        .unwrap();

    let state = wait_state(&h.pipeline, |s| s.missed_readings == 1).await;
    assert!(state.glucose_values.is_empty());
    assert_eq!(state.connection_state, ConnectionState::Disconnected);

    timeout(WAIT, async {
        while h.transport.is_connected() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_link_loss_is_critical_and_reconnect_advances_counter() {
    let sensor = VirtualSensor::new(16).with_age(1440);
    let h = paired(&sensor).await;

    h.transport.drop_connection("out of range");
    let state = wait_state(&h.pipeline, |s| {
        s.connection_state == ConnectionState::Disconnected
    })
    .await;
    assert!(state.connection_error_is_critical);

    h.pipeline.connect().unwrap();
    let state = wait_state(&h.pipeline, |s| {
        s.connection_state == ConnectionState::Connected
    })
    .await;
    assert_eq!(state.connection_error, None);
    assert_eq!(state.unlock_count, 3);
    assert_eq!(h.transport.unlock_counters(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_reset_and_repair_restarts_counter() {
    let sensor = VirtualSensor::new(17).with_age(1440);
    let h = paired(&sensor).await;

    h.pipeline.reset_sensor().unwrap();
    let state = wait_state(&h.pipeline, |s| s.is_pairable()).await;
    assert_eq!(state.unlock_count, 0);

    timeout(WAIT, async {
        while h.transport.is_connected() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    h.pipeline.pair().unwrap();
    wait_state(&h.pipeline, |s| {
        s.sensor.is_some() && s.connection_state == ConnectionState::Connected
    })
    .await;
    assert_eq!(h.transport.unlock_counters(), vec![1, 2, 1, 2]);
}

#[tokio::test]
async fn test_pair_ignored_while_paired() {
    let sensor = VirtualSensor::new(18).with_age(1440);
    let h = paired(&sensor).await;
    let session = h.pipeline.state().session;

    h.pipeline.pair().unwrap();
    h.pipeline
        .dispatch(Action::MissedReading {
            at: time::OffsetDateTime::now_utc(),
        })
        .unwrap();
    let state = wait_state(&h.pipeline, |s| s.missed_readings == 1).await;
    assert_eq!(state.session, session);
    assert_eq!(state.connection_state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_custom_calibration_applies_to_next_values() {
    let sensor = VirtualSensor::new(19).with_age(1440);
    let h = paired(&sensor).await;

    push_frame(&h.transport, &sensor, 1441);
    let state = wait_state(&h.pipeline, |s| !s.glucose_values.is_empty()).await;
    let latest = state.latest_sensor_glucose().unwrap().clone();

    let raw = latest.raw_value.unwrap();
    h.pipeline.add_custom_calibration(raw + 10.0).unwrap();
    let state = wait_state(&h.pipeline, |s| {
        s.sensor
            .as_ref()
            .is_some_and(|s| !s.custom_calibration.is_empty())
    })
    .await;
    let point = state.sensor.as_ref().unwrap().custom_calibration.points[0];
    assert_eq!(point.x, raw);

    h.pipeline.remove_custom_calibration(point.id).unwrap();
    wait_state(&h.pipeline, |s| {
        s.sensor
            .as_ref()
            .is_some_and(|s| s.custom_calibration.is_empty())
    })
    .await;
}

#[tokio::test]
async fn test_blood_glucose_entry() {
    let sensor = VirtualSensor::new(20).with_age(1440);
    let h = paired(&sensor).await;
    h.pipeline.add_blood_glucose(104).unwrap();
    let state = wait_state(&h.pipeline, |s| !s.blood_glucose_values.is_empty()).await;
    assert_eq!(state.blood_glucose_values[0].glucose_value, Some(104));
    assert!(state.glucose_values.is_empty());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let sensor = VirtualSensor::new(21).with_age(1440);
    let transport = Arc::new(MockTransport::with_default_name());
    sensor.install(&transport).await;
    let backend = Arc::new(MemoryPersistence::new());

    let first = Pipeline::builder(transport.clone())
        .persistence(backend.clone())
        .start()
        .await
        .unwrap();
    first.pair().unwrap();
    wait_state(&first, |s| s.connection_state == ConnectionState::Connected).await;
    push_frame(&transport, &sensor, 1441);
    wait_state(&first, |s| !s.glucose_values.is_empty()).await;

    timeout(WAIT, async {
        loop {
            if let Some(saved) = backend.snapshot().await
                && saved.unlock_count == 2
                && !saved.glucose_values.is_empty()
            {
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    first.shutdown();
    timeout(WAIT, async {
        while transport.is_connected() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let second = Pipeline::builder(transport.clone())
        .persistence(backend.clone())
        .start()
        .await
        .unwrap();
    let restored = second.state();
    assert_eq!(&restored.sensor.as_ref().unwrap().uuid, sensor.uid());
    assert!(!restored.glucose_values.is_empty());

    second.connect().unwrap();
    let state = wait_state(&second, |s| s.connection_state == ConnectionState::Connected).await;
    assert_eq!(state.unlock_count, 3);
    assert_eq!(transport.unlock_counters(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_missed_reading_counted_and_reset() {
    let sensor = VirtualSensor::new(22).with_age(1440);
    let mut h = paired(&sensor).await;

    tokio::time::sleep(Duration::from_secs(121)).await;
    let event = next_event(&mut h.events, |e| matches!(e, CoreEvent::MissedReading { .. })).await;
    assert_eq!(event, CoreEvent::MissedReading { count: 1 });

    push_frame(&h.transport, &sensor, 1443);
    let state = wait_state(&h.pipeline, |s| !s.glucose_values.is_empty()).await;
    assert_eq!(state.missed_readings, 0);
}
