//! Record Access exchanges over a mocked control point.

use gatt_bridge::core::record_access::{
    RecordAccessMessage, RecordAccessOpCode, RecordAccessResponseCode, RecordFilter,
};
use std::time::Duration;

use tokio::time::timeout;

use gatt_bridge::{ByteCodec, EngineConfig, Error, RecordSelection};

use crate::mock_radio::RadioCall;
use crate::support::{connected_sensor, control_point, engine, measurement, sensor_id, wait_until, TIMEOUT};

use RecordAccessOpCode::*;
use RecordAccessResponseCode::*;

#[tokio::test]
async fn number_of_stored_records_is_reported() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.respond_to_writes(&control_point(&id), |request| {
        assert_eq!(request, [0x04, 0x01]);
        vec![vec![0x05, 0x00, 0x2a, 0x00]]
    });
    let sensor = connected_sensor(&radio, &manager).await;

    let count = sensor
        .records
        .report_number_of_stored_records(RecordSelection::All)
        .await;
    assert_eq!(count, Ok(42));
    assert!(!sensor.records.is_busy());
}

#[tokio::test]
async fn rejection_carries_the_device_response_code() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.respond_to_writes(&control_point(&id), |_| {
        vec![RecordAccessMessage::general_response(ReportNumberOfStoredRecords, ProcedureNotCompleted).to_bytes()]
    });
    let sensor = connected_sensor(&radio, &manager).await;

    let result = sensor
        .records
        .report_number_of_stored_records(RecordSelection::All)
        .await;
    assert_eq!(
        result,
        Err(Error::RecordAccess {
            request: ReportNumberOfStoredRecords,
            code: ProcedureNotCompleted,
        })
    );
}

#[tokio::test]
async fn filtered_delete_is_encoded_with_its_operand() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.respond_to_writes(&control_point(&id), |_| {
        vec![RecordAccessMessage::general_response(DeleteStoredRecords, Success).to_bytes()]
    });
    let sensor = connected_sensor(&radio, &manager).await;

    let selection = RecordSelection::GreaterThanOrEqualTo(RecordFilter::SequenceNumber(0x0102));
    sensor.records.delete_stored_records(selection).await.unwrap();
    assert_eq!(
        radio.count(&RadioCall::Write(control_point(&id), vec![0x02, 0x03, 0x01, 0x02, 0x01])),
        1
    );
}

#[tokio::test]
async fn report_completes_only_on_its_terminating_response() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    let sensor = connected_sensor(&radio, &manager).await;

    let report = tokio::spawn({
        let records = sensor.records.clone();
        async move { records.report_stored_records(RecordSelection::All).await }
    });
    radio
        .wait_for_call(&RadioCall::Write(control_point(&id), vec![0x01, 0x01]), 1)
        .await;
    assert!(sensor.records.is_busy());

    // A second exchange on the same control point is refused outright.
    assert_eq!(
        sensor.records.delete_stored_records(RecordSelection::All).await,
        Err(Error::RecordAccessInFlight)
    );

    // Records stream in on their own characteristic meanwhile.
    radio.push_value(&measurement(&id), [0x01, 0x00]);
    radio.push_value(&measurement(&id), [0x02, 0x00]);
    wait_until(|| sensor.measurement.cached() == Some(2)).await;
    assert!(!report.is_finished());

    radio.push_value(
        &control_point(&id),
        RecordAccessMessage::general_response(ReportStoredRecords, Success).to_bytes(),
    );
    assert_eq!(report.await.unwrap(), Ok(()));
    assert!(!sensor.records.is_busy());
}

#[tokio::test]
async fn abort_ends_the_running_report() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    let sensor = connected_sensor(&radio, &manager).await;

    let report = tokio::spawn({
        let records = sensor.records.clone();
        async move { records.report_stored_records(RecordSelection::Last).await }
    });
    radio
        .wait_for_call(&RadioCall::Write(control_point(&id), vec![0x01, 0x06]), 1)
        .await;

    let abort = tokio::spawn({
        let records = sensor.records.clone();
        async move { records.abort_operation().await }
    });
    radio
        .wait_for_call(&RadioCall::Write(control_point(&id), vec![0x03, 0x00]), 1)
        .await;

    radio.push_value(
        &control_point(&id),
        RecordAccessMessage::general_response(AbortOperation, Success).to_bytes(),
    );
    assert_eq!(abort.await.unwrap(), Ok(()));
    assert_eq!(
        report.await.unwrap(),
        Err(Error::RecordAccess {
            request: ReportStoredRecords,
            code: ProcedureNotCompleted,
        })
    );
}

#[tokio::test]
async fn malformed_response_fails_the_waiting_exchange() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    let sensor = connected_sensor(&radio, &manager).await;
    let request = RadioCall::Write(control_point(&id), vec![0x04, 0x01]);

    let count = tokio::spawn({
        let records = sensor.records.clone();
        async move { records.report_number_of_stored_records(RecordSelection::All).await }
    });
    radio.wait_for_call(&request, 1).await;
    // Responses only ever use the null operator.
    radio.push_value(&control_point(&id), [0x05, 0x01, 0x2a, 0x00]);
    let result = timeout(TIMEOUT, count).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::RecordAccessResponseFormat(_))), "{result:?}");
    assert!(!sensor.records.is_busy());

    let count = tokio::spawn({
        let records = sensor.records.clone();
        async move { records.report_number_of_stored_records(RecordSelection::All).await }
    });
    radio.wait_for_call(&request, 2).await;
    // Trailing byte after the count.
    radio.push_value(&control_point(&id), [0x05, 0x00, 0x07, 0x00, 0xff]);
    let result = timeout(TIMEOUT, count).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::RecordAccessResponseFormat(_))), "{result:?}");
}

#[tokio::test]
async fn abandoned_request_holds_the_control_point_until_answered() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    let sensor = connected_sensor(&radio, &manager).await;

    let gave_up = timeout(
        Duration::from_millis(50),
        sensor.records.report_stored_records(RecordSelection::All),
    )
    .await;
    assert!(gave_up.is_err());
    radio
        .wait_for_call(&RadioCall::Write(control_point(&id), vec![0x01, 0x01]), 1)
        .await;

    // The device has not answered yet, so the exchange is still running.
    assert!(sensor.records.is_busy());
    assert_eq!(
        sensor.records.report_stored_records(RecordSelection::Last).await,
        Err(Error::RecordAccessInFlight)
    );

    radio.push_value(
        &control_point(&id),
        RecordAccessMessage::general_response(ReportStoredRecords, Success).to_bytes(),
    );
    wait_until(|| !sensor.records.is_busy()).await;

    let report = tokio::spawn({
        let records = sensor.records.clone();
        async move { records.report_stored_records(RecordSelection::Last).await }
    });
    radio
        .wait_for_call(&RadioCall::Write(control_point(&id), vec![0x01, 0x06]), 1)
        .await;
    assert!(!report.is_finished());
    radio.push_value(
        &control_point(&id),
        RecordAccessMessage::general_response(ReportStoredRecords, Success).to_bytes(),
    );
    assert_eq!(report.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn link_loss_fails_the_running_exchange() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    let sensor = connected_sensor(&radio, &manager).await;

    let report = tokio::spawn({
        let records = sensor.records.clone();
        async move { records.report_stored_records(RecordSelection::All).await }
    });
    radio
        .wait_for_call(&RadioCall::Write(control_point(&id), vec![0x01, 0x01]), 1)
        .await;

    radio.drop_link(&id);
    assert_eq!(report.await.unwrap(), Err(Error::Disconnected));
    assert!(!sensor.records.is_busy());
}
