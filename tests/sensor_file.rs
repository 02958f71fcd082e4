use std::fs;

use xiaozhi_audio::sensor::{read_temperature_humidity, temperature_humidity_json};

#[tokio::test]
async fn missing_fields_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("temperature_humidity.json");
    fs::write(&path, r#"{"timestamp":"T","humidity":50}"#).unwrap();

    let v = read_temperature_humidity(&path).await;

    assert_eq!(v["service_status"], "invalid_format");
    assert!(v["error"].as_str().unwrap().contains("temperature"));
}

#[tokio::test]
async fn absent_file_means_service_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("temperature_humidity.json");

    let v: serde_json::Value = serde_json::from_str(&temperature_humidity_json(&path).await).unwrap();

    assert_eq!(v["service_status"], "stopped");
    assert!(v.get("error").is_some());
}

#[tokio::test]
async fn refreshed_file_is_read_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("temperature_humidity.json");

    fs::write(&path, "").unwrap();
    assert_eq!(read_temperature_humidity(&path).await["service_status"], "no_data");

    fs::write(&path, r#"{"timestamp":"T","humidity":40,"temperature":21.0,"unit":"C"}"#).unwrap();
    let v = read_temperature_humidity(&path).await;
    assert_eq!(v["service_status"], "running");
    assert_eq!(v["humidity"], 40);
}
