//! Reader for the file a separate monitoring service keeps refreshed with
//! the latest temperature/humidity sample.
//!
//! Every failure mode is reported in-band as `{"error": ..., "service_status": ...}`
//! so that callers can forward the result as-is.

use std::io::ErrorKind;
use std::path::Path;

use serde_json::{json, Value};

/// Fields a sample must carry, checked in this order.
const REQUIRED_FIELDS: [&str; 4] = ["timestamp", "humidity", "temperature", "unit"];

fn status(error: String, service_status: &str) -> Value {
    json!({ "error": error, "service_status": service_status })
}

pub async fn read_temperature_humidity(path: &Path) -> Value {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return status(
                format!(
                    "Sensor data file not found: {}. Is the monitoring service running?",
                    path.display()
                ),
                "stopped",
            );
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return status(format!("Cannot read sensor data file: {}", path.display()), "permission_denied");
        }
        Err(e) => {
            return status(format!("Failed to read sensor data file: {}", e), "read_error");
        }
    };

    let content = content.trim();
    if content.is_empty() {
        return status("Sensor data file is empty".to_string(), "no_data");
    }

    let mut data: Value = match serde_json::from_str(content) {
        Ok(data) => data,
        Err(e) => return status(format!("Sensor data file is not valid JSON: {}", e), "json_error"),
    };

    let Some(object) = data.as_object_mut() else {
        return status("Sensor data is not a JSON object".to_string(), "invalid_format");
    };
    if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| !object.contains_key(**f)) {
        return status(format!("Sensor data is missing field: {}", missing), "invalid_format");
    }

    object.insert("service_status".to_string(), json!("running"));
    data
}

/// Same as [`read_temperature_humidity`], serialized for a tool response.
pub async fn temperature_humidity_json(path: &Path) -> String {
    log::info!("Reading temperature and humidity from {}", path.display());
    let value = read_temperature_humidity(path).await;
    match value.get("service_status").and_then(Value::as_str) {
        Some("running") => log::info!("Temperature and humidity read"),
        Some(other) => log::warn!("Sensor data unavailable: {}", other),
        None => {}
    }
    serde_json::to_string_pretty(&value).unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn missing_file_means_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let v = read_temperature_humidity(&dir.path().join("nope.json")).await;
        assert_eq!(v["service_status"], "stopped");
        assert!(v["error"].as_str().unwrap().contains("nope.json"));
    }

    #[tokio::test]
    async fn empty_file_means_no_data() {
        let f = file_with("  \n");
        assert_eq!(read_temperature_humidity(f.path()).await["service_status"], "no_data");
    }

    #[tokio::test]
    async fn malformed_json() {
        let f = file_with("{\"timestamp\":");
        assert_eq!(read_temperature_humidity(f.path()).await["service_status"], "json_error");
    }

    #[tokio::test]
    async fn first_missing_field_is_named() {
        let f = file_with(r#"{"timestamp":"T","humidity":50}"#);
        let v = read_temperature_humidity(f.path()).await;
        assert_eq!(v["service_status"], "invalid_format");
        assert!(v["error"].as_str().unwrap().ends_with("temperature"));
    }

    #[tokio::test]
    async fn non_object_is_invalid_format() {
        let f = file_with("[1, 2]");
        assert_eq!(read_temperature_humidity(f.path()).await["service_status"], "invalid_format");
    }

    #[tokio::test]
    async fn valid_sample_is_echoed() {
        let f = file_with(r#"{"timestamp":"2026-10-19T08:00:00","humidity":41.5,"temperature":22.8,"unit":"C"}"#);
        let v = read_temperature_humidity(f.path()).await;
        assert_eq!(v["service_status"], "running");
        assert_eq!(v["temperature"], 22.8);
        assert_eq!(v["unit"], "C");
    }

    #[tokio::test]
    async fn json_wrapper_is_pretty() {
        let f = file_with(r#"{"timestamp":"T","humidity":1,"temperature":2,"unit":"C"}"#);
        let s = temperature_humidity_json(f.path()).await;
        assert!(s.contains("\n"));
        let v: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v["service_status"], "running");
    }
}
