//! 1-Wire temperature sensors.

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::DriverError;

/// Sensor families whose `w1_slave` file carries a temperature reading.
pub const SUPPORTED_FAMILIES: &[&str] = &["DS18B20", "DS18S20", "DS1822", "DS1825"];

/// Device entry settings for a sensor on an OWBUS.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorSettings {
    /// Sensor family, e.g. "DS18B20"
    #[serde(rename = "type")]
    pub sensor_type: String,

    /// 1-Wire address as listed by the kernel, e.g. "28-0000071cbc4b"
    pub address: String,
}

#[derive(Debug, Default)]
struct Reading {
    value: Option<f64>,
    lost: bool,
    time: Option<i64>,
}

/// A 1-Wire sensor and its last reading.
#[derive(Debug)]
pub struct OneWireSensor {
    address: String,
    sensor_type: String,
    reading: Mutex<Reading>,
}

impl OneWireSensor {
    /// Create a new sensor. Fails for families we cannot read.
    pub fn new(settings: SensorSettings) -> Result<Self, String> {
        let family = settings.sensor_type.to_ascii_uppercase();
        if !SUPPORTED_FAMILIES.contains(&family.as_str()) {
            return Err(format!(
                "unsupported 1-Wire sensor type '{}'",
                settings.sensor_type
            ));
        }

        Ok(Self {
            address: settings.address,
            sensor_type: family,
            reading: Mutex::new(Reading::default()),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn sensor_type(&self) -> &str {
        &self.sensor_type
    }

    pub fn value(&self) -> Option<f64> {
        self.reading.lock().value
    }

    pub fn is_lost(&self) -> bool {
        self.reading.lock().lost
    }

    /// Record a read attempt. Returns true when the observable state
    /// changed: a new value, or the sensor going lost or coming back.
    pub(crate) fn record(&self, result: Result<f64, DriverError>) -> bool {
        let mut reading = self.reading.lock();
        match result {
            Ok(value) => {
                let changed = reading.lost || reading.value != Some(value);
                reading.value = Some(value);
                reading.lost = false;
                reading.time = Some(chrono::Utc::now().timestamp_millis());
                changed
            }
            Err(e) => {
                if reading.lost {
                    return false;
                }
                tracing::warn!(sensor = %self.address, error = %e, "1-Wire sensor lost");
                reading.lost = true;
                true
            }
        }
    }

    pub(crate) fn write_fields(&self, fields: &mut Map<String, Value>) {
        let reading = self.reading.lock();
        fields.insert("address".to_string(), json!(self.address));
        fields.insert("typ".to_string(), json!(self.sensor_type));
        fields.insert("value".to_string(), json!(reading.value));
        fields.insert("lost".to_string(), json!(reading.lost));
        fields.insert("time".to_string(), json!(reading.time));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor() -> OneWireSensor {
        OneWireSensor::new(SensorSettings {
            sensor_type: "ds18b20".to_string(),
            address: "28-0000071cbc4b".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_unsupported_family() {
        let result = OneWireSensor::new(SensorSettings {
            sensor_type: "DS2408".to_string(),
            address: "29-00000".to_string(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_record_changes() {
        let s = sensor();
        assert_eq!(s.sensor_type(), "DS18B20");

        assert!(s.record(Ok(21.5)));
        assert!(!s.record(Ok(21.5)));
        assert!(s.record(Ok(21.625)));
        assert_eq!(s.value(), Some(21.625));
    }

    #[test]
    fn test_lost_reported_once() {
        let s = sensor();
        s.record(Ok(20.0));

        assert!(s.record(Err(DriverError::Read("crc".to_string()))));
        assert!(!s.record(Err(DriverError::Read("crc".to_string()))));
        assert!(s.is_lost());

        // Coming back is a change even with the same value
        assert!(s.record(Ok(20.0)));
        assert!(!s.is_lost());
    }
}
