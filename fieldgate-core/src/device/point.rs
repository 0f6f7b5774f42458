//! Modbus-backed I/O points.
//!
//! Each point caches the last value seen on the bus. Scans update the cache
//! through `update*`, commands go through `write` which reaches the bus
//! first and only then updates the cache.

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::config::DataType;
use crate::error::DriverError;

/// Where a point lives: bus, unit id and first coil/register address.
#[derive(Debug, Clone)]
pub struct PointLink {
    bus: Arc<Bus>,
    unit: u8,
    address: u16,
}

impl PointLink {
    pub fn new(bus: Arc<Bus>, unit: u8, address: u16) -> Self {
        Self { bus, unit, address }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    fn write_fields(&self, fields: &mut Map<String, Value>) {
        fields.insert("bus".to_string(), json!(self.bus.name()));
        fields.insert("address".to_string(), json!(self.address));
    }
}

fn bit(value: Option<bool>) -> Value {
    match value {
        Some(v) => json!(u8::from(v)),
        None => Value::Null,
    }
}

/// Writable single-bit output (relay, LED).
#[derive(Debug)]
pub struct CoilPoint {
    link: PointLink,
    value: Mutex<Option<bool>>,
    /// Pending pulse revert, superseded by the next write command
    revert: Mutex<Option<JoinHandle<()>>>,
}

impl CoilPoint {
    pub fn new(link: PointLink) -> Self {
        Self {
            link,
            value: Mutex::new(None),
            revert: Mutex::new(None),
        }
    }

    /// Abort a pending pulse revert. Returns whether one was pending.
    pub(crate) fn cancel_revert(&self) -> bool {
        match self.revert.lock().take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub(crate) fn set_revert(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.revert.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn value(&self) -> Option<bool> {
        *self.value.lock()
    }

    /// Write the coil and return the previously cached value.
    pub(crate) async fn write(&self, value: bool) -> Result<Option<bool>, DriverError> {
        self.link
            .bus
            .modbus()?
            .write_coil(self.link.unit, self.link.address, value)
            .await?;
        Ok(self.value.lock().replace(value))
    }

    pub(crate) fn update(&self, value: bool) -> bool {
        replace_if_changed(&self.value, value)
    }

    pub(crate) fn write_fields(&self, fields: &mut Map<String, Value>) {
        fields.insert("value".to_string(), bit(self.value()));
        self.link.write_fields(fields);
    }
}

/// Read-only digital input.
#[derive(Debug)]
pub struct InputPoint {
    link: PointLink,
    value: Mutex<Option<bool>>,
}

impl InputPoint {
    pub fn new(link: PointLink) -> Self {
        Self {
            link,
            value: Mutex::new(None),
        }
    }

    pub fn value(&self) -> Option<bool> {
        *self.value.lock()
    }

    pub(crate) fn update(&self, value: bool) -> bool {
        replace_if_changed(&self.value, value)
    }

    pub(crate) fn write_fields(&self, fields: &mut Map<String, Value>) {
        fields.insert("value".to_string(), bit(self.value()));
        self.link.write_fields(fields);
    }
}

/// Raw 16-bit holding register.
#[derive(Debug)]
pub struct RegisterPoint {
    link: PointLink,
    value: Mutex<Option<u16>>,
}

impl RegisterPoint {
    pub fn new(link: PointLink) -> Self {
        Self {
            link,
            value: Mutex::new(None),
        }
    }

    pub fn value(&self) -> Option<u16> {
        *self.value.lock()
    }

    pub(crate) async fn write(&self, value: u16) -> Result<(), DriverError> {
        self.link
            .bus
            .modbus()?
            .write_registers(self.link.unit, self.link.address, &[value])
            .await?;
        *self.value.lock() = Some(value);
        Ok(())
    }

    pub(crate) fn update(&self, value: u16) -> bool {
        replace_if_changed(&self.value, value)
    }

    pub(crate) fn write_fields(&self, fields: &mut Map<String, Value>) {
        fields.insert("value".to_string(), json!(self.value()));
        self.link.write_fields(fields);
    }
}

/// How raw registers map to an engineering value.
#[derive(Debug, Clone)]
pub struct Scaling {
    pub data_type: DataType,
    pub scale: f64,
    pub offset: f64,
    pub unit: Option<String>,
}

impl Scaling {
    /// Decode one value (`raw * scale + offset`). Returns `None` when too
    /// few registers were supplied.
    pub fn decode(&self, words: &[u16]) -> Option<f64> {
        let raw = match self.data_type {
            DataType::U16 => *words.first()? as f64,
            DataType::I16 => *words.first()? as i16 as f64,
            DataType::U32 => join_words(words, false)? as f64,
            DataType::I32 => join_words(words, false)? as i32 as f64,
            DataType::F32 => f32::from_bits(join_words(words, false)?) as f64,
            DataType::U32Le => join_words(words, true)? as f64,
            DataType::I32Le => join_words(words, true)? as i32 as f64,
            DataType::F32Le => f32::from_bits(join_words(words, true)?) as f64,
        };
        Some(raw * self.scale + self.offset)
    }

    /// Encode an engineering value back to registers. Integer types round
    /// to the nearest value and saturate at the type bounds.
    pub fn encode(&self, value: f64) -> Vec<u16> {
        let raw = (value - self.offset) / self.scale;
        match self.data_type {
            DataType::U16 => vec![raw.round() as u16],
            DataType::I16 => vec![raw.round() as i16 as u16],
            DataType::U32 => split_words(raw.round() as u32, false),
            DataType::I32 => split_words(raw.round() as i32 as u32, false),
            DataType::F32 => split_words((raw as f32).to_bits(), false),
            DataType::U32Le => split_words(raw.round() as u32, true),
            DataType::I32Le => split_words(raw.round() as i32 as u32, true),
            DataType::F32Le => split_words((raw as f32).to_bits(), true),
        }
    }
}

fn join_words(words: &[u16], little_endian: bool) -> Option<u32> {
    let (hi, lo) = match words {
        [a, b, ..] if little_endian => (*b, *a),
        [a, b, ..] => (*a, *b),
        _ => return None,
    };
    Some(((hi as u32) << 16) | lo as u32)
}

fn split_words(bits: u32, little_endian: bool) -> Vec<u16> {
    let hi = (bits >> 16) as u16;
    let lo = bits as u16;
    if little_endian {
        vec![lo, hi]
    } else {
        vec![hi, lo]
    }
}

/// Scaled analog value (ai reads input registers, ao writes holding
/// registers).
#[derive(Debug)]
pub struct AnalogPoint {
    link: PointLink,
    scaling: Scaling,
    value: Mutex<Option<f64>>,
}

impl AnalogPoint {
    pub fn new(link: PointLink, scaling: Scaling) -> Self {
        Self {
            link,
            scaling,
            value: Mutex::new(None),
        }
    }

    pub fn value(&self) -> Option<f64> {
        *self.value.lock()
    }

    pub fn scaling(&self) -> &Scaling {
        &self.scaling
    }

    pub(crate) async fn write(&self, value: f64) -> Result<(), DriverError> {
        let words = self.scaling.encode(value);
        self.link
            .bus
            .modbus()?
            .write_registers(self.link.unit, self.link.address, &words)
            .await?;
        *self.value.lock() = self.scaling.decode(&words);
        Ok(())
    }

    pub(crate) fn update_raw(&self, words: &[u16]) -> bool {
        match self.scaling.decode(words) {
            Some(value) => replace_if_changed(&self.value, value),
            None => false,
        }
    }

    pub(crate) fn write_fields(&self, fields: &mut Map<String, Value>) {
        fields.insert("value".to_string(), json!(self.value()));
        if let Some(unit) = &self.scaling.unit {
            fields.insert("unit".to_string(), json!(unit));
        }
        self.link.write_fields(fields);
    }
}

fn replace_if_changed<T: PartialEq>(slot: &Mutex<Option<T>>, value: T) -> bool {
    let mut current = slot.lock();
    if current.as_ref() == Some(&value) {
        return false;
    }
    *current = Some(value);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaling(data_type: DataType, scale: f64, offset: f64) -> Scaling {
        Scaling {
            data_type,
            scale,
            offset,
            unit: None,
        }
    }

    #[test]
    fn test_decode_u16() {
        let s = scaling(DataType::U16, 1.0, 0.0);
        assert_eq!(s.decode(&[1234]), Some(1234.0));
        assert_eq!(s.decode(&[]), None);
    }

    #[test]
    fn test_decode_i16() {
        let s = scaling(DataType::I16, 1.0, 0.0);
        assert_eq!(s.decode(&[0xFFFF]), Some(-1.0));
    }

    #[test]
    fn test_decode_f32_big_endian() {
        let bits = 1.5f32.to_bits();
        let s = scaling(DataType::F32, 1.0, 0.0);
        assert_eq!(s.decode(&[(bits >> 16) as u16, bits as u16]), Some(1.5));
    }

    #[test]
    fn test_decode_u32_word_order() {
        assert_eq!(
            scaling(DataType::U32, 1.0, 0.0).decode(&[1, 2]),
            Some(65538.0)
        );
        assert_eq!(
            scaling(DataType::U32Le, 1.0, 0.0).decode(&[2, 1]),
            Some(65538.0)
        );
        assert_eq!(scaling(DataType::U32, 1.0, 0.0).decode(&[1]), None);
    }

    #[test]
    fn test_decode_with_scale_offset() {
        let s = scaling(DataType::U16, 0.1, -40.0);
        let value = s.decode(&[500]).unwrap();
        assert!((value - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_encode_inverts_scaling() {
        let s = scaling(DataType::U16, 0.1, -40.0);
        assert_eq!(s.encode(10.0), vec![500]);

        let s = scaling(DataType::I32, 1.0, 0.0);
        assert_eq!(s.encode(-2.0), vec![0xFFFF, 0xFFFE]);
    }

    #[test]
    fn test_replace_if_changed() {
        let slot = Mutex::new(None);
        assert!(replace_if_changed(&slot, true));
        assert!(!replace_if_changed(&slot, true));
        assert!(replace_if_changed(&slot, false));
    }
}
