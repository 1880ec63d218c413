//! ML-runtime event model.
//!
//! A connected ML-runtime session announces a *counter directory*: the
//! devices, counter sets, and categories of events available on that
//! endpoint. Events are identified across sessions by [`EventId`], which is
//! ordered lexicographically over (category, device, counter set, name)
//! with an absent optional field sorting before any present one. The
//! daemon-wide registry maps each requested [`EventId`] to the
//! [`ApcCounterKey`] under which its samples are written to the capture
//! stream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Integer identifier under which captured samples for a counter are
/// written to the output stream.
pub type ApcCounterKey = i32;

/// Counter semantics class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterClass {
    /// Value is a delta since the previous sample.
    Delta,
    /// Value is an absolute reading.
    Absolute,
}

/// How a consumer may interpolate between samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterInterpolation {
    Linear,
    Step,
}

/// Requested ML capture mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterCaptureMode {
    /// Sample all active counters on a fixed period.
    Periodic,
    /// Sample around job boundaries.
    PerJob,
}

/// Globally-unique descriptor of an ML-runtime event across sessions.
///
/// The derived ordering is lexicographic in field declaration order, and
/// `Option`'s ordering places `None` before any `Some`, which is exactly
/// the required "absent < present" rule for the optional fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub category: String,
    pub device: Option<String>,
    pub counter_set: Option<String>,
    pub name: String,
}

impl EventId {
    pub fn new(
        category: impl Into<String>,
        device: Option<String>,
        counter_set: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            device,
            counter_set,
            name: name.into(),
        }
    }
}

/// Static properties of an event as announced by a counter directory.
///
/// Equality is field-wise; `multiplier` is a floating-point scale factor,
/// so the type is `PartialEq` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventProperties {
    pub counter_set_count: u16,
    pub class: CounterClass,
    pub interpolation: CounterInterpolation,
    pub multiplier: f64,
    pub description: String,
    pub units: String,
}

/// A device as announced by one session's counter directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    /// Number of cores associated with the device (0 = uncored).
    pub cores: u16,
}

/// A counter set as announced by one session's counter directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSetRecord {
    pub name: String,
    /// Number of counters in the set.
    pub count: u16,
}

/// One event inside a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Wire-level UID of the event within the session.
    pub uid: u16,
    pub name: String,
    /// Device reference overriding the category's, if any.
    pub device_uid: Option<u16>,
    /// Counter-set reference overriding the category's, if any.
    pub counter_set_uid: Option<u16>,
    pub class: CounterClass,
    pub interpolation: CounterInterpolation,
    pub multiplier: f64,
    pub description: String,
    pub units: String,
}

/// A category of events as announced by one session's counter directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub name: String,
    pub device_uid: Option<u16>,
    pub counter_set_uid: Option<u16>,
    /// Events keyed by their wire-level UID.
    pub events_by_uid: BTreeMap<u16, EventRecord>,
}

impl CategoryRecord {
    /// Resolves the device reference for an event: the event's own
    /// reference wins over the category's.
    pub fn device_for(&self, event: &EventRecord) -> Option<u16> {
        event.device_uid.or(self.device_uid)
    }

    /// Resolves the counter-set reference for an event.
    pub fn counter_set_for(&self, event: &EventRecord) -> Option<u16> {
        event.counter_set_uid.or(self.counter_set_uid)
    }
}

/// The APC counter key plus core number a requested event UID maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAndCore {
    pub key: ApcCounterKey,
    pub core: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(
        category: &str,
        device: Option<&str>,
        counter_set: Option<&str>,
        name: &str,
    ) -> EventId {
        EventId::new(
            category,
            device.map(str::to_owned),
            counter_set.map(str::to_owned),
            name,
        )
    }

    #[test]
    fn test_event_id_order_is_lexicographic() {
        let a = id("inference", None, None, "cycles");
        let b = id("inference", None, None, "instructions");
        let c = id("memory", None, None, "bytes");
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn test_event_id_absent_sorts_before_present() {
        let absent = id("inference", None, None, "zz");
        let present = id("inference", Some("npu0"), None, "aa");
        assert!(absent < present, "absent device must sort first");

        let no_set = id("inference", Some("npu0"), None, "zz");
        let with_set = id("inference", Some("npu0"), Some("s0"), "aa");
        assert!(no_set < with_set, "absent counter set must sort first");
    }

    #[test]
    fn test_event_id_order_is_strict() {
        let a = id("a", None, None, "x");
        let b = id("a", Some("d"), None, "x");
        // Irreflexive and antisymmetric.
        assert!(!(a < a.clone()));
        assert!(a < b);
        assert!(!(b < a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_event_properties_equality_is_field_wise() {
        let p = EventProperties {
            counter_set_count: 4,
            class: CounterClass::Delta,
            interpolation: CounterInterpolation::Linear,
            multiplier: 1.0,
            description: "cycle count".into(),
            units: "cycles".into(),
        };
        let mut q = p.clone();
        assert_eq!(p, q);
        q.multiplier = 2.0;
        assert_ne!(p, q);
    }

    #[test]
    fn test_category_reference_resolution() {
        let event = EventRecord {
            uid: 3,
            name: "cycles".into(),
            device_uid: None,
            counter_set_uid: Some(9),
            class: CounterClass::Delta,
            interpolation: CounterInterpolation::Linear,
            multiplier: 1.0,
            description: String::new(),
            units: String::new(),
        };
        let category = CategoryRecord {
            name: "inference".into(),
            device_uid: Some(1),
            counter_set_uid: Some(2),
            events_by_uid: BTreeMap::new(),
        };
        assert_eq!(category.device_for(&event), Some(1));
        assert_eq!(category.counter_set_for(&event), Some(9));
    }
}
