use std::collections::BTreeMap;
use tracing::info;

/// One instrumentation event: a name plus string properties and numeric
/// measurements, mirroring what the dispatcher accumulates per command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetryEvent {
    pub name: String,
    pub properties: BTreeMap<String, String>,
    pub measurements: BTreeMap<String, f64>,
}

impl TelemetryEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Fire-and-forget event sink. Implementations must never block or fail
/// the invocation they instrument.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Default sink: renders events onto the `telemetry` tracing target,
/// following whatever subscriber the process installed.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: TelemetryEvent) {
        let properties = event
            .properties
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        let measurements = event
            .measurements
            .iter()
            .map(|(key, value)| format!("{key}={value:.3}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: "telemetry", event = %event.name, "{properties} {measurements}");
    }
}

#[cfg(test)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<TelemetryEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl TelemetrySink for RecordingSink {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{RecordingSink, TelemetryEvent, TelemetrySink};

    #[test]
    fn recording_sink_accumulates_in_order() {
        let sink = RecordingSink::new();
        let mut first = TelemetryEvent::new("command");
        first
            .properties
            .insert("outcome".to_string(), "success".to_string());
        sink.record(first.clone());
        sink.record(TelemetryEvent::new("activate"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], first);
        assert_eq!(events[0].property("outcome"), Some("success"));
        assert_eq!(events[1].name, "activate");
    }
}
