//! Propagation of OpenTelemetry trace context through AMQP message headers.
//!
//! Both directions go through the global text-map propagator: whatever the binary registered
//! (e.g. W3C `traceparent`) decides which headers are written and read.
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::Context;
use std::collections::BTreeMap;
use tracing::debug;

/// Writes propagation fields into AMQP headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads propagation fields out of AMQP headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| debug!(header = key, "Header is not valid UTF-8: {e}"))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Copy of `properties` carrying the trace context of `cx` in its headers.
pub fn inject_context(cx: &Context, properties: BasicProperties) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|h| h.inner().clone())
        .unwrap_or_default();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderInjector::new(&mut headers))
    });
    properties.with_headers(FieldTable::from(headers))
}

/// The remote trace context carried by `properties`, or an empty context.
pub fn extract_context(properties: &BasicProperties) -> Context {
    let empty = BTreeMap::new();
    let headers = properties
        .headers()
        .as_ref()
        .map(FieldTable::inner)
        .unwrap_or(&empty);
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    })
}
