// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in the AMQP message headers: publishing injects the
//! caller's context, consuming extracts it and opens a consumer span around the
//! handler invocation.

use crate::amqp::MessageEnvelope;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Name of the tracer used by consumers
pub(crate) const CONSUMER_TRACER: &str = "amqp consumer";

/// Adapter between OpenTelemetry propagators and AMQP header tables.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Returns `properties` with the trace context of `ctx` merged into its headers.
pub(crate) fn inject(ctx: &Context, properties: BasicProperties) -> BasicProperties {
    let mut headers = properties
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(&mut headers))
    });

    properties.with_headers(FieldTable::from(headers))
}

/// Creates a consumer span for a delivery.
///
/// The parent context is extracted from the delivery headers.
///
/// # Parameters
/// * `envelope` - The delivery
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Span name, typically the message type
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    envelope: &MessageEnvelope,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = envelope
        .properties
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn propagator_reads_back_what_it_wrote() {
        let mut headers = BTreeMap::new();
        let mut propagator = HeaderPropagator::new(&mut headers);

        propagator.set("TraceParent", "00-abc-def-01".to_owned());
        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.keys(), vec!["traceparent"]);
    }

    #[test]
    fn non_string_headers_are_ignored() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("count"), AMQPValue::LongInt(3));
        headers.insert(
            ShortString::from("kind"),
            AMQPValue::LongString(LongString::from("order")),
        );

        let propagator = HeaderPropagator::new(&mut headers);
        assert_eq!(propagator.get("count"), None);
        assert_eq!(propagator.get("kind"), Some("order"));
    }

    #[test]
    fn inject_keeps_existing_headers() {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("tenant"), AMQPValue::LongInt(7));
        let properties = BasicProperties::default().with_headers(table);

        let injected = inject(&Context::new(), properties);
        let headers = injected.headers().clone().unwrap_or_default();
        assert_eq!(
            headers.inner().get("tenant"),
            Some(&AMQPValue::LongInt(7))
        );
    }
}
