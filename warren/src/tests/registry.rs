//! Tests of the consumer registry.

use async_trait::async_trait;
use serde_json::json;

use crate::consumer::{Consumer, ConsumerRegistry, Outcome};
use crate::message::Message;
use crate::Error;

/// A consumer that accepts everything.
struct AcceptAll;

#[async_trait]
impl Consumer for AcceptAll {
    async fn execute(&mut self, _message: &Message) -> Outcome {
        Outcome::Accept
    }
}

/// A consumer that remembers the configuration it was built from.
struct Configured {
    /// The `greeting` field of the configuration record.
    greeting: String,
}

#[async_trait]
impl Consumer for Configured {
    async fn execute(&mut self, _message: &Message) -> Outcome {
        Outcome::Discard(self.greeting.clone())
    }
}

#[test]
fn builds_registered_consumers() {
    let mut registry = ConsumerRegistry::new();
    registry.register("accept_all", |_| Ok::<_, String>(AcceptAll));

    assert!(registry.build("accept_all", None).is_ok());
}

#[test]
fn unknown_names_are_an_error() {
    let registry = ConsumerRegistry::new();
    let error = registry.build("missing", None).unwrap_err();
    assert!(matches!(error, Error::UnknownConsumer(name) if name == "missing"));
}

#[test]
fn factory_failures_are_fatal() {
    let mut registry = ConsumerRegistry::new();
    registry.register("broken", |_| Err::<AcceptAll, _>("no database".to_string()));

    let error = registry.build("broken", None).unwrap_err();
    match error {
        Error::ConsumerSetup { name, reason } => {
            assert_eq!(name, "broken");
            assert_eq!(reason, "no database");
        }
        other => panic!("expected a setup error, got {other:?}"),
    }
}

#[test]
fn factories_receive_their_configuration() {
    let mut registry = ConsumerRegistry::new();
    registry.register("configured", |config| {
        let greeting = config
            .and_then(|value| value.get("greeting"))
            .and_then(|value| value.as_str())
            .ok_or_else(|| "missing greeting".to_string())?;
        Ok(Configured {
            greeting: greeting.to_string(),
        })
    });

    let config = json!({ "greeting": "hello" });
    assert!(registry.build("configured", Some(&config)).is_ok());

    let error = registry.build("configured", None).unwrap_err();
    assert!(matches!(error, Error::ConsumerSetup { reason, .. } if reason == "missing greeting"));
}

#[test]
fn later_registrations_replace_earlier_ones() {
    let mut registry = ConsumerRegistry::new();
    registry.register("name", |_| Err::<AcceptAll, _>("first".to_string()));
    registry.register("name", |_| Ok::<_, String>(AcceptAll));

    assert!(registry.build("name", None).is_ok());
}
