//! Tests of the signal coordinator.

use std::time::Duration;

use tokio::time::timeout;

use crate::signal::Signals;

#[tokio::test]
async fn disarmed_signals_never_fire() {
    let Ok(mut signals) = Signals::install() else {
        // Not every test environment lets us register signal handlers.
        return;
    };

    signals.disarm();

    let waited = timeout(Duration::from_millis(50), signals.recv()).await;
    assert!(waited.is_err(), "disarmed signals produced an event");
}
