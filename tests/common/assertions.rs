//! Domain-specific assertion macros for spewguard harnesses.
//!
//! These wrap `pretty_assertions` and add failure messages that say which
//! pipeline guarantee was violated and for which source.

use spewguard_core::forwarder::Delivered;

// ---------------------------------------------------------------------------
// Governor assertions
// ---------------------------------------------------------------------------

/// Assert the governor's current state for a source.
///
/// ```rust
/// assert_state!(governor, "app1", GovernorState::Backpressure);
/// ```
#[macro_export]
macro_rules! assert_state {
    ($governor:expr, $source:expr, $expected:expr) => {{
        let id = spewguard_core::SourceId::from($source);
        let actual = $governor.current_state(&id);
        pretty_assertions::assert_eq!(
            actual,
            Some($expected),
            "assert_state! failed for source {}: history {:?}",
            id,
            $governor.transitions(&id)
        );
    }};
}

/// Assert a source reports healthy liveness.
#[macro_export]
macro_rules! assert_healthy {
    ($governor:expr, $source:expr) => {{
        let id = spewguard_core::SourceId::from($source);
        match $governor.liveness(&id) {
            Some(signal) if signal.healthy() => {}
            Some(signal) => panic!(
                "assert_healthy! failed: {} is unhealthy ({:?}), state {:?}",
                id,
                signal.reason(),
                $governor.current_state(&id)
            ),
            None => panic!("assert_healthy! failed: {} is not registered", id),
        }
    }};
}

/// Assert the exact (from, to) transition path recorded for a source.
#[macro_export]
macro_rules! assert_transitions {
    ($governor:expr, $source:expr, [$(($from:expr, $to:expr)),* $(,)?]) => {{
        let id = spewguard_core::SourceId::from($source);
        let actual: Vec<_> = $governor
            .transitions(&id)
            .into_iter()
            .map(|t| (t.from, t.to))
            .collect();
        let expected: Vec<(spewguard_core::GovernorState, spewguard_core::GovernorState)> =
            vec![$(($from, $to)),*];
        pretty_assertions::assert_eq!(actual, expected);
    }};
}

// ---------------------------------------------------------------------------
// Delivery assertions
// ---------------------------------------------------------------------------

/// Panic unless `delivered` sequence numbers are strictly increasing.
pub fn assert_in_sequence(delivered: &[Delivered]) {
    for pair in delivered.windows(2) {
        assert!(
            pair[0].sequence < pair[1].sequence,
            "frames of {} out of order: {} then {}",
            pair[1].source_id,
            pair[0].sequence,
            pair[1].sequence
        );
    }
}

/// Concatenate delivered payloads of one stream.
pub fn payload_text(delivered: &[Delivered], stream: spewguard_core::StreamKind) -> String {
    let bytes: Vec<u8> = delivered
        .iter()
        .filter(|d| d.stream == stream)
        .flat_map(|d| d.payload.iter().copied())
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
