//! Negotiation of optional platform capabilities (instance layers and
//! extensions) against what the running Vulkan implementation reports.
//!
//! Negotiation is a pure function over an immutable snapshot of the
//! platform-reported names: no global layer/extension lists, no process
//! state. [`Instance::new`](crate::instance::Instance::new) takes the
//! snapshots once and threads them through here.

use std::ffi::{CStr, CString};

use thiserror::Error;

/// One requested capability, tagged `required` or best-effort.
///
/// A missing `required` capability fails negotiation; a missing
/// optional one is silently dropped (and reported through the
/// [`DiagnosticSink`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequest {
    name: CString,
    required: bool,
}

impl CapabilityRequest {
    pub fn required(name: &CStr) -> Self {
        Self { name: name.to_owned(), required: true }
    }

    pub fn optional(name: &CStr) -> Self {
        Self { name: name.to_owned(), required: false }
    }

    pub fn name(&self) -> &CStr {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Required capability {name:?} is not available on this platform")]
pub struct CapabilityMissing {
    pub name: CString,
}

/// Receiver for diagnostics about dropped optional capabilities.
///
/// Injected by the caller instead of registering a process-global
/// callback; the default [`TracingSink`] forwards to the `tracing`
/// subscriber.
pub trait DiagnosticSink {
    fn report(&self, prefix: &str, message: &str);
}

/// Default diagnostic sink. Emits warnings via [`tracing`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, prefix: &str, message: &str) {
        tracing::warn!(target: "rcompute-capability", "[{}] {}", prefix, message);
    }
}

/// Filter `requested` against the `available` snapshot.
///
/// Accepted names are returned in request order, each name at most
/// once: a duplicate request for an already-accepted name is skipped,
/// whatever its polarity, so callers can layer defaults over explicit
/// requests without double-enabling anything. The first missing
/// `required` entry (in request order, so the failure is deterministic)
/// aborts with [`CapabilityMissing`]; missing optional entries are
/// dropped and reported to `sink`.
///
/// Negotiating twice with the same inputs yields the same output.
pub fn negotiate(
    requested: &[CapabilityRequest],
    available: &[CString],
    sink: &dyn DiagnosticSink,
) -> Result<Vec<CString>, CapabilityMissing> {
    let mut accepted: Vec<CString> = Vec::with_capacity(requested.len());
    for request in requested {
        if accepted.iter().any(|a| a.as_c_str() == request.name()) {
            continue;
        }
        if available.iter().any(|a| a.as_c_str() == request.name()) {
            accepted.push(request.name.clone());
        } else if request.required {
            return Err(CapabilityMissing { name: request.name.clone() });
        } else {
            sink.report(
                "capability",
                &format!("optional capability {:?} is missing, dropping", request.name),
            );
        }
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct RecordingSink {
        messages: RefCell<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { messages: RefCell::new(Vec::new()) }
        }
    }

    impl DiagnosticSink for RecordingSink {
        fn report(&self, _prefix: &str, message: &str) {
            self.messages.borrow_mut().push(message.to_owned());
        }
    }

    fn snapshot(names: &[&CStr]) -> Vec<CString> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    #[test]
    fn accepted_preserves_request_order() {
        let available =
            snapshot(&[c"VK_B", c"VK_A", c"VK_C"]);
        let requested = [
            CapabilityRequest::required(c"VK_C"),
            CapabilityRequest::required(c"VK_A"),
            CapabilityRequest::optional(c"VK_B"),
        ];

        let accepted = negotiate(&requested, &available, &TracingSink).unwrap();
        assert_eq!(
            accepted,
            snapshot(&[c"VK_C", c"VK_A", c"VK_B"])
        );
    }

    #[test]
    fn first_missing_required_entry_is_named() {
        let available = snapshot(&[c"VK_A"]);
        let requested = [
            CapabilityRequest::required(c"VK_A"),
            CapabilityRequest::required(c"VK_X"),
            CapabilityRequest::required(c"VK_Y"),
        ];

        let err = negotiate(&requested, &available, &TracingSink).unwrap_err();
        assert_eq!(err.name, c"VK_X".to_owned());
    }

    #[test]
    fn missing_optionals_are_dropped_and_reported() {
        let available = snapshot(&[c"VK_A"]);
        let requested = [
            CapabilityRequest::optional(c"VK_A"),
            CapabilityRequest::optional(c"VK_GONE"),
        ];

        let sink = RecordingSink::new();
        let accepted = negotiate(&requested, &available, &sink).unwrap();
        assert_eq!(accepted, snapshot(&[c"VK_A"]));

        let messages = sink.messages.borrow();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("VK_GONE"));
    }

    #[test]
    fn duplicate_requests_enable_a_name_once() {
        let available = snapshot(&[c"VK_LAYER_KHRONOS_validation"]);
        let requested = [
            CapabilityRequest::required(c"VK_LAYER_KHRONOS_validation"),
            CapabilityRequest::optional(c"VK_LAYER_KHRONOS_validation"),
        ];

        let accepted = negotiate(&requested, &available, &TracingSink).unwrap();
        assert_eq!(accepted, snapshot(&[c"VK_LAYER_KHRONOS_validation"]));
    }

    #[test]
    fn duplicate_of_a_missing_required_name_still_fails() {
        let available = snapshot(&[]);
        let requested = [
            CapabilityRequest::optional(c"VK_X"),
            CapabilityRequest::required(c"VK_X"),
        ];

        let sink = RecordingSink::new();
        let err = negotiate(&requested, &available, &sink).unwrap_err();
        assert_eq!(err.name, c"VK_X".to_owned());
    }

    #[test]
    fn negotiation_is_idempotent() {
        let available = snapshot(&[c"VK_A", c"VK_B"]);
        let requested = [
            CapabilityRequest::required(c"VK_B"),
            CapabilityRequest::optional(c"VK_MISSING"),
            CapabilityRequest::optional(c"VK_A"),
        ];

        let first = negotiate(&requested, &available, &TracingSink).unwrap();
        let second = negotiate(&requested, &available, &TracingSink).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_request_is_accepted() {
        let accepted =
            negotiate(&[], &snapshot(&[c"VK_A"]), &TracingSink).unwrap();
        assert!(accepted.is_empty());
    }
}
