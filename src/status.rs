//! Canonical status taxonomy. Exact phrase sets first, substring heuristics
//! second, `Pending` when nothing matches.

use crate::models::CanonicalStatus;

const PENDING_PHRASES: &[&str] = &[
    "payment pending",
    "payment verification",
    "review pending",
    "verified",
    "waiting packing",
];

const IN_TRANSIT_PHRASES: &[&str] = &["packing", "packaging completed", "shipped"];

const DELIVERED_PHRASES: &[&str] = &["received"];

const RETURNED_PHRASES: &[&str] = &["returned", "returned by customs"];

const CANCELLED_PHRASES: &[&str] = &["cancelled", "void", "lost"];

/// Map free-text upstream status wording onto the fixed taxonomy.
pub fn canonical_status(raw: &str) -> CanonicalStatus {
    let needle = raw.trim().to_lowercase();
    if needle.is_empty() {
        return CanonicalStatus::Pending;
    }

    let exact = |phrases: &[&str]| phrases.iter().any(|p| *p == needle);
    if exact(PENDING_PHRASES) {
        return CanonicalStatus::Pending;
    }
    if exact(IN_TRANSIT_PHRASES) {
        return CanonicalStatus::InTransit;
    }
    if exact(DELIVERED_PHRASES) {
        return CanonicalStatus::Delivered;
    }
    if exact(RETURNED_PHRASES) {
        return CanonicalStatus::Returned;
    }
    if exact(CANCELLED_PHRASES) {
        return CanonicalStatus::CancelledOrLost;
    }

    let contains = |subs: &[&str]| subs.iter().any(|s| needle.contains(s));
    if contains(&["ship", "transit"]) {
        return CanonicalStatus::InTransit;
    }
    if contains(&["deliver", "sign", "received"]) {
        return CanonicalStatus::Delivered;
    }
    if contains(&["return"]) {
        return CanonicalStatus::Returned;
    }
    if contains(&["cancel", "lost"]) {
        return CanonicalStatus::CancelledOrLost;
    }

    CanonicalStatus::Pending
}
