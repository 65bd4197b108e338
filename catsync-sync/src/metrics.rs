//! Counters and the status gauge emitted by the syncer.
//!
//! Only the `metrics` facade is used here; installing an exporter is up to the
//! embedding binary.

use catsync_core::{CatalogDeregistration, CatalogRegistration};

pub const REGISTER_TOTAL: &str = "catsync_register_total";
pub const REGISTER_ERROR_TOTAL: &str = "catsync_register_error_total";
pub const DEREGISTER_TOTAL: &str = "catsync_deregister_total";
pub const DEREGISTER_ERROR_TOTAL: &str = "catsync_deregister_error_total";
/// 1 after a successful register, 0 after a failed one.
pub const STATUS: &str = "catsync_status";

/// Registers descriptions with whatever recorder is installed.
pub fn describe() {
    metrics::describe_counter!(REGISTER_TOTAL, "Service instances registered to the catalog");
    metrics::describe_counter!(
        REGISTER_ERROR_TOTAL,
        "Register requests the catalog answered with an error"
    );
    metrics::describe_counter!(
        DEREGISTER_TOTAL,
        "Service instances deregistered from the catalog"
    );
    metrics::describe_counter!(
        DEREGISTER_ERROR_TOTAL,
        "Deregister requests the catalog answered with an error"
    );
    metrics::describe_gauge!(STATUS, "1 when the catalog accepts registrations, 0 otherwise");
}

pub(crate) fn registered(registration: &CatalogRegistration) {
    metrics::counter!(
        REGISTER_TOTAL,
        "service" => registration.service.service.clone(),
        "node" => registration.node.clone(),
        "namespace" => registration.service.namespace.clone(),
        "datacenter" => registration.datacenter.clone(),
    )
    .increment(1);
    metrics::gauge!(STATUS).set(1.0);
}

pub(crate) fn register_failed() {
    metrics::counter!(REGISTER_ERROR_TOTAL).increment(1);
    metrics::gauge!(STATUS).set(0.0);
}

pub(crate) fn deregistered(deregistration: &CatalogDeregistration) {
    metrics::counter!(
        DEREGISTER_TOTAL,
        "node" => deregistration.node.clone(),
        "namespace" => deregistration.namespace.clone(),
    )
    .increment(1);
}

pub(crate) fn deregister_failed() {
    metrics::counter!(DEREGISTER_ERROR_TOTAL).increment(1);
}
