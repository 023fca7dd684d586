//! Per-layer filters for the redacting sinks

use tracing::Metadata;
use tracing_subscriber::filter::FilterFn;

/// HTTP and runtime plumbing used by the shipping worker. Their events would
/// otherwise be written into the segments the worker is uploading.
pub const TRANSPORT_TARGETS: &[&str] = &[
    "hyper",
    "h2",
    "tower",
    "reqwest",
    "rustls",
    "tokio_util",
    "want",
];

pub fn is_transport_target(target: &str) -> bool {
    TRANSPORT_TARGETS.iter().any(|noisy| {
        target == *noisy
            || target
                .strip_prefix(noisy)
                .map(|rest| rest.starts_with("::"))
                .unwrap_or(false)
    })
}

fn allows(metadata: &Metadata<'_>) -> bool {
    !is_transport_target(metadata.target())
}

/// Filter dropping every event from [`TRANSPORT_TARGETS`]
pub fn transport_filter() -> FilterFn {
    FilterFn::new(allows as fn(&Metadata<'_>) -> bool)
}
