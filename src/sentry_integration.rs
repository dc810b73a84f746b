//! Optional Sentry error tracking.
//!
//! Error-level tracing events reach Sentry through the layer installed in
//! [`logging::init`](crate::logging::init). The returned guard must live for
//! the whole process so queued events are sent on shutdown.

pub fn init(dsn: &str, environment: Option<&str>) -> sentry::ClientInitGuard {
    let dsn = dsn
        .parse()
        .map_err(|e| tracing::warn!(error = %e, "invalid Sentry DSN, error tracking disabled"))
        .ok();

    sentry::init(sentry::ClientOptions {
        dsn,
        environment: environment.map(|e| e.to_string().into()),
        release: Some(concat!("inference-router@", env!("CARGO_PKG_VERSION")).into()),
        attach_stacktrace: true,
        ..Default::default()
    })
}
