//! Tracing setup for embedding applications.
//!
//! The pipeline logs under the `flicker` target: worker lifecycle, seeks,
//! decoder flushes, audio buffer sizing. Engines that already install their
//! own `tracing` subscriber get all of that for free and can ignore this
//! module; standalone tools and test harnesses can call [`init`] once at
//! boot instead.

/// Install a process-wide subscriber for the pipeline's log output.
///
/// The filter comes from `FLICKER_LOG` (standard `tracing` directive
/// syntax, e.g. `flicker=debug`); without it only warnings and errors get
/// through. Losing the race to another subscriber is fine — the call just
/// becomes a no-op.
#[cfg(feature = "logging")]
pub fn init() {
    use tracing_subscriber::filter::{EnvFilter, LevelFilter};

    let filter = EnvFilter::builder()
        .with_env_var("FLICKER_LOG")
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init();
}

/// Without the `logging` feature the engine owns subscriber setup; this
/// no-op keeps call sites compiling either way.
#[cfg(not(feature = "logging"))]
pub fn init() {}

#[cfg(test)]
mod tests {
    #[test]
    fn repeated_init_is_harmless() {
        super::init();
        super::init();
    }
}
