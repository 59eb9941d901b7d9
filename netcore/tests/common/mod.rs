use std::sync::Once;

/// Initializes a `tracing` subscriber once per test binary, controlled by
/// the `NETCORE_LOG` environment variable. Safe to call from every test;
/// only the first call has any effect.
#[allow(dead_code)]
pub fn init_tracing() {
    static TRACING: Once = Once::new();
    TRACING.call_once(|| {
        let env_filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(tracing::Level::DEBUG.into())
            .with_env_var("NETCORE_LOG")
            .from_env()
            .unwrap();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .compact()
            .with_test_writer()
            .init();
    });
}
