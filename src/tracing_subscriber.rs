pub fn init() {
    #[cfg(feature = "tracing-subscriber")]
    {
        use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

        // Tests call this once per process; later calls are no-ops.
        let _ = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish()
            .try_init();
    }
}
