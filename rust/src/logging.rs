/// Platform-native logging initialization.
///
/// - iOS: tracing-oslog → os_log, plus `<data_dir>/courier.log`
/// - Android: paranoid-android → logcat
/// - Tests / desktop: tracing-subscriber fmt on stderr, or `<data_dir>/courier.log`
///   when `COURIER_LOG_FILE=1`
///
/// Called once at the start of `ChatApp::new()`. Later calls are no-ops.
pub fn init_logging(#[allow(unused)] data_dir: &str) {
    const DEFAULT_FILTER: &str = "courier_core=debug,info";

    #[cfg(target_os = "ios")]
    {
        use tracing_subscriber::prelude::*;

        let os_log = tracing_oslog::OsLogger::new("app.courier", "default");
        let file_layer = open_log_file(data_dir).map(|file| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
        });

        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(DEFAULT_FILTER))
            .with(os_log)
            .with(file_layer)
            .try_init();
    }

    #[cfg(target_os = "android")]
    {
        use tracing_subscriber::prelude::*;

        let android_layer = paranoid_android::layer("courier")
            .with_filter(tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
        let _ = tracing_subscriber::registry().with(android_layer).try_init();
    }

    #[cfg(not(any(target_os = "ios", target_os = "android")))]
    {
        use tracing_subscriber::prelude::*;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| DEFAULT_FILTER.into());
        let to_file = std::env::var("COURIER_LOG_FILE").ok().as_deref() == Some("1");

        let _ = match to_file.then(|| open_log_file(data_dir)).flatten() {
            Some(file) => tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false)
                        .with_target(true),
                )
                .try_init(),
            None => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init(),
        };
    }
}

#[cfg(not(target_os = "android"))]
fn open_log_file(data_dir: &str) -> Option<std::fs::File> {
    let _ = std::fs::create_dir_all(data_dir);
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(std::path::Path::new(data_dir).join("courier.log"))
        .ok()
}
