use std::ffi::OsStr;
use std::path::Path;

use tracing_core::{Level, LevelFilter, Metadata};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, Layer};

/// If a global tracing subscriber is not already configured, log to stderr and,
/// when a path is given, to that file, and add our custom panic hook.
///
/// Returns whether this call installed the subscriber.
pub fn install_logger(file_path: Option<&Path>) -> bool {
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(keep_event));

    let file = file_path.map(|path| {
        let writer = tracing_appender::rolling::never(
            path.parent().unwrap_or_else(|| Path::new(".")),
            path.file_name()
                .unwrap_or_else(|| OsStr::new("experiment.log")),
        );

        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(LevelFilter::INFO)
            .with_filter(filter_fn(keep_event))
    });

    let installed = registry().with(stderr).with(file).try_init().is_ok();

    if installed {
        if let Some(path) = file_path {
            update_panic_hook(path);
        }
    }

    installed
}

fn keep_event(metadata: &Metadata<'_>) -> bool {
    if let Some(path) = metadata.module_path() {
        // The wgpu crate is logging too much, so we skip `info` level.
        if path.starts_with("wgpu") && *metadata.level() >= Level::INFO {
            return false;
        }
    }
    true
}

fn update_panic_hook(file_path: &Path) {
    let hook = std::panic::take_hook();
    let file_path = file_path.display().to_string();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");
        eprintln!(
            "=== PANIC ===\nA fatal error happened, you can check the run logs here => \
             '{file_path}'\n============="
        );
        hook(info);
    }));
}

