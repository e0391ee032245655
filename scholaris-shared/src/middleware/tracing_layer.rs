use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset: info everywhere, debug for the
/// service's own crate and the HTTP trace layer.
pub fn default_directives(service_name: &str) -> String {
    // Crate targets use underscores, service names use dashes.
    let target = service_name.replace('-', "_");
    format!("info,{target}=debug,tower_http=debug")
}

/// JSON output is selected with `SCHOLARIS_ENV=production`.
pub fn init_tracing(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(service_name)));

    let is_production = std::env::var("SCHOLARIS_ENV")
        .map(|v| v == "production")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if is_production {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    };

    match installed {
        Ok(()) => tracing::info!(service = service_name, production = is_production, "tracing initialized"),
        Err(e) => tracing::warn!(error = %e, "tracing subscriber already installed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_use_crate_target() {
        assert_eq!(
            default_directives("scholaris-messaging"),
            "info,scholaris_messaging=debug,tower_http=debug"
        );
    }
}
