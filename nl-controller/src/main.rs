use std::env;

use nl_controller::{Controller, ControllerState, ServerSettings, build_controller_app};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if wants_version_flag() {
        println!("{}", binary_version_text());
        return Ok(());
    }

    init_logging();
    info!(
        "{} profile={}",
        binary_version_text(),
        env!("NL_BUILD_PROFILE")
    );

    let settings = ServerSettings::load()?;
    if settings.enable_ssl {
        warn!(
            "enable_ssl is set; certificate {} and key {} are validated but TLS must be terminated in front of the controller",
            settings
                .certfile
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            settings
                .certkey
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_default()
        );
    }
    tokio::fs::create_dir_all(&settings.projects_path).await?;
    let bind_to = (settings.host.clone(), settings.port);
    info!(
        "projects_path={} placement={} compute_rpc_timeout_ms={} local={}",
        settings.projects_path.display(),
        settings.placement.as_str(),
        settings.compute_rpc_timeout_ms,
        settings.local
    );
    if !settings.additional_images_paths.is_empty() || !settings.allowed_interfaces.is_empty() {
        info!(
            "additional_images_paths={:?} allowed_interfaces={:?}",
            settings.additional_images_paths, settings.allowed_interfaces
        );
    }

    let state = ControllerState::new(Controller::new(settings)?);
    let app = build_controller_app(state);
    let listener = tokio::net::TcpListener::bind(bind_to).await?;
    info!("controller listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn wants_version_flag() -> bool {
    env::args()
        .skip(1)
        .any(|arg| matches!(arg.as_str(), "-V" | "--version"))
}

fn binary_version_text() -> String {
    let binary = env!("CARGO_PKG_NAME");
    let git_tag = option_env!("NL_BUILD_GIT_TAG").unwrap_or("untagged");
    let git_commit = option_env!("NL_BUILD_GIT_COMMIT").unwrap_or("unknown");
    let git_dirty = option_env!("NL_BUILD_GIT_DIRTY").unwrap_or("false");
    let dirty = matches!(git_dirty, "true" | "1" | "yes" | "dirty");

    if dirty {
        format!("{binary} {git_tag} (dirty commit: {git_commit})")
    } else {
        format!("{binary} {git_tag}")
    }
}
