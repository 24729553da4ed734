use std::{env, net::SocketAddr, path::PathBuf};

use compute::{ComputeConfig, EmulatorType, SharedState, build_compute_app, init_logging};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = match parse_cli_args() {
        Ok(CliAction::Run(cli)) => cli,
        Ok(CliAction::Help) => {
            print_cli_help();
            return Ok(());
        }
        Ok(CliAction::Version) => {
            println!("{}", binary_version_text());
            return Ok(());
        }
        Err(err) => {
            eprintln!("error: {err}\n");
            print_cli_help();
            return Err(err.into());
        }
    };

    init_logging()?;
    info!("{}", binary_version_text());

    let listen_addr = match cli.listen_addr {
        Some(addr) => addr,
        None => "0.0.0.0:3080".parse()?,
    };
    let config = ComputeConfig {
        compute_id: cli.compute_id.unwrap_or_else(default_compute_id),
        projects_path: cli
            .projects_path
            .unwrap_or_else(|| PathBuf::from(".nl-compute/projects")),
        emulators: cli.emulators.unwrap_or_else(|| EmulatorType::ALL.to_vec()),
        local: cli.local,
    };
    tokio::fs::create_dir_all(&config.projects_path).await?;
    info!(
        "compute_id={} projects_path={} local={} emulators={}",
        config.compute_id,
        config.projects_path.display(),
        config.local,
        config
            .emulators
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(",")
    );

    let app = build_compute_app(SharedState::new(config));
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("compute listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Clone, Debug, Default)]
struct CliArgs {
    listen_addr: Option<SocketAddr>,
    projects_path: Option<PathBuf>,
    emulators: Option<Vec<EmulatorType>>,
    compute_id: Option<String>,
    local: bool,
}

enum CliAction {
    Run(CliArgs),
    Help,
    Version,
}

fn parse_cli_args() -> Result<CliAction, String> {
    let mut args = env::args().skip(1);
    let mut cli = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliAction::Help),
            "-V" | "--version" => return Ok(CliAction::Version),
            "--listen-addr" => {
                let value = next_arg_value("--listen-addr", &mut args)?;
                cli.listen_addr = Some(
                    value
                        .parse::<SocketAddr>()
                        .map_err(|_| format!("invalid --listen-addr: {value}"))?,
                );
            }
            "--projects-path" => {
                cli.projects_path =
                    Some(PathBuf::from(next_arg_value("--projects-path", &mut args)?));
            }
            "--emulators" => {
                let value = next_arg_value("--emulators", &mut args)?;
                cli.emulators = Some(parse_emulators(&value)?);
            }
            "--local" => cli.local = true,
            "--compute-id" => {
                cli.compute_id = Some(next_arg_value("--compute-id", &mut args)?);
            }
            _ => return Err(format!("unknown argument: {arg}")),
        }
    }
    Ok(CliAction::Run(cli))
}

fn parse_emulators(value: &str) -> Result<Vec<EmulatorType>, String> {
    let mut emulators = Vec::new();
    for item in value.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let kind = item.parse::<EmulatorType>()?;
        if !emulators.contains(&kind) {
            emulators.push(kind);
        }
    }
    if emulators.is_empty() {
        return Err("--emulators needs at least one emulator type".to_string());
    }
    Ok(emulators)
}

fn next_arg_value(flag: &str, args: &mut impl Iterator<Item = String>) -> Result<String, String> {
    let value = args
        .next()
        .ok_or_else(|| format!("missing value for {flag}"))?;
    if value.trim().is_empty() {
        return Err(format!("value for {flag} cannot be empty"));
    }
    Ok(value)
}

fn print_cli_help() {
    eprintln!(concat!(
        "Usage: nl-compute [options]\n\n",
        "Options:\n",
        "  --listen-addr <ADDR>       Listen address (default: 0.0.0.0:3080)\n",
        "  --projects-path <PATH>     Directory holding project roots (default: .nl-compute/projects)\n",
        "  --emulators <LIST>         Comma separated emulator types to host (default: all)\n",
        "  --compute-id <ID>          Identifier reported to the controller (default: hostname)\n",
        "  --local                    Accept client-supplied project paths\n",
        "  -V, --version              Show version with git metadata\n",
        "  -h, --help                 Show this help\n"
    ));
}

fn binary_version_text() -> String {
    let binary = env!("CARGO_PKG_NAME");
    let git_tag = option_env!("NL_BUILD_GIT_TAG").unwrap_or("untagged");
    let git_commit = option_env!("NL_BUILD_GIT_COMMIT").unwrap_or("unknown");
    let dirty = matches!(
        option_env!("NL_BUILD_GIT_DIRTY").unwrap_or("false"),
        "true" | "1" | "yes" | "dirty"
    );

    if dirty {
        format!("{binary} {git_tag} (dirty commit: {git_commit})")
    } else {
        format!("{binary} {git_tag}")
    }
}

fn default_compute_id() -> String {
    for key in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    "local".to_string()
}
