use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bastion_gate::capabilities::builtin;
use bastion_gate::capabilities::{InvocationRequest, InvocationResponse};
use bastion_gate::exec::{LocalExecutor, RemoteExecutor};
use bastion_gate::security::approval::{ApprovalGate, ApprovalInbox, ApprovalMode};
use bastion_gate::security::audit::AuditLog;
use bastion_gate::{ActorContext, CapabilityRegistry, Config, Executors};

fn print_help() {
    println!(
        "\
bastion-gate v{}

Mediates operational commands requested by an automated agent: sanitizes,
audits, checks role allowlists, asks for approval and executes locally or
over SSH.

USAGE:
    bastion-gate [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/gate.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit
    --schemas        Print capability schemas as JSON and exit

PROTOCOL:
    One JSON request per stdin line:
        {{\"id\": 1, \"name\": \"docker_ps\", \"arguments\": {{\"server\": \"gs-01\"}}}}
    One JSON response per stdout line:
        {{\"id\": 1, \"ok\": true, \"data\": {{...}}}}
        {{\"id\": 1, \"ok\": false, \"error\": {{\"kind\": \"policy_denied\", \"message\": \"...\"}}}}

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing, written to stderr
                (e.g. debug, bastion_gate=debug,warn)

EXAMPLES:
    bastion-gate                              # uses config/gate.toml
    bastion-gate /etc/bastion/gate.toml       # custom config path
    RUST_LOG=debug bastion-gate               # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_path = "config/gate.toml".to_string();
    let mut print_schemas = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("bastion-gate v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--schemas" => print_schemas = true,
            path => config_path = path.to_string(),
        }
    }

    // stdout carries responses only
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bastion_gate=info")),
        )
        .init();

    info!("bastion-gate v{}", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    let policy = config.build_policy()?;
    let inventory = config.build_inventory(&policy)?;
    info!("Servers: {}", inventory.names().join(", "));
    info!("Approval mode: {:?}", config.gate.approval_mode);

    let audit = AuditLog::open(&config.gate.audit_log_path).await?;

    let patterns = &policy.approval_required_patterns;
    let (approval, inbox) = match config.gate.approval_mode {
        ApprovalMode::Interactive => {
            let (gate, inbox) = ApprovalGate::interactive(patterns);
            (gate, Some(inbox))
        }
        ApprovalMode::AutoDeny => (ApprovalGate::auto_deny(patterns), None),
    };

    let executors = Executors {
        local: Arc::new(LocalExecutor::new(config.gate.max_output_bytes)),
        remote: Arc::new(
            RemoteExecutor::new(&inventory, config.gate.max_sessions_per_server)
                .with_ssh_program(config.gate.ssh_program.clone())
                .with_connect_timeout(config.gate.connect_timeout())
                .with_max_output_bytes(config.gate.max_output_bytes),
        ),
    };

    let mut registry = CapabilityRegistry::new(
        policy,
        inventory,
        audit,
        approval,
        executors,
        config.gate.command_timeout(),
    );
    for capability in builtin::all() {
        registry.register(capability)?;
    }
    info!("Capabilities: {} registered", registry.len());

    if print_schemas {
        println!("{}", serde_json::to_string_pretty(&registry.schemas())?);
        return Ok(());
    }

    let surface = inbox.map(|inbox| tokio::spawn(approval_surface(inbox)));
    let outcome = serve(Arc::new(registry), surface).await;
    // Blocking reads on stdin and the tty would hold the runtime open.
    match outcome {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1)
        }
    }
}

/// Reads requests from stdin until EOF or Ctrl-C and answers each on stdout.
///
/// Invocations already running are drained before returning. On Ctrl-C the
/// approval surface is stopped first, which denies every pending approval.
async fn serve(
    registry: Arc<CapabilityRegistry>,
    surface: Option<JoinHandle<()>>,
) -> Result<()> {
    let actor = Arc::new(ActorContext::new(format!("stdio-{}", std::process::id())));
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<InvocationResponse>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = out_rx.recv().await {
            let mut line = match serde_json::to_vec(&response) {
                Ok(line) => line,
                Err(e) => {
                    error!("Cannot encode response: {e}");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = stdout.write_all(&line).await {
                error!("stdout closed: {e}");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => {
                    info!("Input closed");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received, draining {} in-flight invocations", in_flight.len());
                if let Some(surface) = &surface {
                    surface.abort();
                }
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: InvocationRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed request: {e}");
                let _ = out_tx.send(InvocationResponse::failure(
                    None,
                    "invalid_request",
                    format!("malformed request: {e}"),
                ));
                continue;
            }
        };

        let registry = registry.clone();
        let actor = actor.clone();
        let out_tx = out_tx.clone();
        in_flight.spawn(async move {
            let result = registry
                .invoke(&request.name, request.arguments, &actor)
                .await;
            let _ = out_tx.send(InvocationResponse::from_result(request.id, result));
        });
    }

    while in_flight.join_next().await.is_some() {}
    drop(out_tx);
    let _ = writer.await;
    info!("All invocations closed, exiting");
    Ok(())
}

/// Asks the operator on the controlling terminal, one request at a time.
async fn approval_surface(mut inbox: ApprovalInbox) {
    let operator = std::env::var("USER").ok();
    while let Some(request) = inbox.recv().await {
        let prompt = format!(
            "\n[approval required] {} on {}\n  command: {}\n  matched: '{}'\nApprove? [y/N] ",
            request.capability, request.server, request.command, request.matched_pattern
        );
        let approved = tokio::task::spawn_blocking(move || ask_terminal(&prompt))
            .await
            .unwrap_or(false);
        inbox.resolve(request.invocation_id, approved, operator.clone());
    }
}

fn ask_terminal(prompt: &str) -> bool {
    let mut stderr = std::io::stderr();
    let _ = stderr.write_all(prompt.as_bytes());
    let _ = stderr.flush();

    let tty = match std::fs::File::open("/dev/tty") {
        Ok(tty) => tty,
        Err(e) => {
            warn!("No terminal for approval prompt ({e}), denying");
            return false;
        }
    };
    let mut answer = String::new();
    if std::io::BufReader::new(tty).read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
