//! Capability registry and the mediation pipeline.
//!
//! `invoke` is the only way in. Every invocation, for every capability,
//! runs the same fixed sequence:
//!
//! sanitizer -> audit(attempt) -> policy -> approval (if flagged)
//! -> executor -> audit(terminal)
//!
//! A stage that denies or fails short-circuits the rest, and the invocation
//! is still closed with exactly one terminal audit event.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::{Action, Capability};
use crate::error::GateError;
use crate::exec::{CommandResult, Executor};
use crate::invocation::{ActorContext, Arguments, Invocation};
use crate::inventory::{Connection, Inventory};
use crate::security::allowlist::{is_path_allowed, is_permitted, PathMode, Policy};
use crate::security::approval::{ApprovalGate, ApprovalMode, ApprovalRequest, Classification};
use crate::security::audit::{AuditEvent, AuditLog, EventKind};
use crate::security::sanitizer;

/// Successful outcome of an invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CapabilityOutput {
    Command(CommandResult),
    Report(String),
}

/// The two executor implementations, chosen by the server's connection.
pub struct Executors {
    pub local: Arc<dyn Executor>,
    pub remote: Arc<dyn Executor>,
}

pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
    pipeline: Arc<Pipeline>,
}

/// The stages an invocation passes through once its capability is looked up.
struct Pipeline {
    policy: Policy,
    inventory: Inventory,
    audit: AuditLog,
    approval: ApprovalGate,
    executors: Executors,
    timeout: Duration,
}

impl CapabilityRegistry {
    pub fn new(
        policy: Policy,
        inventory: Inventory,
        audit: AuditLog,
        approval: ApprovalGate,
        executors: Executors,
        timeout: Duration,
    ) -> Self {
        Self {
            capabilities: BTreeMap::new(),
            pipeline: Arc::new(Pipeline {
                policy,
                inventory,
                audit,
                approval,
                executors,
                timeout,
            }),
        }
    }

    /// Registers a capability. A second capability with the same name is a
    /// setup defect.
    pub fn register(&mut self, capability: Box<dyn Capability>) -> Result<(), GateError> {
        let name = capability.name().to_string();
        if self.capabilities.contains_key(&name) {
            return Err(GateError::configuration(format!(
                "capability '{name}' registered twice"
            )));
        }
        info!("Capability registered: {name} ({})", capability.effect().as_str());
        self.capabilities.insert(name, Arc::from(capability));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }

    pub fn inventory(&self) -> &Inventory {
        &self.pipeline.inventory
    }

    /// Tool definitions for the decision-maker: name, description, effect
    /// and JSON Schema of each capability.
    pub fn schemas(&self) -> Vec<Value> {
        self.capabilities
            .values()
            .map(|c| {
                json!({
                    "name": c.name(),
                    "description": c.description(),
                    "effect": c.effect().as_str(),
                    "input_schema": c.input_schema().to_json(),
                })
            })
            .collect()
    }

    /// Runs one invocation through the full pipeline.
    ///
    /// The pipeline runs on its own task. Dropping the returned future stops
    /// waiting for the answer, but the invocation still runs to its terminal
    /// audit event.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: Arguments,
        actor: &ActorContext,
    ) -> Result<CapabilityOutput, GateError> {
        let invocation = Invocation::new(name, arguments, actor);
        let capability = self.capabilities.get(name).cloned().ok_or_else(|| {
            GateError::configuration(format!(
                "unknown capability: '{name}'. Available: {}",
                self.names().join(", ")
            ))
        });
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move { pipeline.run(invocation, capability).await })
            .await
            .unwrap_or_else(|e| Err(GateError::Execution(format!("invocation task failed: {e}"))))
    }
}

impl Pipeline {
    async fn run(
        &self,
        mut invocation: Invocation,
        capability: Result<Arc<dyn Capability>, GateError>,
    ) -> Result<CapabilityOutput, GateError> {
        if let Ok(capability) = &capability {
            self.annotate(&mut invocation, capability.as_ref());
        }

        let screened = sanitizer::check(&invocation.arguments);
        self.audit
            .record(AuditEvent::new(EventKind::Attempt, &invocation))
            .await;

        let started = Instant::now();
        let result = match (screened, capability) {
            (Err(e), _) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(capability)) => self.mediate(&invocation, capability).await,
        };
        self.close(&invocation, &result, started).await;
        result
    }

    /// Resolves server and role for the audit record. Failures here are left
    /// to the pipeline to report.
    fn annotate(&self, invocation: &mut Invocation, capability: &dyn Capability) {
        let Some(server) = capability.target(&invocation.arguments) else {
            return;
        };
        if let Ok(known) = self.inventory.get(&server) {
            invocation.role = Some(known.role.clone());
        }
        invocation.server = Some(server);
    }

    async fn mediate(
        &self,
        invocation: &Invocation,
        capability: Arc<dyn Capability>,
    ) -> Result<CapabilityOutput, GateError> {
        let arguments = capability.input_schema().validate(&invocation.arguments)?;
        let action = capability.plan(&arguments, &self.inventory)?;

        let (server_name, command) = match (&action, action.command_text()) {
            (Action::Report(text), _) => return Ok(CapabilityOutput::Report(text.clone())),
            (action, Some(command)) => (action.server().unwrap_or_default(), command),
            (_, None) => {
                return Err(GateError::configuration(format!(
                    "capability '{}' planned no command",
                    invocation.capability
                )))
            }
        };

        let server = self.inventory.get(server_name)?;
        let role = self.policy.role(&server.role)?;

        match &action {
            Action::Read { path, .. } => {
                if !is_path_allowed(role, path, PathMode::Read) {
                    return Err(GateError::PolicyDenied {
                        role: role.name.clone(),
                        reason: format!("path '{path}' is not under an allowed read path"),
                    });
                }
            }
            _ => {
                if !is_permitted(role, &command) {
                    return Err(GateError::PolicyDenied {
                        role: role.name.clone(),
                        reason: format!("command '{command}' matches no allowed pattern"),
                    });
                }
            }
        }

        if let Classification::RequiresApproval(pattern) = self.approval.classify(&command) {
            let decision = self
                .approval
                .arbitrate(ApprovalRequest {
                    invocation_id: invocation.id,
                    capability: invocation.capability.clone(),
                    server: server.name.clone(),
                    command: command.clone(),
                    matched_pattern: pattern.clone(),
                })
                .await;
            self.audit
                .record(
                    AuditEvent::new(EventKind::Approval, invocation)
                        .with_decision(decision.approved, decision.operator.clone()),
                )
                .await;
            if !decision.approved {
                let reason = match self.approval.mode() {
                    ApprovalMode::AutoDeny => "approval mode is auto_deny".to_string(),
                    ApprovalMode::Interactive => "operator refused".to_string(),
                };
                return Err(GateError::ApprovalDenied { pattern, reason });
            }
        }

        let executor = match server.connection {
            Connection::Local => &self.executors.local,
            Connection::Remote(_) => &self.executors.remote,
        };
        let result = executor.run(server, &command, self.timeout).await?;
        Ok(CapabilityOutput::Command(result))
    }

    /// Writes the single terminal event for `invocation`.
    async fn close(
        &self,
        invocation: &Invocation,
        result: &Result<CapabilityOutput, GateError>,
        started: Instant,
    ) {
        let id = invocation.id;
        let event = match result {
            Ok(CapabilityOutput::Command(out)) if out.success() => {
                info!("{} on {} succeeded ({id})", invocation.capability, out.server);
                AuditEvent::new(EventKind::Success, invocation)
                    .with_exit_code(out.exit_code)
                    .with_duration_ms(out.duration_ms)
            }
            Ok(CapabilityOutput::Command(out)) => {
                info!(
                    "{} on {} exited with {} ({id})",
                    invocation.capability, out.server, out.exit_code
                );
                let detail = if out.stderr.is_empty() {
                    format!("exited with status {}", out.exit_code)
                } else {
                    out.stderr.clone()
                };
                AuditEvent::new(EventKind::Error, invocation)
                    .with_exit_code(out.exit_code)
                    .with_error("non_zero_exit", detail)
                    .with_duration_ms(out.duration_ms)
            }
            Ok(CapabilityOutput::Report(_)) => {
                info!("{} answered in-process ({id})", invocation.capability);
                AuditEvent::new(EventKind::Success, invocation)
                    .with_duration_ms(started.elapsed().as_millis() as u64)
            }
            Err(e) => {
                match e {
                    GateError::Configuration(_) => {
                        error!("{} failed at {}: {e} ({id})", invocation.capability, e.stage())
                    }
                    _ => warn!("{} stopped at {}: {e} ({id})", invocation.capability, e.stage()),
                }
                AuditEvent::new(e.terminal_event(), invocation).with_error(e.kind(), e.to_string())
            }
        };
        self.audit.record(event).await;
    }
}

/// One line of the request stream.
#[derive(Debug, Clone, Deserialize)]
pub struct InvocationRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub name: String,
    #[serde(default)]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// `{ok, data?, error?}` as returned to the decision-maker.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl InvocationResponse {
    pub fn from_result(id: Option<Value>, result: Result<CapabilityOutput, GateError>) -> Self {
        match result {
            Ok(output) => Self {
                id,
                ok: true,
                data: serde_json::to_value(output).ok(),
                error: None,
            },
            Err(e) => Self::failure(id, e.kind(), e.to_string()),
        }
    }

    pub fn failure(id: Option<Value>, kind: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::capabilities::builtin;
    use crate::exec::{ExecError, LocalExecutor};
    use crate::invocation::{args, ArgValue};
    use crate::inventory::{RemoteEndpoint, Server, LOCAL_SERVER};
    use crate::security::allowlist::Role;
    use crate::security::approval::ApprovalInbox;

    /// Records every command it is asked to run and returns a canned result.
    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
        commands: std::sync::Mutex<Vec<String>>,
        exit_code: i32,
    }

    #[async_trait]
    impl Executor for CountingExecutor {
        async fn run(
            &self,
            server: &Server,
            command: &str,
            _timeout: Duration,
        ) -> Result<CommandResult, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.commands.lock().unwrap().push(command.to_string());
            Ok(CommandResult {
                stdout: "ok".to_string(),
                stderr: String::new(),
                exit_code: self.exit_code,
                duration_ms: 1,
                server: server.name.clone(),
            })
        }
    }

    impl CountingExecutor {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn policy() -> Policy {
        Policy::new(
            vec![
                Role::new(
                    "game-server",
                    strings(&["docker ps *", "docker ps", "docker restart *", "uptime"]),
                    strings(&["/var/log"]),
                    vec![],
                )
                .unwrap(),
                Role::new(
                    "bastion",
                    strings(&["echo *", "sleep *", "false"]),
                    strings(&["/tmp"]),
                    vec![],
                )
                .unwrap(),
            ],
            strings(&["restart", "stop", "rm "]),
        )
    }

    fn inventory() -> Inventory {
        Inventory::new(vec![
            Server::local(LOCAL_SERVER, "bastion"),
            Server::remote(
                "gameserver-01",
                "game-server",
                RemoteEndpoint {
                    host: "10.0.0.5".to_string(),
                    port: 22,
                    user: "bastion-agent".to_string(),
                    key_path: PathBuf::from("/etc/bastion/keys/gs01"),
                    known_hosts_path: None,
                },
            ),
        ])
    }

    struct Harness {
        registry: CapabilityRegistry,
        remote: Arc<CountingExecutor>,
        audit_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn events(&self) -> Vec<AuditEvent> {
            AuditLog::read_events(&self.audit_path).await.unwrap()
        }
    }

    async fn harness_with(
        approval: ApprovalGate,
        local: Arc<dyn Executor>,
        remote: Arc<CountingExecutor>,
        timeout: Duration,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let audit = AuditLog::open(&audit_path).await.unwrap();
        let mut registry = CapabilityRegistry::new(
            policy(),
            inventory(),
            audit,
            approval,
            Executors {
                local,
                remote: remote.clone(),
            },
            timeout,
        );
        for cap in builtin::all() {
            registry.register(cap).unwrap();
        }
        Harness {
            registry,
            remote,
            audit_path,
            _dir: dir,
        }
    }

    async fn harness(approval: ApprovalGate) -> Harness {
        harness_with(
            approval,
            Arc::new(LocalExecutor::default()),
            Arc::new(CountingExecutor::default()),
            Duration::from_secs(10),
        )
        .await
    }

    fn auto_deny() -> ApprovalGate {
        ApprovalGate::auto_deny(&policy().approval_required_patterns)
    }

    fn interactive() -> (ApprovalGate, ApprovalInbox) {
        ApprovalGate::interactive(&policy().approval_required_patterns)
    }

    fn remote(command: &str) -> Arguments {
        args([("server", "gameserver-01"), ("command", command)])
    }

    fn actor() -> ActorContext {
        ActorContext::new("test-session")
    }

    /// Exactly one attempt first and exactly one terminal event last.
    fn assert_closed_once(events: &[AuditEvent]) {
        let attempts = events.iter().filter(|e| e.event == EventKind::Attempt).count();
        let terminals = events.iter().filter(|e| e.event.is_terminal()).count();
        assert_eq!(attempts, 1, "events: {events:?}");
        assert_eq!(terminals, 1, "events: {events:?}");
        assert_eq!(events[0].event, EventKind::Attempt);
        assert!(events.last().unwrap().event.is_terminal());
        assert!(events[0].timestamp <= events.last().unwrap().timestamp);
    }

    // ── Scenarios ───────────────────────────────────────

    #[tokio::test]
    async fn test_permitted_command_succeeds() {
        let h = harness(auto_deny()).await;
        let out = h
            .registry
            .invoke("run_remote_command", remote("docker ps -a"), &actor())
            .await
            .unwrap();
        assert!(matches!(out, CapabilityOutput::Command(ref r) if r.exit_code == 0));
        assert_eq!(h.remote.calls(), 1);

        let events = h.events().await;
        assert_closed_once(&events);
        let terminal = events.last().unwrap();
        assert_eq!(terminal.event, EventKind::Success);
        assert_eq!(terminal.exit_code, Some(0));
        assert_eq!(terminal.server.as_deref(), Some("gameserver-01"));
        assert_eq!(terminal.role.as_deref(), Some("game-server"));
        assert_eq!(terminal.actor.as_deref(), Some("test-session"));
    }

    #[tokio::test]
    async fn test_chained_command_rejected_by_sanitizer() {
        let h = harness(auto_deny()).await;
        let err = h
            .registry
            .invoke(
                "run_remote_command",
                remote("systemctl restart nginx; rm -rf /tmp"),
                &actor(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "sanitization_rejected");
        assert_eq!(h.remote.calls(), 0);

        let events = h.events().await;
        assert_closed_once(&events);
        assert_eq!(events[1].event, EventKind::DeniedSanitizer);
        // The raw input is recorded as-is.
        assert_eq!(
            events[0].sanitized_input["command"],
            "systemctl restart nginx; rm -rf /tmp"
        );
    }

    #[tokio::test]
    async fn test_operator_denies_flagged_command() {
        let (gate, mut inbox) = interactive();
        let h = harness(gate).await;
        let operator = tokio::spawn(async move {
            let request = inbox.recv().await.unwrap();
            assert_eq!(request.command, "docker restart app");
            assert_eq!(request.matched_pattern, "restart");
            inbox.resolve(request.invocation_id, false, Some("alice".to_string()));
            inbox
        });

        let err = h
            .registry
            .invoke("run_remote_command", remote("docker restart app"), &actor())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "approval_denied");
        assert!(err.to_string().contains("operator refused"));
        assert_eq!(h.remote.calls(), 0);
        let _inbox = operator.await.unwrap();

        let events = h.events().await;
        assert_closed_once(&events);
        assert_eq!(events[1].event, EventKind::Approval);
        assert_eq!(events[1].approved, Some(false));
        assert_eq!(events[2].event, EventKind::DeniedApproval);
    }

    #[tokio::test]
    async fn test_operator_approves_flagged_command() {
        let (gate, mut inbox) = interactive();
        let h = harness(gate).await;
        let operator = tokio::spawn(async move {
            let request = inbox.recv().await.unwrap();
            inbox.resolve(request.invocation_id, true, Some("alice".to_string()));
            inbox
        });

        let out = h
            .registry
            .invoke("run_remote_command", remote("docker restart app"), &actor())
            .await
            .unwrap();
        assert!(matches!(out, CapabilityOutput::Command(_)));
        assert_eq!(h.remote.calls(), 1);
        let _inbox = operator.await.unwrap();

        let events = h.events().await;
        assert_closed_once(&events);
        let approvals: Vec<_> = events
            .iter()
            .filter(|e| e.event == EventKind::Approval)
            .collect();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].approved, Some(true));
        assert_eq!(approvals[0].operator.as_deref(), Some("alice"));
        assert_eq!(events.last().unwrap().event, EventKind::Success);
    }

    #[tokio::test]
    async fn test_approval_is_never_reused() {
        let (gate, mut inbox) = interactive();
        let h = harness(gate).await;
        let operator = tokio::spawn(async move {
            let mut seen = 0;
            while let Some(request) = inbox.recv().await {
                seen += 1;
                inbox.resolve(request.invocation_id, seen == 1, None);
                if seen == 2 {
                    break;
                }
            }
            seen
        });

        let first = h
            .registry
            .invoke("run_remote_command", remote("docker restart app"), &actor())
            .await;
        let second = h
            .registry
            .invoke("run_remote_command", remote("docker restart app"), &actor())
            .await;
        assert!(first.is_ok());
        assert_eq!(second.unwrap_err().kind(), "approval_denied");
        assert_eq!(operator.await.unwrap(), 2);
    }

    // ── Properties ──────────────────────────────────────

    #[tokio::test]
    async fn test_sanitizer_rejections_only_produce_denied_sanitizer() {
        let h = harness(auto_deny()).await;
        let inputs = [
            "docker ps; ls",
            "docker ps | sh",
            "docker ps & ls",
            "docker ps $(id)",
            "docker ps `id`",
            "docker ps ../..",
            "docker ps \0",
            "docker ps\nls",
        ];
        for input in inputs {
            let err = h
                .registry
                .invoke("run_remote_command", remote(input), &actor())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "sanitization_rejected", "input {input:?}");
        }
        assert_eq!(h.remote.calls(), 0);

        let events = h.events().await;
        assert_eq!(events.len(), inputs.len() * 2);
        for e in events.iter().filter(|e| e.event.is_terminal()) {
            assert_eq!(e.event, EventKind::DeniedSanitizer);
        }
    }

    #[tokio::test]
    async fn test_policy_denial_never_reaches_executor() {
        let h = harness(auto_deny()).await;
        for command in ["docker rm app", "cat /etc/shadow", "sudo docker ps -a"] {
            let err = h
                .registry
                .invoke("run_remote_command", remote(command), &actor())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "policy_denied");
            assert!(err.to_string().contains("game-server"));
        }
        assert_eq!(h.remote.calls(), 0);
        let events = h.events().await;
        assert!(events
            .iter()
            .filter(|e| e.event.is_terminal())
            .all(|e| e.event == EventKind::DeniedPolicy));
    }

    #[tokio::test]
    async fn test_auto_deny_refuses_flagged_commands() {
        let h = harness(auto_deny()).await;
        let err = h
            .registry
            .invoke("run_remote_command", remote("docker restart app"), &actor())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "approval_denied");
        assert!(err.to_string().contains("auto_deny"));
        assert_eq!(h.remote.calls(), 0);
        assert_eq!(h.events().await.last().unwrap().event, EventKind::DeniedApproval);
    }

    #[tokio::test]
    async fn test_flagged_but_not_permitted_is_policy_denied() {
        let h = harness(auto_deny()).await;
        let err = h
            .registry
            .invoke("run_remote_command", remote("docker stop app"), &actor())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "policy_denied");
        let events = h.events().await;
        assert!(events.iter().all(|e| e.event != EventKind::Approval));
    }

    #[tokio::test]
    async fn test_non_zero_exit_closes_with_error() {
        let remote_exec = Arc::new(CountingExecutor {
            exit_code: 2,
            ..Default::default()
        });
        let h = harness_with(
            auto_deny(),
            Arc::new(LocalExecutor::default()),
            remote_exec,
            Duration::from_secs(10),
        )
        .await;
        let out = h
            .registry
            .invoke("run_remote_command", remote("uptime"), &actor())
            .await
            .unwrap();
        assert!(matches!(out, CapabilityOutput::Command(ref r) if r.exit_code == 2));

        let events = h.events().await;
        assert_closed_once(&events);
        let terminal = events.last().unwrap();
        assert_eq!(terminal.event, EventKind::Error);
        assert_eq!(terminal.exit_code, Some(2));
        assert_eq!(terminal.error_kind.as_deref(), Some("non_zero_exit"));
    }

    #[tokio::test]
    async fn test_local_timeout() {
        let h = harness_with(
            auto_deny(),
            Arc::new(LocalExecutor::default()),
            Arc::new(CountingExecutor::default()),
            Duration::from_millis(200),
        )
        .await;
        let started = Instant::now();
        let err = h
            .registry
            .invoke("run_local_command", args([("command", "sleep 5")]), &actor())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(3));
        let events = h.events().await;
        assert_closed_once(&events);
        assert_eq!(events.last().unwrap().event, EventKind::Timeout);
    }

    #[tokio::test]
    async fn test_abandoned_invocation_still_closes() {
        let h = harness_with(
            auto_deny(),
            Arc::new(LocalExecutor::default()),
            Arc::new(CountingExecutor::default()),
            Duration::from_millis(500),
        )
        .await;
        let actor = actor();
        tokio::select! {
            _ = h.registry.invoke("run_local_command", args([("command", "sleep 5")]), &actor) => {
                panic!("sleep 5 finished inside 200ms");
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        let mut events = h.events().await;
        for _ in 0..100 {
            if events.iter().any(|e| e.event.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            events = h.events().await;
        }
        assert_closed_once(&events);
        assert_eq!(events.last().unwrap().event, EventKind::Timeout);
    }

    #[tokio::test]
    async fn test_local_command_really_runs() {
        let h = harness(auto_deny()).await;
        let out = h
            .registry
            .invoke("run_local_command", args([("command", "echo hello")]), &actor())
            .await
            .unwrap();
        match out {
            CapabilityOutput::Command(r) => {
                assert_eq!(r.stdout, "hello");
                assert_eq!(r.server, LOCAL_SERVER);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    // ── Dispatch errors ─────────────────────────────────

    #[tokio::test]
    async fn test_unknown_capability_is_configuration_error() {
        let h = harness(auto_deny()).await;
        let err = h
            .registry
            .invoke("format_disk", Arguments::new(), &actor())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
        assert!(err.to_string().contains("run_remote_command"));
        let events = h.events().await;
        assert_closed_once(&events);
        assert_eq!(events[1].event, EventKind::Error);
        assert_eq!(events[1].error_kind.as_deref(), Some("configuration_error"));
    }

    #[tokio::test]
    async fn test_unknown_server_is_configuration_error() {
        let h = harness(auto_deny()).await;
        let err = h
            .registry
            .invoke(
                "run_remote_command",
                args([("server", "mystery-01"), ("command", "uptime")]),
                &actor(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
        let events = h.events().await;
        assert_closed_once(&events);
        assert_eq!(events[0].server.as_deref(), Some("mystery-01"));
        assert_eq!(events[0].role, None);
    }

    #[tokio::test]
    async fn test_schema_violation_is_configuration_error() {
        let h = harness(auto_deny()).await;
        let mut a = args([("server", "gameserver-01"), ("path", "/var/log/syslog")]);
        a.insert("lines".to_string(), ArgValue::Int(0));
        let err = h.registry.invoke("read_file", a, &actor()).await.unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
        assert!(matches!(err, GateError::InvalidArguments(_)));
        assert_eq!(err.stage(), "validation");
        assert_eq!(h.remote.calls(), 0);

        let events = h.events().await;
        assert_closed_once(&events);
        let terminal = events.last().unwrap();
        assert_eq!(terminal.event, EventKind::Error);
        assert_eq!(terminal.error_kind.as_deref(), Some("configuration_error"));
    }

    #[tokio::test]
    async fn test_read_file_checks_read_paths() {
        let h = harness(auto_deny()).await;
        let allowed = args([("server", "gameserver-01"), ("path", "/var/log/syslog")]);
        assert!(h.registry.invoke("read_file", allowed, &actor()).await.is_ok());

        let denied = args([("server", "gameserver-01"), ("path", "/etc/shadow")]);
        let err = h.registry.invoke("read_file", denied, &actor()).await.unwrap_err();
        assert_eq!(err.kind(), "policy_denied");

        assert_eq!(h.remote.calls(), 1);
        let commands = h.remote.commands.lock().unwrap().clone();
        assert_eq!(commands, vec!["head -n 100 /var/log/syslog"]);
    }

    #[tokio::test]
    async fn test_list_servers_is_audited() {
        let h = harness(auto_deny()).await;
        let out = h
            .registry
            .invoke("list_servers", Arguments::new(), &actor())
            .await
            .unwrap();
        assert!(matches!(out, CapabilityOutput::Report(ref t) if t.contains("gameserver-01")));
        let events = h.events().await;
        assert_closed_once(&events);
        assert_eq!(events[1].event, EventKind::Success);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let mut h = harness(auto_deny()).await;
        let err = h
            .registry
            .register(Box::new(builtin::ListServers))
            .unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[tokio::test]
    async fn test_schemas_exported() {
        let h = harness(auto_deny()).await;
        let schemas = h.registry.schemas();
        assert_eq!(schemas.len(), h.registry.len());
        let read_file = schemas.iter().find(|s| s["name"] == "read_file").unwrap();
        assert_eq!(
            read_file["input_schema"]["required"],
            serde_json::json!(["server", "path"])
        );
        assert_eq!(read_file["effect"], "read_only");
        let remote_command = schemas
            .iter()
            .find(|s| s["name"] == "run_remote_command")
            .unwrap();
        assert_eq!(remote_command["effect"], "mutating");
    }

    // ── Concurrency ─────────────────────────────────────

    #[tokio::test]
    async fn test_concurrent_invocations_each_closed_once() {
        let h = harness(auto_deny()).await;
        let commands = [
            "docker ps -a",
            "uptime",
            "docker rm app",
            "docker restart app",
            "uptime; id",
        ];
        let actor = actor();
        let calls = (0..20).map(|i| {
            let command = commands[i % commands.len()];
            h.registry.invoke("run_remote_command", remote(command), &actor)
        });
        let results = futures::future::join_all(calls).await;
        assert_eq!(results.len(), 20);

        let events = h.events().await;
        let mut by_id: BTreeMap<uuid::Uuid, Vec<&AuditEvent>> = BTreeMap::new();
        for e in &events {
            by_id.entry(e.invocation_id).or_default().push(e);
        }
        assert_eq!(by_id.len(), 20);
        for (_, group) in by_id {
            let owned: Vec<AuditEvent> = group.into_iter().cloned().collect();
            assert_closed_once(&owned);
        }
        // Successes and denials interleave but each call got one answer.
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 8);
        assert_eq!(h.remote.calls(), 8);
    }

    // ── Wire types ──────────────────────────────────────

    #[test]
    fn test_response_shapes() {
        let ok = InvocationResponse::from_result(
            Some(json!(7)),
            Ok(CapabilityOutput::Report("hi".to_string())),
        );
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v, json!({"id": 7, "ok": true, "data": "hi"}));

        let err = InvocationResponse::from_result(
            None,
            Err(GateError::Timeout {
                bound: Duration::from_secs(30),
            }),
        );
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["kind"], "timeout");
        assert!(v.get("id").is_none());
    }

    #[test]
    fn test_request_parsing() {
        let req: InvocationRequest = serde_json::from_str(
            r#"{"id":"a1","name":"docker_ps","arguments":{"server":"gs","all":true}}"#,
        )
        .unwrap();
        assert_eq!(req.name, "docker_ps");
        assert_eq!(req.arguments["all"], ArgValue::Bool(true));

        let bare: InvocationRequest = serde_json::from_str(r#"{"name":"list_servers"}"#).unwrap();
        assert!(bare.arguments.is_empty());
        assert!(bare.id.is_none());
    }
}
