use crate::errors::{KnownFailure, Notification, UserCancelled, classify};
use crate::gateway::ResourceGateway;
use crate::model::{LifecycleOp, NodeId, ResourceKind, VmCreateSpec};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::tree::TreeCache;
use anyhow::{Context as _, Result, bail};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const CMD_REFRESH: &str = "strato.refresh";
pub const CMD_LOAD_MORE: &str = "strato.loadMore";
pub const CMD_GET_CHILDREN: &str = "strato.getChildren";
pub const CMD_CREATE_VM: &str = "strato.createVirtualMachine";
pub const CMD_START_VM: &str = "strato.startVirtualMachine";
pub const CMD_STOP_VM: &str = "strato.stopVirtualMachine";
pub const CMD_RESTART_VM: &str = "strato.restartVirtualMachine";
pub const CMD_DELETE_VM: &str = "strato.deleteVirtualMachine";
pub const CMD_ADD_SSH_KEY: &str = "strato.addSshKey";
pub const CMD_OPEN_IN_SSH: &str = "strato.openInSsh";
pub const CMD_COPY_IP: &str = "strato.copyIpAddress";
pub const CMD_VIEW_PROPERTIES: &str = "strato.viewProperties";
pub const CMD_OPEN_IN_PORTAL: &str = "strato.openInPortal";
pub const CMD_REPORT_ISSUE: &str = "strato.reportIssue";

/// Events the engine pushes back to the UI shell. Sending never blocks;
/// a departed shell just drops them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Notify(Notification),
    TreeChanged,
    Status(String),
    Detail { title: String, body: String },
    OpenUrl(String),
}

#[derive(Clone)]
pub struct Shell {
    tx: mpsc::UnboundedSender<ShellEvent>,
}

impl Shell {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ShellEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: ShellEvent) {
        let _ = self.tx.send(event);
    }
}

/// A prompt the engine wants the shell to answer. Dropping the reply
/// sender (shell gone, overlay dismissed) reads as cancellation.
#[derive(Debug)]
pub enum PromptRequest {
    Confirm {
        message: String,
        reply: oneshot::Sender<bool>,
    },
    Input {
        message: String,
        default: Option<String>,
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Prompt capability handed to handlers through the execution context.
/// Suspends until the shell answers or the command is cancelled.
#[derive(Clone)]
pub struct Prompter {
    tx: mpsc::UnboundedSender<PromptRequest>,
}

impl Prompter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PromptRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub async fn confirm(
        &self,
        cancel: &CancellationToken,
        message: impl Into<String>,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PromptRequest::Confirm {
                message: message.into(),
                reply: reply_tx,
            })
            .map_err(|_| UserCancelled)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(UserCancelled.into()),
            answer = reply_rx => match answer {
                Ok(true) => Ok(()),
                Ok(false) | Err(_) => Err(UserCancelled.into()),
            },
        }
    }

    pub async fn input(
        &self,
        cancel: &CancellationToken,
        message: impl Into<String>,
        default: Option<&str>,
    ) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PromptRequest::Input {
                message: message.into(),
                default: default.map(str::to_string),
                reply: reply_tx,
            })
            .map_err(|_| UserCancelled)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(UserCancelled.into()),
            answer = reply_rx => match answer {
                Ok(Some(value)) => Ok(value),
                Ok(None) | Err(_) => Err(UserCancelled.into()),
            },
        }
    }
}

/// Reporting state shared across nested contexts of one invocation, so a
/// failure unwinding through several layers is surfaced exactly once.
#[derive(Default)]
struct ReportState {
    reported: Mutex<bool>,
    shown: Mutex<HashSet<String>>,
}

/// Per-invocation bundle of telemetry, cancellation, and reporting state.
/// Nested operations borrow or derive from the parent's context rather
/// than opening an independent one.
pub struct ActionContext {
    command_id: String,
    pub cancel: CancellationToken,
    suppress_report_issue: bool,
    properties: Mutex<BTreeMap<String, String>>,
    measurements: Mutex<BTreeMap<String, f64>>,
    report_state: Arc<ReportState>,
}

impl ActionContext {
    fn root(command_id: &str, suppress_report_issue: bool, cancel: CancellationToken) -> Self {
        Self {
            command_id: command_id.to_string(),
            cancel,
            suppress_report_issue,
            properties: Mutex::new(BTreeMap::new()),
            measurements: Mutex::new(BTreeMap::new()),
            report_state: Arc::new(ReportState::default()),
        }
    }

    /// Context for a nested invocation: fresh telemetry bags, shared
    /// cancellation and reporting state.
    fn nested(&self, command_id: &str) -> Self {
        Self {
            command_id: command_id.to_string(),
            cancel: self.cancel.clone(),
            suppress_report_issue: self.suppress_report_issue,
            properties: Mutex::new(BTreeMap::new()),
            measurements: Mutex::new(BTreeMap::new()),
            report_state: self.report_state.clone(),
        }
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    pub fn add_property(&self, key: &str, value: impl Into<String>) {
        self.properties
            .lock()
            .unwrap()
            .insert(key.to_string(), value.into());
    }

    pub fn add_measurement(&self, key: &str, value: f64) {
        self.measurements
            .lock()
            .unwrap()
            .insert(key.to_string(), value);
    }
}

/// Defaults the create wizard offers before the user edits them.
#[derive(Debug, Clone)]
pub struct VmDefaults {
    pub location: String,
    pub vm_size: String,
    pub image: String,
    pub admin_username: String,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            location: "westeurope".to_string(),
            vm_size: "Standard_B2s".to_string(),
            image: "ubuntu-24.04-lts".to_string(),
            admin_username: "cloud".to_string(),
        }
    }
}

/// Shared collaborators constructed once at startup and injected into
/// every handler, instead of module-level globals.
pub struct Services {
    pub tree: Arc<TreeCache>,
    pub gateway: Arc<dyn ResourceGateway>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub shell: Shell,
    pub prompter: Prompter,
    pub suppress_report_issue: bool,
    pub portal_base: String,
    pub issue_url: String,
    pub vm_defaults: VmDefaults,
}

type HandlerFuture = BoxFuture<'static, Result<()>>;
type Handler = Arc<dyn Fn(Arc<Services>, Arc<ActionContext>, Option<NodeId>) -> HandlerFuture + Send + Sync>;

/// Map from command id to handler. Duplicate ids are a programming error
/// caught while the registry is being built, before any dispatch.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Handler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, id: &str, handler: F) -> Result<()>
    where
        F: Fn(Arc<Services>, Arc<ActionContext>, Option<NodeId>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.handlers.contains_key(id) {
            bail!("command '{id}' is registered twice");
        }
        self.handlers.insert(
            id.to_string(),
            Arc::new(move |services, ctx, target| Box::pin(handler(services, ctx, target))),
        );
        Ok(())
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids = self.handlers.keys().map(String::as_str).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }
}

/// Wraps every handler call with an execution context, an unconditional
/// outcome telemetry event, and exactly-once error classification.
#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<CommandRegistry>,
    services: Arc<Services>,
}

impl CommandDispatcher {
    pub fn new(registry: CommandRegistry, services: Arc<Services>) -> Self {
        Self {
            registry: Arc::new(registry),
            services,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Top-level invocation from the shell. Only failures classified as
    /// unexpected come back as `Err`; everything else has already been
    /// handled (logged, shown, or silently dropped for cancellation).
    pub async fn invoke(
        &self,
        id: &str,
        target: Option<NodeId>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let ctx = ActionContext::root(id, self.services.suppress_report_issue, cancel);
        self.invoke_scoped(id, target, ctx).await
    }

    /// Invocation from inside another handler, reusing the parent's
    /// cancellation and reporting state.
    pub async fn invoke_nested(
        &self,
        parent: &ActionContext,
        id: &str,
        target: Option<NodeId>,
    ) -> Result<()> {
        self.invoke_scoped(id, target, parent.nested(id)).await
    }

    async fn invoke_scoped(
        &self,
        id: &str,
        target: Option<NodeId>,
        ctx: ActionContext,
    ) -> Result<()> {
        let ctx = Arc::new(ctx);
        let started = Instant::now();
        debug!(command = id, target = ?target, "invoking");

        let result = match self.registry.handlers.get(id) {
            Some(handler) => handler(self.services.clone(), ctx.clone(), target).await,
            None => Err(anyhow::anyhow!("unknown command '{id}'")),
        };

        let (outcome, settled) = match result {
            Ok(()) => ("success", Ok(())),
            Err(error) => {
                let classification = classify(&error);
                self.report(&ctx, &classification, &error);
                match classification {
                    c if c.is_benign() => (c.outcome(), Ok(())),
                    crate::errors::Classification::Known { .. } => ("error", Ok(())),
                    _ => ("error", Err(error)),
                }
            }
        };

        let mut event = TelemetryEvent::new(id);
        event.properties = ctx.properties.lock().unwrap().clone();
        event
            .properties
            .insert("outcome".to_string(), outcome.to_string());
        event.measurements = ctx.measurements.lock().unwrap().clone();
        event.measurements.insert(
            "durationMs".to_string(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        self.services.telemetry.record(event);

        settled
    }

    /// Surfaces one classified failure at most once per invocation, even
    /// when nested contexts unwind the same error, and deduplicates
    /// identical messages within the invocation.
    fn report(
        &self,
        ctx: &ActionContext,
        classification: &crate::errors::Classification,
        error: &anyhow::Error,
    ) {
        {
            let mut reported = ctx.report_state.reported.lock().unwrap();
            if *reported {
                return;
            }
            *reported = true;
        }
        classification.log(ctx.command_id(), error);
        if let Some(notification) = classification.notification(ctx.suppress_report_issue) {
            let fresh = ctx
                .report_state
                .shown
                .lock()
                .unwrap()
                .insert(notification.message.clone());
            if fresh {
                self.services.shell.send(ShellEvent::Notify(notification));
            }
        }
    }
}

/// Registers the full command set. Failing here aborts startup.
pub fn build_registry() -> Result<CommandRegistry> {
    let mut registry = CommandRegistry::new();
    registry.register(CMD_REFRESH, refresh)?;
    registry.register(CMD_LOAD_MORE, load_more)?;
    registry.register(CMD_GET_CHILDREN, get_children)?;
    registry.register(CMD_CREATE_VM, create_virtual_machine)?;
    registry.register(CMD_START_VM, |s, c, t| lifecycle(s, c, t, LifecycleOp::Start))?;
    registry.register(CMD_STOP_VM, |s, c, t| lifecycle(s, c, t, LifecycleOp::Stop))?;
    registry.register(CMD_RESTART_VM, |s, c, t| {
        lifecycle(s, c, t, LifecycleOp::Restart)
    })?;
    registry.register(CMD_DELETE_VM, |s, c, t| {
        lifecycle(s, c, t, LifecycleOp::Delete)
    })?;
    registry.register(CMD_ADD_SSH_KEY, add_ssh_key)?;
    registry.register(CMD_OPEN_IN_SSH, open_in_ssh)?;
    registry.register(CMD_COPY_IP, copy_ip_address)?;
    registry.register(CMD_VIEW_PROPERTIES, view_properties)?;
    registry.register(CMD_OPEN_IN_PORTAL, open_in_portal)?;
    registry.register(CMD_REPORT_ISSUE, report_issue)?;
    Ok(registry)
}

async fn refresh(
    services: Arc<Services>,
    ctx: Arc<ActionContext>,
    target: Option<NodeId>,
) -> Result<()> {
    services.tree.refresh(target.as_ref());
    services
        .tree
        .children(&ctx.cancel, target.as_ref())
        .await
        .context("reloading after refresh")?;
    services.shell.send(ShellEvent::TreeChanged);
    Ok(())
}

async fn get_children(
    services: Arc<Services>,
    ctx: Arc<ActionContext>,
    target: Option<NodeId>,
) -> Result<()> {
    services.tree.children(&ctx.cancel, target.as_ref()).await?;
    services.shell.send(ShellEvent::TreeChanged);
    Ok(())
}

async fn load_more(
    services: Arc<Services>,
    ctx: Arc<ActionContext>,
    target: Option<NodeId>,
) -> Result<()> {
    let node = target.ok_or_else(|| KnownFailure::new("nothing selected to load more of"))?;
    services.tree.load_more(&ctx.cancel, &node).await?;
    services.shell.send(ShellEvent::TreeChanged);
    Ok(())
}

fn require_vm(services: &Services, target: Option<NodeId>) -> Result<NodeId> {
    let node = target.ok_or_else(|| KnownFailure::new("select a virtual machine first"))?;
    match services.tree.kind_of(&node) {
        Some(ResourceKind::VirtualMachine) => Ok(node),
        Some(_) => Err(KnownFailure::new("this action applies to virtual machines").into()),
        None => Err(KnownFailure::with_remediation(
            "the selected resource is no longer in the tree",
            "refresh and try again",
        )
        .into()),
    }
}

async fn lifecycle(
    services: Arc<Services>,
    ctx: Arc<ActionContext>,
    target: Option<NodeId>,
    op: LifecycleOp,
) -> Result<()> {
    let vm = require_vm(&services, target)?;
    let label = services
        .tree
        .label_of(&vm)
        .unwrap_or_else(|| vm.to_string());
    ctx.add_property("op", op.verb());

    if op.needs_confirmation() {
        services
            .prompter
            .confirm(
                &ctx.cancel,
                format!("{} virtual machine '{label}'?", op.verb()),
            )
            .await?;
    }
    if ctx.cancel.is_cancelled() {
        return Err(UserCancelled.into());
    }

    services
        .gateway
        .invoke(&vm, op)
        .await
        .with_context(|| format!("failed to {} '{label}'", op.verb()))?;

    // Power state and membership live on the parent group's listing.
    let parent = services.tree.parent_of(&vm);
    services.tree.refresh(parent.as_ref());
    services
        .tree
        .children(&ctx.cancel, parent.as_ref())
        .await?;
    services.shell.send(ShellEvent::TreeChanged);
    services
        .shell
        .send(ShellEvent::Status(format!("{} '{label}'", op.past_tense())));
    Ok(())
}

async fn create_virtual_machine(
    services: Arc<Services>,
    ctx: Arc<ActionContext>,
    target: Option<NodeId>,
) -> Result<()> {
    let group = target.ok_or_else(|| KnownFailure::new("select a resource group first"))?;
    if services.tree.kind_of(&group) != Some(ResourceKind::ResourceGroup) {
        return Err(KnownFailure::new("virtual machines are created inside a resource group").into());
    }

    let defaults = &services.vm_defaults;
    let prompter = &services.prompter;
    let name = prompter
        .input(&ctx.cancel, "Virtual machine name", None)
        .await?;
    let location = prompter
        .input(&ctx.cancel, "Location", Some(&defaults.location))
        .await?;
    let vm_size = prompter
        .input(&ctx.cancel, "Size", Some(&defaults.vm_size))
        .await?;
    let image = prompter
        .input(&ctx.cancel, "Image", Some(&defaults.image))
        .await?;
    let admin_username = prompter
        .input(&ctx.cancel, "Admin username", Some(&defaults.admin_username))
        .await?;
    let spec = VmCreateSpec {
        name: name.clone(),
        location,
        vm_size,
        image,
        admin_username,
        ssh_public_key: None,
    };

    let created = services
        .gateway
        .create_virtual_machine(&group, &spec)
        .await
        .with_context(|| format!("failed to create '{name}'"))?;
    ctx.add_property("location", spec.location.clone());

    services.tree.refresh(Some(&group));
    services.tree.children(&ctx.cancel, Some(&group)).await?;
    services.shell.send(ShellEvent::TreeChanged);
    services.shell.send(ShellEvent::Status(format!(
        "Created '{}' ({})",
        created.label,
        created.id
    )));
    Ok(())
}

async fn add_ssh_key(
    services: Arc<Services>,
    ctx: Arc<ActionContext>,
    target: Option<NodeId>,
) -> Result<()> {
    let vm = require_vm(&services, target)?;
    let label = services
        .tree
        .label_of(&vm)
        .unwrap_or_else(|| vm.to_string());
    let username = services
        .prompter
        .input(
            &ctx.cancel,
            "Username to add the key for",
            Some(&services.vm_defaults.admin_username),
        )
        .await?;
    let public_key = services
        .prompter
        .input(&ctx.cancel, "SSH public key (openssh format)", None)
        .await?;

    services
        .gateway
        .add_ssh_key(&vm, &username, &public_key)
        .await
        .with_context(|| format!("failed to add SSH key to '{label}'"))?;
    services.shell.send(ShellEvent::Status(format!(
        "Added SSH key for '{username}' on '{label}'"
    )));
    Ok(())
}

async fn open_in_ssh(
    services: Arc<Services>,
    _ctx: Arc<ActionContext>,
    target: Option<NodeId>,
) -> Result<()> {
    let vm = require_vm(&services, target)?;
    let label = services
        .tree
        .label_of(&vm)
        .unwrap_or_else(|| vm.to_string());
    let summary = services.tree.summary_of(&vm).unwrap_or_default();
    let ip = summary.public_ip.or(summary.private_ip).ok_or_else(|| {
        KnownFailure::with_remediation(
            format!("no IP address known for '{label}'"),
            "start the machine and refresh before connecting",
        )
    })?;
    services.shell.send(ShellEvent::OpenUrl(format!(
        "ssh://{}@{ip}",
        services.vm_defaults.admin_username
    )));
    Ok(())
}

async fn copy_ip_address(
    services: Arc<Services>,
    _ctx: Arc<ActionContext>,
    target: Option<NodeId>,
) -> Result<()> {
    let vm = require_vm(&services, target)?;
    let label = services
        .tree
        .label_of(&vm)
        .unwrap_or_else(|| vm.to_string());
    let summary = services.tree.summary_of(&vm).unwrap_or_default();
    let ip = summary
        .public_ip
        .or(summary.private_ip)
        .ok_or_else(|| {
            KnownFailure::with_remediation(
                format!("no IP address known for '{label}'"),
                "refresh the tree once the machine is running",
            )
        })?;
    services
        .shell
        .send(ShellEvent::Status(format!("{label}: {ip}")));
    Ok(())
}

async fn view_properties(
    services: Arc<Services>,
    _ctx: Arc<ActionContext>,
    target: Option<NodeId>,
) -> Result<()> {
    let node = target.ok_or_else(|| KnownFailure::new("select a resource first"))?;
    let detail = services.gateway.resource_detail(&node).await?;
    let body = serde_json::to_string_pretty(&detail).context("rendering properties")?;
    let title = services
        .tree
        .label_of(&node)
        .unwrap_or_else(|| node.to_string());
    services.shell.send(ShellEvent::Detail { title, body });
    Ok(())
}

async fn open_in_portal(
    services: Arc<Services>,
    _ctx: Arc<ActionContext>,
    target: Option<NodeId>,
) -> Result<()> {
    let node = target.ok_or_else(|| KnownFailure::new("select a resource first"))?;
    services.shell.send(ShellEvent::OpenUrl(format!(
        "{}/#resource{}",
        services.portal_base, node
    )));
    Ok(())
}

async fn report_issue(
    services: Arc<Services>,
    _ctx: Arc<ActionContext>,
    _target: Option<NodeId>,
) -> Result<()> {
    services
        .shell
        .send(ShellEvent::OpenUrl(services.issue_url.clone()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        ActionContext, CMD_DELETE_VM, CMD_START_VM, CommandDispatcher, CommandRegistry, Prompter,
        PromptRequest, Services, Shell, ShellEvent, VmDefaults, build_registry,
    };
    use crate::errors::{KnownFailure, Severity};
    use crate::gateway::testing::{ScriptedFailure, ScriptedGateway, vm_page};
    use crate::model::{LifecycleOp, NodeId};
    use crate::telemetry::RecordingSink;
    use crate::tree::TreeCache;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        dispatcher: CommandDispatcher,
        gateway: Arc<ScriptedGateway>,
        telemetry: Arc<RecordingSink>,
        shell_rx: mpsc::UnboundedReceiver<ShellEvent>,
    }

    fn auto_prompter(confirm: bool) -> Prompter {
        let (prompter, mut rx) = Prompter::new();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    PromptRequest::Confirm { reply, .. } => {
                        let _ = reply.send(confirm);
                    }
                    PromptRequest::Input { reply, default, .. } => {
                        let _ = reply.send(Some(default.unwrap_or_else(|| "value".to_string())));
                    }
                }
            }
        });
        prompter
    }

    fn harness_with(registry: CommandRegistry, confirm: bool) -> Harness {
        let gateway = Arc::new(ScriptedGateway::new());
        let root = NodeId::root();
        gateway.script_page(&root, None, vm_page(&root, 0, 3, None));
        let tree = Arc::new(TreeCache::new(gateway.clone(), 100, "Test Account"));
        let telemetry = Arc::new(RecordingSink::new());
        let (shell, shell_rx) = Shell::new();
        let services = Arc::new(Services {
            tree,
            gateway: gateway.clone(),
            telemetry: telemetry.clone(),
            shell,
            prompter: auto_prompter(confirm),
            suppress_report_issue: true,
            portal_base: "https://portal.example.test".to_string(),
            issue_url: "https://example.test/issues/new".to_string(),
            vm_defaults: VmDefaults::default(),
        });
        Harness {
            dispatcher: CommandDispatcher::new(registry, services),
            gateway,
            telemetry,
            shell_rx,
        }
    }

    fn harness(confirm: bool) -> Harness {
        harness_with(build_registry().unwrap(), confirm)
    }

    async fn load_first_vm(harness: &Harness) -> NodeId {
        let rows = harness
            .dispatcher
            .services()
            .tree
            .children(&CancellationToken::new(), None)
            .await
            .unwrap();
        rows[0].id.clone()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ShellEvent>) -> Vec<ShellEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn notifications(events: &[ShellEvent]) -> Vec<crate::errors::Notification> {
        events
            .iter()
            .filter_map(|event| match event {
                ShellEvent::Notify(notification) => Some(notification.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let mut registry = CommandRegistry::new();
        registry
            .register("strato.example", |_, _, _| async { Ok(()) })
            .unwrap();
        let error = registry
            .register("strato.example", |_, _, _| async { Ok(()) })
            .unwrap_err();
        assert!(error.to_string().contains("registered twice"));
    }

    #[test]
    fn full_registry_builds() {
        let registry = build_registry().unwrap();
        let ids = registry.ids();
        assert!(ids.contains(&super::CMD_REFRESH));
        assert!(ids.contains(&super::CMD_LOAD_MORE));
        assert!(ids.contains(&super::CMD_CREATE_VM));
        assert!(ids.contains(&super::CMD_REPORT_ISSUE));
        assert!(ids.contains(&super::CMD_OPEN_IN_SSH));
        assert_eq!(ids.len(), 14);
    }

    #[tokio::test]
    async fn successful_command_records_one_success_event() {
        let mut harness = harness(true);
        let vm = load_first_vm(&harness).await;

        harness
            .dispatcher
            .invoke(CMD_START_VM, Some(vm.clone()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(harness.gateway.invoked(), vec![(vm, LifecycleOp::Start)]);
        let events = harness.telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, CMD_START_VM);
        assert_eq!(events[0].property("outcome"), Some("success"));
        assert_eq!(events[0].property("op"), Some("start"));
        assert!(events[0].measurements.contains_key("durationMs"));
        assert!(notifications(&drain(&mut harness.shell_rx)).is_empty());
    }

    #[tokio::test]
    async fn quota_exceeded_is_shown_once_with_remediation() {
        let mut harness = harness(true);
        let vm = load_first_vm(&harness).await;
        harness.gateway.fail_invocations(ScriptedFailure::Remote {
            code: "QuotaExceeded".to_string(),
            message: "no cores left".to_string(),
        });

        // Known failures are fully handled here, not re-surfaced.
        harness
            .dispatcher
            .invoke(CMD_START_VM, Some(vm), CancellationToken::new())
            .await
            .unwrap();

        let events = harness.telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].property("outcome"), Some("error"));

        let shown = notifications(&drain(&mut harness.shell_rx));
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].severity, Severity::Warning);
        assert!(shown[0].message.contains("QuotaExceeded"));
        assert!(shown[0].remediation.as_deref().unwrap().contains("quota"));
    }

    #[tokio::test]
    async fn dismissed_confirmation_is_silent_and_cancelled() {
        let mut harness = harness(false);
        let vm = load_first_vm(&harness).await;

        harness
            .dispatcher
            .invoke(CMD_DELETE_VM, Some(vm), CancellationToken::new())
            .await
            .unwrap();

        assert!(harness.gateway.invoked().is_empty());
        let events = harness.telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].property("outcome"), Some("cancelled"));
        assert!(notifications(&drain(&mut harness.shell_rx)).is_empty());
    }

    #[tokio::test]
    async fn nested_failure_is_reported_exactly_once() {
        let mut registry = build_registry().unwrap();
        registry
            .register("strato.inner", |_, _, _| async {
                Err(KnownFailure::new("disk quota exhausted").into())
            })
            .unwrap();
        let mut harness = harness_with(registry, true);
        let dispatcher = harness.dispatcher.clone();

        let ctx = ActionContext::root("strato.outer", true, CancellationToken::new());
        let inner = dispatcher.invoke_nested(&ctx, "strato.inner", None).await;
        inner.unwrap();
        // The outer layer sees the same failure again via its own report
        // path; the shared state keeps it to one notification.
        let error: anyhow::Error = KnownFailure::new("disk quota exhausted").into();
        let classification = crate::errors::classify(&error);
        dispatcher.report(&ctx, &classification, &error);

        let shown = notifications(&drain(&mut harness.shell_rx));
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].message, "disk quota exhausted");
    }

    #[tokio::test]
    async fn unknown_command_surfaces_as_unexpected() {
        let mut harness = harness(true);
        let error = harness
            .dispatcher
            .invoke("strato.doesNotExist", None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("unknown command"));

        let events = harness.telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].property("outcome"), Some("error"));

        let shown = notifications(&drain(&mut harness.shell_rx));
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn open_in_ssh_surfaces_a_connect_url() {
        let mut harness = harness(true);
        let root = NodeId::root();
        let mut machine = crate::gateway::testing::vm(
            &NodeId::new("/subscriptions/s1/resourceGroups/rg/virtualMachines/web"),
            "web",
        );
        machine.summary.public_ip = Some("203.0.113.7".to_string());
        harness.gateway.script_page(
            &root,
            None,
            crate::model::ResourcePage {
                items: vec![machine],
                next_cursor: None,
            },
        );
        let vm = load_first_vm(&harness).await;

        harness
            .dispatcher
            .invoke(super::CMD_OPEN_IN_SSH, Some(vm), CancellationToken::new())
            .await
            .unwrap();

        let events = drain(&mut harness.shell_rx);
        assert!(events.contains(&ShellEvent::OpenUrl(
            "ssh://cloud@203.0.113.7".to_string()
        )));
    }

    #[tokio::test]
    async fn copy_ip_without_address_is_a_known_failure() {
        let mut harness = harness(true);
        let vm = load_first_vm(&harness).await;

        harness
            .dispatcher
            .invoke(super::CMD_COPY_IP, Some(vm), CancellationToken::new())
            .await
            .unwrap();

        let shown = notifications(&drain(&mut harness.shell_rx));
        assert_eq!(shown.len(), 1);
        assert!(shown[0].message.contains("no IP address"));
        assert_eq!(shown[0].severity, Severity::Warning);
    }
}
