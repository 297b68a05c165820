use std::fmt::{Display, Formatter};

/// Stable identity of one entry in the resource tree. Cloud resource ids
/// are already path-shaped (`/subscriptions/<s>/resourceGroups/<g>/...`),
/// so the id doubles as the arena key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub const ROOT: &'static str = "/";

    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    /// Id of the synthetic "load more" row under this node.
    pub fn load_more_child(&self) -> Self {
        Self(format!("{}#load-more", self.0))
    }

    /// Inverse of [`NodeId::load_more_child`]: the node whose next page a
    /// synthetic row stands for, or `None` for ordinary ids.
    pub fn load_more_parent(&self) -> Option<Self> {
        self.0
            .strip_suffix("#load-more")
            .map(|parent| Self(parent.to_string()))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResourceKind {
    Account,
    Subscription,
    ResourceGroup,
    VirtualMachine,
    /// Synthetic paging row, never cached as a real resource.
    LoadMore,
}

impl ResourceKind {
    pub fn title(self) -> &'static str {
        match self {
            Self::Account => "Account",
            Self::Subscription => "Subscription",
            Self::ResourceGroup => "Resource Group",
            Self::VirtualMachine => "Virtual Machine",
            Self::LoadMore => "Load more",
        }
    }

    /// Whether children can be fetched for a node of this kind.
    pub fn has_children(self) -> bool {
        matches!(
            self,
            Self::Account | Self::Subscription | Self::ResourceGroup
        )
    }
}

/// Pagination state of one node's child list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PageCursor {
    /// No page has been fetched yet.
    #[default]
    Unloaded,
    /// Opaque continuation token for the next page.
    Next(String),
    /// The remote source reported no further pages.
    Exhausted,
}

impl PageCursor {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }

    pub fn is_unloaded(&self) -> bool {
        matches!(self, Self::Unloaded)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PowerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Deallocating,
    Deallocated,
    Unknown,
}

impl PowerState {
    /// Parses the `PowerState/<state>` code reported by instance views.
    pub fn from_code(code: &str) -> Self {
        match code.rsplit('/').next().unwrap_or(code) {
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "deallocating" => Self::Deallocating,
            "deallocated" => Self::Deallocated,
            _ => Self::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deallocating => "deallocating",
            Self::Deallocated => "deallocated",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for PowerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Display payload carried by a tree node. Group-level nodes leave most
/// fields empty; virtual machines fill them from the remote summary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceSummary {
    pub location: Option<String>,
    pub power_state: Option<PowerState>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub os: Option<String>,
    pub vm_size: Option<String>,
}

/// One entry returned by the remote list call, before it becomes a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResource {
    pub id: NodeId,
    pub label: String,
    pub kind: ResourceKind,
    pub summary: ResourceSummary,
}

/// One page of children plus the continuation token, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePage {
    pub items: Vec<RemoteResource>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LifecycleOp {
    Start,
    Stop,
    Restart,
    Delete,
}

impl LifecycleOp {
    pub fn verb(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Delete => "delete",
        }
    }

    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Start => "Started",
            Self::Stop => "Stopped",
            Self::Restart => "Restarted",
            Self::Delete => "Deleted",
        }
    }

    /// Whether the operation is destructive enough to confirm first.
    pub fn needs_confirmation(self) -> bool {
        matches!(self, Self::Stop | Self::Restart | Self::Delete)
    }
}

/// Parameters gathered by the create-VM wizard before the remote call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmCreateSpec {
    pub name: String,
    pub location: String,
    pub vm_size: String,
    pub image: String,
    pub admin_username: String,
    pub ssh_public_key: Option<String>,
}

/// Flattened, depth-annotated row handed to the UI for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRow {
    pub id: NodeId,
    pub label: String,
    pub kind: ResourceKind,
    pub depth: usize,
    pub expanded: bool,
    pub summary: ResourceSummary,
}

impl TreeRow {
    pub fn is_load_more(&self) -> bool {
        self.kind == ResourceKind::LoadMore
    }
}
