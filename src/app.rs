use crate::commands::{
    CMD_ADD_SSH_KEY, CMD_COPY_IP, CMD_CREATE_VM, CMD_DELETE_VM, CMD_GET_CHILDREN, CMD_LOAD_MORE,
    CMD_OPEN_IN_PORTAL, CMD_OPEN_IN_SSH, CMD_REFRESH, CMD_REPORT_ISSUE, CMD_RESTART_VM,
    CMD_START_VM, CMD_STOP_VM, CMD_VIEW_PROPERTIES, PromptRequest, ShellEvent,
};
use crate::errors::Notification;
use crate::input::Action;
use crate::model::{NodeId, TreeRow};
use std::collections::{HashSet, VecDeque};
use tokio::sync::oneshot;

const MAX_NOTIFICATIONS: usize = 20;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InputMode {
    Normal,
    Confirm,
    Input,
}

/// What the event loop should do after applying an action.
#[derive(Debug, PartialEq, Eq)]
pub enum AppCommand {
    None,
    /// Re-flatten the tree into rows (pure view change, no remote work).
    Resnapshot,
    Invoke {
        command_id: &'static str,
        target: Option<NodeId>,
    },
    /// Cancel whatever commands are currently in flight.
    CancelActive,
}

enum PromptReply {
    Confirm(oneshot::Sender<bool>),
    Input(oneshot::Sender<Option<String>>),
}

struct ActivePrompt {
    message: String,
    default: Option<String>,
    buffer: String,
    reply: PromptReply,
}

/// UI-shell state. Holds no live references into the tree cache: rows are
/// a flattened snapshot refreshed whenever the engine reports a change.
pub struct App {
    running: bool,
    mode: InputMode,
    rows: Vec<TreeRow>,
    selected: usize,
    expanded: HashSet<NodeId>,
    status: String,
    notifications: VecDeque<Notification>,
    show_help: bool,
    detail: Option<(String, String)>,
    detail_scroll: u16,
    prompt: Option<ActivePrompt>,
    account_label: String,
    endpoint: String,
    in_flight: usize,
    page_height: usize,
}

impl App {
    pub fn new(account_label: String, endpoint: String) -> Self {
        Self {
            running: true,
            mode: InputMode::Normal,
            rows: Vec::new(),
            selected: 0,
            expanded: HashSet::new(),
            status: "Loading subscriptions…".to_string(),
            notifications: VecDeque::new(),
            show_help: false,
            detail: None,
            detail_scroll: 0,
            prompt: None,
            account_label,
            endpoint,
            in_flight: 0,
            page_height: 20,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn rows(&self) -> &[TreeRow] {
        &self.rows
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn selected_row(&self) -> Option<&TreeRow> {
        self.rows.get(self.selected)
    }

    pub fn expanded(&self) -> &HashSet<NodeId> {
        &self.expanded
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    pub fn notifications(&self) -> &VecDeque<Notification> {
        &self.notifications
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    pub fn detail(&self) -> Option<(&str, &str)> {
        self.detail
            .as_ref()
            .map(|(title, body)| (title.as_str(), body.as_str()))
    }

    pub fn detail_scroll(&self) -> u16 {
        self.detail_scroll
    }

    pub fn prompt_message(&self) -> Option<&str> {
        self.prompt.as_ref().map(|prompt| prompt.message.as_str())
    }

    pub fn prompt_buffer(&self) -> Option<&str> {
        self.prompt.as_ref().map(|prompt| prompt.buffer.as_str())
    }

    pub fn prompt_default(&self) -> Option<&str> {
        self.prompt.as_ref().and_then(|prompt| prompt.default.as_deref())
    }

    pub fn account_label(&self) -> &str {
        &self.account_label
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn busy(&self) -> bool {
        self.in_flight > 0
    }

    pub fn note_command_started(&mut self) {
        self.in_flight += 1;
    }

    pub fn note_command_finished(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn set_page_height(&mut self, height: usize) {
        self.page_height = height.max(1);
    }

    /// Replaces the visible rows, keeping the selection on the same node
    /// where possible so refreshes do not yank the cursor around.
    pub fn set_rows(&mut self, rows: Vec<TreeRow>) {
        let selected_id = self.rows.get(self.selected).map(|row| row.id.clone());
        self.rows = rows;
        self.selected = selected_id
            .and_then(|id| self.rows.iter().position(|row| row.id == id))
            .unwrap_or_else(|| self.selected.min(self.rows.len().saturating_sub(1)));
    }

    /// Routes an engine event into the shell state. Returns `true` when
    /// the caller should re-snapshot the tree rows.
    pub fn on_shell_event(&mut self, event: ShellEvent) -> bool {
        match event {
            ShellEvent::TreeChanged => return true,
            ShellEvent::Notify(notification) => {
                self.status = notification.message.clone();
                self.notifications.push_front(notification);
                self.notifications.truncate(MAX_NOTIFICATIONS);
            }
            ShellEvent::Status(status) => self.status = status,
            ShellEvent::Detail { title, body } => {
                self.detail = Some((title, body));
                self.detail_scroll = 0;
            }
            ShellEvent::OpenUrl(url) => {
                self.status = format!("Open: {url}");
            }
        }
        false
    }

    /// Surfaces an engine prompt as a modal, switching the input mode.
    pub fn on_prompt(&mut self, request: PromptRequest) {
        match request {
            PromptRequest::Confirm { message, reply } => {
                self.mode = InputMode::Confirm;
                self.prompt = Some(ActivePrompt {
                    message,
                    default: None,
                    buffer: String::new(),
                    reply: PromptReply::Confirm(reply),
                });
            }
            PromptRequest::Input {
                message,
                default,
                reply,
            } => {
                self.mode = InputMode::Input;
                self.prompt = Some(ActivePrompt {
                    message,
                    default,
                    buffer: String::new(),
                    reply: PromptReply::Input(reply),
                });
            }
        }
    }

    pub fn apply_action(&mut self, action: Action) -> AppCommand {
        match self.mode {
            InputMode::Normal => self.apply_normal_action(action),
            InputMode::Confirm => {
                self.apply_confirm_action(action);
                AppCommand::None
            }
            InputMode::Input => {
                self.apply_input_action(action);
                AppCommand::None
            }
        }
    }

    fn apply_normal_action(&mut self, action: Action) -> AppCommand {
        match action {
            Action::Quit => {
                self.running = false;
                AppCommand::None
            }
            Action::Down => {
                self.move_selection(1);
                AppCommand::None
            }
            Action::Up => {
                self.move_selection(-1);
                AppCommand::None
            }
            Action::PageDown => {
                self.move_selection(self.page_height as isize);
                AppCommand::None
            }
            Action::PageUp => {
                self.move_selection(-(self.page_height as isize));
                AppCommand::None
            }
            Action::Top => {
                if self.detail.is_some() {
                    self.detail_scroll = 0;
                } else {
                    self.selected = 0;
                }
                AppCommand::None
            }
            Action::Bottom => {
                self.selected = self.rows.len().saturating_sub(1);
                AppCommand::None
            }
            Action::ToggleExpand => self.toggle_expand(),
            Action::Collapse => {
                if let Some(id) = self.selected_row().map(|row| row.id.clone())
                    && self.expanded.remove(&id)
                {
                    AppCommand::Resnapshot
                } else {
                    AppCommand::None
                }
            }
            Action::Refresh => AppCommand::Invoke {
                command_id: CMD_REFRESH,
                target: self.selected_target(),
            },
            Action::RefreshAll => AppCommand::Invoke {
                command_id: CMD_REFRESH,
                target: None,
            },
            Action::CreateVm => AppCommand::Invoke {
                command_id: CMD_CREATE_VM,
                target: self.selected_target(),
            },
            Action::StartVm => self.invoke_on_selection(CMD_START_VM),
            Action::StopVm => self.invoke_on_selection(CMD_STOP_VM),
            Action::RestartVm => self.invoke_on_selection(CMD_RESTART_VM),
            Action::DeleteVm => self.invoke_on_selection(CMD_DELETE_VM),
            Action::AddSshKey => self.invoke_on_selection(CMD_ADD_SSH_KEY),
            Action::OpenInSsh => self.invoke_on_selection(CMD_OPEN_IN_SSH),
            Action::CopyIp => self.invoke_on_selection(CMD_COPY_IP),
            Action::ViewProperties => self.invoke_on_selection(CMD_VIEW_PROPERTIES),
            Action::OpenInPortal => self.invoke_on_selection(CMD_OPEN_IN_PORTAL),
            Action::ReportIssue => AppCommand::Invoke {
                command_id: CMD_REPORT_ISSUE,
                target: None,
            },
            Action::ToggleHelp => {
                self.show_help = !self.show_help;
                AppCommand::None
            }
            Action::Escape => {
                if self.show_help {
                    self.show_help = false;
                    AppCommand::None
                } else if self.detail.is_some() {
                    self.detail = None;
                    AppCommand::None
                } else if self.busy() {
                    AppCommand::CancelActive
                } else {
                    AppCommand::None
                }
            }
            _ => AppCommand::None,
        }
    }

    fn toggle_expand(&mut self) -> AppCommand {
        let Some(row) = self.selected_row().cloned() else {
            return AppCommand::None;
        };
        if row.is_load_more() {
            return AppCommand::Invoke {
                command_id: CMD_LOAD_MORE,
                target: row.id.load_more_parent(),
            };
        }
        if !row.kind.has_children() {
            return AppCommand::Invoke {
                command_id: CMD_VIEW_PROPERTIES,
                target: Some(row.id),
            };
        }
        if self.expanded.remove(&row.id) {
            AppCommand::Resnapshot
        } else {
            self.expanded.insert(row.id.clone());
            AppCommand::Invoke {
                command_id: CMD_GET_CHILDREN,
                target: Some(row.id),
            }
        }
    }

    fn apply_confirm_action(&mut self, action: Action) {
        let answer = match action {
            Action::ConfirmYes => true,
            Action::ConfirmNo | Action::Escape => false,
            _ => return,
        };
        if let Some(prompt) = self.prompt.take() {
            if let PromptReply::Confirm(reply) = prompt.reply {
                let _ = reply.send(answer);
            }
        }
        self.mode = InputMode::Normal;
    }

    fn apply_input_action(&mut self, action: Action) {
        match action {
            Action::InputChar(c) => {
                if let Some(prompt) = self.prompt.as_mut() {
                    prompt.buffer.push(c);
                }
            }
            Action::Backspace => {
                if let Some(prompt) = self.prompt.as_mut() {
                    prompt.buffer.pop();
                }
            }
            Action::SubmitInput => {
                if let Some(prompt) = self.prompt.take() {
                    let value = if prompt.buffer.trim().is_empty() {
                        prompt.default.clone().unwrap_or_default()
                    } else {
                        prompt.buffer.clone()
                    };
                    if let PromptReply::Input(reply) = prompt.reply {
                        let _ = reply.send(Some(value));
                    }
                }
                self.mode = InputMode::Normal;
            }
            Action::CancelInput => {
                if let Some(prompt) = self.prompt.take()
                    && let PromptReply::Input(reply) = prompt.reply
                {
                    let _ = reply.send(None);
                }
                self.mode = InputMode::Normal;
            }
            _ => {}
        }
    }

    fn invoke_on_selection(&self, command_id: &'static str) -> AppCommand {
        AppCommand::Invoke {
            command_id,
            target: self.selected_target(),
        }
    }

    fn selected_target(&self) -> Option<NodeId> {
        let row = self.selected_row()?;
        if row.is_load_more() {
            row.id.load_more_parent()
        } else {
            Some(row.id.clone())
        }
    }

    fn move_selection(&mut self, delta: isize) {
        if self.detail.is_some() {
            self.detail_scroll = self.detail_scroll.saturating_add_signed(delta as i16);
            return;
        }
        if self.rows.is_empty() {
            return;
        }
        let last = self.rows.len() as isize - 1;
        self.selected = (self.selected as isize + delta).clamp(0, last) as usize;
    }
}
