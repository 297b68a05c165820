use crate::app::InputMode;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Quit,
    Down,
    Up,
    PageDown,
    PageUp,
    Top,
    Bottom,
    ToggleExpand,
    Collapse,
    Refresh,
    RefreshAll,
    CreateVm,
    StartVm,
    StopVm,
    RestartVm,
    DeleteVm,
    AddSshKey,
    OpenInSsh,
    CopyIp,
    ViewProperties,
    OpenInPortal,
    ReportIssue,
    ToggleHelp,
    Escape,
    ConfirmYes,
    ConfirmNo,
    SubmitInput,
    CancelInput,
    Backspace,
    InputChar(char),
}

pub fn map_key(mode: InputMode, key: KeyEvent) -> Option<Action> {
    match mode {
        InputMode::Normal => map_normal_mode_key(key),
        InputMode::Confirm => map_confirm_mode_key(key),
        InputMode::Input => map_input_mode_key(key),
    }
}

fn map_normal_mode_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Char('q') => Some(Action::Quit),
        KeyCode::Char('j') | KeyCode::Down => Some(Action::Down),
        KeyCode::Char('k') | KeyCode::Up => Some(Action::Up),
        KeyCode::PageDown => Some(Action::PageDown),
        KeyCode::PageUp => Some(Action::PageUp),
        KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Action::PageDown)
        }
        KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::PageUp),
        KeyCode::Char('g') | KeyCode::Home => Some(Action::Top),
        KeyCode::Char('G') | KeyCode::End => Some(Action::Bottom),
        KeyCode::Enter | KeyCode::Char('l') | KeyCode::Right => Some(Action::ToggleExpand),
        KeyCode::Char('h') | KeyCode::Left => Some(Action::Collapse),
        KeyCode::Char('r') | KeyCode::F(5) => Some(Action::Refresh),
        KeyCode::Char('R') => Some(Action::RefreshAll),
        KeyCode::Char('c') => Some(Action::CreateVm),
        KeyCode::Char('s') => Some(Action::StartVm),
        KeyCode::Char('x') => Some(Action::StopVm),
        KeyCode::Char('b') => Some(Action::RestartVm),
        KeyCode::Char('d') => Some(Action::DeleteVm),
        KeyCode::Char('a') => Some(Action::AddSshKey),
        KeyCode::Char('S') => Some(Action::OpenInSsh),
        KeyCode::Char('i') => Some(Action::CopyIp),
        KeyCode::Char('v') => Some(Action::ViewProperties),
        KeyCode::Char('o') => Some(Action::OpenInPortal),
        KeyCode::Char('I') => Some(Action::ReportIssue),
        KeyCode::Char('?') => Some(Action::ToggleHelp),
        KeyCode::Esc => Some(Action::Escape),
        _ => None,
    }
}

fn map_confirm_mode_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Char('y') | KeyCode::Char('Y') => Some(Action::ConfirmYes),
        KeyCode::Char('n') | KeyCode::Char('N') => Some(Action::ConfirmNo),
        KeyCode::Esc => Some(Action::Escape),
        _ => None,
    }
}

fn map_input_mode_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Enter => Some(Action::SubmitInput),
        KeyCode::Esc => Some(Action::CancelInput),
        KeyCode::Backspace => Some(Action::Backspace),
        KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Action::InputChar(c))
        }
        _ => None,
    }
}
