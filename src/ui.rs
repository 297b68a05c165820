use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap};

use crate::app::{App, InputMode};
use crate::errors::Severity;
use crate::model::{PowerState, ResourceKind, TreeRow};

const BG: Color = Color::Rgb(10, 16, 28);
const PANEL: Color = Color::Rgb(18, 28, 46);
const ACCENT: Color = Color::Rgb(96, 165, 250);
const MUTED: Color = Color::Rgb(140, 156, 178);
const OK: Color = Color::Rgb(52, 211, 153);
const WARN: Color = Color::Rgb(251, 191, 36);
const ERROR: Color = Color::Rgb(248, 113, 113);
const PL_A: Color = Color::Rgb(30, 64, 175);
const PL_B: Color = Color::Rgb(55, 48, 163);
const PL_C: Color = Color::Rgb(82, 24, 124);

pub fn render(frame: &mut Frame, app: &mut App) {
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(6),
            Constraint::Length(1),
        ])
        .split(frame.area());

    app.set_page_height(root[1].height.saturating_sub(3) as usize);

    render_header(frame, root[0], app);
    render_tree(frame, root[1], app);
    render_footer(frame, root[2], app);

    if let Some((title, body)) = app.detail() {
        render_detail_modal(frame, title, body, app.detail_scroll());
    }
    if app.show_help() {
        render_help_modal(frame);
    }
    match app.mode() {
        InputMode::Confirm => render_confirm_modal(frame, app),
        InputMode::Input => render_input_modal(frame, app),
        InputMode::Normal => {}
    }
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, " STRATO ", Color::Black, ACCENT, PL_A);
    push_powerline_segment(
        &mut spans,
        format!(" 󰀄 {} ", compact_text(app.account_label(), 18)),
        Color::White,
        PL_A,
        PL_B,
    );
    push_powerline_segment(
        &mut spans,
        format!(" 󰅟 {} ", compact_text(&display_endpoint(app.endpoint()), 32)),
        Color::White,
        PL_B,
        PL_C,
    );
    push_powerline_segment(
        &mut spans,
        if app.busy() { " 󰦖 busy " } else { " 󰄬 idle " },
        Color::White,
        PL_C,
        BG,
    );
    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

fn render_tree(frame: &mut Frame, area: Rect, app: &App) {
    let header = Row::new(
        ["NAME", "STATE", "SIZE", "LOCATION", "PUBLIC IP", "PRIVATE IP"]
            .into_iter()
            .map(|title| Cell::from(title).style(Style::default().fg(MUTED))),
    )
    .height(1);

    let rows: Vec<Row> = app.rows().iter().map(tree_table_row).collect();
    let table = Table::new(
        rows,
        [
            Constraint::Min(28),
            Constraint::Length(13),
            Constraint::Length(16),
            Constraint::Length(14),
            Constraint::Length(16),
            Constraint::Length(16),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(PANEL))
            .style(Style::default().bg(BG)),
    )
    .row_highlight_style(
        Style::default()
            .bg(PANEL)
            .fg(Color::White)
            .add_modifier(Modifier::BOLD),
    );

    let mut state = TableState::default();
    if !app.rows().is_empty() {
        state.select(Some(app.selected()));
    }
    frame.render_stateful_widget(table, area, &mut state);
}

fn tree_table_row(row: &TreeRow) -> Row<'static> {
    let indent = "  ".repeat(row.depth);
    let marker = if row.is_load_more() {
        "󰁔 "
    } else if !row.kind.has_children() {
        "󰒋 "
    } else if row.expanded {
        "▾ "
    } else {
        "▸ "
    };
    let name_style = if row.is_load_more() {
        Style::default().fg(ACCENT).add_modifier(Modifier::ITALIC)
    } else {
        Style::default().fg(Color::White)
    };

    let summary = &row.summary;
    let state_cell = match summary.power_state {
        Some(state) => Cell::from(state.label()).style(Style::default().fg(power_color(state))),
        None if row.kind == ResourceKind::VirtualMachine => {
            Cell::from("-").style(Style::default().fg(MUTED))
        }
        None => Cell::from(""),
    };

    Row::new(vec![
        Cell::from(format!("{indent}{marker}{}", row.label)).style(name_style),
        state_cell,
        muted_cell(summary.vm_size.as_deref()),
        muted_cell(summary.location.as_deref()),
        muted_cell(summary.public_ip.as_deref()),
        muted_cell(summary.private_ip.as_deref()),
    ])
    .height(1)
}

fn muted_cell(value: Option<&str>) -> Cell<'static> {
    Cell::from(value.unwrap_or("").to_string()).style(Style::default().fg(MUTED))
}

fn power_color(state: PowerState) -> Color {
    match state {
        PowerState::Running => OK,
        PowerState::Starting | PowerState::Stopping | PowerState::Deallocating => WARN,
        PowerState::Stopped | PowerState::Deallocated => MUTED,
        PowerState::Unknown => ERROR,
    }
}

fn render_footer(frame: &mut Frame, area: Rect, app: &App) {
    let (status_text, status_color) = match app.notifications().front() {
        Some(notification) if notification.message == app.status() => {
            let color = match notification.severity {
                Severity::Info => Color::White,
                Severity::Warning => WARN,
                Severity::Error => ERROR,
            };
            let text = match &notification.remediation {
                Some(remediation) => format!("{}  󰛨 {}", notification.message, remediation),
                None => notification.message.clone(),
            };
            (text, color)
        }
        _ => (app.status().to_string(), Color::White),
    };

    let mut spans = Vec::new();
    let (mode_fg, mode_bg) = match app.mode() {
        InputMode::Normal => (Color::White, PL_A),
        InputMode::Confirm | InputMode::Input => (Color::Black, WARN),
    };
    push_powerline_segment(
        &mut spans,
        format!(" 󰘳 {} ", mode_label(app.mode())),
        mode_fg,
        mode_bg,
        PL_B,
    );
    push_powerline_segment(
        &mut spans,
        format!(" {} ", compact_text(&status_text, area.width.saturating_sub(30) as usize)),
        status_color,
        PL_B,
        BG,
    );
    spans.push(Span::styled(
        "  ? help  q quit",
        Style::default().fg(MUTED).bg(BG),
    ));
    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

fn mode_label(mode: InputMode) -> &'static str {
    match mode {
        InputMode::Normal => "nrm",
        InputMode::Confirm => "cfm",
        InputMode::Input => "ins",
    }
}

fn render_detail_modal(frame: &mut Frame, title: &str, body: &str, scroll: u16) {
    let area = centered_rect(74, 76, frame.area());
    frame.render_widget(Clear, area);
    let modal = Paragraph::new(body.to_string())
        .wrap(Wrap { trim: false })
        .scroll((scroll, 0))
        .block(
            Block::default()
                .title(format!(" {title} "))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(ACCENT))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));
    frame.render_widget(modal, area);
}

fn render_help_modal(frame: &mut Frame) {
    let area = centered_rect(64, 70, frame.area());
    frame.render_widget(Clear, area);

    let lines: Vec<Line> = [
        "Flow: Enter/l expand or collapse  h collapse  Esc dismiss/cancel",
        "",
        "j/k move  g/G top/bottom  Ctrl-d/Ctrl-u page",
        "Enter on 'Load more…' fetches the next page of siblings",
        "",
        "r refresh node  R refresh everything",
        "c create virtual machine  d delete  s start  x stop  b restart",
        "a add ssh public key  S connect over ssh  i copy ip address",
        "v properties  o open in portal",
        "",
        "I report an issue  ? toggle this help  q quit",
    ]
    .into_iter()
    .map(Line::from)
    .collect();

    let modal = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(ACCENT))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));
    frame.render_widget(modal, area);
}

fn render_confirm_modal(frame: &mut Frame, app: &App) {
    let message = app.prompt_message().unwrap_or_default();
    let area = centered_rect(54, 20, frame.area());
    frame.render_widget(Clear, area);
    let modal = Paragraph::new(vec![
        Line::from(message.to_string()),
        Line::from(""),
        Line::from(Span::styled("y confirm   n / Esc cancel", Style::default().fg(MUTED))),
    ])
    .wrap(Wrap { trim: false })
    .block(
        Block::default()
            .title("Confirm")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(WARN))
            .style(Style::default().bg(PANEL)),
    )
    .style(Style::default().fg(Color::White));
    frame.render_widget(modal, area);
}

fn render_input_modal(frame: &mut Frame, app: &App) {
    let message = app.prompt_message().unwrap_or_default();
    let buffer = app.prompt_buffer().unwrap_or_default();
    let hint = match app.prompt_default() {
        Some(default) if buffer.is_empty() => format!("(default: {default})"),
        _ => String::new(),
    };
    let area = centered_rect(54, 22, frame.area());
    frame.render_widget(Clear, area);
    let modal = Paragraph::new(vec![
        Line::from(message.to_string()),
        Line::from(vec![
            Span::styled("> ", Style::default().fg(ACCENT)),
            Span::raw(buffer.to_string()),
            Span::styled("▌", Style::default().fg(ACCENT)),
            Span::styled(format!(" {hint}"), Style::default().fg(MUTED)),
        ]),
        Line::from(""),
        Line::from(Span::styled("Enter submit   Esc cancel", Style::default().fg(MUTED))),
    ])
    .wrap(Wrap { trim: false })
    .block(
        Block::default()
            .title("Input")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(ACCENT))
            .style(Style::default().bg(PANEL)),
    )
    .style(Style::default().fg(Color::White));
    frame.render_widget(modal, area);
}

fn push_powerline_segment(
    spans: &mut Vec<Span<'static>>,
    content: impl Into<String>,
    fg: Color,
    bg: Color,
    next_bg: Color,
) {
    spans.push(Span::styled(
        content.into(),
        Style::default().fg(fg).bg(bg).add_modifier(Modifier::BOLD),
    ));
    spans.push(Span::styled("", Style::default().fg(bg).bg(next_bg)));
}

fn compact_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    if max_chars <= 1 {
        return "…".to_string();
    }
    let mut out = value
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push('…');
    out
}

fn display_endpoint(endpoint: &str) -> String {
    endpoint
        .trim()
        .trim_end_matches('/')
        .strip_prefix("https://")
        .or_else(|| endpoint.trim().trim_end_matches('/').strip_prefix("http://"))
        .unwrap_or(endpoint.trim().trim_end_matches('/'))
        .to_string()
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::mode_label;
    use crate::app::InputMode;

    #[test]
    fn footer_label_tracks_the_input_mode() {
        assert_eq!(mode_label(InputMode::Normal), "nrm");
        assert_eq!(mode_label(InputMode::Confirm), "cfm");
        assert_eq!(mode_label(InputMode::Input), "ins");
    }
}
