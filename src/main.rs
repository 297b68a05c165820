mod app;
mod cli;
mod commands;
mod config;
mod errors;
mod gateway;
mod input;
mod model;
mod telemetry;
mod tree;
mod ui;

use anyhow::{Context, Result};
use app::{App, AppCommand};
use clap::Parser;
use cli::CliArgs;
use commands::{CMD_GET_CHILDREN, CommandDispatcher, Prompter, PromptRequest, Services, Shell, ShellEvent, build_registry};
use config::RuntimeConfig;
use crossterm::event::{
    Event, EventStream, KeyEventKind, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
    supports_keyboard_enhancement,
};
use futures::StreamExt;
use gateway::HttpGateway;
use model::NodeId;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use std::io::{self, Stdout};
use std::sync::Arc;
use telemetry::TracingSink;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tree::TreeCache;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let mut config = RuntimeConfig::load(args.config)?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(page_size) = args.page_size {
        config.page_size = page_size.clamp(1, 1000);
    }
    if let Some(source) = &config.source {
        debug!("loaded config from {source}");
    }

    let gateway = Arc::new(
        HttpGateway::new(&config.endpoint, config.token.clone())
            .context("failed to build the management gateway")?,
    );
    let tree = Arc::new(TreeCache::new(
        gateway.clone(),
        config.page_size,
        &config.account_label,
    ));
    let (shell, shell_rx) = Shell::new();
    let (prompter, prompt_rx) = Prompter::new();
    let services = Arc::new(Services {
        tree: tree.clone(),
        gateway,
        telemetry: Arc::new(TracingSink),
        shell,
        prompter,
        suppress_report_issue: config.suppress_report_issue,
        portal_base: config.portal_base.clone(),
        issue_url: config.issue_url.clone(),
        vm_defaults: config.vm_defaults.clone(),
    });
    let dispatcher = CommandDispatcher::new(build_registry()?, services);

    let mut app = App::new(config.account_label.clone(), config.endpoint.clone());
    run(&mut app, dispatcher, tree, shell_rx, prompt_rx).await
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    // The alternate screen owns stdout, so nothing may print there.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::sink)
        .try_init();

    Ok(())
}

async fn run(
    app: &mut App,
    dispatcher: CommandDispatcher,
    tree: Arc<TreeCache>,
    shell_rx: mpsc::UnboundedReceiver<ShellEvent>,
    prompt_rx: mpsc::UnboundedReceiver<PromptRequest>,
) -> Result<()> {
    let (mut terminal, keyboard_enhanced) = init_terminal()?;
    let run_result = run_loop(&mut terminal, app, dispatcher, tree, shell_rx, prompt_rx).await;
    let restore_result = restore_terminal(&mut terminal, keyboard_enhanced);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_terminal() -> Result<(TuiTerminal, bool)> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    let keyboard_enhanced = matches!(supports_keyboard_enhancement(), Ok(true));
    if keyboard_enhanced {
        execute!(
            stdout,
            EnterAlternateScreen,
            PushKeyboardEnhancementFlags(
                KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_EVENT_TYPES
            )
        )
        .context("failed to enter alternate screen with keyboard enhancement")?;
    } else {
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    }
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok((terminal, keyboard_enhanced))
}

fn restore_terminal(terminal: &mut TuiTerminal, keyboard_enhanced: bool) -> Result<()> {
    if keyboard_enhanced {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)
            .context("failed to pop keyboard enhancement flags")?;
    }
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn run_loop(
    terminal: &mut TuiTerminal,
    app: &mut App,
    dispatcher: CommandDispatcher,
    tree: Arc<TreeCache>,
    mut shell_rx: mpsc::UnboundedReceiver<ShellEvent>,
    mut prompt_rx: mpsc::UnboundedReceiver<PromptRequest>,
) -> Result<()> {
    let mut reader = EventStream::new();
    // One parent token per "generation" of in-flight commands; Esc cancels
    // the whole generation and starts a fresh one.
    let mut active_cancel = CancellationToken::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

    spawn_command(&dispatcher, app, &active_cancel, &done_tx, CMD_GET_CHILDREN, None);

    loop {
        terminal
            .draw(|frame| ui::render(frame, app))
            .context("failed to render terminal frame")?;

        if !app.running() {
            break;
        }

        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(action) = input::map_key(app.mode(), key) {
                            debug!("action={action:?}");
                            match app.apply_action(action) {
                                AppCommand::None => {}
                                AppCommand::Resnapshot => {
                                    let rows = tree.visible_rows(app.expanded());
                                    app.set_rows(rows);
                                }
                                AppCommand::Invoke { command_id, target } => {
                                    spawn_command(
                                        &dispatcher,
                                        app,
                                        &active_cancel,
                                        &done_tx,
                                        command_id,
                                        target,
                                    );
                                }
                                AppCommand::CancelActive => {
                                    active_cancel.cancel();
                                    active_cancel = CancellationToken::new();
                                    app.set_status("Cancelled");
                                }
                            }
                        }
                    }
                    Some(Ok(Event::Resize(_, _))) => {}
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        app.set_status(format!("terminal event error: {error}"));
                    }
                    None => {
                        app.set_status("terminal event stream closed");
                        break;
                    }
                }
            }
            maybe_event = shell_rx.recv() => {
                if let Some(event) = maybe_event
                    && app.on_shell_event(event)
                {
                    let rows = tree.visible_rows(app.expanded());
                    app.set_rows(rows);
                }
            }
            maybe_request = prompt_rx.recv() => {
                if let Some(request) = maybe_request {
                    app.on_prompt(request);
                }
            }
            _ = done_rx.recv() => {
                app.note_command_finished();
            }
        }
    }

    active_cancel.cancel();
    Ok(())
}

fn spawn_command(
    dispatcher: &CommandDispatcher,
    app: &mut App,
    active_cancel: &CancellationToken,
    done_tx: &mpsc::UnboundedSender<()>,
    command_id: &'static str,
    target: Option<NodeId>,
) {
    app.note_command_started();
    let dispatcher = dispatcher.clone();
    let cancel = active_cancel.child_token();
    let done = done_tx.clone();
    tokio::spawn(async move {
        if let Err(error) = dispatcher.invoke(command_id, target, cancel).await {
            debug!("command {command_id} failed: {error:#}");
        }
        let _ = done.send(());
    });
}
