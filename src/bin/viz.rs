/// infersim live visualizer — attach to any running simulation at any time.
///
/// Run in a separate terminal:
///   cargo run --bin viz
///
/// Polls /tmp/infersim_live.json every 200ms and renders a live TUI
/// dashboard: an SM heatmap for the whole GPU, and one occupancy panel per
/// application (SM share, VRAM pages, queue depth).
///
/// Press q or Esc to quit. The simulation keeps running unaffected.
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use gpusim::metrics::{read_metrics, LiveMetrics};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use std::{io, time::Duration};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let metrics = read_metrics();
        terminal.draw(|f| render(f, metrics.as_ref()))?;

        // Non-blocking: poll for 200ms, then redraw regardless
        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level layout
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, metrics: Option<&LiveMetrics>) {
    let area = f.area();

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(8),    // heatmap + apps
            Constraint::Length(1), // footer
        ])
        .split(area);

    render_header(f, rows[0], metrics);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(rows[1]);

    render_heatmap(f, cols[0], metrics);
    render_apps(f, cols[1], metrics);

    render_footer(f, rows[2]);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(Span::styled(
            " infersim live monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (scheduler, cycle, kernels_done, finished, total) = metrics
        .map(|m| (m.scheduler_mode.as_str(), m.cycle, m.finished_kernels, m.apps_finished, m.apps_total))
        .unwrap_or(("—", 0, 0, 0, 0));

    let status_color = if total > 0 && finished == total { Color::Cyan } else { Color::Green };

    let spans = vec![
        Span::styled("  scheduler: ", Style::default().fg(Color::DarkGray)),
        Span::styled(scheduler, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::styled("   cycle: ", Style::default().fg(Color::DarkGray)),
        Span::styled(cycle.to_string(), Style::default().fg(Color::Cyan)),
        Span::styled("   kernels finished: ", Style::default().fg(Color::DarkGray)),
        Span::raw(kernels_done.to_string()),
        Span::styled("   apps: ", Style::default().fg(Color::DarkGray)),
        Span::styled(format!("{}/{}", finished, total), Style::default().fg(status_color).add_modifier(Modifier::BOLD)),
    ];

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

// ---------------------------------------------------------------------------
// SM heatmap
// ---------------------------------------------------------------------------

fn render_heatmap(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" SM Utilization ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let sm_active: Vec<bool> = metrics.map(|m| m.sm_active.clone()).unwrap_or_else(|| vec![false; 32]);

    // Fit as many SMs per row as the panel width allows (each SM = 2 chars + 1 space)
    let sms_per_row = ((inner.width as usize).saturating_sub(1) / 3).max(1);

    let legend = Line::from(vec![
        Span::styled("██", Style::default().fg(Color::Green)),
        Span::raw(" active   "),
        Span::styled("░░", Style::default().fg(Color::DarkGray)),
        Span::raw(" idle"),
    ]);

    let mut lines: Vec<Line> = vec![legend, Line::raw("")];

    for row in sm_active.chunks(sms_per_row) {
        let spans: Vec<Span> = row
            .iter()
            .flat_map(|&active| {
                let (symbol, color) = if active { ("██", Color::Green) } else { ("░░", Color::DarkGray) };
                vec![Span::styled(symbol, Style::default().fg(color)), Span::raw(" ")]
            })
            .collect();
        lines.push(Line::from(spans));
    }

    let active_count = sm_active.iter().filter(|&&b| b).count();
    lines.push(Line::raw(""));
    lines.push(Line::from(vec![Span::styled(
        format!("  {}/{} SMs active", active_count, sm_active.len()),
        Style::default().fg(Color::DarkGray),
    )]));

    f.render_widget(Paragraph::new(lines), inner);
}

// ---------------------------------------------------------------------------
// Per-app occupancy panels
// ---------------------------------------------------------------------------

fn render_apps(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Applications ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        f.render_widget(
            Paragraph::new(vec![
                Line::raw(""),
                Line::from(Span::styled("  No simulation running.", Style::default().fg(Color::DarkGray))),
                Line::from(Span::styled("  Start infersim to see live data.", Style::default().fg(Color::DarkGray))),
            ]),
            inner,
        );
        return;
    };

    if m.apps.is_empty() {
        f.render_widget(Paragraph::new(Line::from(Span::styled("  (no applications)", Style::default().fg(Color::DarkGray)))), inner);
        return;
    }

    let per_app = 3u16;
    let constraints: Vec<Constraint> = m.apps.iter().map(|_| Constraint::Length(per_app)).collect();
    let rows = Layout::default().direction(Direction::Vertical).constraints(constraints).split(inner);

    for (row, app) in rows.iter().zip(m.apps.iter()) {
        let parts = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(1), Constraint::Length(1), Constraint::Length(1)])
            .split(*row);

        let status = if app.finished { "done" } else { "running" };
        let status_color = if app.finished { Color::Cyan } else { Color::Green };
        let header = Line::from(vec![
            Span::styled(format!("  app {} ", app.app_id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
            Span::raw(app.model_type.clone()),
            Span::raw("   "),
            Span::styled(status, Style::default().fg(status_color)),
            Span::raw(format!("   queued={} models={}/{}", app.queued_tasks, app.running_models, app.waiting_models)),
        ]);
        f.render_widget(Paragraph::new(header), parts[0]);

        let vram_pct = if app.vram_pages_capacity > 0 {
            ((app.vram_pages_used as f64 / app.vram_pages_capacity as f64) * 100.0).clamp(0.0, 100.0) as u16
        } else {
            0
        };
        let gauge = Gauge::default()
            .block(Block::default().title(format!("VRAM  {} SMs", app.sm_count)))
            .gauge_style(Style::default().fg(Color::Blue))
            .percent(vram_pct)
            .label(format!("{}/{} pages", app.vram_pages_used, app.vram_pages_capacity));
        f.render_widget(gauge, parts[1]);
    }
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

fn render_footer(f: &mut Frame, area: Rect) {
    let text = Paragraph::new(Span::styled(
        "  q / esc: quit    auto-refreshes every 200ms    reads /tmp/infersim_live.json",
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}
