use anyhow::Result;
use chrono::NaiveDate;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
};
use std::collections::HashSet;
use std::io::stdout;

use crate::clock::parse_date;
use crate::config::job_family_label;
use crate::db::Database;
use crate::export::{default_export_path, export_opportunities};
use crate::models::{ActivityLog, Contact, ContactFilter, Opportunity, OpportunityFilter};
use crate::stages::StageVocabulary;
use crate::workflow::{StageCount, Workflow};

struct AppState {
    opportunities: Vec<Opportunity>,
    summary: Vec<StageCount>,
    stale_ids: HashSet<i64>,
    today: NaiveDate,
    selected: usize,
    scroll_offset: u16,
    contacts: Vec<Contact>,
    activity: Vec<ActivityLog>,
    status: Option<String>,
    /// Text typed so far while adding a note; `None` outside note entry.
    note_input: Option<String>,
}

enum NoteKey {
    Editing,
    Cancelled,
    Submit(String),
}

impl AppState {
    fn load(db: &Database, workflow: &Workflow, stale_days: i64) -> Result<Self> {
        let mut state = Self {
            opportunities: Vec::new(),
            summary: Vec::new(),
            stale_ids: HashSet::new(),
            today: workflow.clock().today(),
            selected: 0,
            scroll_offset: 0,
            contacts: Vec::new(),
            activity: Vec::new(),
            status: None,
            note_input: None,
        };
        state.refresh(db, workflow, stale_days)?;
        Ok(state)
    }

    fn refresh(&mut self, db: &Database, workflow: &Workflow, stale_days: i64) -> Result<()> {
        self.opportunities = db.list_opportunities(&OpportunityFilter {
            exclude_stage: Some(workflow.stages().terminal().to_string()),
            ..Default::default()
        })?;
        self.summary = workflow.get_pipeline_summary()?.with_all_stages(workflow.stages());
        self.stale_ids = workflow.flag_stale_records(stale_days)?.iter().map(|o| o.id).collect();
        self.today = workflow.clock().today();
        if self.selected >= self.opportunities.len() {
            self.selected = self.opportunities.len().saturating_sub(1);
        }
        self.load_detail(db);
        Ok(())
    }

    fn current(&self) -> Option<&Opportunity> {
        self.opportunities.get(self.selected)
    }

    fn load_detail(&mut self, db: &Database) {
        let Some(id) = self.current().map(|o| o.id) else {
            self.contacts.clear();
            self.activity.clear();
            return;
        };
        self.contacts = db
            .list_contacts(&ContactFilter { opportunity_id: Some(id), ..Default::default() })
            .unwrap_or_default();
        self.activity = db.get_activity_log(Some(id), 10).unwrap_or_default();
    }

    fn next(&mut self) {
        if !self.opportunities.is_empty() && self.selected < self.opportunities.len() - 1 {
            self.selected += 1;
            self.scroll_offset = 0;
        }
    }

    fn prev(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
            self.scroll_offset = 0;
        }
    }

    fn scroll_down(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_add(3);
    }

    fn scroll_up(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_sub(3);
    }

    fn handle_note_key(&mut self, code: KeyCode) -> NoteKey {
        let Some(input) = self.note_input.as_mut() else {
            return NoteKey::Cancelled;
        };
        match code {
            KeyCode::Esc => {
                self.note_input = None;
                NoteKey::Cancelled
            }
            KeyCode::Enter => NoteKey::Submit(self.note_input.take().unwrap_or_default()),
            KeyCode::Backspace => {
                input.pop();
                NoteKey::Editing
            }
            KeyCode::Char(c) => {
                input.push(c);
                NoteKey::Editing
            }
            _ => NoteKey::Editing,
        }
    }
}

pub fn run_dashboard(db: &Database, workflow: &Workflow, stale_days: i64) -> Result<()> {
    let mut state = AppState::load(db, workflow, stale_days)?;
    if state.opportunities.is_empty() {
        println!("No active opportunities. Add one with: jobops add <JD text or URL>");
        return Ok(());
    }

    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = run_loop(&mut terminal, &mut state, db, workflow, stale_days);

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    state: &mut AppState,
    db: &Database,
    workflow: &Workflow,
    stale_days: i64,
) -> Result<()> {
    let mut list_state = ListState::default();
    list_state.select(Some(0));

    loop {
        terminal.draw(|frame| draw(frame, state, workflow.stages(), &mut list_state))?;

        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            if state.note_input.is_some() {
                match state.handle_note_key(key.code) {
                    NoteKey::Editing => {}
                    NoteKey::Cancelled => state.status = Some("Note discarded".to_string()),
                    NoteKey::Submit(text) => {
                        if let Some(id) = state.current().map(|o| o.id) {
                            state.status = Some(match workflow.add_note(id, &text) {
                                Ok(_) => format!("Note added to #{}", id),
                                Err(e) => format!("Error: {}", e),
                            });
                            state.refresh(db, workflow, stale_days)?;
                        }
                    }
                }
                continue;
            }

            let prev_selected = state.selected;
            let target = match key.code {
                KeyCode::Char('q') | KeyCode::Esc => break,
                KeyCode::Down | KeyCode::Char('j') => {
                    state.next();
                    None
                }
                KeyCode::Up | KeyCode::Char('k') => {
                    state.prev();
                    None
                }
                KeyCode::Char('J') | KeyCode::PageDown => {
                    state.scroll_down();
                    None
                }
                KeyCode::Char('K') | KeyCode::PageUp => {
                    state.scroll_up();
                    None
                }
                KeyCode::Char('a') => state
                    .current()
                    .and_then(|o| workflow.stages().next_stage(&o.stage))
                    .map(str::to_string),
                KeyCode::Char('c') => Some(workflow.stages().terminal().to_string()),
                KeyCode::Char('n') => {
                    if state.current().is_some() {
                        state.note_input = Some(String::new());
                    }
                    None
                }
                KeyCode::Char('x') => {
                    let path = default_export_path(state.today);
                    state.status = Some(match export_opportunities(db, &path) {
                        Ok(0) => "No opportunities to export".to_string(),
                        Ok(rows) => format!("Exported {} opportunities to {}", rows, path.display()),
                        Err(e) => format!("Error: {}", e),
                    });
                    None
                }
                _ => None,
            };

            if let Some((id, stage)) = target.and_then(|s| state.current().map(|o| (o.id, s))) {
                state.status = Some(match workflow.advance_stage(id, &stage, None) {
                    Ok(()) => format!("#{} moved to {}", id, stage),
                    Err(e) => format!("Error: {}", e),
                });
                state.refresh(db, workflow, stale_days)?;
                list_state.select(Some(state.selected));
            } else if state.selected != prev_selected {
                list_state.select(Some(state.selected));
                state.load_detail(db);
            }
        }
    }
    Ok(())
}

fn stage_icon(stages: &StageVocabulary, stage: &str) -> &'static str {
    if stages.is_terminal(stage) {
        "-"
    } else if stages.is_applied_or_later(stage) {
        "+"
    } else {
        " "
    }
}

/// "!" when the next action is due today or overdue.
fn due_marker(opp: &Opportunity, today: NaiveDate) -> &'static str {
    match opp.next_action_date.as_deref().and_then(parse_date) {
        Some(due) if due <= today => "!",
        _ => " ",
    }
}

fn draw(frame: &mut Frame, state: &AppState, stages: &StageVocabulary, list_state: &mut ListState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(1)])
        .split(frame.area());

    // Top: pipeline summary
    let summary = state
        .summary
        .iter()
        .map(|row| format!("{} {}", row.stage, row.count))
        .collect::<Vec<_>>()
        .join("  |  ");
    let summary_widget =
        Paragraph::new(summary).block(Block::default().borders(Borders::ALL).title(" Pipeline "));
    frame.render_widget(summary_widget, rows[0]);

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(rows[1]);

    // Left panel: active opportunities
    let items: Vec<ListItem> = state
        .opportunities
        .iter()
        .map(|opp| {
            let stale = if state.stale_ids.contains(&opp.id) { "~" } else { " " };
            let role = if opp.role_title.chars().count() > 30 {
                format!("{}...", opp.role_title.chars().take(27).collect::<String>())
            } else {
                opp.role_title.clone()
            };
            ListItem::new(format!(
                "{}{}{} #{:<4} {} | {}",
                stage_icon(stages, &opp.stage),
                due_marker(opp, state.today),
                stale,
                opp.id,
                opp.company,
                role
            ))
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(format!(
            " Active ({}) ", state.opportunities.len()
        )))
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, chunks[0], list_state);

    // Right panel: detail
    let detail_widget = Paragraph::new(build_detail(state))
        .block(Block::default().borders(Borders::ALL).title(" Detail "))
        .wrap(Wrap { trim: false })
        .scroll((state.scroll_offset, 0));

    frame.render_widget(detail_widget, chunks[1]);

    let help = match (&state.note_input, &state.status) {
        (Some(input), _) => format!(" Note: {}_   (Enter save  Esc cancel)", input),
        (None, Some(status)) => {
            format!(" {}   (j/k move  J/K scroll  a:advance  c:close  n:note  x:export  q:quit)", status)
        }
        (None, None) => {
            " j/k:navigate  J/K:scroll  a:advance  c:close  n:note  x:export  q:quit   ! due  ~ stale".to_string()
        }
    };
    frame.render_widget(Paragraph::new(help).style(Style::default().fg(Color::DarkGray)), rows[2]);
}

fn build_detail<'a>(state: &'a AppState) -> Text<'a> {
    let Some(opp) = state.current() else {
        return Text::raw("No opportunity selected");
    };

    let mut lines: Vec<Line> = Vec::new();
    let bold = Style::default().add_modifier(Modifier::BOLD);

    lines.push(Line::from(Span::styled(&opp.role_title, bold)));
    lines.push(Line::from(format!("at {}", opp.company)));
    lines.push(Line::from(Span::styled(
        format!("Stage: {}", opp.stage),
        Style::default().fg(Color::Cyan),
    )));

    let family = opp.job_family.as_deref().and_then(job_family_label).unwrap_or("-");
    let tier = opp.tier.map_or_else(|| "-".to_string(), |t| t.to_string());
    lines.push(Line::from(format!("Tier: {}   Family: {}", tier, family)));
    if let Some(score) = opp.fit_score {
        lines.push(Line::from(format!("Fit score: {:.1}/10", score)));
    }
    if let Some(salary) = &opp.salary_range {
        lines.push(Line::from(format!("Salary: {}", salary)));
    }
    if let Some(url) = &opp.jd_url {
        lines.push(Line::from(format!("URL: {}", url)));
    }

    lines.push(Line::from(""));
    let due_style = if due_marker(opp, state.today) == "!" {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };
    lines.push(Line::from(Span::styled(
        format!(
            "Next: {} (due {})",
            opp.next_action.as_deref().unwrap_or("-"),
            opp.next_action_date.as_deref().unwrap_or("-")
        ),
        due_style,
    )));
    if let Some(applied) = &opp.date_applied {
        lines.push(Line::from(format!("Applied: {}", applied)));
    }
    if state.stale_ids.contains(&opp.id) {
        lines.push(Line::from(Span::styled(
            format!("No update since {}", opp.updated_at),
            Style::default().fg(Color::Red),
        )));
    }

    if !state.contacts.is_empty() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled("Contacts", bold)));
        for c in &state.contacts {
            lines.push(Line::from(format!(
                "  {} ({}) - {}, Day 0 {}",
                c.full_name,
                c.contact_type.map_or("?", |t| t.as_str()),
                c.response_status,
                c.outreach_day0.as_deref().unwrap_or("-")
            )));
        }
    }

    if !state.activity.is_empty() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled("Recent activity", bold)));
        for entry in &state.activity {
            lines.push(Line::from(format!(
                "  {} {}: {}",
                entry.created_at,
                entry.activity_type,
                entry.description.as_deref().unwrap_or("")
            )));
        }
    }

    if let Some(notes) = &opp.notes {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled("Notes", bold)));
        for line in textwrap::fill(notes, 70).lines() {
            lines.push(Line::from(format!("  {}", line)));
        }
    }

    Text::from(lines)
}
