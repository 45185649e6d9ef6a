use crate::{CancelToken, ExperimentConfig, Progress, SyncState};
use anyhow::Result;
use crossbeam_channel::{tick, Receiver, TryRecvError};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Layout, Rect},
    style::{Style, Stylize},
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Gauge, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Completed points, all-time and over a sliding window.
#[derive(Debug)]
pub struct PointCounter {
    pub n_points: usize,
    pub t_begin: Instant,
    window: Duration,
    recent: VecDeque<Instant>,
}

impl Default for PointCounter {
    fn default() -> Self {
        Self {
            n_points: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(10),
            recent: VecDeque::new(),
        }
    }
}

impl PointCounter {
    /// Points per second since the counter started.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.n_points as f64 / secs
    }

    /// Points per second over the sliding window.
    pub fn rate(&self) -> f64 {
        self.recent.len() as f64 / self.window.as_secs_f64().max(1e-6)
    }

    pub fn increment(&mut self) {
        self.increment_at(Instant::now());
    }

    fn increment_at(&mut self, now: Instant) {
        self.n_points += 1;
        self.recent.push_back(now);
        while let Some(&ts) = self.recent.front() {
            if now.duration_since(ts) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Seconds left at the current rate, if there is one.
    pub fn eta(&self, remaining: usize) -> Option<Duration> {
        let rate = self.average_rate();
        (self.n_points > 0 && rate > 0.0)
            .then(|| Duration::from_secs_f64(remaining as f64 / rate))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusExit {
    Quit,
    Closed,
}

#[derive(Debug)]
pub struct Status {
    pub name: String,
    pub drive_mode: String,
    pub state: SyncState,
    pub planned: usize,
    pub counter: PointCounter,
    pub retries: usize,
    pub last_point: Option<(usize, f64, f64)>,
    pub outcome: Option<Result<usize, String>>,
    pub exit: Option<StatusExit>,
    cancel: CancelToken,
}

impl Status {
    pub fn new(config: &ExperimentConfig, cancel: CancelToken) -> Self {
        Self {
            name: config.name.clone(),
            drive_mode: format!("{:?}", config.smu.drive_mode),
            state: SyncState::Idle,
            planned: config.ramp_points,
            counter: PointCounter::default(),
            retries: 0,
            last_point: None,
            outcome: None,
            exit: None,
            cancel,
        }
    }

    /// Render until the run has finished and the operator closes the view.
    pub fn run(&mut self, terminal: &mut DefaultTerminal, progress: Receiver<Progress>) -> Result<()> {
        let ticker = tick(Duration::from_millis(200));

        while self.exit != Some(StatusExit::Closed) {
            let _ = ticker.recv();

            loop {
                match progress.try_recv() {
                    Ok(event) => self.apply(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if self.outcome.is_none() {
                            self.outcome = Some(Err("run ended without a result".into()));
                        }
                        break;
                    }
                }
            }

            self.handle_events()?;
            terminal.draw(|f| self.draw(f))?;
        }
        Ok(())
    }

    pub fn apply(&mut self, progress: Progress) {
        match progress {
            Progress::State(state) => self.state = state,
            Progress::Planned { points } => {
                self.planned = points;
                self.counter = PointCounter::default();
            }
            Progress::Retry { .. } => self.retries += 1,
            Progress::Point {
                ordinal,
                commanded,
                measured,
                ..
            } => {
                self.counter.increment();
                self.last_point = Some((ordinal, commanded, measured));
            }
            Progress::Finished { records, error } => {
                self.outcome = Some(match error {
                    None => Ok(records),
                    Some(e) => Err(e),
                });
            }
        }
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.kind == KeyEventKind::Press {
                    self.handle_key_event(key_event)
                }
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if let KeyCode::Char('q') = key_event.code {
            self.exit();
        }
    }

    /// First `q` cancels a running sweep, `q` after the run closes the view.
    fn exit(&mut self) {
        if self.outcome.is_some() {
            self.exit = Some(StatusExit::Closed);
        } else {
            self.cancel.cancel();
            self.exit = Some(StatusExit::Quit);
        }
    }

    fn ratio(&self) -> f64 {
        if self.planned == 0 {
            return 0.0;
        }
        (self.counter.n_points as f64 / self.planned as f64).clamp(0.0, 1.0)
    }
}

impl Widget for &Status {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(format!(" {} Sweep Status ", self.name).bold());
        let instructions = if self.outcome.is_some() {
            Line::from(vec![" Close ".into(), "<Q> ".blue().bold()])
        } else {
            Line::from(vec![" Cancel ".into(), "<Q> ".blue().bold()])
        };
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);
        let inner = block.inner(area);
        block.render(area, buf);

        let [text_area, gauge_area] =
            Layout::vertical([Constraint::Min(3), Constraint::Length(1)]).areas(inner);

        let state = match (&self.outcome, self.exit) {
            (None, Some(StatusExit::Quit)) => "CANCELLING".to_string(),
            _ => self.state.to_string(),
        };
        let mut lines = vec![Line::from(vec![
            "State: ".into(),
            state.yellow(),
            " Drive mode: ".into(),
            self.drive_mode.clone().yellow(),
            " Elapsed time: ".into(),
            self.counter.t_begin.elapsed().as_secs().to_string().yellow(),
            " s".into(),
            " Retries: ".into(),
            self.retries.to_string().yellow(),
        ])];

        let mut rate_line = vec![
            "Rate: ".into(),
            format!("{:.2}", self.counter.rate()).yellow(),
            " points/s".into(),
        ];
        if let Some(eta) = self
            .counter
            .eta(self.planned.saturating_sub(self.counter.n_points))
        {
            rate_line.push(" ETA: ".into());
            rate_line.push(format!("{} s", eta.as_secs()).yellow());
        }
        lines.push(Line::from(rate_line));

        if let Some((ordinal, commanded, measured)) = self.last_point {
            lines.push(Line::from(vec![
                "Last point: ".into(),
                ordinal.to_string().yellow(),
                " commanded ".into(),
                format!("{commanded:.4e}").yellow(),
                " measured ".into(),
                format!("{measured:.4e}").yellow(),
            ]));
        }
        match &self.outcome {
            Some(Ok(records)) => {
                lines.push(Line::from(format!("Done: {records} points recorded").green()))
            }
            Some(Err(e)) => lines.push(Line::from(format!("Aborted: {e}").red())),
            None => {}
        }

        Paragraph::new(Text::from(lines))
            .centered()
            .render(text_area, buf);

        Gauge::default()
            .gauge_style(Style::new().yellow())
            .label(format!("{}/{}", self.counter.n_points, self.planned))
            .ratio(self.ratio())
            .render(gauge_area, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::bench_config;

    fn buffer_text(buf: &Buffer) -> String {
        buf.content().iter().map(|c| c.symbol()).collect()
    }

    #[test]
    fn sliding_window_drops_old_points() {
        let mut counter = PointCounter::default();
        let start = Instant::now();
        counter.increment_at(start);
        counter.increment_at(start + Duration::from_secs(5));
        counter.increment_at(start + Duration::from_secs(12));
        assert_eq!(counter.n_points, 3);
        assert_eq!(counter.recent.len(), 2);
        assert!((counter.rate() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn progress_updates_status() {
        let mut status = Status::new(&bench_config(), CancelToken::default());
        status.apply(Progress::Planned { points: 30 });
        status.apply(Progress::State(SyncState::Acquiring));
        status.apply(Progress::Retry {
            ordinal: 0,
            commanded: -150e-9,
            achieved: -120e-9,
        });
        status.apply(Progress::Point {
            ordinal: 0,
            commanded: -150e-9,
            measured: -150e-9,
            attempts: 2,
        });
        assert_eq!(status.state, SyncState::Acquiring);
        assert_eq!(status.retries, 1);
        assert_eq!(status.counter.n_points, 1);
        assert!((status.ratio() - 1.0 / 30.0).abs() < 1e-12);

        status.apply(Progress::Finished {
            records: 1,
            error: Some("cancelled".into()),
        });
        assert_eq!(status.outcome, Some(Err("cancelled".to_string())));
    }

    #[test]
    fn q_cancels_then_closes() {
        let cancel = CancelToken::default();
        let mut status = Status::new(&bench_config(), cancel.clone());
        status.handle_key_event(KeyEvent::from(KeyCode::Char('q')));
        assert!(cancel.is_cancelled());
        assert_eq!(status.exit, Some(StatusExit::Quit));

        status.apply(Progress::Finished {
            records: 11,
            error: Some("cancelled".into()),
        });
        status.handle_key_event(KeyEvent::from(KeyCode::Char('q')));
        assert_eq!(status.exit, Some(StatusExit::Closed));
    }

    #[test]
    fn renders_progress() {
        let mut status = Status::new(&bench_config(), CancelToken::default());
        status.apply(Progress::State(SyncState::Stepping));
        status.apply(Progress::Point {
            ordinal: 0,
            commanded: -150e-9,
            measured: -150e-9,
            attempts: 1,
        });
        let area = Rect::new(0, 0, 100, 8);
        let mut buf = Buffer::empty(area);
        (&status).render(area, &mut buf);
        let text = buffer_text(&buf);
        assert!(text.contains("hysteron Sweep Status"));
        assert!(text.contains("STEPPING"));
        assert!(text.contains("1/30"));
        assert!(text.contains("Cancel"));
    }
}
